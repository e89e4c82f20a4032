//! Candle-aligned sleep computation

use std::time::Duration;

use super::worker::ControlLoopConfig;
use crate::types::Timeframe;

/// Time to wait until the next candle of `timeframe` opens, plus a buffer.
///
/// `now_secs` is Unix time. Unparseable timeframes fall back to
/// `fallback_interval`; the result is never below `min_sleep`.
pub fn sleep_duration(timeframe: &str, now_secs: i64, config: &ControlLoopConfig) -> Duration {
    let tf_secs = Timeframe::parse(timeframe).and_then(|tf| i64::try_from(tf.duration_secs()).ok());
    let Some(tf_secs) = tf_secs else {
        return config.fallback_interval;
    };

    let next_candle = now_secs - now_secs.rem_euclid(tf_secs) + tf_secs;
    let until_next = Duration::from_secs((next_candle - now_secs).max(0) as u64);

    (until_next + config.candle_buffer).max(config.min_sleep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_next_hour_plus_buffer() {
        let config = ControlLoopConfig::default();
        let now = 10 * 3600 + 100;
        assert_eq!(sleep_duration("1h", now, &config), Duration::from_secs(3505));
    }

    #[test]
    fn on_boundary_waits_a_full_candle() {
        let config = ControlLoopConfig::default();
        assert_eq!(sleep_duration("1h", 7200, &config), Duration::from_secs(3605));
        assert_eq!(sleep_duration("15m", 900, &config), Duration::from_secs(905));
    }

    #[test]
    fn respects_min_sleep() {
        let config = ControlLoopConfig {
            candle_buffer: Duration::ZERO,
            ..ControlLoopConfig::default()
        };
        // one second before the next minute
        assert_eq!(sleep_duration("1m", 59, &config), Duration::from_secs(5));
    }

    #[test]
    fn unknown_timeframe_uses_fallback() {
        let config = ControlLoopConfig::default();
        assert_eq!(sleep_duration("bogus", 0, &config), Duration::from_secs(900));
        assert_eq!(sleep_duration("", 0, &config), Duration::from_secs(900));
    }
}
