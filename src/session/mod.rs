//! Session registry
//!
//! One entry per running `(user, exchange, symbol)` key. Registry membership
//! is the only "is this session running" signal: workers poll it once per
//! cycle and exit when their entry is gone.
//!
//! Every entry records the generation of the worker that owns it. A worker
//! only considers itself running while the entry for its key carries its own
//! generation, so stopping and immediately restarting a key never leaves two
//! live workers behind.

mod timing;
mod worker;

pub use timing::sleep_duration;
pub use worker::{ControlLoop, ControlLoopConfig, SessionDeps, WorkerExit};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{SessionKey, UserId};

/// Worker generation id, unique per registry
pub type Generation = u64;

/// Result of [`SessionRegistry::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Handed to a freshly spawned worker
#[derive(Debug, Clone)]
pub struct WorkerTicket {
    pub key: SessionKey,
    pub generation: Generation,
    pub strategy: String,
    cancel: CancellationToken,
}

impl WorkerTicket {
    /// Resolves once the session has been stopped. Only used to cut sleeps short.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }
}

/// Public view of a running session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub strategy: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    generation: Generation,
    strategy: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Outcome of [`SessionRegistry::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub joined: usize,
    pub aborted: usize,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Entry>>,
    handles: Mutex<Vec<JoinHandle<WorkerExit>>>,
    next_generation: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register `key` and launch its worker through `spawn`.
    ///
    /// Idempotent: a key that is already running is left untouched and
    /// `spawn` is not called.
    pub fn start<F>(&self, key: SessionKey, strategy: &str, spawn: F) -> StartOutcome
    where
        F: FnOnce(WorkerTicket) -> JoinHandle<WorkerExit>,
    {
        let ticket = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(&key) {
                return StartOutcome::AlreadyRunning;
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            sessions.insert(
                key.clone(),
                Entry {
                    generation,
                    strategy: strategy.to_string(),
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                },
            );
            WorkerTicket {
                key,
                generation,
                strategy: strategy.to_string(),
                cancel,
            }
        };

        info!(session = %ticket.key, generation = ticket.generation, "Session registered");
        let handle = spawn(ticket);

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        StartOutcome::Started
    }

    /// Remove `key`. The worker notices at its next cycle; nothing is awaited
    /// or aborted here. Returns whether the key was running.
    pub fn stop(&self, key: &SessionKey) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);

        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(session = %key, generation = entry.generation, "Session stop requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, key: &SessionKey) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Whether `key` is still owned by the worker of `generation`
    pub fn is_current(&self, key: &SessionKey, generation: Generation) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
    }

    /// Remove `key` only if it still belongs to `generation`
    pub fn remove_if_current(&self, key: &SessionKey, generation: Generation) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        match sessions.get(key) {
            Some(entry) if entry.generation == generation => {
                if let Some(entry) = sessions.remove(key) {
                    entry.cancel.cancel();
                }
                debug!(session = %key, generation, "Session removed by its worker");
                true
            }
            _ => false,
        }
    }

    pub fn active_keys(&self) -> Vec<SessionKey> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, entry)| SessionInfo {
                key: key.clone(),
                strategy: entry.strategy.clone(),
                started_at: entry.started_at,
            })
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    /// Users with at least one running session, ascending
    pub fn active_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .map(|k| k.user_id)
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// Exchanges a user currently trades on
    pub fn user_exchanges(&self, user_id: UserId) -> Vec<String> {
        let mut exchanges: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.user_id == user_id)
            .map(|k| k.exchange.clone())
            .collect();
        exchanges.sort();
        exchanges.dedup();
        exchanges
    }

    /// Stop every session of a user, returning the keys that were stopped
    pub fn stop_user(&self, user_id: UserId) -> Vec<SessionKey> {
        let keys: Vec<SessionKey> = self
            .active_keys()
            .into_iter()
            .filter(|k| k.user_id == user_id)
            .collect();
        keys.into_iter().filter(|k| self.stop(k)).collect()
    }

    /// Stop every session and wait up to `grace` for the workers to exit.
    /// Workers still running at the deadline are aborted.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for key in self.active_keys() {
            if self.stop(&key) {
                report.stopped += 1;
            }
        }

        let mut handles =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        let deadline = Instant::now() + grace;

        while let Some(mut handle) = handles.pop() {
            tokio::select! {
                res = &mut handle => {
                    report.joined += 1;
                    if let Err(e) = res {
                        warn!(error = %e, "Session worker did not exit cleanly");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    handle.abort();
                    report.aborted += 1 + handles.len();
                    for h in handles.drain(..) {
                        h.abort();
                    }
                }
            }
        }

        info!(
            stopped = report.stopped,
            joined = report.joined,
            aborted = report.aborted,
            "Session registry shut down"
        );
        report
    }
}
