use super::{SessionHandle, SharedStatus, TaskExit, TaskState, lock_status};
use pinger::mail_info::SessionKey;
use pinger::protocol::SessionInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, mpsc};

pub type SessionMap = HashMap<SessionKey, SessionHandle>;

type StartLocks = StdMutex<HashMap<SessionKey, Arc<Mutex<()>>>>;

/// Held while a Start for one key is in flight. Other keys and the
/// registry lock are unaffected.
pub struct StartGuard<'a> {
    locks: &'a StartLocks,
    key: SessionKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // Waiters clone the entry under this lock, so a count of one means
        // nobody else wants it.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Filters for [`SessionRegistry::snapshot`]. `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub client_id: Option<String>,
    pub client_context: Option<String>,
    pub device_id: Option<String>,
    pub max_results: Option<usize>,
}

impl SessionFilter {
    fn matches(&self, key: &SessionKey) -> bool {
        let field = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);
        field(&self.client_id, &key.client_id)
            && field(&self.client_context, &key.client_context)
            && field(&self.device_id, &key.device_id)
    }
}

/// All live sessions of this daemon, keyed by (client, context, device).
///
/// The lock is held only for lookups and structural changes. Tasks report
/// through their status cells and the exit channel and never take it.
pub struct SessionRegistry {
    sessions: Mutex<SessionMap>,
    starting: StartLocks,
    next_generation: AtomicU64,
    exits: mpsc::UnboundedSender<TaskExit>,
}

impl SessionRegistry {
    /// Create the registry and start its reaper.
    pub fn new() -> Arc<Self> {
        let (exits, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            starting: StdMutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            exits,
        });
        tokio::spawn(reap(Arc::downgrade(&registry), rx));
        registry
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().await
    }

    /// Serialize Starts for `key`. Waits while another Start for the same
    /// key is in flight.
    pub async fn start_guard(&self, key: &SessionKey) -> StartGuard<'_> {
        let lock = {
            let mut locks = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.clone()).or_default().clone()
        };
        StartGuard {
            locks: &self.starting,
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Distinguishes a session from a later one under the same key.
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    pub fn exit_sender(&self) -> mpsc::UnboundedSender<TaskExit> {
        self.exits.clone()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Matching sessions sorted by key. Statuses are read after the
    /// registry lock is released.
    pub async fn snapshot(&self, filter: &SessionFilter) -> Vec<SessionInfo> {
        let mut entries: Vec<(SessionKey, String, SharedStatus)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(key, _)| filter.matches(key))
                .map(|(key, handle)| {
                    (
                        key.clone(),
                        handle.info().redacted_url().to_string(),
                        handle.shared_status(),
                    )
                })
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(max) = filter.max_results {
            entries.truncate(max);
        }

        entries
            .into_iter()
            .map(|(key, url, status)| {
                let cell = lock_status(&status).clone();
                SessionInfo {
                    client_id: key.client_id,
                    client_context: key.client_context,
                    device_id: key.device_id,
                    url,
                    status: cell.state.status(),
                    error: cell.error,
                }
            })
            .collect()
    }

    /// Remove every session and wait for their tasks, aborting whatever is
    /// still running after `grace`. The shutdown signal must already be set.
    pub async fn drain(&self, grace: Duration) -> usize {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, h)| h).collect()
        };
        let count = handles.len();
        let deadline = tokio::time::Instant::now() + grace;
        for handle in handles {
            let session = handle.info().log_prefix();
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            handle.join_within(left, &session).await;
        }
        count
    }
}

/// Drop sessions whose task stopped on its own. Failed sessions stay so
/// their error is visible until the device starts or stops again.
async fn reap(registry: Weak<SessionRegistry>, mut exits: mpsc::UnboundedReceiver<TaskExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        if exit.state != TaskState::Stopped {
            continue;
        }
        let mut sessions = registry.sessions.lock().await;
        if sessions
            .get(&exit.key)
            .is_some_and(|h| h.generation() == exit.generation)
        {
            sessions.remove(&exit.key);
            tracing::debug!(device = %exit.key, "reaped finished session");
        }
    }
}
