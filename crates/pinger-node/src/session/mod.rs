//! Live polling sessions: one task per registered device, driven through a
//! command queue and observed through a shared status cell.

pub mod registry;
pub mod task;

use crate::adapter::MailAdapter;
use pinger::mail_info::{MailPingInformation, SessionKey};
use pinger::protocol::SessionStatus;
use pinger_crypto::token::tokens_match;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

pub use registry::SessionRegistry;
pub use task::SessionEnv;

/// Capacity of each session's command queue.
pub const COMMAND_QUEUE: usize = 10;

/// Control-plane commands for a running session, delivered in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    /// Suspend polling for `timeout_ms` (0 = the session's wait-before-use).
    Defer { timeout_ms: u64 },
}

/// Where a session task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Connecting,
    Polling,
    Deferred,
    Stopping,
    Stopped,
    Error,
}

impl TaskState {
    pub fn status(self) -> SessionStatus {
        match self {
            TaskState::Created => SessionStatus::Initialized,
            TaskState::Connecting => SessionStatus::Connecting,
            TaskState::Polling => SessionStatus::Active,
            TaskState::Deferred => SessionStatus::Waiting,
            TaskState::Stopping => SessionStatus::Stopping,
            TaskState::Stopped => SessionStatus::Stopped,
            TaskState::Error => SessionStatus::Error,
        }
    }

    /// The task has exited or is about to.
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Stopped | TaskState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCell {
    pub state: TaskState,
    pub error: Option<String>,
}

pub type SharedStatus = Arc<StdMutex<StatusCell>>;

/// A panicking task must not take status reporting down with it.
pub(crate) fn lock_status(status: &SharedStatus) -> MutexGuard<'_, StatusCell> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sent by a task when it ends on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub key: SessionKey,
    pub generation: u64,
    pub state: TaskState,
}

/// The registry's view of one session.
pub struct SessionHandle {
    info: Zeroizing<MailPingInformation>,
    token: Zeroizing<String>,
    generation: u64,
    commands: mpsc::Sender<Command>,
    status: SharedStatus,
    join: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn the polling task for `info` and return its handle.
    pub fn spawn(
        info: &MailPingInformation,
        adapter: Box<dyn MailAdapter>,
        env: SessionEnv,
        token: Zeroizing<String>,
        generation: u64,
        exits: mpsc::UnboundedSender<TaskExit>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let status: SharedStatus = Arc::new(StdMutex::new(StatusCell {
            state: TaskState::Created,
            error: None,
        }));
        let task = task::MailTask::new(
            Zeroizing::new(info.clone()),
            adapter,
            env,
            rx,
            status.clone(),
        );
        let join = tokio::spawn(task.run(generation, exits));
        Self {
            info: Zeroizing::new(info.clone()),
            token,
            generation,
            commands: tx,
            status,
            join,
        }
    }

    pub fn info(&self) -> &MailPingInformation {
        &self.info
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Constant-time check of a presented stop-token.
    pub fn token_matches(&self, presented: &str) -> bool {
        tokens_match(&self.token, presented)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> StatusCell {
        lock_status(&self.status).clone()
    }

    pub(crate) fn shared_status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    /// Ask the task to stop and wait for it, aborting it after `grace`.
    pub async fn stop(self, grace: Duration) {
        let session = self.info.log_prefix();
        // A closed queue means the task already exited.
        let _ = self.commands.send(Command::Stop).await;
        self.join_within(grace, &session).await;
    }

    /// Wait for a task that has already been told to stop.
    pub(crate) async fn join_within(self, grace: Duration, session: &str) {
        let mut join = self.join;
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(session, err = %e, "session task ended abnormally"),
            Err(_) => {
                tracing::warn!(session, ?grace, "session task did not stop in time, aborting");
                join.abort();
            }
        }
    }
}
