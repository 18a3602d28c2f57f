use super::{Command, SharedStatus, TaskExit, TaskState, lock_status};
use crate::adapter::{AdapterError, Backoff, MailAdapter, PollOutcome, redact_user};
use futures_util::FutureExt;
use pinger::mail_info::MailPingInformation;
use pinger_push::endpoint::disable_device_endpoint;
use pinger_push::{Dispatcher, Notification, PingerNotification, PushError};
use pinger_store::{DeviceRegistry, PushTarget, run_blocking};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use zeroize::Zeroizing;

/// What every session task shares with the rest of the daemon.
#[derive(Clone)]
pub struct SessionEnv {
    pub devices: DeviceRegistry,
    pub dispatcher: Dispatcher,
    /// Flips to `true` once on daemon shutdown.
    pub shutdown: watch::Receiver<bool>,
    pub max_transient_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    Shutdown,
    MaxPollExpired,
    ReRegister,
}

enum Next {
    Connect,
    Poll,
    Defer(Duration),
    Finish(StopReason),
}

enum Interrupt {
    Stop,
    Shutdown,
    Defer(u64),
}

/// Wait for the next command or the daemon-wide shutdown.
async fn next_interrupt(
    commands: &mut mpsc::Receiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
) -> Interrupt {
    tokio::select! {
        cmd = commands.recv() => match cmd {
            Some(Command::Defer { timeout_ms }) => Interrupt::Defer(timeout_ms),
            // Every sender gone means the registry dropped us.
            Some(Command::Stop) | None => Interrupt::Stop,
        },
        _ = shutdown.wait_for(|down| *down) => Interrupt::Shutdown,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) struct MailTask {
    info: Zeroizing<MailPingInformation>,
    session: String,
    adapter: Box<dyn MailAdapter>,
    env: SessionEnv,
    commands: mpsc::Receiver<Command>,
    status: SharedStatus,
    /// Used by `Defer(0)`; the last non-zero defer timeout replaces it.
    defer_default: u64,
}

impl MailTask {
    pub(crate) fn new(
        info: Zeroizing<MailPingInformation>,
        adapter: Box<dyn MailAdapter>,
        env: SessionEnv,
        commands: mpsc::Receiver<Command>,
        status: SharedStatus,
    ) -> Self {
        let session = info.log_prefix();
        let defer_default = info.wait_before_use;
        Self {
            info,
            session,
            adapter,
            env,
            commands,
            status,
            defer_default,
        }
    }

    /// Drive the session to completion, record how it ended and tell the
    /// registry. Panics inside the session end it in `Error`.
    pub(crate) async fn run(self, generation: u64, exits: mpsc::UnboundedSender<TaskExit>) {
        let key = self.info.key();
        let session = self.session.clone();
        let status = self.status.clone();

        let state = match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(Ok(reason)) => {
                tracing::info!(session = %session, ?reason, "session stopped");
                TaskState::Stopped
            }
            Ok(Err(e)) => {
                tracing::warn!(session = %session, state = "error", err = %e, "session failed");
                lock_status(&status).error = Some(e.to_string());
                TaskState::Error
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(session = %session, panic = %message, "session task panicked");
                lock_status(&status).error = Some(format!("internal fault: {message}"));
                TaskState::Error
            }
        };
        lock_status(&status).state = state;
        let _ = exits.send(TaskExit {
            key,
            generation,
            state,
        });
    }

    /// Consumes the task so the configuration is wiped however it ends.
    async fn drive(mut self) -> Result<StopReason, AdapterError> {
        let result = self.run_states().await;
        if result.is_ok() {
            self.set_state(TaskState::Stopping);
        }
        self.adapter.release().await;
        result
    }

    async fn run_states(&mut self) -> Result<StopReason, AdapterError> {
        let mut next = match self.info.wait_before_use {
            0 => Next::Connect,
            ms => Next::Defer(Duration::from_millis(ms)),
        };
        let mut connected = false;
        loop {
            next = match next {
                Next::Connect => {
                    let next = self.connect().await?;
                    connected = matches!(next, Next::Poll);
                    next
                }
                Next::Poll if !connected => Next::Connect,
                Next::Poll => self.poll().await?,
                Next::Defer(duration) => self.defer(duration).await,
                Next::Finish(reason) => return Ok(reason),
            };
        }
    }

    fn set_state(&self, state: TaskState) {
        let mut cell = lock_status(&self.status);
        if cell.state != state {
            tracing::debug!(session = %self.session, ?state, "session state");
            cell.state = state;
        }
    }

    fn defer_for(&mut self, timeout_ms: u64) -> Duration {
        if timeout_ms > 0 {
            self.defer_default = timeout_ms;
        }
        Duration::from_millis(self.defer_default)
    }

    fn on_interrupt(&mut self, interrupt: Interrupt) -> Next {
        match interrupt {
            Interrupt::Stop => Next::Finish(StopReason::Requested),
            Interrupt::Shutdown => Next::Finish(StopReason::Shutdown),
            Interrupt::Defer(ms) => Next::Defer(self.defer_for(ms)),
        }
    }

    /// Count a transient failure and return how long to back off, or give
    /// up once the retry budget is spent.
    fn retry_delay(
        &self,
        backoff: &mut Backoff,
        failures: &mut u32,
        err: &str,
    ) -> Result<Duration, AdapterError> {
        *failures += 1;
        if *failures > self.env.max_transient_retries {
            return Err(AdapterError::Fatal(format!(
                "giving up after {} transient failures: {err}",
                *failures - 1
            )));
        }
        let delay = backoff.next_delay();
        tracing::info!(session = %self.session, err, ?delay, "transient mail server error, backing off");
        Ok(delay)
    }

    async fn connect(&mut self) -> Result<Next, AdapterError> {
        self.set_state(TaskState::Connecting);
        let mut backoff = Backoff::default();
        let mut failures = 0;
        loop {
            let result = tokio::select! {
                r = self.adapter.connect() => r,
                i = next_interrupt(&mut self.commands, &mut self.env.shutdown) => {
                    return Ok(self.on_interrupt(i));
                }
            };
            match result {
                Ok(()) => return Ok(Next::Poll),
                Err(AdapterError::ReRegister(reason)) => return Ok(self.reregister(&reason).await),
                Err(AdapterError::Transient(err)) => {
                    let delay = self.retry_delay(&mut backoff, &mut failures, &err)?;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        i = next_interrupt(&mut self.commands, &mut self.env.shutdown) => {
                            return Ok(self.on_interrupt(i));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Long-poll until something other than a no-change reply or new mail
    /// happens. The max-poll timer starts fresh on every entry.
    async fn poll(&mut self) -> Result<Next, AdapterError> {
        self.set_state(TaskState::Polling);
        let max_poll = Duration::from_millis(self.info.max_poll_timeout_ms());
        let expiry = tokio::time::sleep(max_poll);
        tokio::pin!(expiry);
        let too_fast = Duration::from_millis(self.info.response_timeout / 4);
        let mut backoff = Backoff::default();
        let mut failures = 0;
        let mut delay = None;

        loop {
            if let Some(d) = delay.take() {
                tokio::select! {
                    _ = tokio::time::sleep(d) => {}
                    i = next_interrupt(&mut self.commands, &mut self.env.shutdown) => {
                        return Ok(self.on_interrupt(i));
                    }
                    _ = &mut expiry => return Ok(self.max_poll_expired(max_poll)),
                }
            }

            let sent = Instant::now();
            let result = tokio::select! {
                r = self.adapter.poll() => r,
                i = next_interrupt(&mut self.commands, &mut self.env.shutdown) => {
                    return Ok(self.on_interrupt(i));
                }
                _ = &mut expiry => return Ok(self.max_poll_expired(max_poll)),
            };

            match result {
                Ok(PollOutcome::NoChange) => {
                    failures = 0;
                    let elapsed = sent.elapsed();
                    if elapsed < too_fast {
                        let d = backoff.next_delay();
                        tracing::warn!(
                            session = %self.session,
                            ?elapsed,
                            backoff = ?d,
                            "no-change reply too fast, backing off"
                        );
                        delay = Some(d);
                    } else {
                        backoff.reset();
                    }
                }
                Ok(PollOutcome::NewMail) => {
                    failures = 0;
                    backoff.reset();
                    tracing::info!(session = %self.session, "new mail");
                    self.notify(PingerNotification::NewMail).await;
                }
                Ok(PollOutcome::ReRegister) => {
                    return Ok(self.reregister("mail server rejected the session").await);
                }
                Err(AdapterError::ReRegister(reason)) => return Ok(self.reregister(&reason).await),
                Err(AdapterError::Transient(err)) => {
                    delay = Some(self.retry_delay(&mut backoff, &mut failures, &err)?);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn max_poll_expired(&self, max_poll: Duration) -> Next {
        tracing::info!(session = %self.session, ?max_poll, "max poll time reached");
        Next::Finish(StopReason::MaxPollExpired)
    }

    /// Wait out a defer. Further defers restart the single timer.
    async fn defer(&mut self, duration: Duration) -> Next {
        self.set_state(TaskState::Deferred);
        tracing::debug!(session = %self.session, ?duration, "polling deferred");
        let timer = tokio::time::sleep(duration);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return Next::Poll,
                i = next_interrupt(&mut self.commands, &mut self.env.shutdown) => match i {
                    Interrupt::Defer(ms) => {
                        let duration = self.defer_for(ms);
                        tracing::debug!(session = %self.session, ?duration, "defer timer reset");
                        timer.as_mut().reset(Instant::now() + duration);
                    }
                    other => return self.on_interrupt(other),
                },
            }
        }
    }

    async fn reregister(&mut self, reason: &str) -> Next {
        tracing::info!(
            session = %self.session,
            reason = %redact_user(reason),
            "asking device to re-register"
        );
        self.notify(PingerNotification::Register).await;
        Next::Finish(StopReason::ReRegister)
    }

    /// Push to the device. Failures are logged; the session carries on.
    async fn notify(&self, kind: PingerNotification) -> bool {
        let key = self.info.key();
        let devices = self.env.devices.clone();
        let lookup = key.clone();
        let mut device = match run_blocking(move || devices.find(&lookup)).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                tracing::warn!(session = %self.session, "no device record, cannot push");
                return false;
            }
            Err(e) => {
                tracing::error!(session = %self.session, err = %e, "device lookup failed");
                return false;
            }
        };

        let notification = Notification::new(kind, self.info.client_context.as_str())
            .with_session(self.info.session_id.as_str());
        match self
            .env
            .dispatcher
            .push(&PushTarget::from(&device), &notification)
            .await
        {
            Ok(attempts) => {
                tracing::info!(
                    session = %self.session,
                    service = %device.push_service,
                    kind = kind.as_str(),
                    attempts,
                    "push sent"
                );
                let devices = self.env.devices.clone();
                if let Err(e) = run_blocking(move || devices.update_last_contact_request(&key)).await {
                    tracing::warn!(session = %self.session, err = %e, "could not record contact request");
                }
                true
            }
            Err(PushError::InvalidToken(reason)) => {
                tracing::warn!(
                    session = %self.session,
                    service = %device.push_service,
                    reason = %reason,
                    "push token rejected, disabling device"
                );
                disable_device_endpoint(self.env.dispatcher.gateway().as_ref(), &mut device).await;
                let devices = self.env.devices.clone();
                if let Err(e) = run_blocking(move || devices.save(&device)).await {
                    tracing::error!(session = %self.session, err = %e, "could not save disabled device");
                }
                false
            }
            Err(e) => {
                tracing::error!(
                    session = %self.session,
                    service = %device.push_service,
                    kind = kind.as_str(),
                    err = %e,
                    "push failed"
                );
                false
            }
        }
    }
}
