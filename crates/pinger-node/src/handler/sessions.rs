use super::{NodeState, error_response, ok_response, warn_response};
use crate::session::registry::SessionFilter;
use crate::session::{Command, SessionHandle};
use pinger::mail_info::{MailPingInformation, SessionKey};
use pinger::protocol::{AliveStatus, Response, StartResult, error_code};
use pinger_crypto::token::generate_token;
use pinger_push::endpoint::ensure_device_endpoint;
use pinger_store::{StoreError, run_blocking};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use zeroize::Zeroizing;

fn to_data<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok()
}

fn store_failure(e: &StoreError) -> Response {
    match e {
        StoreError::Invalid(msg) => error_response(error_code::INVALID_REQUEST, msg),
        other => error_response(error_code::STORE_ERROR, &other.to_string()),
    }
}

fn started(token: &str, previous_error: Option<String>) -> Response {
    let data = to_data(&StartResult {
        token: token.to_string(),
    });
    match previous_error {
        Some(e) => warn_response(&format!("Previous Ping failed with error: {e}"), data),
        None => ok_response("Polling", data),
    }
}

/// Record that the device reached us. Bookkeeping only; failures are logged.
async fn touch_last_contact(state: &NodeState, key: &SessionKey) {
    let devices = state.devices.clone();
    let key = key.clone();
    let device = key.to_string();
    if let Err(e) = run_blocking(move || devices.update_last_contact(&key)).await {
        tracing::warn!(device = %device, err = %e, "could not update last contact");
    }
}

/// Get-or-create the device records and make sure the push endpoint is
/// registered when the push destination is new or changed.
async fn register_device(state: &NodeState, info: &MailPingInformation) -> Result<(), Response> {
    let devices = state.devices.clone();
    let registration_info = Zeroizing::new(info.clone());
    let registration = run_blocking(move || devices.register(&registration_info))
        .await
        .map_err(|e| store_failure(&e))?;

    if registration.needs_endpoint() {
        let mut device = registration.device;
        let changed = ensure_device_endpoint(
            state.dispatcher.gateway().as_ref(),
            &mut device,
            state.config.backend.ignore_push_failures,
        )
        .await
        .map_err(|e| {
            tracing::warn!(session = %info.log_prefix(), err = %e, "push registration failed");
            error_response(error_code::PUSH_ERROR, &format!("push registration failed: {e}"))
        })?;
        if changed {
            let devices = state.devices.clone();
            run_blocking(move || devices.save(&device))
                .await
                .map_err(|e| store_failure(&e))?;
        }
    }
    touch_last_contact(state, &info.key()).await;
    Ok(())
}

/// Start polling for a device, or confirm the session already running.
pub async fn handle_start(state: &Arc<NodeState>, info: MailPingInformation) -> Response {
    let info = Zeroizing::new(info);
    let session = info.log_prefix();
    if let Err(e) = info.validate() {
        tracing::warn!(session = %session, err = %e, "start rejected");
        return error_response(error_code::INVALID_REQUEST, &e.to_string());
    }
    if state.is_shutting_down() {
        return error_response(error_code::INTERNAL, "pinger is shutting down");
    }

    let key = info.key();
    // Starts for this key queue here; the registry lock is only taken for
    // the lookup and the final insert.
    let _starting = state.sessions.start_guard(&key).await;

    let mut previous_error = None;
    let replaced = {
        let mut sessions = state.sessions.lock().await;
        match sessions.get(&key) {
            None => None,
            Some(existing) => {
                let status = existing.status();
                let same = existing.info().same_configuration(&info);
                if same && !status.state.is_finished() {
                    let token = existing.token().to_string();
                    drop(sessions);
                    tracing::info!(session = %session, "session already polling");
                    touch_last_contact(state, &key).await;
                    return started(&token, None);
                }
                if same {
                    tracing::info!(session = %session, state = ?status.state, "replacing finished session");
                    previous_error = status.error;
                } else {
                    tracing::info!(session = %session, "configuration changed, restarting session");
                }
                sessions.remove(&key)
            }
        }
    };
    if let Some(old) = replaced {
        old.stop(state.config.backend.stop_grace()).await;
    }

    let adapter = match state.adapters.create(&info) {
        Ok(adapter) => adapter,
        Err(e) => {
            tracing::warn!(session = %session, err = %e, "no adapter for session");
            return error_response(error_code::INVALID_REQUEST, &e.to_string());
        }
    };
    if let Err(resp) = register_device(state, &info).await {
        return resp;
    }

    let mut sessions = state.sessions.lock().await;
    // Drain takes this lock after raising the flag, so nothing slips in
    // behind it.
    if state.is_shutting_down() {
        return error_response(error_code::INTERNAL, "pinger is shutting down");
    }
    let handle = SessionHandle::spawn(
        &info,
        adapter,
        state.session_env(),
        generate_token(),
        state.sessions.next_generation(),
        state.sessions.exit_sender(),
    );
    let resp = started(handle.token(), previous_error);
    sessions.insert(key, handle);
    tracing::info!(session = %session, sessions = sessions.len(), "session started");
    resp
}

/// Stop a session. The caller must present the session's token.
pub async fn handle_stop(state: &Arc<NodeState>, key: &SessionKey, token: &str) -> Response {
    if token.is_empty() {
        return error_response(error_code::TOKEN_MISMATCH, "Token does not match");
    }
    let handle = {
        let mut sessions = state.sessions.lock().await;
        match sessions.get(key) {
            None => return error_response(error_code::NOT_FOUND, "Not Polling"),
            Some(existing) if !existing.token_matches(token) => {
                tracing::warn!(device = %key, "stop with wrong token");
                return error_response(error_code::TOKEN_MISMATCH, "Token does not match");
            }
            Some(_) => sessions.remove(key),
        }
    };

    touch_last_contact(state, key).await;
    if let Some(handle) = handle {
        handle.stop(state.config.backend.stop_grace()).await;
    }
    tracing::info!(device = %key, "session stopped on request");
    ok_response("Stopped", None)
}

/// Pause polling; the session resumes by itself when the timer fires.
pub async fn handle_defer(
    state: &Arc<NodeState>,
    key: &SessionKey,
    token: &str,
    timeout_ms: u64,
) -> Response {
    if token.is_empty() {
        return error_response(error_code::TOKEN_MISMATCH, "Token does not match");
    }
    let commands = {
        let sessions = state.sessions.lock().await;
        match sessions.get(key) {
            None => return error_response(error_code::NOT_FOUND, "Not Polling"),
            Some(existing) if !existing.token_matches(token) => {
                tracing::warn!(device = %key, "defer with wrong token");
                return error_response(error_code::TOKEN_MISMATCH, "Token does not match");
            }
            Some(existing) => existing.commands(),
        }
    };

    touch_last_contact(state, key).await;
    match commands.try_send(Command::Defer { timeout_ms }) {
        Ok(()) => {
            tracing::debug!(device = %key, timeout_ms, "session deferred");
            ok_response("Deferred", None)
        }
        Err(TrySendError::Full(_)) => {
            tracing::warn!(device = %key, "defer dropped, command queue full");
            warn_response("Defer queue is full, try again", None)
        }
        Err(TrySendError::Closed(_)) => {
            error_response(error_code::NOT_FOUND, "Client has stopped. Can not defer")
        }
    }
}

pub async fn handle_find(state: &Arc<NodeState>, filter: &SessionFilter) -> Response {
    let sessions = state.sessions.snapshot(filter).await;
    ok_response(&format!("{} sessions", sessions.len()), to_data(&sessions))
}

/// Healthy when the store answers; warns once the soft session limit is hit.
pub async fn handle_alive_check(state: &Arc<NodeState>) -> Response {
    let devices = state.devices.clone();
    match run_blocking(move || devices.heartbeat()).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(error_code::STORE_ERROR, "heartbeat record is missing");
        }
        Err(e) => {
            tracing::error!(err = %e, "alive check: store unreachable");
            return error_response(error_code::STORE_ERROR, &e.to_string());
        }
    }

    let count = state.sessions.len().await;
    let limit = state.config.backend.soft_session_limit;
    let status = AliveStatus {
        pinger_id: state.pinger_id.clone(),
        sessions: count,
        healthy: count < limit,
    };
    if count >= limit {
        warn_response(
            &format!("{count} sessions, soft limit is {limit}"),
            to_data(&status),
        )
    } else {
        ok_response(&format!("alive, {count} sessions"), to_data(&status))
    }
}
