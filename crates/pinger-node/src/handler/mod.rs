pub mod sessions;

use crate::adapter::AdapterFactory;
use crate::config::Config;
use crate::session::{SessionEnv, SessionRegistry};
use crate::session::registry::SessionFilter;
use pinger::mail_info::SessionKey;
use pinger::protocol::{Request, Response};
use pinger_push::Dispatcher;
use pinger_store::DeviceRegistry;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared daemon state, built once in `main` and handed to every
/// connection and session task.
pub struct NodeState {
    pub pinger_id: String,
    pub config: Config,
    pub sessions: Arc<SessionRegistry>,
    pub devices: DeviceRegistry,
    pub dispatcher: Dispatcher,
    /// Builds the mail adapter for each new session.
    pub adapters: Arc<dyn AdapterFactory>,
    shutdown_tx: watch::Sender<bool>,
}

impl NodeState {
    pub fn new(
        config: Config,
        devices: DeviceRegistry,
        dispatcher: Dispatcher,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            pinger_id: devices.pinger_id().to_string(),
            config,
            sessions: SessionRegistry::new(),
            devices,
            dispatcher,
            adapters,
            shutdown_tx,
        })
    }

    pub fn session_env(&self) -> SessionEnv {
        SessionEnv {
            devices: self.devices.clone(),
            dispatcher: self.dispatcher.clone(),
            shutdown: self.shutdown_tx.subscribe(),
            max_transient_retries: self.config.backend.max_transient_retries,
        }
    }

    /// Tell every session task and the accept loop to wind down.
    pub fn begin_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Route a request to its handler and produce exactly one reply.
pub async fn handle_request(state: &Arc<NodeState>, req: Request) -> Response {
    match req {
        Request::Start { info } => sessions::handle_start(state, *info).await,
        Request::Stop {
            client_id,
            client_context,
            device_id,
            token,
        } => {
            let key = SessionKey::new(client_id, client_context, device_id);
            sessions::handle_stop(state, &key, &token).await
        }
        Request::Defer {
            client_id,
            client_context,
            device_id,
            token,
            timeout_ms,
        } => {
            let key = SessionKey::new(client_id, client_context, device_id);
            sessions::handle_defer(state, &key, &token, timeout_ms).await
        }
        Request::FindActiveSessions {
            client_id,
            client_context,
            device_id,
            max_results,
        } => {
            let filter = SessionFilter {
                client_id,
                client_context,
                device_id,
                max_results,
            };
            sessions::handle_find(state, &filter).await
        }
        Request::AliveCheck => sessions::handle_alive_check(state).await,
        Request::Shutdown => handle_shutdown(state),
    }
}

fn handle_shutdown(state: &NodeState) -> Response {
    tracing::info!("shutdown requested over control socket");
    state.begin_shutdown();
    ok_response("shutting down", None)
}

// ---- Shared helpers ----

pub fn ok_response(message: &str, data: Option<serde_json::Value>) -> Response {
    Response::Ok {
        message: message.to_string(),
        data,
    }
}

pub fn warn_response(message: &str, data: Option<serde_json::Value>) -> Response {
    Response::Warn {
        message: message.to_string(),
        data,
    }
}

pub fn error_response(code: &str, message: &str) -> Response {
    Response::Error {
        code: code.to_string(),
        message: message.to_string(),
    }
}
