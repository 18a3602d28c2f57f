use crate::mail_info::MailPingInformation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of a JSON-lines frame on the Unix socket (256 KiB).
/// Start requests carry base64 request/reply blobs, so this is larger than
/// a plain command would need.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Machine-readable error codes carried in [`Response::Error`].
pub mod error_code {
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const TOKEN_MISMATCH: &str = "token_mismatch";
    pub const NOT_FOUND: &str = "not_found";
    pub const STORE_ERROR: &str = "store_error";
    pub const PUSH_ERROR: &str = "push_error";
    pub const INTERNAL: &str = "internal";
}

// ---------------------------------------------------------------------------
// Reply codes and session status
// ---------------------------------------------------------------------------

/// Outcome class of a control-plane call. Callers branch on this, never on
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplyCode {
    Ok,
    Warn,
    Error,
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyCode::Ok => write!(f, "OK"),
            ReplyCode::Warn => write!(f, "WARN"),
            ReplyCode::Error => write!(f, "ERROR"),
        }
    }
}

/// Session status as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Initialized,
    Connecting,
    /// Long-polling the mail server.
    Active,
    /// Deferred; polling resumes when the defer timer fires.
    Waiting,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Initialized => "Initialized",
            SessionStatus::Connecting => "Connecting",
            SessionStatus::Active => "Active",
            SessionStatus::Waiting => "Waiting",
            SessionStatus::Stopping => "Stopping",
            SessionStatus::Stopped => "Stopped",
            SessionStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent to the pinger daemon over the Unix socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Start (or idempotently restart) polling for a device.
    Start { info: Box<MailPingInformation> },
    /// Stop a session. Requires the token issued by `Start`.
    Stop {
        client_id: String,
        client_context: String,
        device_id: String,
        token: String,
    },
    /// Suspend polling and resume after `timeout_ms` (0 = the session's
    /// configured wait-before-use).
    Defer {
        client_id: String,
        client_context: String,
        device_id: String,
        token: String,
        #[serde(default)]
        timeout_ms: u64,
    },
    /// List live sessions, optionally filtered.
    FindActiveSessions {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_results: Option<usize>,
    },
    /// Liveness probe.
    AliveCheck,

    // -- Daemon lifecycle --
    /// Shut down the daemon.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response sent from the pinger daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Connection established.
    Hello { pinger_id: String, version: String },
    /// Request succeeded.
    Ok {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Request succeeded but something deserves attention.
    Warn {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Request failed.
    Error { code: String, message: String },
}

impl Response {
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Response::Hello { .. } | Response::Ok { .. } => ReplyCode::Ok,
            Response::Warn { .. } => ReplyCode::Warn,
            Response::Error { .. } => ReplyCode::Error,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Response::Hello { .. } => "",
            Response::Ok { message, .. }
            | Response::Warn { message, .. }
            | Response::Error { message, .. } => message,
        }
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Response::Ok { data, .. } | Response::Warn { data, .. } => data.as_ref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Data types returned in Ok.data / Warn.data
// ---------------------------------------------------------------------------

/// Returned by `Start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResult {
    pub token: String,
}

/// One entry of `FindActiveSessions`. Never carries tokens or credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub client_id: String,
    pub client_context: String,
    pub device_id: String,
    pub url: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Returned by `AliveCheck`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliveStatus {
    pub pinger_id: String,
    pub sessions: usize,
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_wire_shape() {
        let req = Request::Stop {
            client_id: "C1".to_string(),
            client_context: "ctx1".to_string(),
            device_id: "D1".to_string(),
            token: "abc".to_string(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["client_context"], "ctx1");
    }

    #[test]
    fn defer_timeout_defaults_to_zero() {
        let req: Request = serde_json::from_str(
            r#"{"type":"defer","client_id":"C1","client_context":"x","device_id":"D1","token":"t"}"#,
        )
        .unwrap();
        match req {
            Request::Defer { timeout_ms, .. } => assert_eq!(timeout_ms, 0),
            other => panic!("expected Defer, got {other:?}"),
        }
    }

    #[test]
    fn find_filters_are_optional() {
        let req: Request = serde_json::from_str(r#"{"type":"find_active_sessions"}"#).unwrap();
        assert!(matches!(
            req,
            Request::FindActiveSessions {
                client_id: None,
                max_results: None,
                ..
            }
        ));

        let json = serde_json::to_string(&Request::FindActiveSessions {
            client_id: Some("C1".to_string()),
            client_context: None,
            device_id: None,
            max_results: None,
        })
        .unwrap();
        assert!(json.contains("\"client_id\":\"C1\""));
        assert!(!json.contains("device_id"));
    }

    #[test]
    fn reply_codes() {
        let ok = Response::Ok {
            message: String::new(),
            data: None,
        };
        let warn = Response::Warn {
            message: "previous ping failed".to_string(),
            data: None,
        };
        let err = Response::Error {
            code: error_code::NOT_FOUND.to_string(),
            message: "Not Polling".to_string(),
        };
        assert_eq!(ok.reply_code(), ReplyCode::Ok);
        assert_eq!(warn.reply_code(), ReplyCode::Warn);
        assert_eq!(err.reply_code(), ReplyCode::Error);
        assert_eq!(err.message(), "Not Polling");
        assert_eq!(serde_json::to_string(&ReplyCode::Warn).unwrap(), "\"WARN\"");
    }

    #[test]
    fn session_info_error_skips_none() {
        let info = SessionInfo {
            client_id: "C1".to_string(),
            client_context: "ctx1".to_string(),
            device_id: "D1".to_string(),
            url: "https://mail.example/eas".to_string(),
            status: SessionStatus::Active,
            error: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("\"error\""));
        assert!(json.contains("\"status\":\"Active\""));
    }
}
