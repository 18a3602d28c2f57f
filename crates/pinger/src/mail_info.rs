use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroize;

/// Default maximum polling lifetime: 2 days.
pub const DEFAULT_MAX_POLL_TIMEOUT_MS: u64 = 2 * 24 * 60 * 60 * 1000;

pub const PROTOCOL_ACTIVESYNC: &str = "ActiveSync";
pub const PROTOCOL_IMAP: &str = "IMAP";

// ---------------------------------------------------------------------------
// Session identity
// ---------------------------------------------------------------------------

/// Canonical identity of a session and of its device record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub client_id: String,
    pub client_context: String,
    pub device_id: String,
}

impl SessionKey {
    pub fn new(
        client_id: impl Into<String>,
        client_context: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_context: client_context.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.device_id, self.client_id, self.client_context)
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Mail protocols a client may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailProtocol {
    ActiveSync,
    Imap,
}

impl MailProtocol {
    /// Case-insensitive lookup of a protocol name.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case(PROTOCOL_ACTIVESYNC) {
            Some(MailProtocol::ActiveSync)
        } else if s.eq_ignore_ascii_case(PROTOCOL_IMAP) {
            Some(MailProtocol::Imap)
        } else {
            None
        }
    }
}

/// Why a registration was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{protocol} registration requires {field}")]
    MissingProtocolData {
        protocol: &'static str,
        field: &'static str,
    },

    #[error("mail protocol {0} is not supported")]
    UnsupportedProtocol(String),

    #[error("unknown mail protocol '{0}'")]
    UnknownProtocol(String),
}

// ---------------------------------------------------------------------------
// MailPingInformation
// ---------------------------------------------------------------------------

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything a client hands over when it asks to be watched.
///
/// None of this is persisted as-is. The device record keeps only the
/// identity and push fields; the rest lives in the session task and is wiped
/// when the task ends. Hold it in `zeroize::Zeroizing` wherever it outlives a
/// request.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailPingInformation {
    pub client_id: String,
    pub client_context: String,
    pub device_id: String,
    /// `ios` or `android`.
    pub platform: String,
    pub mail_server_url: String,
    pub mail_server_credentials: Credentials,
    pub protocol: String,
    pub http_headers: BTreeMap<String, String>,
    #[serde(with = "b64")]
    pub request_data: Vec<u8>,
    #[serde(with = "b64")]
    pub expected_reply: Vec<u8>,
    #[serde(with = "b64")]
    pub no_change_reply: Vec<u8>,
    /// IMAP only.
    #[serde(with = "b64")]
    pub command_terminator: Vec<u8>,
    /// IMAP only.
    #[serde(with = "b64")]
    pub command_acknowledgement: Vec<u8>,
    /// Milliseconds.
    pub response_timeout: u64,
    /// Milliseconds.
    pub wait_before_use: u64,
    pub push_token: String,
    /// APNS, GCM, ...
    pub push_service: String,
    /// Maximum polling lifetime in milliseconds; 0 means the 2-day default.
    pub max_poll_timeout: u64,
    pub os_version: String,
    pub app_build_version: String,
    pub app_build_number: String,
    pub session_id: String,
    /// ActiveSync Sync instead of Ping: any non-empty body means new mail.
    pub is_sync_request: bool,
}

impl MailPingInformation {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.client_id, &self.client_context, &self.device_id)
    }

    /// `device:client:context:session`, for log fields.
    pub fn log_prefix(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.device_id, self.client_id, self.client_context, self.session_id
        )
    }

    pub fn max_poll_timeout_ms(&self) -> u64 {
        if self.max_poll_timeout == 0 {
            DEFAULT_MAX_POLL_TIMEOUT_MS
        } else {
            self.max_poll_timeout
        }
    }

    /// Check that the registration carries what its protocol needs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("client_id", &self.client_id),
            ("client_context", &self.client_context),
            ("device_id", &self.device_id),
            ("mail_server_url", &self.mail_server_url),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.is_empty()) {
            return Err(ValidationError::MissingField(*name));
        }

        match MailProtocol::parse(&self.protocol) {
            Some(MailProtocol::ActiveSync) => {
                if self.request_data.is_empty() {
                    return Err(ValidationError::MissingProtocolData {
                        protocol: PROTOCOL_ACTIVESYNC,
                        field: "request_data",
                    });
                }
                if self.http_headers.is_empty() {
                    return Err(ValidationError::MissingProtocolData {
                        protocol: PROTOCOL_ACTIVESYNC,
                        field: "http_headers",
                    });
                }
                Ok(())
            }
            Some(MailProtocol::Imap) => {
                Err(ValidationError::UnsupportedProtocol(self.protocol.clone()))
            }
            None => Err(ValidationError::UnknownProtocol(self.protocol.clone())),
        }
    }

    /// True when `other` would produce the same polling behaviour.
    /// The session id only tags notifications and is ignored.
    pub fn same_configuration(&self, other: &Self) -> bool {
        self.client_id == other.client_id
            && self.client_context == other.client_context
            && self.device_id == other.device_id
            && self.platform == other.platform
            && self.mail_server_url == other.mail_server_url
            && self.mail_server_credentials == other.mail_server_credentials
            && self.protocol == other.protocol
            && self.http_headers == other.http_headers
            && self.request_data == other.request_data
            && self.expected_reply == other.expected_reply
            && self.no_change_reply == other.no_change_reply
            && self.command_terminator == other.command_terminator
            && self.command_acknowledgement == other.command_acknowledgement
            && self.response_timeout == other.response_timeout
            && self.wait_before_use == other.wait_before_use
            && self.push_token == other.push_token
            && self.push_service == other.push_service
            && self.max_poll_timeout == other.max_poll_timeout
            && self.os_version == other.os_version
            && self.app_build_version == other.app_build_version
            && self.app_build_number == other.app_build_number
            && self.is_sync_request == other.is_sync_request
    }

    /// Mail server URL without its query string, safe to log.
    pub fn redacted_url(&self) -> &str {
        self.mail_server_url
            .split('?')
            .next()
            .unwrap_or_default()
    }
}

impl Zeroize for MailPingInformation {
    fn zeroize(&mut self) {
        self.client_id.zeroize();
        self.client_context.zeroize();
        self.device_id.zeroize();
        self.platform.zeroize();
        self.mail_server_url.zeroize();
        self.mail_server_credentials.zeroize();
        self.protocol.zeroize();
        for (mut k, mut v) in std::mem::take(&mut self.http_headers) {
            k.zeroize();
            v.zeroize();
        }
        self.request_data.zeroize();
        self.expected_reply.zeroize();
        self.no_change_reply.zeroize();
        self.command_terminator.zeroize();
        self.command_acknowledgement.zeroize();
        self.push_token.zeroize();
        self.push_service.zeroize();
        self.os_version.zeroize();
        self.app_build_version.zeroize();
        self.app_build_number.zeroize();
        self.session_id.zeroize();
        self.response_timeout = 0;
        self.wait_before_use = 0;
        self.max_poll_timeout = 0;
        self.is_sync_request = false;
    }
}

impl fmt::Debug for MailPingInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailPingInformation")
            .field("session", &self.log_prefix())
            .field("platform", &self.platform)
            .field("url", &self.redacted_url())
            .field("protocol", &self.protocol)
            .field("request_data_len", &self.request_data.len())
            .field("response_timeout", &self.response_timeout)
            .field("wait_before_use", &self.wait_before_use)
            .field("push_service", &self.push_service)
            .finish_non_exhaustive()
    }
}

/// Byte blobs travel as standard base64 strings.
mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = Option::<String>::deserialize(d)?.unwrap_or_default();
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activesync_info() -> MailPingInformation {
        MailPingInformation {
            client_id: "C1".into(),
            client_context: "ctx1".into(),
            device_id: "D1".into(),
            platform: "ios".into(),
            mail_server_url: "https://mail.example/eas?User=alice".into(),
            mail_server_credentials: Credentials {
                username: "alice".into(),
                password: "hunter2".into(),
            },
            protocol: PROTOCOL_ACTIVESYNC.into(),
            http_headers: BTreeMap::from([("MS-ASProtocolVersion".into(), "14.1".into())]),
            request_data: vec![1, 2, 3],
            no_change_reply: vec![9],
            response_timeout: 600_000,
            ..Default::default()
        }
    }

    #[test]
    fn valid_activesync_passes() {
        assert_eq!(activesync_info().validate(), Ok(()));
    }

    #[test]
    fn missing_identity_fields_rejected() {
        let mut info = activesync_info();
        info.client_context.clear();
        assert_eq!(
            info.validate(),
            Err(ValidationError::MissingField("client_context"))
        );

        let mut info = activesync_info();
        info.mail_server_url.clear();
        assert_eq!(
            info.validate(),
            Err(ValidationError::MissingField("mail_server_url"))
        );
    }

    #[test]
    fn activesync_requires_request_data_and_headers() {
        let mut info = activesync_info();
        info.request_data.clear();
        assert!(matches!(
            info.validate(),
            Err(ValidationError::MissingProtocolData {
                field: "request_data",
                ..
            })
        ));

        let mut info = activesync_info();
        info.http_headers.clear();
        assert!(matches!(
            info.validate(),
            Err(ValidationError::MissingProtocolData {
                field: "http_headers",
                ..
            })
        ));
    }

    #[test]
    fn imap_and_unknown_protocols_rejected() {
        let mut info = activesync_info();
        info.protocol = "IMAP".into();
        assert!(matches!(
            info.validate(),
            Err(ValidationError::UnsupportedProtocol(_))
        ));

        info.protocol = "carrier-pigeon".into();
        assert!(matches!(
            info.validate(),
            Err(ValidationError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn session_id_does_not_change_configuration() {
        let a = activesync_info();
        let mut b = activesync_info();
        b.session_id = "other".into();
        assert!(a.same_configuration(&b));

        b.wait_before_use = 10;
        assert!(!a.same_configuration(&b));
    }

    #[test]
    fn zeroize_wipes_secrets() {
        let mut info = activesync_info();
        info.zeroize();
        assert!(info.mail_server_credentials.password.is_empty());
        assert!(info.mail_server_credentials.username.is_empty());
        assert!(info.request_data.is_empty());
        assert!(info.http_headers.is_empty());
        assert!(info.client_id.is_empty());
    }

    #[test]
    fn debug_hides_secrets() {
        let rendered = format!("{:?}", activesync_info());
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("User=alice"));
        assert!(rendered.contains("D1:C1:ctx1:"));
    }

    #[test]
    fn blobs_are_base64_on_the_wire() {
        let json = serde_json::to_value(activesync_info()).unwrap();
        assert_eq!(json["request_data"], "AQID");
        assert_eq!(json["expected_reply"], "");

        let decoded: MailPingInformation = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.request_data, vec![1, 2, 3]);
        assert!(decoded.expected_reply.is_empty());
    }

    #[test]
    fn max_poll_defaults_to_two_days() {
        let mut info = activesync_info();
        assert_eq!(info.max_poll_timeout_ms(), DEFAULT_MAX_POLL_TIMEOUT_MS);
        info.max_poll_timeout = 5_000;
        assert_eq!(info.max_poll_timeout_ms(), 5_000);
    }
}
