//! Mail-server adapters. A session task drives one adapter through
//! `connect`, repeated `poll`s and a final `release`.

pub mod activesync;
pub mod backoff;

use async_trait::async_trait;
use pinger::mail_info::{MailPingInformation, MailProtocol};
use regex::Regex;
use std::sync::LazyLock;

pub use activesync::ActiveSyncAdapter;
pub use backoff::Backoff;

/// Result of one long-poll round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The server answered with its no-change reply.
    NoChange,
    NewMail,
    /// Nothing this backend can do will fix the session; the device must
    /// register again.
    ReRegister,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Worth retrying after a backoff.
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    /// The device must register again (bad credentials, vanished host).
    #[error("{0}")]
    ReRegister(String),
}

/// One mail protocol conversation.
///
/// A poll future may be dropped at any await point when the session is
/// stopped or deferred, so implementations must tolerate cancellation.
#[async_trait]
pub trait MailAdapter: Send + Sync {
    async fn connect(&mut self) -> Result<(), AdapterError>;

    async fn poll(&mut self) -> Result<PollOutcome, AdapterError>;

    /// Drop connections. Called once when the session ends.
    async fn release(&mut self);
}

/// Builds the adapter for a new session.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, info: &MailPingInformation) -> Result<Box<dyn MailAdapter>, AdapterError>;
}

/// Picks the adapter by the registration's protocol.
#[derive(Debug, Clone, Default)]
pub struct ProtocolAdapters {
    proxy: Option<String>,
}

impl ProtocolAdapters {
    /// Reads `PINGER_PROXY` for outgoing mail-server requests.
    pub fn from_env() -> Self {
        Self {
            proxy: std::env::var("PINGER_PROXY").ok().filter(|p| !p.is_empty()),
        }
    }
}

impl AdapterFactory for ProtocolAdapters {
    fn create(&self, info: &MailPingInformation) -> Result<Box<dyn MailAdapter>, AdapterError> {
        match MailProtocol::parse(&info.protocol) {
            Some(MailProtocol::ActiveSync) => Ok(Box::new(ActiveSyncAdapter::new(
                info,
                self.proxy.as_deref(),
            )?)),
            Some(MailProtocol::Imap) => Err(AdapterError::Fatal(
                "IMAP sessions are not supported".to_string(),
            )),
            None => Err(AdapterError::Fatal(format!(
                "unknown mail protocol '{}'",
                info.protocol
            ))),
        }
    }
}

static USER_PARAM: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"User=[^&\s]+").ok());

/// Hide `User=...` query parameters in error text.
pub fn redact_user(text: &str) -> String {
    match USER_PARAM.as_ref() {
        Some(re) => re.replace_all(text, "User=<redacted>").into_owned(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_user_parameter() {
        assert_eq!(
            redact_user("error sending request for url (https://m.example/eas?Cmd=Ping&User=alice@example.com&DeviceId=D1)"),
            "error sending request for url (https://m.example/eas?Cmd=Ping&User=<redacted>&DeviceId=D1)"
        );
        assert_eq!(redact_user("connection reset"), "connection reset");
    }

    #[test]
    fn factory_rejects_non_activesync() {
        let adapters = ProtocolAdapters::default();
        let info = MailPingInformation {
            protocol: "IMAP".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            adapters.create(&info).err(),
            Some(AdapterError::Fatal(_))
        ));

        let info = MailPingInformation {
            protocol: "smoke-signals".to_string(),
            ..Default::default()
        };
        assert!(adapters.create(&info).is_err());
    }
}
