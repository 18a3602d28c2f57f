/// Errors from building or delivering a push notification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PushError {
    #[error("invalid push token: {0}")]
    InvalidToken(String),

    #[error("apple payload is {size} bytes, limit is {}", crate::payload::APNS_MAX_PAYLOAD)]
    PayloadTooLarge { size: usize },

    #[error("endpoint {arn} already exists")]
    EndpointExists { arn: String },

    #[error("endpoint is disabled")]
    EndpointDisabled,

    #[error("endpoint not registered")]
    NotRegistered,

    #[error("push gateway: {0}")]
    Gateway(String),

    #[error("could not encode payload: {0}")]
    Serialize(String),
}

impl PushError {
    /// Worth another attempt. Everything except gateway hiccups is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PushError::Gateway(_))
    }
}

impl From<serde_json::Error> for PushError {
    fn from(e: serde_json::Error) -> Self {
        PushError::Serialize(e.to_string())
    }
}
