use crate::error::PushError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Endpoint attributes as the gateway reports them (`Enabled`, `Token`,
/// `CustomUserData`, ...).
pub type Attributes = BTreeMap<String, String>;

/// A platform push gateway holding one endpoint per device token.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Create an endpoint for a device token. Fails with
    /// [`PushError::EndpointExists`] when the token already has one.
    async fn register_endpoint(
        &self,
        service: &str,
        token: &str,
        custom_data: &str,
    ) -> Result<String, PushError>;

    /// Publish a message built by [`crate::payload::build_message`].
    async fn send(&self, arn: &str, message: &str) -> Result<(), PushError>;

    async fn get_attributes(&self, arn: &str) -> Result<Attributes, PushError>;

    async fn set_attributes(&self, arn: &str, attributes: &Attributes) -> Result<(), PushError>;

    async fn delete_endpoint(&self, arn: &str) -> Result<(), PushError>;
}
