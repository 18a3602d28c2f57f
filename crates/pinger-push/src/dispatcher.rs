use crate::error::PushError;
use crate::gateway::PushGateway;
use crate::payload::{Notification, PayloadSettings, build_message};
use pinger_store::PushTarget;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Builds platform payloads and delivers them with retry.
#[derive(Clone)]
pub struct Dispatcher {
    gateway: Arc<dyn PushGateway>,
    settings: PayloadSettings,
    max_attempts: u32,
    retry_interval: Duration,
}

impl Dispatcher {
    pub fn new(gateway: Arc<dyn PushGateway>, settings: PayloadSettings) -> Self {
        Self {
            gateway,
            settings,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_interval: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_interval = retry_interval;
        self
    }

    pub fn gateway(&self) -> &Arc<dyn PushGateway> {
        &self.gateway
    }

    pub fn settings(&self) -> &PayloadSettings {
        &self.settings
    }

    /// Deliver one notification. Returns the number of attempts it took.
    ///
    /// The payload is built once; a payload error is returned without
    /// contacting the gateway.
    pub async fn push(
        &self,
        target: &PushTarget,
        notification: &Notification,
    ) -> Result<u32, PushError> {
        if target.endpoint_arn.is_empty() {
            return Err(PushError::NotRegistered);
        }
        if !target.enabled {
            return Err(PushError::EndpointDisabled);
        }
        let message = build_message(&target.platform, notification, &self.settings)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.send(&target.endpoint_arn, &message).await {
                Ok(()) => {
                    tracing::debug!(
                        service = %target.push_service,
                        kind = notification.kind.as_str(),
                        attempt,
                        size = message.len(),
                        "push delivered"
                    );
                    return Ok(attempt);
                }
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => {
                    tracing::warn!(
                        service = %target.push_service,
                        attempt,
                        err = %e,
                        "push failed"
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        service = %target.push_service,
                        attempt,
                        err = %e,
                        "push error, retrying in {:?}",
                        self.retry_interval
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PushGateway;
    use crate::memory::MemoryGateway;
    use crate::payload::PingerNotification;

    async fn registered(gateway: &MemoryGateway, platform: &str) -> PushTarget {
        let arn = gateway
            .register_endpoint("APNS", "tok-1", "C1")
            .await
            .unwrap();
        PushTarget {
            platform: platform.to_string(),
            push_service: "APNS".to_string(),
            push_token: "tok-1".to_string(),
            endpoint_arn: arn,
            enabled: true,
        }
    }

    fn dispatcher(gateway: Arc<MemoryGateway>) -> Dispatcher {
        Dispatcher::new(gateway, PayloadSettings::default())
    }

    fn new_mail() -> Notification {
        Notification::new(PingerNotification::NewMail, "ctx1")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_within_budget() {
        let gateway = Arc::new(MemoryGateway::new());
        let target = registered(&gateway, "ios").await;
        gateway.fail_sends((0..9).map(|i| PushError::Gateway(format!("503 #{i}"))));

        let attempts = dispatcher(gateway.clone())
            .push(&target, &new_mail())
            .await
            .unwrap();
        assert_eq!(attempts, 10);
        assert_eq!(gateway.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_ten_attempts() {
        let gateway = Arc::new(MemoryGateway::new());
        let target = registered(&gateway, "android").await;
        gateway.fail_sends((0..10).map(|_| PushError::Gateway("503".to_string())));

        let started = tokio::time::Instant::now();
        let err = dispatcher(gateway.clone())
            .push(&target, &new_mail())
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Gateway(_)));
        assert_eq!(gateway.send_attempts(), 10);
        assert!(gateway.sent().is_empty());
        // Nine pauses between ten attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn invalid_token_is_not_retried() {
        let gateway = Arc::new(MemoryGateway::new());
        let target = registered(&gateway, "ios").await;
        gateway.fail_sends([PushError::InvalidToken("tok-1".to_string())]);

        let err = dispatcher(gateway.clone())
            .push(&target, &new_mail())
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::InvalidToken(_)));
        assert_eq!(gateway.send_attempts(), 1);
    }

    #[tokio::test]
    async fn oversized_payload_never_reaches_gateway() {
        let gateway = Arc::new(MemoryGateway::new());
        let target = registered(&gateway, "ios").await;
        let contexts = (0..20).map(|i| format!("context-{i:04}")).collect();
        let n = Notification::for_contexts(PingerNotification::NewMail, contexts);

        let err = dispatcher(gateway.clone())
            .push(&target, &n)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::PayloadTooLarge { .. }));
        assert_eq!(gateway.send_attempts(), 0);
    }

    #[tokio::test]
    async fn unregistered_target_is_rejected() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut target = registered(&gateway, "ios").await;
        target.endpoint_arn.clear();
        let err = dispatcher(gateway)
            .push(&target, &new_mail())
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::NotRegistered));
    }

    #[tokio::test]
    async fn disabled_target_is_not_sent() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut target = registered(&gateway, "android").await;
        target.enabled = false;
        let err = dispatcher(gateway.clone())
            .push(&target, &new_mail())
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::EndpointDisabled));
        assert_eq!(gateway.send_attempts(), 0);
    }
}
