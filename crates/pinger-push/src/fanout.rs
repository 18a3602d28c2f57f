use crate::dispatcher::Dispatcher;
use crate::payload::{Notification, PingerNotification};
use pinger_store::{DeviceRegistry, StoreError, run_blocking};
use std::time::Duration;

/// Pause after this many successful sends.
const BATCH_SIZE: usize = 10;
const BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Ask every device owned by this host to re-register. Each distinct push
/// destination gets one `register` notification naming all of its client
/// contexts. Returns the number of pushes sent.
///
/// Individual push failures are logged and skipped; only store failures
/// abort the run.
pub async fn alert_all_devices(
    registry: &DeviceRegistry,
    dispatcher: &Dispatcher,
) -> Result<usize, StoreError> {
    let reg = registry.clone();
    let targets = run_blocking(move || reg.owned_push_targets()).await?;
    tracing::info!(targets = targets.len(), "alerting all devices to re-register");

    let mut sent = 0;
    let mut batch = 0;
    for target in targets {
        let reg = registry.clone();
        let (service, token) = (target.push_service.clone(), target.push_token.clone());
        let contexts = run_blocking(move || reg.contexts_for(&service, &token)).await?;
        if contexts.is_empty() {
            continue;
        }

        let notification = Notification::for_contexts(PingerNotification::Register, contexts);
        match dispatcher.push(&target, &notification).await {
            Ok(_) => {
                sent += 1;
                batch += 1;
            }
            Err(e) => {
                tracing::error!(service = %target.push_service, err = %e, "could not send re-register push");
            }
        }
        if batch >= BATCH_SIZE {
            batch = 0;
            tokio::time::sleep(BATCH_PAUSE).await;
        }
    }
    tracing::info!(sent, "re-register pushes sent");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGateway;
    use crate::payload::PayloadSettings;
    use crate::endpoint::ensure_device_endpoint;
    use pinger::mail_info::MailPingInformation;
    use pinger_store::MemoryStore;
    use std::sync::Arc;

    fn registration(context: &str, device: &str, token: &str) -> MailPingInformation {
        MailPingInformation {
            client_id: "C1".to_string(),
            client_context: context.to_string(),
            device_id: device.to_string(),
            platform: "android".to_string(),
            push_service: "GCM".to_string(),
            push_token: token.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn one_push_per_destination_with_all_contexts() {
        let registry = DeviceRegistry::new(Arc::new(MemoryStore::new()), "host-a");
        let gateway = Arc::new(MemoryGateway::new());

        for info in [
            registration("ctx1", "D1", "tok-1"),
            registration("ctx2", "D1", "tok-1"),
            registration("ctx1", "D2", "tok-2"),
        ] {
            let mut device = registry.register(&info).unwrap().device;
            ensure_device_endpoint(gateway.as_ref(), &mut device, false)
                .await
                .unwrap();
            registry.save(&device).unwrap();
        }

        let dispatcher = Dispatcher::new(gateway.clone(), PayloadSettings::default());
        let sent = alert_all_devices(&registry, &dispatcher).await.unwrap();
        assert_eq!(sent, 2);

        let messages = gateway.sent();
        let to_tok1 = messages
            .iter()
            .find(|(arn, _)| arn.ends_with("tok-1"))
            .map(|(_, m)| m.clone())
            .unwrap();
        let outer: serde_json::Value = serde_json::from_str(&to_tok1).unwrap();
        let gcm: serde_json::Value =
            serde_json::from_str(outer["GCM"].as_str().unwrap()).unwrap();
        assert_eq!(gcm["data"]["ctx1"], "register");
        assert_eq!(gcm["data"]["ctx2"], "register");
    }

    #[tokio::test]
    async fn unregistered_devices_are_skipped() {
        let registry = DeviceRegistry::new(Arc::new(MemoryStore::new()), "host-a");
        registry
            .register(&registration("ctx1", "D1", "tok-1"))
            .unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let dispatcher = Dispatcher::new(gateway.clone(), PayloadSettings::default());

        assert_eq!(alert_all_devices(&registry, &dispatcher).await.unwrap(), 0);
        assert_eq!(gateway.send_attempts(), 0);
    }
}
