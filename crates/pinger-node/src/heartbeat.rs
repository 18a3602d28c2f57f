use pinger_store::{DeviceRegistry, run_blocking};
use std::time::Duration;
use tokio::sync::watch;

/// Refresh this host's heartbeat record every `interval` until shutdown.
/// Failures are logged and retried on the next tick.
pub async fn run(devices: DeviceRegistry, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already wrote the record.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|down| *down) => break,
        }
        let registry = devices.clone();
        match run_blocking(move || registry.touch_heartbeat()).await {
            Ok(info) => tracing::debug!(pinger = %info.pinger, "heartbeat updated"),
            Err(e) => tracing::warn!(err = %e, "heartbeat update failed"),
        }
    }
    tracing::debug!("heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinger_store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn refreshes_until_shutdown() {
        let devices = DeviceRegistry::new(Arc::new(MemoryStore::new()), "hb-test");
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run(devices.clone(), Duration::from_secs(600), rx));

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert!(devices.heartbeat().unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        for _ in 0..100 {
            if devices.heartbeat().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(devices.heartbeat().unwrap().unwrap().pinger, "hb-test");

        tx.send_replace(true);
        task.await.unwrap();
    }
}
