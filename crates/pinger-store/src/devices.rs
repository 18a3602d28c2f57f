use crate::error::StoreError;
use crate::record::{
    DeviceChange, DeviceContact, DeviceInfo, PingerInfo, Record, device_key, get_record,
    insert_record, search_records, update_record,
};
use crate::schema::Filter;
use crate::store::Store;
use pinger::mail_info::{MailPingInformation, SessionKey};
use pinger_crypto::time::now_ms;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Run a blocking store call on tokio's blocking pool.
pub async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// A distinct push destination owned by this host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PushTarget {
    pub platform: String,
    pub push_service: String,
    pub push_token: String,
    pub endpoint_arn: String,
    /// Cleared once the gateway reports the token as invalid.
    pub enabled: bool,
}

impl From<&DeviceInfo> for PushTarget {
    fn from(d: &DeviceInfo) -> Self {
        Self {
            platform: d.platform.clone(),
            push_service: d.push_service.clone(),
            push_token: d.push_token.clone(),
            endpoint_arn: d.endpoint_arn.clone(),
            enabled: d.enabled,
        }
    }
}

/// Outcome of [`DeviceRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub device: DeviceInfo,
    pub change: DeviceChange,
    /// The record did not exist before.
    pub created: bool,
}

impl Registration {
    /// The push endpoint must be (re-)registered with the gateway.
    pub fn needs_endpoint(&self) -> bool {
        self.created || self.change.push_changed || self.device.endpoint_arn.is_empty()
    }
}

/// Device bookkeeping for one backend host.
#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn Store>,
    pinger_id: String,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn Store>, pinger_id: impl Into<String>) -> Self {
        Self {
            store,
            pinger_id: pinger_id.into(),
        }
    }

    pub fn pinger_id(&self) -> &str {
        &self.pinger_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Fetch a device record. A record owned by another host is taken over.
    pub fn find(&self, key: &SessionKey) -> Result<Option<DeviceInfo>, StoreError> {
        let Some(mut di) = get_record::<DeviceInfo>(self.store.as_ref(), &device_key(key))? else {
            return Ok(None);
        };
        if di.pinger != self.pinger_id {
            tracing::warn!(
                device = %key,
                previous = %di.pinger,
                "taking over device record from another pinger"
            );
            di.pinger.clone_from(&self.pinger_id);
            di.updated = now_ms();
            update_record(self.store.as_ref(), &di)?;
        }
        Ok(Some(di))
    }

    /// Get-or-create the device record for a registration and make sure a
    /// contact record exists.
    pub fn register(&self, info: &MailPingInformation) -> Result<Registration, StoreError> {
        let key = info.key();
        let registration = match self.find(&key)? {
            Some(mut device) => {
                let change = device.update_from(info);
                if change.changed {
                    device.validate()?;
                    device.updated = now_ms();
                    update_record(self.store.as_ref(), &device)?;
                    tracing::debug!(device = %key, push_changed = change.push_changed, "device record updated");
                }
                Registration {
                    device,
                    change,
                    created: false,
                }
            }
            None => {
                let device = DeviceInfo::new(info, &self.pinger_id)?;
                match insert_record(self.store.as_ref(), &device) {
                    Ok(()) => {}
                    // Lost a race with a concurrent registration; theirs wins.
                    Err(StoreError::AlreadyExists { .. }) => {
                        return self.register(info);
                    }
                    Err(e) => return Err(e),
                }
                tracing::info!(device = %key, platform = %device.platform, "device registered");
                Registration {
                    device,
                    change: DeviceChange {
                        changed: true,
                        push_changed: true,
                    },
                    created: true,
                }
            }
        };

        self.ensure_contact(&registration.device)?;
        Ok(registration)
    }

    /// Persist changes to a device record, e.g. a newly registered endpoint.
    pub fn save(&self, device: &DeviceInfo) -> Result<(), StoreError> {
        let mut device = device.clone();
        device.updated = now_ms();
        if update_record(self.store.as_ref(), &device)? == 0 {
            return Err(StoreError::Invalid(format!(
                "device {} is not registered",
                device.session_key()
            )));
        }
        Ok(())
    }

    fn ensure_contact(&self, device: &DeviceInfo) -> Result<(), StoreError> {
        let key = device.session_key();
        match get_record::<DeviceContact>(self.store.as_ref(), &device_key(&key))? {
            Some(mut contact) => {
                if contact.push_token != device.push_token
                    || contact.push_service != device.push_service
                    || contact.pinger != device.pinger
                {
                    contact.push_token.clone_from(&device.push_token);
                    contact.push_service.clone_from(&device.push_service);
                    contact.pinger.clone_from(&device.pinger);
                    contact.updated = now_ms();
                    update_record(self.store.as_ref(), &contact)?;
                }
                Ok(())
            }
            None => match insert_record(self.store.as_ref(), &DeviceContact::for_device(device)) {
                Ok(()) | Err(StoreError::AlreadyExists { .. }) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    pub fn contact(&self, key: &SessionKey) -> Result<Option<DeviceContact>, StoreError> {
        get_record(self.store.as_ref(), &device_key(key))
    }

    /// The device reached us (Start, Stop or Defer).
    pub fn update_last_contact(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.touch_contact(key, |c, now| c.last_contact = now)
    }

    /// We attempted to reach the device (a push went out).
    pub fn update_last_contact_request(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.touch_contact(key, |c, now| c.last_contact_request = now)
    }

    fn touch_contact(
        &self,
        key: &SessionKey,
        apply: impl FnOnce(&mut DeviceContact, u64),
    ) -> Result<(), StoreError> {
        let Some(mut contact) = self.contact(key)? else {
            tracing::debug!(device = %key, "no contact record to update");
            return Ok(());
        };
        let now = now_ms();
        apply(&mut contact, now);
        contact.updated = now;
        update_record(self.store.as_ref(), &contact)?;
        Ok(())
    }

    /// Remove the device and its contact record.
    pub fn delete(&self, key: &SessionKey) -> Result<u64, StoreError> {
        let filters = device_key(key);
        let removed = self.store.delete(DeviceInfo::TABLE, &filters)?;
        self.store.delete(DeviceContact::TABLE, &filters)?;
        Ok(removed)
    }

    /// Distinct push destinations across devices owned by this host.
    pub fn owned_push_targets(&self) -> Result<Vec<PushTarget>, StoreError> {
        let devices: Vec<DeviceInfo> = search_records(
            self.store.as_ref(),
            &[Filter::eq("pinger", self.pinger_id.as_str())],
        )?;
        let targets: BTreeSet<PushTarget> = devices
            .iter()
            .filter(|d| d.enabled && !d.push_token.is_empty())
            .map(PushTarget::from)
            .collect();
        Ok(targets.into_iter().collect())
    }

    /// Every client context registered for a push destination.
    pub fn contexts_for(
        &self,
        push_service: &str,
        push_token: &str,
    ) -> Result<Vec<String>, StoreError> {
        let devices: Vec<DeviceInfo> = search_records(
            self.store.as_ref(),
            &[
                Filter::eq("push_service", push_service),
                Filter::eq("push_token", push_token),
            ],
        )?;
        let contexts: BTreeSet<String> = devices.into_iter().map(|d| d.client_context).collect();
        Ok(contexts.into_iter().collect())
    }

    // -- Host heartbeat --

    /// Create or refresh this host's heartbeat row.
    pub fn touch_heartbeat(&self) -> Result<PingerInfo, StoreError> {
        let now = now_ms();
        match self.heartbeat()? {
            Some(mut hb) => {
                hb.updated = now;
                update_record(self.store.as_ref(), &hb)?;
                Ok(hb)
            }
            None => {
                let hb = PingerInfo {
                    pinger: self.pinger_id.clone(),
                    created: now,
                    updated: now,
                };
                insert_record(self.store.as_ref(), &hb)?;
                tracing::info!(pinger = %self.pinger_id, "heartbeat row created");
                Ok(hb)
            }
        }
    }

    pub fn heartbeat(&self) -> Result<Option<PingerInfo>, StoreError> {
        get_record(
            self.store.as_ref(),
            &[Filter::eq("pinger", self.pinger_id.as_str())],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, SqliteStore};

    fn registration(device: &str) -> MailPingInformation {
        MailPingInformation {
            client_id: "C1".to_string(),
            client_context: "ctx1".to_string(),
            device_id: device.to_string(),
            platform: "ios".to_string(),
            push_token: "tok-1".to_string(),
            push_service: "APNS".to_string(),
            os_version: "17.2".to_string(),
            ..Default::default()
        }
    }

    fn stores() -> Vec<Arc<dyn Store>> {
        vec![
            Arc::new(MemoryStore::new()),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn register_round_trips_through_both_stores() {
        for store in stores() {
            let reg = DeviceRegistry::new(store, "host-a");
            let first = reg.register(&registration("D1")).unwrap();
            assert!(first.created);
            assert!(first.needs_endpoint());

            let again = reg.register(&registration("D1")).unwrap();
            assert!(!again.created);
            assert!(!again.change.changed);
            assert_eq!(again.device.created, first.device.created);

            let found = reg.find(&registration("D1").key()).unwrap().unwrap();
            assert_eq!(found.push_token, "tok-1");
            assert_eq!(found.pinger, "host-a");

            let contact = reg.contact(&registration("D1").key()).unwrap().unwrap();
            assert_eq!(contact.push_service, "APNS");
        }
    }

    #[test]
    fn saved_endpoint_survives_identical_registration() {
        for store in stores() {
            let reg = DeviceRegistry::new(store, "host-a");
            let mut device = reg.register(&registration("D1")).unwrap().device;
            device.endpoint_arn = "arn:1".to_string();
            device.enabled = true;
            reg.save(&device).unwrap();

            let again = reg.register(&registration("D1")).unwrap();
            assert!(!again.needs_endpoint());
            assert_eq!(again.device.endpoint_arn, "arn:1");

            let mut moved = registration("D1");
            moved.push_token = "tok-2".to_string();
            let changed = reg.register(&moved).unwrap();
            assert!(changed.change.push_changed);
            assert!(changed.device.endpoint_arn.is_empty());
            assert_eq!(
                reg.contact(&moved.key()).unwrap().unwrap().push_token,
                "tok-2"
            );
        }
    }

    #[test]
    fn find_steals_records_from_other_hosts() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let a = DeviceRegistry::new(store.clone(), "host-a");
        let b = DeviceRegistry::new(store, "host-b");
        a.register(&registration("D1")).unwrap();

        let stolen = b.find(&registration("D1").key()).unwrap().unwrap();
        assert_eq!(stolen.pinger, "host-b");
        assert_eq!(
            a.find(&registration("D1").key()).unwrap().unwrap().pinger,
            "host-a"
        );
    }

    #[test]
    fn contact_timestamps_are_touched() {
        let reg = DeviceRegistry::new(Arc::new(MemoryStore::new()), "host-a");
        let key = registration("D1").key();
        reg.update_last_contact(&key).unwrap();
        assert!(reg.contact(&key).unwrap().is_none());

        reg.register(&registration("D1")).unwrap();
        reg.update_last_contact_request(&key).unwrap();
        let contact = reg.contact(&key).unwrap().unwrap();
        assert!(contact.last_contact_request > 0);
    }

    #[test]
    fn push_targets_are_distinct_and_grouped() {
        let reg = DeviceRegistry::new(Arc::new(MemoryStore::new()), "host-a");
        let mut other_ctx = registration("D1");
        other_ctx.client_context = "ctx2".to_string();
        for info in [registration("D1"), other_ctx.clone()] {
            let mut device = reg.register(&info).unwrap().device;
            device.endpoint_arn = "arn:1".to_string();
            device.enabled = true;
            reg.save(&device).unwrap();
        }

        let targets = reg.owned_push_targets().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].push_token, "tok-1");
        assert!(targets[0].enabled);
        assert_eq!(
            reg.contexts_for("APNS", "tok-1").unwrap(),
            vec!["ctx1".to_string(), "ctx2".to_string()]
        );

        assert_eq!(reg.delete(&other_ctx.key()).unwrap(), 1);
        assert_eq!(reg.contexts_for("APNS", "tok-1").unwrap(), vec!["ctx1"]);
    }

    #[test]
    fn disabled_devices_are_not_push_targets() {
        let reg = DeviceRegistry::new(Arc::new(MemoryStore::new()), "host-a");
        let mut device = reg.register(&registration("D1")).unwrap().device;
        assert!(reg.owned_push_targets().unwrap().is_empty());

        device.endpoint_arn = "arn:1".to_string();
        device.enabled = true;
        reg.save(&device).unwrap();
        assert_eq!(reg.owned_push_targets().unwrap().len(), 1);

        device.endpoint_arn.clear();
        device.enabled = false;
        reg.save(&device).unwrap();
        assert!(reg.owned_push_targets().unwrap().is_empty());
    }

    #[test]
    fn heartbeat_is_created_then_refreshed() {
        let reg = DeviceRegistry::new(Arc::new(MemoryStore::new()), "host-a");
        assert!(reg.heartbeat().unwrap().is_none());
        let first = reg.touch_heartbeat().unwrap();
        let second = reg.touch_heartbeat().unwrap();
        assert_eq!(first.created, second.created);
        assert!(second.updated >= first.updated);
    }
}
