use crate::error::PushError;
use crate::gateway::{Attributes, PushGateway};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex as StdMutex;

/// In-process gateway. Endpoints live in memory and every published
/// message is kept, so the daemon can run without a relay and tests can
/// inspect what went out.
#[derive(Default)]
pub struct MemoryGateway {
    inner: StdMutex<Inner>,
}

#[derive(Default)]
struct Inner {
    endpoints: BTreeMap<String, Attributes>,
    sent: Vec<(String, String)>,
    send_failures: VecDeque<PushError>,
    send_attempts: usize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next sends with these errors, in order.
    pub fn fail_sends(&self, errors: impl IntoIterator<Item = PushError>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.send_failures.extend(errors);
        }
    }

    /// Successfully published `(arn, message)` pairs.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .map(|inner| inner.sent.clone())
            .unwrap_or_default()
    }

    /// Every send call, including failed ones.
    pub fn send_attempts(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.send_attempts)
            .unwrap_or_default()
    }

    pub fn endpoint(&self, arn: &str) -> Option<Attributes> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.endpoints.get(arn).cloned())
    }

    /// Overwrite an endpoint, e.g. to simulate the gateway disabling it.
    pub fn put_endpoint(&self, arn: &str, attributes: Attributes) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.endpoints.insert(arn.to_string(), attributes);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, PushError> {
        self.inner
            .lock()
            .map_err(|_| PushError::Gateway("memory gateway poisoned".to_string()))
    }
}

fn endpoint_arn(service: &str, token: &str) -> String {
    format!("arn:memory:{service}:{token}")
}

#[async_trait]
impl PushGateway for MemoryGateway {
    async fn register_endpoint(
        &self,
        service: &str,
        token: &str,
        custom_data: &str,
    ) -> Result<String, PushError> {
        let arn = endpoint_arn(service, token);
        let mut inner = self.lock()?;
        if inner.endpoints.contains_key(&arn) {
            return Err(PushError::EndpointExists { arn });
        }
        let attributes = Attributes::from([
            ("Enabled".to_string(), "true".to_string()),
            ("Token".to_string(), token.to_string()),
            ("CustomUserData".to_string(), custom_data.to_string()),
        ]);
        inner.endpoints.insert(arn.clone(), attributes);
        Ok(arn)
    }

    async fn send(&self, arn: &str, message: &str) -> Result<(), PushError> {
        let mut inner = self.lock()?;
        inner.send_attempts += 1;
        if let Some(err) = inner.send_failures.pop_front() {
            return Err(err);
        }
        match inner.endpoints.get(arn) {
            None => return Err(PushError::NotRegistered),
            Some(attrs) if attrs.get("Enabled").map(String::as_str) != Some("true") => {
                return Err(PushError::EndpointDisabled);
            }
            Some(_) => {}
        }
        inner.sent.push((arn.to_string(), message.to_string()));
        tracing::info!(arn, size = message.len(), "push recorded");
        Ok(())
    }

    async fn get_attributes(&self, arn: &str) -> Result<Attributes, PushError> {
        self.lock()?
            .endpoints
            .get(arn)
            .cloned()
            .ok_or(PushError::NotRegistered)
    }

    async fn set_attributes(&self, arn: &str, attributes: &Attributes) -> Result<(), PushError> {
        let mut inner = self.lock()?;
        let existing = inner
            .endpoints
            .get_mut(arn)
            .ok_or(PushError::NotRegistered)?;
        existing.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_endpoint(&self, arn: &str) -> Result<(), PushError> {
        self.lock()?.endpoints.remove(arn);
        Ok(())
    }
}
