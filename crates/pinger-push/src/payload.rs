use crate::error::PushError;
use pinger_crypto::time::now_rfc3339_ms;
use serde_json::{Map, Value, json};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Apple rejects payloads larger than this.
pub const APNS_MAX_PAYLOAD: usize = 256;

/// 28 days.
pub const DEFAULT_TTL_SECS: u64 = 28 * 24 * 60 * 60;

const REREGISTER_ALERT: &str = "Please re-register";

/// What the device is being told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingerNotification {
    /// Session ended; the app must call Start again.
    Register,
    NewMail,
}

impl PingerNotification {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingerNotification::Register => "register",
            PingerNotification::NewMail => "new",
        }
    }
}

/// Platform payload knobs, from the `[backend]` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSettings {
    pub apns_alert: bool,
    pub apns_sound: String,
    pub apns_content_available: u32,
    pub ttl_secs: u64,
}

impl Default for PayloadSettings {
    fn default() -> Self {
        Self {
            apns_alert: true,
            apns_sound: "silent.wav".to_string(),
            apns_content_available: 1,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

impl PayloadSettings {
    /// Only re-register requests show a visible alert.
    fn alert_for(&self, kind: PingerNotification) -> &'static str {
        match kind {
            PingerNotification::Register if self.apns_alert => REREGISTER_ALERT,
            _ => "",
        }
    }
}

/// One notification for one push destination, covering every client
/// context registered with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: PingerNotification,
    pub contexts: Vec<String>,
    pub session_id: String,
}

impl Notification {
    pub fn new(kind: PingerNotification, context: impl Into<String>) -> Self {
        Self {
            kind,
            contexts: vec![context.into()],
            session_id: String::new(),
        }
    }

    pub fn for_contexts(kind: PingerNotification, contexts: Vec<String>) -> Self {
        Self {
            kind,
            contexts,
            session_id: String::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// `{<context>: <kind>, ..., "timestamp": ..., "session": ...}`
    pub fn pinger_map(&self) -> Map<String, Value> {
        self.pinger_map_at(&now_rfc3339_ms())
    }

    fn pinger_map_at(&self, timestamp: &str) -> Map<String, Value> {
        let mut map = Map::new();
        for context in &self.contexts {
            map.insert(context.clone(), Value::from(self.kind.as_str()));
        }
        map.insert("timestamp".to_string(), Value::from(timestamp));
        if !self.session_id.is_empty() {
            map.insert("session".to_string(), Value::from(self.session_id.as_str()));
        }
        map
    }
}

/// Build the gateway message: a JSON object whose values are themselves
/// JSON-encoded strings, one per delivery platform plus `default`.
pub fn build_message(
    platform: &str,
    notification: &Notification,
    settings: &PayloadSettings,
) -> Result<String, PushError> {
    envelope(platform, &notification.pinger_map(), notification.kind, settings)
}

fn envelope(
    platform: &str,
    pinger_map: &Map<String, Value>,
    kind: PingerNotification,
    settings: &PayloadSettings,
) -> Result<String, PushError> {
    let pinger_json = serde_json::to_string(pinger_map)?;
    let mut message = BTreeMap::new();

    match platform {
        "ios" => {
            let mut aps = Map::new();
            if settings.apns_content_available > 0 {
                aps.insert(
                    "content-available".to_string(),
                    Value::from(settings.apns_content_available),
                );
            }
            if !settings.apns_sound.is_empty() {
                aps.insert("sound".to_string(), Value::from(settings.apns_sound.as_str()));
            }
            let alert = settings.alert_for(kind);
            if !alert.is_empty() {
                aps.insert("alert".to_string(), Value::from(alert));
            }
            let apple = serde_json::to_string(&json!({ "pinger": pinger_map, "aps": aps }))?;
            if apple.len() > APNS_MAX_PAYLOAD {
                tracing::error!(size = apple.len(), "apple push payload too large");
                return Err(PushError::PayloadTooLarge { size: apple.len() });
            }
            tracing::debug!(size = apple.len(), "apple push payload");
            message.insert("APNS", apple.clone());
            message.insert("APNS_SANDBOX", apple);
        }
        "android" => {
            let collapse_key = hex::encode(Sha1::digest(pinger_json.as_bytes()));
            let gcm = json!({
                "data": pinger_map,
                "collapse_key": collapse_key,
                "time_to_live": settings.ttl_secs,
                "delay_while_idle": false,
            });
            message.insert("GCM", serde_json::to_string(&gcm)?);
        }
        other => {
            tracing::debug!(platform = other, "no platform payload, sending default only");
        }
    }

    message.insert("default", pinger_json);
    Ok(serde_json::to_string(&message)?)
}
