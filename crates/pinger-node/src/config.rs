use anyhow::{Context, Result, bail};
use pinger_push::PayloadSettings;
use pinger_push::payload::DEFAULT_TTL_SECS;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Daemon configuration, read from a TOML file. Every key is optional.
///
/// ```toml
/// [backend]
/// pinger_updater_minutes = 10
/// rearm_on_start = true
///
/// [push]
/// relay_url = "https://push-relay.internal/v1"
/// ```
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub push: PushConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default)]
    pub debug: bool,
    /// How often the host heartbeat row is refreshed.
    #[serde(default = "default_pinger_updater_minutes")]
    pub pinger_updater_minutes: u64,
    /// Ask every device owned by this host to re-register at startup.
    #[serde(default)]
    pub rearm_on_start: bool,
    /// Delay before the startup re-register fan-out begins.
    #[serde(default = "default_rearm_timeout_secs")]
    pub rearm_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub apns_alert: bool,
    #[serde(default = "default_apns_sound")]
    pub apns_sound: String,
    #[serde(default = "default_apns_content_available")]
    pub apns_content_available: u32,
    #[serde(default = "default_apns_expiration_secs")]
    pub apns_expiration_secs: u64,
    #[serde(default)]
    pub ignore_push_failures: bool,
    /// AliveCheck warns at or above this many sessions.
    #[serde(default = "default_soft_session_limit")]
    pub soft_session_limit: usize,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Consecutive transient mail-server failures before a session gives up.
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PushConfig {
    /// Push relay base URL. Without one, pushes go to an in-process
    /// gateway and never leave the host.
    pub relay_url: Option<String>,
    pub api_key: Option<String>,
}

/// Flags that override the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub debug: bool,
    pub ignore_push_failures: bool,
    pub push_relay: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            debug: false,
            pinger_updater_minutes: default_pinger_updater_minutes(),
            rearm_on_start: false,
            rearm_timeout_secs: default_rearm_timeout_secs(),
            apns_alert: true,
            apns_sound: default_apns_sound(),
            apns_content_available: default_apns_content_available(),
            apns_expiration_secs: default_apns_expiration_secs(),
            ignore_push_failures: false,
            soft_session_limit: default_soft_session_limit(),
            stop_grace_ms: default_stop_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_transient_retries: default_max_transient_retries(),
        }
    }
}

impl Config {
    /// Read `path`, or return the defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.backend;
        if b.apns_sound.contains('/') || b.apns_sound.contains('\\') {
            bail!("apns_sound must be a file name, got {:?}", b.apns_sound);
        }
        if b.pinger_updater_minutes == 0 {
            bail!("pinger_updater_minutes must be greater than 0");
        }
        if b.soft_session_limit == 0 {
            bail!("soft_session_limit must be greater than 0");
        }
        if let Some(url) = &self.push.relay_url {
            if url.is_empty() {
                bail!("push.relay_url is empty");
            }
        }
        Ok(())
    }

    /// Flags win over the file.
    pub fn apply(&mut self, cli: &CliOverrides) {
        if cli.debug {
            self.backend.debug = true;
        }
        if cli.ignore_push_failures {
            self.backend.ignore_push_failures = true;
        }
        if let Some(url) = &cli.push_relay {
            self.push.relay_url = Some(url.clone());
        }
    }

    pub fn payload_settings(&self) -> PayloadSettings {
        PayloadSettings {
            apns_alert: self.backend.apns_alert,
            apns_sound: self.backend.apns_sound.clone(),
            apns_content_available: self.backend.apns_content_available,
            ttl_secs: self.backend.apns_expiration_secs,
        }
    }
}

impl BackendConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.pinger_updater_minutes * 60)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_pinger_updater_minutes() -> u64 {
    10
}

fn default_rearm_timeout_secs() -> u64 {
    10
}

fn default_apns_sound() -> String {
    "silent.wav".to_string()
}

fn default_apns_content_available() -> u32 {
    1
}

fn default_apns_expiration_secs() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_soft_session_limit() -> usize {
    10_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_max_transient_retries() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.backend.pinger_updater_minutes, 10);
        assert_eq!(config.backend.apns_sound, "silent.wav");
        assert_eq!(config.backend.apns_expiration_secs, 28 * 24 * 60 * 60);
        assert_eq!(config.backend.soft_session_limit, 10_000);
        assert!(config.push.relay_url.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [backend]
            rearm_on_start = true
            stop_grace_ms = 250

            [push]
            relay_url = "https://relay.example/v1"
            "#,
        )
        .unwrap();
        assert!(config.backend.rearm_on_start);
        assert_eq!(config.backend.stop_grace(), Duration::from_millis(250));
        assert!(config.backend.apns_alert);
        assert_eq!(config.push.relay_url.as_deref(), Some("https://relay.example/v1"));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Config::parse("[backend]\napns_sound = \"../../etc/passwd\"").is_err());
        assert!(Config::parse("[backend]\npinger_updater_minutes = 0").is_err());
        assert!(Config::parse("[backend]\nsoft_session_limit = 0").is_err());
        assert!(Config::parse("[backend]\nno_such_key = 1").is_err());
        assert!(Config::parse("[push]\nrelay_url = \"\"").is_err());
    }

    #[test]
    fn flags_override_file() {
        let mut config = Config::parse(
            "[backend]\nignore_push_failures = false\n[push]\nrelay_url = \"https://a.example\"",
        )
        .unwrap();
        config.apply(&CliOverrides {
            debug: true,
            ignore_push_failures: true,
            push_relay: Some("https://b.example".to_string()),
        });
        assert!(config.backend.debug);
        assert!(config.backend.ignore_push_failures);
        assert_eq!(config.push.relay_url.as_deref(), Some("https://b.example"));

        // Unset flags leave the file's values alone.
        let mut config = Config::parse("[backend]\ndebug = true").unwrap();
        config.apply(&CliOverrides::default());
        assert!(config.backend.debug);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinger.toml");
        std::fs::write(&path, "[backend]\napns_alert = false\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.payload_settings().apns_alert);

        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
        assert_eq!(Config::load(None).unwrap(), Config::default());
    }
}
