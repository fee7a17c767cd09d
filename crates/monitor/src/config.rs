//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::connection::{ManagerConfig, DEFAULT_MAX_RECONNECT_ATTEMPTS};
use crate::mqtt::has_wildcard;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub reconnect: ReconnectSection,
    pub storage: StorageSection,
    pub web: WebSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub client_id_prefix: String,
    pub keep_alive_sec: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            username: None,
            password: None,
            topic: "garden/soil".into(),
            client_id_prefix: "soil-monitor".into(),
            keep_alive_sec: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_url: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_url: "sqlite:soil-monitor.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `MQTT_*`, `DB_URL` and `WEB_PORT` overrides from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Unset variables leave the file value
    /// alone; unparseable numbers are an error.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v:?}"))?;
        }
        if let Some(v) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = lookup("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Some(v) = lookup("DB_URL") {
            self.storage.db_url = v;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.web.port = v
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {v:?}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);

        if self.reconnect.max_attempts == 0 {
            errors.push("reconnect: max_attempts must be positive".into());
        }
        if self.storage.db_url.trim().is_empty() {
            errors.push("storage: db_url is empty".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt: port must be non-zero".into());
        }

        if m.topic.trim().is_empty() {
            errors.push("mqtt: topic is empty".into());
        } else if has_wildcard(&m.topic) {
            errors.push(format!(
                "mqtt: topic '{}' contains a wildcard; a single concrete topic is required",
                m.topic
            ));
        }

        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt: password set without username".into());
        }
        if m.client_id_prefix.trim().is_empty() {
            errors.push("mqtt: client_id_prefix is empty".into());
        }
        if m.keep_alive_sec == 0 {
            errors.push("mqtt: keep_alive_sec must be positive".into());
        }
    }

    /// Connection manager settings derived from the `[mqtt]` and
    /// `[reconnect]` sections.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            topic: self.mqtt.topic.clone(),
            client_id_prefix: self.mqtt.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_sec),
            max_reconnect_attempts: self.reconnect.max_attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, and
/// validate. A missing file means all defaults.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found; using defaults");
        Config::default()
    };
    config.apply_env()?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
