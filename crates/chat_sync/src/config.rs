use std::{
    collections::HashMap,
    fs,
    path::Path,
    time::Duration,
};

use anyhow::Context;

use crate::live_channel::BackoffPolicy;

pub const DEFAULT_SETTINGS_FILE: &str = "coach.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub platform_url: String,
    pub anon_key: String,
    pub push_relay_url: String,
    pub realtime_heartbeat_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    pub token_refresh_margin_secs: i64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            platform_url: "http://127.0.0.1:54321".into(),
            anon_key: String::new(),
            push_relay_url: "https://exp.host/--/api/v2/push/send".into(),
            realtime_heartbeat_secs: 25,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: 8,
            token_refresh_margin_secs: 60,
        }
    }
}

impl ClientSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            multiplier: 2,
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.realtime_heartbeat_secs.max(1))
    }

    pub fn token_refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_margin_secs)
    }
}

/// Defaults, then `path` (or `coach.toml` when present), then environment.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
            apply_file(&mut settings, &raw)
                .with_context(|| format!("invalid settings file '{}'", path.display()))?;
        }
        None => {
            if let Ok(raw) = fs::read_to_string(DEFAULT_SETTINGS_FILE) {
                apply_file(&mut settings, &raw)
                    .with_context(|| format!("invalid settings file '{DEFAULT_SETTINGS_FILE}'"))?;
            }
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings.platform_url = settings.platform_url.trim_end_matches('/').to_string();
    Ok(settings)
}

fn apply_file(settings: &mut ClientSettings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: HashMap<String, toml::Value> = toml::from_str(raw)?;
    for (key, value) in file_cfg {
        let value = match value {
            toml::Value::String(s) => s,
            other => other.to_string(),
        };
        apply_value(settings, &key, &value);
    }
    Ok(())
}

fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    for key in [
        "platform_url",
        "anon_key",
        "push_relay_url",
        "realtime_heartbeat_secs",
        "reconnect_initial_ms",
        "reconnect_max_ms",
        "reconnect_max_attempts",
        "token_refresh_margin_secs",
    ] {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = lookup(&upper) {
            apply_value(settings, key, &v);
        }
        if let Some(v) = lookup(&format!("APP__{upper}")) {
            apply_value(settings, key, &v);
        }
    }
}

fn apply_value(settings: &mut ClientSettings, key: &str, value: &str) {
    match key {
        "platform_url" => settings.platform_url = value.to_string(),
        "anon_key" => settings.anon_key = value.to_string(),
        "push_relay_url" => settings.push_relay_url = value.to_string(),
        "realtime_heartbeat_secs" => {
            if let Ok(parsed) = value.parse() {
                settings.realtime_heartbeat_secs = parsed;
            }
        }
        "reconnect_initial_ms" => {
            if let Ok(parsed) = value.parse() {
                settings.reconnect_initial_ms = parsed;
            }
        }
        "reconnect_max_ms" => {
            if let Ok(parsed) = value.parse() {
                settings.reconnect_max_ms = parsed;
            }
        }
        "reconnect_max_attempts" => {
            if let Ok(parsed) = value.parse() {
                settings.reconnect_max_attempts = parsed;
            }
        }
        "token_refresh_margin_secs" => {
            if let Ok(parsed) = value.parse() {
                settings.token_refresh_margin_secs = parsed;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
