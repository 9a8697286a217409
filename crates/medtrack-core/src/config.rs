//! TOML-based tracker configuration.
//!
//! Stores the tunable constants of the tracker:
//! - Dose windows (confirmation, auto-miss, reminder lead)
//! - Reminder engine trigger window and poll period
//! - Mirror coalescing and store retry policy
//! - Store endpoints
//! - The user's UTC offset, which defines calendar days
//!
//! Configuration is stored at `~/.config/medtrack/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::dose::DoseWindows;
use crate::error::ConfigError;
use crate::sync::RetryPolicy;

/// Returns `~/.config/medtrack[-dev]/` based on MEDTRACK_ENV.
///
/// Set MEDTRACK_ENV=dev to use the development data directory.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("MEDTRACK_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("medtrack-dev")
    } else {
        base_dir.join("medtrack")
    };

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::SaveFailed {
        path: dir.clone(),
        message: e.to_string(),
    })?;
    Ok(dir)
}

/// Dose timing windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowsConfig {
    #[serde(default = "default_confirm_window")]
    pub confirm_window_secs: u64,
    #[serde(default = "default_miss_window")]
    pub miss_window_secs: u64,
    /// How far ahead of a dose a reminder may be scheduled.
    #[serde(default = "default_reminder_lead")]
    pub reminder_lead_secs: u64,
}

/// Reminder engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemindersConfig {
    #[serde(default = "default_trigger_window")]
    pub trigger_window_secs: u64,
    #[serde(default = "default_poll_period")]
    pub poll_period_secs: u64,
    /// Prompt for due doses that have no reminder of their own.
    #[serde(default = "default_true")]
    pub prompt_due_doses: bool,
}

/// Store replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_coalesce_window")]
    pub coalesce_window_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

/// Store endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub mirror_base_url: Option<String>,
    /// Key under which mirror records are stored.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimezoneConfig {
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub windows: WindowsConfig,
    #[serde(default)]
    pub reminders: RemindersConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub timezone: TimezoneConfig,
}

fn default_confirm_window() -> u64 {
    3600
}
fn default_miss_window() -> u64 {
    7200
}
fn default_reminder_lead() -> u64 {
    7200
}
fn default_trigger_window() -> u64 {
    30
}
fn default_poll_period() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_coalesce_window() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay() -> u64 {
    250
}
fn default_max_delay() -> u64 {
    8000
}
fn default_api_base_url() -> String {
    "http://localhost:5000/api".to_string()
}
fn default_request_timeout() -> u64 {
    10
}

impl Default for WindowsConfig {
    fn default() -> Self {
        Self {
            confirm_window_secs: default_confirm_window(),
            miss_window_secs: default_miss_window(),
            reminder_lead_secs: default_reminder_lead(),
        }
    }
}

impl Default for RemindersConfig {
    fn default() -> Self {
        Self {
            trigger_window_secs: default_trigger_window(),
            poll_period_secs: default_poll_period(),
            prompt_due_doses: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: default_coalesce_window(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            mirror_base_url: None,
            user_id: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl TrackerConfig {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value
                            .parse::<bool>()
                            .map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        if let Ok(n) = value.parse::<i64>() {
                            serde_json::Value::Number(n.into())
                        } else {
                            return Err(invalid(format!("cannot parse '{value}' as integer")));
                        }
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    /// Default location of the config file.
    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults if the file is missing.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from `path`, writing defaults there if the file is missing.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: TrackerConfig =
                    toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| save_failed(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Load from disk, returning default on error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by dot-separated key. Call [`save`](Self::save)
    /// to persist.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: TrackerConfig = serde_json::from_value(json).map_err(|e| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }
        })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Cross-field checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.windows.confirm_window_secs == 0 {
            return Err(invalid("windows.confirm_window_secs", "must be positive"));
        }
        if self.windows.miss_window_secs <= self.windows.confirm_window_secs {
            return Err(invalid(
                "windows.miss_window_secs",
                "must exceed the confirmation window",
            ));
        }
        for (key, secs) in [
            ("windows.confirm_window_secs", self.windows.confirm_window_secs),
            ("windows.miss_window_secs", self.windows.miss_window_secs),
            ("windows.reminder_lead_secs", self.windows.reminder_lead_secs),
            ("reminders.trigger_window_secs", self.reminders.trigger_window_secs),
            ("reminders.poll_period_secs", self.reminders.poll_period_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(invalid(key, "must be at most one week"));
            }
        }
        if self.reminders.poll_period_secs == 0 {
            return Err(invalid("reminders.poll_period_secs", "must be positive"));
        }
        if self.sync.max_attempts == 0 {
            return Err(invalid("sync.max_attempts", "must be at least 1"));
        }
        if self.timezone.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(invalid("timezone.utc_offset_minutes", "out of range"));
        }
        Ok(())
    }

    // ── Typed accessors ─────────────────────────────────────────────

    pub fn dose_windows(&self) -> DoseWindows {
        DoseWindows::new(
            window(self.windows.confirm_window_secs),
            window(self.windows.miss_window_secs),
        )
    }

    pub fn reminder_lead(&self) -> Duration {
        window(self.windows.reminder_lead_secs)
    }

    pub fn trigger_window(&self) -> Duration {
        window(self.reminders.trigger_window_secs)
    }

    pub fn poll_period(&self) -> StdDuration {
        StdDuration::from_secs(self.reminders.poll_period_secs)
    }

    pub fn coalesce_window(&self) -> StdDuration {
        StdDuration::from_millis(self.sync.coalesce_window_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts,
            base_delay: StdDuration::from_millis(self.sync.base_delay_ms),
            max_delay: StdDuration::from_millis(self.sync.max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.store.request_timeout_secs)
    }

    /// The user's calendar offset; falls back to UTC if out of range.
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.timezone.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }
}

/// Upper bound for every `*_secs` window setting.
const MAX_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Seconds as a chrono duration, clamped to [`MAX_WINDOW_SECS`] for configs
/// that skipped validation.
fn window(secs: u64) -> Duration {
    i64::try_from(secs.min(MAX_WINDOW_SECS))
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(Duration::zero)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = TrackerConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: TrackerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.windows.confirm_window_secs, 3600);
        assert_eq!(parsed.reminders.trigger_window_secs, 30);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: TrackerConfig = toml::from_str("[windows]\nmiss_window_secs = 9000\n").unwrap();
        assert_eq!(parsed.windows.miss_window_secs, 9000);
        assert_eq!(parsed.windows.confirm_window_secs, 3600);
        assert_eq!(parsed.sync.max_attempts, 4);
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.get("windows.confirm_window_secs"), Some("3600".to_string()));
        assert_eq!(cfg.get("reminders.prompt_due_doses"), Some("true".to_string()));
        assert_eq!(cfg.get("windows.nope"), None);
    }

    #[test]
    fn set_updates_nested_values() {
        let mut cfg = TrackerConfig::default();
        cfg.set("reminders.poll_period_secs", "10").unwrap();
        cfg.set("reminders.prompt_due_doses", "false").unwrap();
        cfg.set("store.user_id", "u-42").unwrap();
        assert_eq!(cfg.reminders.poll_period_secs, 10);
        assert!(!cfg.reminders.prompt_due_doses);
        assert_eq!(cfg.store.user_id.as_deref(), Some("u-42"));
    }

    #[test]
    fn set_rejects_unknown_key_and_bad_type() {
        let mut cfg = TrackerConfig::default();
        assert!(matches!(
            cfg.set("windows.nonexistent", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            cfg.set("reminders.prompt_due_doses", "maybe"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn set_keeps_old_value_when_validation_fails() {
        let mut cfg = TrackerConfig::default();
        assert!(cfg.set("windows.miss_window_secs", "1800").is_err());
        assert_eq!(cfg.windows.miss_window_secs, 7200);
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let mut cfg = TrackerConfig::default();
        assert!(matches!(
            cfg.set("windows.miss_window_secs", "100000000000000000"),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "windows.miss_window_secs"
        ));
        assert!(cfg.set("reminders.trigger_window_secs", "18446744073709551615").is_err());
        assert_eq!(cfg.windows.miss_window_secs, 7200);

        cfg.windows.reminder_lead_secs = u64::MAX;
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.reminder_lead(), Duration::weeks(1));

        cfg.windows.reminder_lead_secs = MAX_WINDOW_SECS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_from_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let cfg = TrackerConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.windows.miss_window_secs, 7200);

        let mut changed = cfg.clone();
        changed.timezone.utc_offset_minutes = 540;
        changed.save_to(&path).unwrap();
        let reloaded = TrackerConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.local_offset(), FixedOffset::east_opt(540 * 60).unwrap());
    }

    #[test]
    fn load_from_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "windows = [").unwrap();
        assert!(matches!(
            TrackerConfig::load_from(&path),
            Err(ConfigError::LoadFailed { .. })
        ));
    }

    #[test]
    fn typed_accessors() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.dose_windows(), DoseWindows::default());
        assert_eq!(cfg.retry_policy().max_attempts, 4);
        assert_eq!(cfg.poll_period(), StdDuration::from_secs(60));
        assert_eq!(cfg.trigger_window(), Duration::seconds(30));
    }
}
