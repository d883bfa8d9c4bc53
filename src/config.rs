use std::time::Duration;

use crate::models::Setting;
use crate::retry::RetryPolicy;

pub const KEY_AI_API_KEY: &str = "gemini_api_key";
pub const KEY_AI_MODEL: &str = "gemini_model";
pub const KEY_ACCESS_TOKEN: &str = "google_access_token";
pub const KEY_LAST_SYNC: &str = "last_sync_timestamp";
pub const KEY_ACTIVE_LIST: &str = "active_task_list";
pub const KEY_DEBOUNCE_SECS: &str = "sync_debounce_secs";
pub const KEY_STALE_THRESHOLD: &str = "sync_stale_threshold";

pub const DEFAULT_AI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_TASK_LIST: &str = "@default";
pub const ENVELOPE_VERSION: &str = "1.2";
pub const BACKUP_NAME: &str = "battle_plan_data.json";

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);
const DEFAULT_STALE_THRESHOLD: usize = 1;
const RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Quiet period after the last task mutation before an automatic backup runs.
    pub debounce_window: Duration,
    /// A newer cloud copy replaces local data only while the device holds at most
    /// this many tasks.
    pub stale_local_threshold: usize,
    pub envelope_version: String,
    pub backup_name: String,
    /// Completed tasks older than this are purged at startup.
    pub retention: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE,
            stale_local_threshold: DEFAULT_STALE_THRESHOLD,
            envelope_version: ENVELOPE_VERSION.to_string(),
            backup_name: BACKUP_NAME.to_string(),
            retention: RETENTION,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults with any overrides found in the settings table. Unparsable values
    /// are ignored with a warning.
    pub fn from_settings(settings: &[Setting]) -> Self {
        let mut config = Self::default();
        if let Some(raw) = setting_value(settings, KEY_DEBOUNCE_SECS) {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => config.debounce_window = Duration::from_secs(secs),
                _ => log::warn!("ignoring invalid {KEY_DEBOUNCE_SECS}={raw:?}"),
            }
        }
        if let Some(raw) = setting_value(settings, KEY_STALE_THRESHOLD) {
            match raw.parse::<usize>() {
                Ok(threshold) => config.stale_local_threshold = threshold,
                Err(_) => log::warn!("ignoring invalid {KEY_STALE_THRESHOLD}={raw:?}"),
            }
        }
        config
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub access_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ai_api_key", &self.ai_api_key.as_ref().map(|_| "<redacted>"))
            .field("ai_model", &self.ai_model)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn from_settings(settings: &[Setting]) -> Self {
        Self {
            ai_api_key: setting_value(settings, KEY_AI_API_KEY).map(str::to_string),
            ai_model: setting_value(settings, KEY_AI_MODEL)
                .map(|m| m.trim_start_matches("models/").to_string())
                .unwrap_or_else(|| DEFAULT_AI_MODEL.to_string()),
            access_token: setting_value(settings, KEY_ACCESS_TOKEN).map(str::to_string),
        }
    }

    pub fn has_ai_key(&self) -> bool {
        self.ai_api_key.is_some()
    }
}

/// Keys that describe this device rather than the user's data. They are never
/// written into a backup and never overwritten by a restore.
pub fn is_device_local(key: &str) -> bool {
    matches!(key, KEY_LAST_SYNC | KEY_ACCESS_TOKEN)
}

/// Trimmed, non-empty value for `key`.
pub fn setting_value<'a>(settings: &'a [Setting], key: &str) -> Option<&'a str> {
    settings
        .iter()
        .find(|s| s.key == key)
        .map(|s| s.value.trim())
        .filter(|v| !v.is_empty())
}

/// `BATTLE_PLAN_DATA_DIR`, else the platform data directory.
#[cfg(feature = "app")]
pub fn data_dir() -> std::path::PathBuf {
    std::env::var_os("BATTLE_PLAN_DATA_DIR")
        .filter(|value| !value.is_empty())
        .map(std::path::PathBuf::from)
        .or_else(|| dirs::data_dir().map(|dir| dir.join("battle-plan")))
        .unwrap_or_else(|| std::path::PathBuf::from("battle-plan-data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce_window, Duration::from_secs(10));
        assert_eq!(config.stale_local_threshold, 1);
        assert_eq!(config.envelope_version, "1.2");
        assert_eq!(config.backup_name, "battle_plan_data.json");
        assert_eq!(config.retention, Duration::from_secs(2_592_000));
    }

    #[test]
    fn settings_override_tunables() {
        let settings = vec![
            Setting::new(KEY_DEBOUNCE_SECS, "3"),
            Setting::new(KEY_STALE_THRESHOLD, "0"),
        ];
        let config = SyncConfig::from_settings(&settings);
        assert_eq!(config.debounce_window, Duration::from_secs(3));
        assert_eq!(config.stale_local_threshold, 0);

        let bad = vec![
            Setting::new(KEY_DEBOUNCE_SECS, "0"),
            Setting::new(KEY_STALE_THRESHOLD, "many"),
        ];
        assert_eq!(SyncConfig::from_settings(&bad), SyncConfig::default());
    }

    #[test]
    fn credentials_ignore_blank_values() {
        let settings = vec![
            Setting::new(KEY_AI_API_KEY, "  "),
            Setting::new(KEY_AI_MODEL, "models/gemini-2.0"),
            Setting::new(KEY_ACCESS_TOKEN, "tok"),
        ];
        let creds = Credentials::from_settings(&settings);
        assert!(!creds.has_ai_key());
        assert_eq!(creds.ai_model, "gemini-2.0");
        assert_eq!(creds.access_token.as_deref(), Some("tok"));
        assert!(!format!("{creds:?}").contains("tok"));

        let empty = Credentials::from_settings(&[]);
        assert_eq!(empty.ai_model, DEFAULT_AI_MODEL);
    }

    #[test]
    fn device_local_keys() {
        assert!(is_device_local(KEY_LAST_SYNC));
        assert!(is_device_local(KEY_ACCESS_TOKEN));
        assert!(!is_device_local(KEY_AI_API_KEY));
        assert!(!is_device_local(KEY_ACTIVE_LIST));
    }
}
