use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "DEAL_DASHBOARD_CONFIG";
pub const DATA_DIR_ENV: &str = "DEAL_DASHBOARD_DATA_DIR";
pub const TIMEOUT_ENV: &str = "DEAL_DASHBOARD_TIMEOUT_MS";
pub const REFRESH_POLICY_ENV: &str = "DEAL_DASHBOARD_REFRESH_POLICY";
pub const CHANNEL_ENV: &str = "DEAL_DASHBOARD_CHANNEL";

/// Headless runner credentials. Never read from the settings file.
pub const EMAIL_ENV: &str = "DEAL_DASHBOARD_EMAIL";
pub const PASSWORD_ENV: &str = "DEAL_DASHBOARD_PASSWORD";
pub const DISPLAY_NAME_ENV: &str = "DEAL_DASHBOARD_NAME";

pub const DEFAULT_REALTIME_CHANNEL: &str = "sales-deals-changes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshPolicy {
    /// Triggers arriving during a fetch collapse into one follow-up fetch.
    Coalesce,
    /// Every trigger issues its own fetch pair.
    PerNotification,
}

impl RefreshPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "coalesce" => Some(Self::Coalesce),
            "per-notification" | "per_notification" => Some(Self::PerNotification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub data_dir: PathBuf,
    pub realtime_channel: String,
    pub request_timeout_ms: u64,
    pub refresh_policy: RefreshPolicy,
    pub session_ttl_secs: i64,
    /// Embedded backend creates the profile row itself on sign-up.
    pub profile_trigger: bool,
    pub log_to_file: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".deal-dashboard"),
            realtime_channel: DEFAULT_REALTIME_CHANNEL.to_string(),
            request_timeout_ms: 10_000,
            refresh_policy: RefreshPolicy::Coalesce,
            session_ttl_secs: 3600,
            profile_trigger: true,
            log_to_file: true,
        }
    }
}

impl AppSettings {
    /// Defaults, then the JSON file named by `DEAL_DASHBOARD_CONFIG`, then
    /// individual environment overrides.
    pub fn load() -> AppResult<Self> {
        let mut settings = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let update: serde_json::Value = serde_json::from_str(&raw)?;
        let mut merged = serde_json::to_value(Self::default())?;
        merge_json(&mut merged, update);
        Ok(serde_json::from_value(merged)?)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> AppResult<()> {
        if let Some(dir) = lookup(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(TIMEOUT_ENV) {
            self.request_timeout_ms = raw
                .trim()
                .parse()
                .map_err(|_| AppError::Internal(format!("{} must be a number of milliseconds", TIMEOUT_ENV)))?;
        }
        if let Some(raw) = lookup(REFRESH_POLICY_ENV) {
            self.refresh_policy = RefreshPolicy::parse(&raw)
                .ok_or_else(|| AppError::Internal(format!("Unknown refresh policy: {}", raw)))?;
        }
        if let Some(channel) = lookup(CHANNEL_ENV) {
            if !channel.trim().is_empty() {
                self.realtime_channel = channel.trim().to_string();
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("dashboard.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
