//! Configuration loading for the index tracker.
//!
//! Layered config: defaults -> config file -> env vars.
//! The default config file lives at ~/.config/index-tracker/config.toml.
//! Environment variables use the `TRACKER_` prefix and `__` between
//! sections, e.g. `TRACKER_TRACKING__REINDEX_LAG_MS=2000`.

use std::path::PathBuf;
use std::str::FromStr;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::TrackerError;

/// Index recovery performed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecoveryMode {
    /// Do nothing, not even a check.
    None,
    /// Sample the start and end of the transaction history and warn when
    /// the index is behind. Never repairs.
    #[default]
    Validate,
    /// Validate, then rebuild fully when the start of history is missing or
    /// top up through the tracker when only the end is missing.
    Auto,
    /// Walk every recorded transaction and reindex it.
    Full,
}

impl FromStr for RecoveryMode {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(RecoveryMode::None),
            "VALIDATE" => Ok(RecoveryMode::Validate),
            "AUTO" => Ok(RecoveryMode::Auto),
            "FULL" => Ok(RecoveryMode::Full),
            other => Err(TrackerError::InvalidInput(format!(
                "unknown recovery mode '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryMode::None => write!(f, "NONE"),
            RecoveryMode::Validate => write!(f, "VALIDATE"),
            RecoveryMode::Auto => write!(f, "AUTO"),
            RecoveryMode::Full => write!(f, "FULL"),
        }
    }
}

/// Settings for live transaction tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSettings {
    /// Longest transaction the tracker must cope with, in minutes.
    /// Bounds the start-up look-back and the lifetime of voids.
    #[serde(default = "default_max_txn_duration_minutes")]
    pub max_txn_duration_minutes: u64,

    /// Minimum age of a transaction before the tracker looks at it.
    #[serde(default = "default_reindex_lag_ms")]
    pub reindex_lag_ms: u64,

    /// Transactions requested per query.
    #[serde(default = "default_max_record_set_size")]
    pub max_record_set_size: usize,

    /// Transactions grouped into one index commit.
    #[serde(default = "default_max_transactions_per_commit")]
    pub max_transactions_per_commit: usize,

    /// Reindex worker threads. Fewer than 2 reindexes inline.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Seconds the head of the commit queue may go without progress.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// Disable indexing inside user transactions once tracking starts.
    #[serde(default)]
    pub disable_in_transaction_indexing: bool,

    /// Cron expression for the tracking job (6-field, seconds first).
    #[serde(default = "default_tracking_cron")]
    pub cron: String,

    /// Max jitter applied before each tracking run.
    #[serde(default)]
    pub jitter_secs: u64,
}

fn default_max_txn_duration_minutes() -> u64 {
    60
}

fn default_reindex_lag_ms() -> u64 {
    1000
}

fn default_max_record_set_size() -> usize {
    1000
}

fn default_max_transactions_per_commit() -> usize {
    100
}

fn default_worker_threads() -> usize {
    4
}

fn default_inactivity_timeout_secs() -> u64 {
    60
}

fn default_tracking_cron() -> String {
    "*/10 * * * * *".to_string()
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            max_txn_duration_minutes: default_max_txn_duration_minutes(),
            reindex_lag_ms: default_reindex_lag_ms(),
            max_record_set_size: default_max_record_set_size(),
            max_transactions_per_commit: default_max_transactions_per_commit(),
            worker_threads: default_worker_threads(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            disable_in_transaction_indexing: false,
            cron: default_tracking_cron(),
            jitter_secs: 0,
        }
    }
}

/// Settings for startup index recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    #[serde(default)]
    pub mode: RecoveryMode,

    /// Abort a full rebuild on the first failed transaction.
    #[serde(default = "default_true")]
    pub stop_on_error: bool,

    /// Keep the store read-only while recovery runs.
    #[serde(default)]
    pub lock_server: bool,

    #[serde(default = "default_max_transactions_per_commit")]
    pub max_transactions_per_commit: usize,
}

fn default_true() -> bool {
    true
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::default(),
            stop_on_error: true,
            lock_server: false,
            max_transactions_per_commit: default_max_transactions_per_commit(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tracking: TrackingSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Path to the RocksDB directory holding recovery checkpoints
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_checkpoint_path() -> String {
    ProjectDirs::from("", "", "index-tracker")
        .map(|p| p.data_local_dir().join("checkpoints"))
        .unwrap_or_else(|| PathBuf::from("./checkpoints"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tracking: TrackingSettings::default(),
            recovery: RecoverySettings::default(),
            checkpoint_path: default_checkpoint_path(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/index-tracker/config.toml)
    /// 3. Explicit config file (optional)
    /// 4. Environment variables (TRACKER_*)
    pub fn load(config_path: Option<&str>) -> Result<Self, TrackerError> {
        let config_dir = ProjectDirs::from("", "", "index-tracker")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("checkpoint_path", default_checkpoint_path())
            .map_err(|e| TrackerError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TrackerError::Config(e.to_string()))?
            .set_default("recovery.mode", RecoveryMode::default().to_string())
            .map_err(|e| TrackerError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("TRACKER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TrackerError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TrackerError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Enforce the lower bounds the tracker relies on.
    pub fn validate(&self) -> Result<(), TrackerError> {
        let tracking = &self.tracking;
        if tracking.max_txn_duration_minutes < 1 {
            return Err(TrackerError::Config(
                "maximum transaction duration must be at least one minute".to_string(),
            ));
        }
        if tracking.reindex_lag_ms < 1 {
            return Err(TrackerError::Config(
                "reindex lag must be at least 1 millisecond".to_string(),
            ));
        }
        if tracking.max_record_set_size == 0 || tracking.max_transactions_per_commit == 0 {
            return Err(TrackerError::Config(
                "record set size and transactions per commit must be > 0".to_string(),
            ));
        }
        if self.recovery.max_transactions_per_commit == 0 {
            return Err(TrackerError::Config(
                "recovery transactions per commit must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Expand ~ in checkpoint_path to the home directory
    pub fn expanded_checkpoint_path(&self) -> PathBuf {
        if let Some(rest) = self.checkpoint_path.strip_prefix("~/") {
            if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.checkpoint_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.tracking.max_txn_duration_minutes, 60);
        assert_eq!(settings.tracking.reindex_lag_ms, 1000);
        assert_eq!(settings.tracking.max_record_set_size, 1000);
        assert_eq!(settings.tracking.max_transactions_per_commit, 100);
        assert_eq!(settings.recovery.mode, RecoveryMode::Validate);
        assert!(settings.recovery.stop_on_error);
        assert!(!settings.recovery.lock_server);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::load(None).unwrap();
        assert!(settings.tracking.max_txn_duration_minutes >= 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("tracker-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tracker.toml");
        std::fs::write(
            &path,
            "[tracking]\nreindex_lag_ms = 2500\n\n[recovery]\nmode = \"FULL\"\nstop_on_error = false\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path.to_string_lossy())).unwrap();
        assert_eq!(settings.tracking.reindex_lag_ms, 2500);
        assert_eq!(settings.recovery.mode, RecoveryMode::Full);
        assert!(!settings.recovery.stop_on_error);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_lag() {
        let mut settings = Settings::default();
        settings.tracking.reindex_lag_ms = 0;
        assert!(matches!(settings.validate(), Err(TrackerError::Config(_))));

        let mut settings = Settings::default();
        settings.tracking.max_txn_duration_minutes = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_expanded_checkpoint_path() {
        let mut settings = Settings::default();
        settings.checkpoint_path = "/var/lib/tracker/checkpoints".to_string();
        assert_eq!(
            settings.expanded_checkpoint_path(),
            PathBuf::from("/var/lib/tracker/checkpoints")
        );

        settings.checkpoint_path = "~/tracker/checkpoints".to_string();
        let expanded = settings.expanded_checkpoint_path();
        assert!(expanded.ends_with("tracker/checkpoints"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_recovery_mode_parsing() {
        assert_eq!("auto".parse::<RecoveryMode>().unwrap(), RecoveryMode::Auto);
        assert_eq!("FULL".parse::<RecoveryMode>().unwrap(), RecoveryMode::Full);
        assert_eq!(" none ".parse::<RecoveryMode>().unwrap(), RecoveryMode::None);
        assert!("partial".parse::<RecoveryMode>().is_err());
    }

    #[test]
    fn test_recovery_mode_serialization() {
        let json = serde_json::to_string(&RecoveryMode::Validate).unwrap();
        assert_eq!(json, "\"VALIDATE\"");
        let mode: RecoveryMode = serde_json::from_str("\"AUTO\"").unwrap();
        assert_eq!(mode, RecoveryMode::Auto);
    }
}
