//! Configuration management for lifeline.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::EventSource;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "lifeline";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "lifeline.db";

/// Dialable emergency number: digits plus the keypad symbols.
const EMERGENCY_NUMBER_PATTERN: &str = r"^[0-9+*#]{2,15}$";

/// Absolute http(s) URL with a host.
const ENDPOINT_PATTERN: &str = r"^https?://[A-Za-z0-9.\-]+(:[0-9]{1,5})?(/\S*)?$";

/// Longest confirmation countdown the coordinator will run.
pub const MAX_COUNTDOWN: Duration = Duration::from_secs(60 * 60);

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `LIFELINE_`, sections split by `__`)
/// 2. TOML config file at `~/.config/lifeline/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Crash detector thresholds.
    pub detector: DetectorConfig,
    /// Countdown and merge policy.
    pub coordinator: CoordinatorConfig,
    /// Dead-man's switch configuration.
    pub safety: SafetyConfig,
    /// Retry policy for the alert queue.
    pub queue: QueueConfig,
    /// Connectivity monitoring.
    pub connectivity: ConnectivityConfig,
    /// Delivery channels.
    pub channels: ChannelsConfig,
    /// Device identity.
    pub device: DeviceConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/lifeline/lifeline.db`
    pub database_path: Option<PathBuf>,
    /// Days to keep finished events. Set to 0 to keep forever.
    pub retention_days: u32,
}

/// Crash detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Samples kept in the sliding window (about 10 s at 10 Hz).
    pub window_size: usize,
    /// Magnitude (m/s²) that counts as an impact.
    pub impact_threshold: f64,
    /// Rolling mean (m/s²) that confirms a sustained deceleration.
    pub sustained_threshold: f64,
    /// Samples in the rolling mean.
    pub rolling_window: usize,
    /// Samples required before any analysis.
    pub min_samples: usize,
    /// Samples copied into the diagnostic snapshot.
    pub snapshot_samples: usize,
}

/// What to do with a second crash signal while the countdown is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatCrashPolicy {
    /// Restart the countdown at its maximum.
    #[default]
    Reset,
    /// Fold the signal into the event and keep the current countdown.
    Ignore,
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Countdown for crash-sourced events.
    pub crash_countdown_secs: u64,
    /// Countdown for user-initiated events.
    pub manual_countdown_secs: u64,
    /// Hard cap on the location fetch.
    pub location_timeout_ms: u64,
    /// Handling of repeated crash signals during the countdown.
    pub repeat_crash_policy: RepeatCrashPolicy,
}

/// Dead-man's switch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Seconds before expiry at which a warning is raised.
    pub warning_window_secs: u64,
}

/// Retry policy for the alert queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts per channel before it counts as exhausted.
    pub max_attempts: u32,
    /// First retry delay.
    pub backoff_base_secs: u64,
    /// Upper bound on the retry delay.
    pub backoff_max_secs: u64,
    /// Time allowed for one channel send.
    pub send_timeout_secs: u64,
}

/// Connectivity monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Interval of the periodic flush.
    pub flush_interval_secs: u64,
}

/// Delivery channel configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Emergency voice call.
    pub voice: VoiceChannelConfig,
    /// Data-network alert push.
    pub data_push: DataPushChannelConfig,
    /// Satellite relay.
    pub satellite: SatelliteChannelConfig,
}

/// Voice channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceChannelConfig {
    /// Whether the channel is registered.
    pub enabled: bool,
    /// Numbers in priority order; the first is dialed.
    pub emergency_numbers: Vec<String>,
    /// Require general connectivity before dialing. Carrier dependent.
    pub requires_connectivity: bool,
}

/// Data push channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPushChannelConfig {
    /// Whether the channel is registered.
    pub enabled: bool,
    /// Endpoint receiving the alert payload.
    pub endpoint: Option<String>,
}

/// Satellite channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteChannelConfig {
    /// Whether the channel is registered.
    pub enabled: bool,
    /// Only relay while general connectivity is down.
    pub only_when_offline: bool,
}

/// Device identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Identifier included in diagnostic snapshots.
    pub device_id: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            retention_days: 30,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            impact_threshold: 25.0,
            sustained_threshold: 15.0,
            rolling_window: 5,
            min_samples: 5,
            snapshot_samples: 20,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            crash_countdown_secs: 10,
            manual_countdown_secs: 3,
            location_timeout_ms: 5_000,
            repeat_crash_policy: RepeatCrashPolicy::Reset,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            warning_window_secs: 60,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            send_timeout_secs: 30,
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
        }
    }
}

impl Default for VoiceChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            emergency_numbers: default_emergency_numbers(),
            requires_connectivity: false,
        }
    }
}

impl Default for DataPushChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
        }
    }
}

impl Default for SatelliteChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            only_when_offline: true,
        }
    }
}

/// Default emergency numbers, highest priority first.
fn default_emergency_numbers() -> Vec<String> {
    vec!["911".to_string(), "065".to_string(), "078".to_string()]
}

impl CoordinatorConfig {
    /// Countdown for events raised by `source`.
    ///
    /// Safety timeouts never wait: the user already missed their check-in.
    #[must_use]
    pub fn countdown_for(&self, source: EventSource) -> Duration {
        let secs = match source {
            EventSource::CrashDetected => self.crash_countdown_secs,
            EventSource::UserInitiated => self.manual_countdown_secs,
            EventSource::SafetyTimeout => 0,
        };
        Duration::from_secs(secs).min(MAX_COUNTDOWN)
    }

    /// The location fetch timeout as a Duration.
    #[must_use]
    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }
}

impl QueueConfig {
    /// Delay before the retry that follows `attempts` failed attempts.
    ///
    /// Doubles from the base and saturates at the cap.
    #[must_use]
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let secs = self
            .backoff_base_secs
            .saturating_mul(1_u64 << exponent)
            .min(self.backoff_max_secs);
        Duration::from_secs(secs)
    }

    /// The per-send timeout as a Duration.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("LIFELINE_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let detector = &self.detector;
        if detector.window_size == 0 || detector.rolling_window == 0 {
            return Err(invalid("detector window sizes must be greater than 0"));
        }
        if detector.rolling_window > detector.window_size {
            return Err(invalid(format!(
                "rolling_window ({}) cannot be greater than window_size ({})",
                detector.rolling_window, detector.window_size
            )));
        }
        if detector.sustained_threshold > detector.impact_threshold {
            return Err(invalid(format!(
                "sustained_threshold ({}) cannot be greater than impact_threshold ({})",
                detector.sustained_threshold, detector.impact_threshold
            )));
        }

        let coordinator = &self.coordinator;
        for (name, secs) in [
            ("crash_countdown_secs", coordinator.crash_countdown_secs),
            ("manual_countdown_secs", coordinator.manual_countdown_secs),
        ] {
            if secs > MAX_COUNTDOWN.as_secs() {
                return Err(invalid(format!(
                    "{name} ({secs}) cannot be greater than {}",
                    MAX_COUNTDOWN.as_secs()
                )));
            }
        }
        if coordinator.location_timeout_ms == 0 {
            return Err(invalid("location_timeout_ms must be greater than 0"));
        }

        if self.queue.max_attempts == 0 {
            return Err(invalid("max_attempts must be greater than 0"));
        }
        if self.queue.backoff_base_secs > self.queue.backoff_max_secs {
            return Err(invalid(format!(
                "backoff_base_secs ({}) cannot be greater than backoff_max_secs ({})",
                self.queue.backoff_base_secs, self.queue.backoff_max_secs
            )));
        }
        if self.queue.send_timeout_secs == 0 {
            return Err(invalid("send_timeout_secs must be greater than 0"));
        }

        if self.connectivity.flush_interval_secs == 0 {
            return Err(invalid("flush_interval_secs must be greater than 0"));
        }

        let voice = &self.channels.voice;
        if voice.enabled && voice.emergency_numbers.is_empty() {
            return Err(invalid("voice channel needs at least one emergency number"));
        }
        let number_re = compile(EMERGENCY_NUMBER_PATTERN)?;
        for number in &voice.emergency_numbers {
            if !number_re.is_match(number) {
                return Err(invalid(format!("invalid emergency number: {number}")));
            }
        }

        if let Some(endpoint) = &self.channels.data_push.endpoint {
            if !compile(ENDPOINT_PATTERN)?.is_match(endpoint) {
                return Err(invalid(format!("invalid data push endpoint: {endpoint}")));
            }
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the retention window, or `None` to keep records forever.
    #[must_use]
    pub fn retention(&self) -> Option<Duration> {
        if self.storage.retention_days == 0 {
            None
        } else {
            Some(Duration::from_secs(
                u64::from(self.storage.retention_days) * 24 * 60 * 60,
            ))
        }
    }

    /// Get the periodic flush interval as a Duration.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity.flush_interval_secs)
    }

    /// Get the dead-man's switch warning window as a Duration.
    #[must_use]
    pub fn warning_window(&self) -> Duration {
        Duration::from_secs(self.safety.warning_window_secs)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::internal(format!("bad built-in pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_detector_config() {
        let detector = DetectorConfig::default();
        assert_eq!(detector.window_size, 100);
        assert!((detector.impact_threshold - 25.0).abs() < f64::EPSILON);
        assert!((detector.sustained_threshold - 15.0).abs() < f64::EPSILON);
        assert_eq!(detector.rolling_window, 5);
    }

    #[test]
    fn test_default_coordinator_countdowns() {
        let coordinator = CoordinatorConfig::default();
        assert_eq!(
            coordinator.countdown_for(EventSource::CrashDetected),
            Duration::from_secs(10)
        );
        assert_eq!(
            coordinator.countdown_for(EventSource::UserInitiated),
            Duration::from_secs(3)
        );
        assert_eq!(
            coordinator.countdown_for(EventSource::SafetyTimeout),
            Duration::ZERO
        );
        assert_eq!(coordinator.location_timeout(), Duration::from_millis(5_000));
        assert_eq!(coordinator.repeat_crash_policy, RepeatCrashPolicy::Reset);
    }

    #[test]
    fn test_default_channels() {
        let channels = ChannelsConfig::default();
        assert!(channels.voice.enabled);
        assert!(!channels.voice.requires_connectivity);
        assert_eq!(channels.voice.emergency_numbers[0], "911");
        assert!(channels.data_push.endpoint.is_none());
        assert!(channels.satellite.only_when_offline);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let queue = QueueConfig::default();
        assert_eq!(queue.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(queue.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(queue.backoff_delay(3), Duration::from_secs(20));
        assert_eq!(queue.backoff_delay(10), Duration::from_secs(300));
        assert_eq!(queue.backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rolling_window_too_large() {
        let mut config = Config::default();
        config.detector.rolling_window = 200;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("rolling_window"));
    }

    #[test]
    fn test_validate_thresholds_order() {
        let mut config = Config::default();
        config.detector.sustained_threshold = 30.0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sustained_threshold"));
    }

    #[test]
    fn test_validate_countdown_bound() {
        let mut config = Config::default();
        config.coordinator.crash_countdown_secs = MAX_COUNTDOWN.as_secs();
        assert!(config.validate().is_ok());

        config.coordinator.manual_countdown_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("manual_countdown_secs"));
    }

    #[test]
    fn test_safety_timeout_never_counts_down() {
        let coordinator = CoordinatorConfig {
            crash_countdown_secs: 30,
            manual_countdown_secs: 30,
            ..CoordinatorConfig::default()
        };
        assert_eq!(
            coordinator.countdown_for(EventSource::SafetyTimeout),
            Duration::ZERO
        );
        assert_eq!(
            coordinator.countdown_for(EventSource::CrashDetected),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_validate_zero_max_attempts() {
        let mut config = Config::default();
        config.queue.max_attempts = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_attempts"));
    }

    #[test]
    fn test_validate_backoff_order() {
        let mut config = Config::default();
        config.queue.backoff_base_secs = 600;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("backoff_base_secs"));
    }

    #[test]
    fn test_validate_bad_emergency_number() {
        let mut config = Config::default();
        config.channels.voice.emergency_numbers = vec!["call-me".to_string()];
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("invalid emergency number"));
    }

    #[test]
    fn test_validate_voice_without_numbers() {
        let mut config = Config::default();
        config.channels.voice.emergency_numbers.clear();
        assert!(config.validate().is_err());

        config.channels.voice.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_endpoint() {
        let mut config = Config::default();
        config.channels.data_push.endpoint = Some("https://alerts.example.com/api/sos".to_string());
        assert!(config.validate().is_ok());

        config.channels.data_push.endpoint = Some("ftp://nope".to_string());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("endpoint"));
    }

    #[test]
    fn test_database_path_default() {
        let config = Config::default();
        assert!(config.database_path().to_string_lossy().contains("lifeline.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_retention() {
        let mut config = Config::default();
        assert_eq!(
            config.retention(),
            Some(Duration::from_secs(30 * 24 * 60 * 60))
        );
        config.storage.retention_days = 0;
        assert!(config.retention().is_none());
    }

    #[test]
    fn test_flush_interval_and_warning_window() {
        let config = Config::default();
        assert_eq!(config.flush_interval(), Duration::from_secs(60));
        assert_eq!(config.warning_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let result = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")));
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), Config::default());
    }

    #[test]
    fn test_load_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[coordinator]\ncrash_countdown_secs = 15\nrepeat_crash_policy = \"ignore\"\n\n[queue]\nmax_attempts = 7\n",
        )
        .unwrap();

        let config = Config::load_from(Some(path)).unwrap();
        assert_eq!(config.coordinator.crash_countdown_secs, 15);
        assert_eq!(
            config.coordinator.repeat_crash_policy,
            RepeatCrashPolicy::Ignore
        );
        assert_eq!(config.queue.max_attempts, 7);
        assert_eq!(config.coordinator.manual_countdown_secs, 3);
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("lifeline"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_queue_config_deserialize() {
        let json = r#"{"max_attempts": 5, "backoff_base_secs": 1}"#;
        let queue: QueueConfig = serde_json::from_str(json).unwrap();
        assert_eq!(queue.max_attempts, 5);
        assert_eq!(queue.backoff_base_secs, 1);
        assert_eq!(queue.backoff_max_secs, 300);
    }
}
