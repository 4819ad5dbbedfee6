// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (OPMETRICS_ prefix, `__` separator)
// - Validation of schedules, offsets and retention horizons
// - Live swapping of the active configuration
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::time::Granularity;
use crate::types::{SignalBounds, SignalClass, SignalRegistry};
use crate::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_STORE_TIMEOUT_MS, FEATURE_NAME, SHUTDOWN_GRACE_PERIOD_SECS};

const DAY: u64 = 86_400;

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the metrics core
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Administrative on/off switch for the whole subsystem
    #[serde(default)]
    pub feature: FeatureConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub aggregates: AggregatesConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Signal tags accepted on top of the built-in vocabulary
    #[serde(default)]
    pub signals: SignalsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("OPMETRICS_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.max_batch_size == 0 {
            return Err(ConfigError::invalid_value("ingest.max_batch_size", "must be greater than zero"));
        }

        if self.store.op_timeout.is_zero() {
            return Err(ConfigError::invalid_value("store.op_timeout", "must be greater than zero"));
        }

        if self.store.backend == StoreBackend::Log && self.store.path.is_none() {
            return Err(ConfigError::invalid_value("store.path", "required when backend = \"log\""));
        }

        let mut seen = Vec::with_capacity(self.aggregates.rollups.len());
        for (i, rollup) in self.aggregates.rollups.iter().enumerate() {
            let field = format!("aggregates.rollups[{i}]");
            if seen.contains(&rollup.granularity) {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("duplicate granularity {}", rollup.granularity),
                ));
            }
            seen.push(rollup.granularity);

            if rollup.every.is_zero() {
                return Err(ConfigError::invalid_value(format!("{field}.every"), "must be greater than zero"));
            }
            if rollup.end_offset >= rollup.start_offset {
                return Err(ConfigError::invalid_value(
                    format!("{field}.start_offset"),
                    "start_offset must be larger than end_offset",
                ));
            }
        }

        let retention = &self.retention;
        if retention.sweep_interval.is_zero() {
            return Err(ConfigError::invalid_value("retention.sweep_interval", "must be greater than zero"));
        }
        for (field, horizon) in retention.horizons() {
            if horizon.is_zero() {
                return Err(ConfigError::invalid_value(format!("retention.{field}"), "must be greater than zero"));
            }
        }
        let longest_raw = retention.events.max(retention.biofeedback).max(retention.system_metrics);
        if retention.aggregates < longest_raw {
            return Err(ConfigError::invalid_value(
                "retention.aggregates",
                format!(
                    "aggregate horizon ({}) must be at least the longest raw horizon ({})",
                    humantime::format_duration(retention.aggregates),
                    humantime::format_duration(longest_raw),
                ),
            ));
        }

        self.signals.build_registry()?;
        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// General & Feature Configuration
// ----------------------------------------------------------------------------

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Instance name (for identification in logs)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Environment name (prod, staging, dev)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// How long background loops get to finish on shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            environment: default_environment(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    "operator-metrics".into()
}

fn default_environment() -> String {
    "production".into()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)
}

fn default_true() -> bool {
    true
}

/// Subsystem feature switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name reported in status and error messages
    #[serde(default = "default_feature_name")]
    pub name: String,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_feature_name(),
        }
    }
}

fn default_feature_name() -> String {
    FEATURE_NAME.into()
}

// ----------------------------------------------------------------------------
// Ingestion Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Largest batch accepted by one call
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Honour caller-supplied timestamps (replays, imports)
    #[serde(default = "default_true")]
    pub allow_client_timestamps: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            allow_client_timestamps: true,
        }
    }
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

// ----------------------------------------------------------------------------
// Store Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Volatile; tests and local experiments
    #[default]
    Memory,
    /// Append-only log replayed on open
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Log file path (log backend only)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Upper bound on any single store call
    #[serde(default = "default_op_timeout", with = "humantime_serde")]
    pub op_timeout: Duration,

    /// fsync after every appended record
    #[serde(default)]
    pub sync_every_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: None,
            op_timeout: default_op_timeout(),
            sync_every_write: false,
        }
    }
}

fn default_op_timeout() -> Duration {
    Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS)
}

// ----------------------------------------------------------------------------
// Continuous Aggregate Configuration
// ----------------------------------------------------------------------------

/// One rollup granularity and its refresh policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupConfig {
    pub granularity: Granularity,

    /// Schedule period
    #[serde(with = "humantime_serde")]
    pub every: Duration,

    /// Oldest bucket start revisited: `now - start_offset`
    #[serde(with = "humantime_serde")]
    pub start_offset: Duration,

    /// Newest bucket start revisited: `now - end_offset`
    #[serde(with = "humantime_serde")]
    pub end_offset: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatesConfig {
    #[serde(default = "default_rollups")]
    pub rollups: Vec<RollupConfig>,

    /// Also maintain the cross-entity (`*`) bucket per signal
    #[serde(default = "default_true")]
    pub wildcard_scope: bool,
}

impl Default for AggregatesConfig {
    fn default() -> Self {
        Self {
            rollups: default_rollups(),
            wildcard_scope: true,
        }
    }
}

fn default_rollups() -> Vec<RollupConfig> {
    vec![
        RollupConfig {
            granularity: Granularity::ONE_MINUTE,
            every: Duration::from_secs(60),
            start_offset: Duration::from_secs(10 * 60),
            end_offset: Duration::from_secs(60),
        },
        RollupConfig {
            granularity: Granularity::FIVE_MINUTES,
            every: Duration::from_secs(5 * 60),
            start_offset: Duration::from_secs(30 * 60),
            end_offset: Duration::from_secs(5 * 60),
        },
    ]
}

// ----------------------------------------------------------------------------
// Retention Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Schedule period shared by every table sweep
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    #[serde(default = "default_events_horizon", with = "humantime_serde")]
    pub events: Duration,

    #[serde(default = "default_biofeedback_horizon", with = "humantime_serde")]
    pub biofeedback: Duration,

    #[serde(default = "default_system_horizon", with = "humantime_serde")]
    pub system_metrics: Duration,

    #[serde(default = "default_kpi_horizon", with = "humantime_serde")]
    pub kpi_measurements: Duration,

    #[serde(default = "default_aggregates_horizon", with = "humantime_serde")]
    pub aggregates: Duration,
}

impl RetentionConfig {
    pub fn horizons(&self) -> [(&'static str, Duration); 5] {
        [
            ("events", self.events),
            ("biofeedback", self.biofeedback),
            ("system_metrics", self.system_metrics),
            ("kpi_measurements", self.kpi_measurements),
            ("aggregates", self.aggregates),
        ]
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: default_sweep_interval(),
            events: default_events_horizon(),
            biofeedback: default_biofeedback_horizon(),
            system_metrics: default_system_horizon(),
            kpi_measurements: default_kpi_horizon(),
            aggregates: default_aggregates_horizon(),
        }
    }
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_events_horizon() -> Duration {
    Duration::from_secs(90 * DAY)
}

fn default_biofeedback_horizon() -> Duration {
    Duration::from_secs(30 * DAY)
}

fn default_system_horizon() -> Duration {
    Duration::from_secs(7 * DAY)
}

fn default_kpi_horizon() -> Duration {
    Duration::from_secs(365 * DAY)
}

fn default_aggregates_horizon() -> Duration {
    Duration::from_secs(400 * DAY)
}

// ----------------------------------------------------------------------------
// Signal Vocabulary
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraSignal {
    pub tag: String,
    pub class: SignalClass,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalsConfig {
    #[serde(default)]
    pub extra: Vec<ExtraSignal>,
}

impl SignalsConfig {
    /// Built-in vocabulary plus configured extras.
    pub fn build_registry(&self) -> Result<SignalRegistry, ConfigError> {
        let mut registry = SignalRegistry::default();
        for (i, extra) in self.extra.iter().enumerate() {
            let bounds = SignalBounds {
                min: extra.min,
                max: extra.max,
            };
            if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
                if min > max {
                    return Err(ConfigError::invalid_value(
                        format!("signals.extra[{i}]"),
                        format!("min ({min}) exceeds max ({max})"),
                    ));
                }
            }
            registry
                .register(&extra.tag, extra.class, bounds)
                .map_err(|e| ConfigError::invalid_value(format!("signals.extra[{i}].tag"), e.to_string()))?;
        }
        Ok(registry)
    }
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty, compact, json
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors in pretty/compact output
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file and line in events
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ----------------------------------------------------------------------------
// Live Configuration
// ----------------------------------------------------------------------------

/// Holds the active configuration and swaps it atomically on reload.
#[derive(Debug)]
pub struct ConfigManager {
    config: ArcSwap<EngineConfig>,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = EngineConfig::load(&path)?;
        let mut manager = Self::new(config);
        manager.config_path = Some(path.as_ref().to_path_buf());
        Ok(manager)
    }

    /// Get current configuration
    pub fn get(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    /// Validate and swap in a new configuration
    pub fn update(&self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Reload from file. Returns the new configuration.
    pub fn reload(&self) -> Result<Arc<EngineConfig>, ConfigError> {
        if let Some(path) = &self.config_path {
            self.update(EngineConfig::load(path)?)?;
        }
        Ok(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert!(config.feature.enabled);
        assert_eq!(config.ingest.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(config.aggregates.rollups.len(), 2);
        assert_eq!(config.retention.biofeedback, Duration::from_secs(30 * DAY));
    }

    #[test]
    fn test_default_config_round_trips() {
        let text = EngineConfig::generate_default_config();
        let parsed = EngineConfig::from_str(&text).unwrap();
        assert_eq!(parsed.aggregates.rollups, EngineConfig::default().aggregates.rollups);
        assert_eq!(parsed.retention.kpi_measurements, Duration::from_secs(365 * DAY));
    }

    #[test]
    fn test_parse_overrides() {
        let config = EngineConfig::from_str(
            r#"
            [feature]
            enabled = false

            [retention]
            system_metrics = "2days"

            [[aggregates.rollups]]
            granularity = "15m"
            every = "15m"
            start_offset = "2h"
            end_offset = "15m"

            [[signals.extra]]
            tag = "skin_temp"
            class = "biofeedback"
            min = 20.0
            max = 45.0
            "#,
        )
        .unwrap();
        assert!(!config.feature.enabled);
        assert_eq!(config.retention.system_metrics, Duration::from_secs(2 * DAY));
        assert_eq!(config.aggregates.rollups[0].granularity, Granularity::FIFTEEN_MINUTES);
        assert!(config.signals.build_registry().unwrap().contains("skin_temp"));
    }

    #[test]
    fn test_rejects_aggregate_horizon_shorter_than_raw() {
        let err = EngineConfig::from_str(
            r#"
            [retention]
            aggregates = "10days"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("retention.aggregates"));
    }

    #[test]
    fn test_rejects_inverted_offsets() {
        let err = EngineConfig::from_str(
            r#"
            [[aggregates.rollups]]
            granularity = "1m"
            every = "1m"
            start_offset = "1m"
            end_offset = "5m"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_rejects_log_backend_without_path() {
        let err = EngineConfig::from_str("[store]\nbackend = \"log\"\n").unwrap_err();
        assert!(err.to_string().contains("store.path"));
    }

    #[test]
    fn test_config_manager_swaps() {
        let manager = ConfigManager::new(EngineConfig::default());
        let mut next = EngineConfig::default();
        next.feature.enabled = false;
        manager.update(next).unwrap();
        assert!(!manager.get().feature.enabled);

        let mut bad = EngineConfig::default();
        bad.ingest.max_batch_size = 0;
        assert!(manager.update(bad).is_err());
        assert!(!manager.get().feature.enabled);
    }
}
