// ============================================================================
// SECTION 8: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (FORENSICS_SECTION__FIELD)
// - Validation against the engine bounds
// - Sensible defaults for every field
// ============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;
use crate::ingest::AccessPolicy;

// ----------------------------------------------------------------------------
// 8.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the forensics engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForensicsConfig {
    /// General engine settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Query pipeline limits
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Topology builder and analyzer settings
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Spec diff and lifecycle settings
    #[serde(default)]
    pub changes: ChangesConfig,

    /// Trace path comparison settings
    #[serde(default)]
    pub traces: TracesConfig,

    /// Context aggregation settings
    #[serde(default)]
    pub context: ContextConfig,

    /// File access policy
    #[serde(default)]
    pub access: AccessConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ForensicsConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::extract(figment)
    }

    /// Load the explicit file, else `forensics.toml` when present, else
    /// defaults; environment overrides apply in every case.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => {
                let figment = Figment::from(Serialized::defaults(Self::default()))
                    .merge(Env::prefixed(ENV_PREFIX).split("__"));
                Self::extract(figment)
            }
        }
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.default_limit > MAX_PAGE_LIMIT {
            return Err(ConfigError::invalid_value(
                "pipeline.default_limit",
                format!("Page size cannot exceed {}", MAX_PAGE_LIMIT),
            ));
        }

        if self.pipeline.list_max_values == 0 {
            return Err(ConfigError::invalid_value(
                "pipeline.list_max_values",
                "At least one value must be kept per list",
            ));
        }

        if self.topology.app_namespace.trim().is_empty() {
            return Err(ConfigError::missing_field("topology.app_namespace"));
        }

        if self.topology.max_chain_depth == 0 || self.topology.max_chain_depth > MAX_CHAIN_DEPTH * 10 {
            return Err(ConfigError::invalid_value(
                "topology.max_chain_depth",
                format!("Chain depth must be between 1 and {}", MAX_CHAIN_DEPTH * 10),
            ));
        }

        if self.changes.max_changes_per_diff == 0 || self.changes.max_changes_per_diff > MAX_CHANGES_PER_DIFF_LIMIT {
            return Err(ConfigError::invalid_value(
                "changes.max_changes_per_diff",
                format!("Must be between 1 and {}", MAX_CHANGES_PER_DIFF_LIMIT),
            ));
        }

        for (field, value) in [
            ("traces.error_threshold", self.traces.error_threshold),
            ("traces.latency_threshold", self.traces.latency_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid_value(field, "Threshold must be a non-negative percentage"));
            }
        }

        if self.traces.delta.is_zero() {
            return Err(ConfigError::invalid_value("traces.delta", "Window half-width must be positive"));
        }

        if self.context.deps_per_page == 0 {
            return Err(ConfigError::invalid_value(
                "context.deps_per_page",
                "At least one dependency per page is required",
            ));
        }

        if !["json", "compact", "pretty"].contains(&self.logging.format.as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unknown format '{}' (json, compact, pretty)", self.logging.format),
            ));
        }

        self.access.policy()?;
        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 8.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Snapshot directory used when a command is not given one
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,

    /// Pretty-print JSON documents
    #[serde(default)]
    pub pretty_output: bool,

    /// Wall-clock budget per request; unset means unbounded
    #[serde(default, with = "humantime_serde")]
    pub deadline: Option<Duration>,
}

// ----------------------------------------------------------------------------
// 8.3 Query Pipeline Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rows per page when a query does not say (0 = all)
    #[serde(default)]
    pub default_limit: usize,

    /// Distinct values kept by the `list` aggregation
    #[serde(default = "default_list_max_values")]
    pub list_max_values: usize,

    /// Row limit of compact metric summaries
    #[serde(default = "default_metric_limit")]
    pub metric_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_limit: 0,
            list_max_values: default_list_max_values(),
            metric_limit: default_metric_limit(),
        }
    }
}

fn default_list_max_values() -> usize {
    LIST_AGG_MAX_VALUES
}

fn default_metric_limit() -> usize {
    DEFAULT_METRIC_LIMIT
}

// ----------------------------------------------------------------------------
// 8.4 Topology Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Namespace logical services are resolved in
    #[serde(default = "default_app_namespace")]
    pub app_namespace: String,

    /// Service names that imply a dependency when found in env values
    #[serde(default = "default_telemetry_services")]
    pub telemetry_services: Vec<String>,

    /// Logical service -> concrete Service name
    #[serde(default = "default_service_aliases")]
    pub service_aliases: BTreeMap<String, String>,

    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    #[serde(default = "default_max_chains")]
    pub max_chains: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            app_namespace: default_app_namespace(),
            telemetry_services: default_telemetry_services(),
            service_aliases: default_service_aliases(),
            max_chain_depth: default_max_chain_depth(),
            max_chains: default_max_chains(),
        }
    }
}

fn default_app_namespace() -> String {
    DEFAULT_APP_NAMESPACE.into()
}

fn default_telemetry_services() -> Vec<String> {
    DEFAULT_TELEMETRY_SERVICES.iter().map(|s| s.to_string()).collect()
}

fn default_service_aliases() -> BTreeMap<String, String> {
    DEFAULT_SERVICE_ALIASES
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn default_max_chain_depth() -> usize {
    MAX_CHAIN_DEPTH
}

fn default_max_chains() -> usize {
    MAX_CHAINS
}

// ----------------------------------------------------------------------------
// 8.5 Spec Change Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesConfig {
    /// Diff items kept per change window
    #[serde(default = "default_max_changes_per_diff")]
    pub max_changes_per_diff: usize,

    /// Grace period before a vanished entity is reported removed (raw snapshots)
    #[serde(default = "default_removal_grace", with = "humantime_serde")]
    pub removal_grace: Duration,

    /// Later observation cycles required before inferring removal (raw snapshots)
    #[serde(default = "default_min_missing_cycles")]
    pub min_missing_cycles: usize,
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self {
            max_changes_per_diff: default_max_changes_per_diff(),
            removal_grace: default_removal_grace(),
            min_missing_cycles: default_min_missing_cycles(),
        }
    }
}

fn default_max_changes_per_diff() -> usize {
    DEFAULT_MAX_CHANGES_PER_DIFF
}

fn default_removal_grace() -> Duration {
    Duration::from_secs(DEFAULT_REMOVAL_GRACE_SECS)
}

fn default_min_missing_cycles() -> usize {
    DEFAULT_MIN_MISSING_CYCLES
}

// ----------------------------------------------------------------------------
// 8.6 Trace Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracesConfig {
    /// Half-width of the pre/post windows around the pivot
    #[serde(default = "default_trace_delta", with = "humantime_serde")]
    pub delta: Duration,

    /// Error-rate change in percentage points that flags a path
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,

    /// p99 latency change in percent that flags a path
    #[serde(default = "default_latency_threshold")]
    pub latency_threshold: f64,
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self {
            delta: default_trace_delta(),
            error_threshold: default_error_threshold(),
            latency_threshold: default_latency_threshold(),
        }
    }
}

fn default_trace_delta() -> Duration {
    Duration::from_secs(DEFAULT_TRACE_DELTA_SECS)
}

fn default_error_threshold() -> f64 {
    DEFAULT_ERROR_THRESHOLD_PCT
}

fn default_latency_threshold() -> f64 {
    DEFAULT_LATENCY_THRESHOLD_PCT
}

// ----------------------------------------------------------------------------
// 8.7 Context Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_deps_per_page")]
    pub deps_per_page: usize,

    #[serde(default = "default_max_log_patterns")]
    pub max_log_patterns: usize,

    /// Specs longer than this are replaced by a preview
    #[serde(default = "default_spec_preview_chars")]
    pub spec_preview_chars: usize,

    /// Fan dependency sections out over the rayon pool
    #[serde(default = "default_true")]
    pub parallel_dependencies: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            deps_per_page: default_deps_per_page(),
            max_log_patterns: default_max_log_patterns(),
            spec_preview_chars: default_spec_preview_chars(),
            parallel_dependencies: true,
        }
    }
}

fn default_deps_per_page() -> usize {
    DEFAULT_DEPS_PER_PAGE
}

fn default_max_log_patterns() -> usize {
    15
}

fn default_spec_preview_chars() -> usize {
    SPEC_PREVIEW_CHARS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 8.8 Access Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Directories reads are confined to (empty = anywhere)
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,

    /// Glob patterns that may never be read
    #[serde(default)]
    pub denied_patterns: Vec<String>,
}

impl AccessConfig {
    pub fn policy(&self) -> Result<AccessPolicy, ConfigError> {
        AccessPolicy::new(&self.allowed_roots, &self.denied_patterns)
    }
}

// ----------------------------------------------------------------------------
// 8.9 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

fn default_log_format() -> String {
    "compact".into()
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ForensicsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topology.service_aliases["checkout-service"], "checkout");
        assert_eq!(config.traces.delta, Duration::from_secs(300));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let text = ForensicsConfig::generate_default_config();
        assert!(text.contains("[traces]"));
        let parsed = ForensicsConfig::from_str(&text).unwrap();
        assert_eq!(parsed.changes.max_changes_per_diff, DEFAULT_MAX_CHANGES_PER_DIFF);
        assert_eq!(parsed.changes.removal_grace, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = ForensicsConfig::from_str(
            r#"
            [traces]
            delta = "10m"
            error_threshold = 25.0
            "#,
        )
        .unwrap();
        assert_eq!(config.traces.delta, Duration::from_secs(600));
        assert!((config.traces.error_threshold - 25.0).abs() < 0.001);
        assert!((config.traces.latency_threshold - DEFAULT_LATENCY_THRESHOLD_PCT).abs() < 0.001);
        assert_eq!(config.context.deps_per_page, DEFAULT_DEPS_PER_PAGE);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ForensicsConfig::from_str("[context]\ndeps_per_page = 0\n").is_err());
        assert!(ForensicsConfig::from_str("[logging]\nformat = \"xml\"\n").is_err());
        assert!(ForensicsConfig::from_str("[traces]\nerror_threshold = -1.0\n").is_err());
        assert!(ForensicsConfig::from_str("[access]\ndenied_patterns = [\"[\"]\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ForensicsConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forensics.toml");
        std::fs::write(&path, "[topology]\napp_namespace = \"shop\"\n").unwrap();
        let config = ForensicsConfig::load(&path).unwrap();
        assert_eq!(config.topology.app_namespace, "shop");
    }
}
