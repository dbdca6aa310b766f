// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the engine.
// Designed for:
// - Clear error categorization
// - Enough context for a caller to self-correct (available columns, kinds)
// - Serialization into a JSON error payload
// ============================================================================

use std::path::PathBuf;

use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the forensics engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ForensicsError {
    // ---- Caller Input Errors ----
    #[error("{0}")]
    Input(#[from] InputError),

    // ---- Derive Expression Errors ----
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    // ---- Topology Errors ----
    #[error("{0}")]
    Topology(#[from] TopologyError),

    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- JSON Errors ----
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForensicsError {
    /// Get the error category for logging and payloads
    pub fn category(&self) -> &'static str {
        match self {
            ForensicsError::Input(e) => e.category(),
            ForensicsError::Expression(_) => "expression",
            ForensicsError::Topology(_) => "topology",
            ForensicsError::Config(_) => "config",
            ForensicsError::Io(_) => "io",
            ForensicsError::Json(_) => "json",
            ForensicsError::Internal(_) => "internal",
        }
    }

    /// Whether the caller can fix this by changing the request
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ForensicsError::Input(_) | ForensicsError::Expression(_) | ForensicsError::Topology(_)
        )
    }

    /// Render as the JSON error object returned to callers.
    pub fn to_payload(&self) -> JsonValue {
        let mut payload = Map::new();
        payload.insert("error".into(), json!(self.to_string()));
        payload.insert("category".into(), json!(self.category()));
        match self {
            ForensicsError::Input(InputError::UnknownColumn { available, .. })
            | ForensicsError::Expression(ExpressionError::UnknownColumn { available, .. }) => {
                payload.insert("available_columns".into(), json!(available));
            }
            ForensicsError::Input(InputError::UnsupportedAggregation { supported, .. }) => {
                payload.insert("supported".into(), json!(supported));
            }
            ForensicsError::Input(InputError::NoMatchingEntity {
                available_kinds,
                sample_entities,
                ..
            }) => {
                payload.insert("available_kinds".into(), json!(available_kinds));
                payload.insert("sample_entities".into(), json!(sample_entities));
            }
            ForensicsError::Topology(TopologyError::EntityNotFound { available, .. }) => {
                payload.insert("available_entities".into(), json!(available));
            }
            _ => {}
        }
        JsonValue::Object(payload)
    }
}

// ----------------------------------------------------------------------------
// 4.2 Input Errors
// ----------------------------------------------------------------------------

/// Problems with what the caller asked for
#[derive(Error, Debug)]
pub enum InputError {
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Access to {path} denied by policy rule '{rule}'")]
    AccessDenied { path: PathBuf, rule: String },

    #[error("Invalid identifier '{input}': {message}")]
    InvalidIdentifier { input: String, message: String },

    #[error("Column '{column}' not found. Available: {available:?}")]
    UnknownColumn { column: String, available: Vec<String> },

    #[error("Unknown aggregation '{name}'. Use: {}", supported.join(", "))]
    UnsupportedAggregation { name: String, supported: Vec<String> },

    #[error("Invalid time range: {message}")]
    InvalidTimeRange { message: String },

    #[error("No objects matching '{query}' found. Available kinds: {available_kinds:?}. Sample entities: {sample_entities:?}")]
    NoMatchingEntity {
        query: String,
        available_kinds: Vec<String>,
        sample_entities: Vec<String>,
    },

    #[error("Unsupported input format: {message}")]
    UnsupportedFormat { message: String },

    #[error("No numeric columns for {agg} aggregation")]
    NoNumericColumns { agg: String },

    #[error("Missing required argument: {name}")]
    MissingArgument { name: String },

    #[error("Invalid value '{value}' for {name}: {message}")]
    InvalidArgument { name: String, value: String, message: String },
}

impl InputError {
    pub fn category(&self) -> &'static str {
        match self {
            InputError::FileNotFound { .. } | InputError::AccessDenied { .. } => "input_file",
            InputError::InvalidIdentifier { .. } | InputError::NoMatchingEntity { .. } => "input_entity",
            InputError::UnknownColumn { .. }
            | InputError::UnsupportedAggregation { .. }
            | InputError::NoNumericColumns { .. } => "input_query",
            InputError::InvalidTimeRange { .. } => "input_time",
            InputError::UnsupportedFormat { .. } => "input_format",
            InputError::MissingArgument { .. } | InputError::InvalidArgument { .. } => "input_argument",
        }
    }

    pub fn unknown_column(column: impl Into<String>, available: &[String]) -> Self {
        InputError::UnknownColumn {
            column: column.into(),
            available: available.to_vec(),
        }
    }

    pub fn invalid_time(message: impl Into<String>) -> Self {
        InputError::InvalidTimeRange {
            message: message.into(),
        }
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        InputError::UnsupportedFormat {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Expression Errors
// ----------------------------------------------------------------------------

/// Errors from compiling a derive expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("cannot parse '{expr}' at offset {position}: {message}")]
    Parse {
        expr: String,
        position: usize,
        message: String,
    },

    #[error("unknown column '{name}' (available: {available:?})")]
    UnknownColumn { name: String, available: Vec<String> },
}

// ----------------------------------------------------------------------------
// 4.4 Topology Errors
// ----------------------------------------------------------------------------

/// Errors from the topology engine
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Entity '{query}' not found in topology. Available entities: {available:?}")]
    EntityNotFound { query: String, available: Vec<String> },

    #[error("Invalid topology document: {message}")]
    InvalidDocument { message: String },
}

// ----------------------------------------------------------------------------
// 4.5 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for forensics operations
pub type ForensicsResult<T> = Result<T, ForensicsError>;

/// Result type for expression compilation
pub type ExpressionResult<T> = Result<T, ExpressionError>;

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_unknown_column_payload_lists_available() {
        let err: ForensicsError =
            InputError::unknown_column("sevrity", &["severity".to_string(), "state".to_string()]).into();
        let payload = err.to_payload();

        assert_eq!(payload["category"], "input_query");
        assert_eq!(payload["available_columns"][0], "severity");
        assert!(payload["error"].as_str().unwrap_or_default().contains("sevrity"));
        assert!(err.is_input_error());
    }

    #[test]
    fn test_unsupported_aggregation_message() {
        let err = InputError::UnsupportedAggregation {
            name: "median".into(),
            supported: vec!["count".into(), "sum".into()],
        };
        assert_eq!(err.to_string(), "Unknown aggregation 'median'. Use: count, sum");
    }

    #[test]
    fn test_internal_is_not_input_error() {
        let err = ForensicsError::Internal("boom".into());
        assert!(!err.is_input_error());
        assert_eq!(err.category(), "internal");
    }
}
