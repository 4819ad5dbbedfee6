// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error type for the whole core, categorized so the outer HTTP layer can
// distinguish "bad request" from "not offered" from "try again later".
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type MetricsResult<T> = Result<T, MetricsError>;

// ----------------------------------------------------------------------------
// Core Errors
// ----------------------------------------------------------------------------

/// The main error type for the metrics core.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Malformed or out-of-range input. Never retried by the core.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    /// The durable store is unreachable or the call timed out.
    #[error("store unavailable during {operation}: {reason}")]
    StoreUnavailable { operation: String, reason: String },

    /// The subsystem has been administratively switched off.
    #[error("feature '{feature}' is disabled: the metrics service is currently unavailable")]
    FeatureDisabled { feature: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetricsError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MetricsError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        MetricsError::NotFound { what: what.into() }
    }

    pub fn store_unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        MetricsError::StoreUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn feature_disabled(feature: impl Into<String>) -> Self {
        MetricsError::FeatureDisabled {
            feature: feature.into(),
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetricsError::StoreUnavailable { .. } | MetricsError::Io(_))
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            MetricsError::Validation { .. } => "validation",
            MetricsError::NotFound { .. } => "not_found",
            MetricsError::StoreUnavailable { .. } => "store_unavailable",
            MetricsError::FeatureDisabled { .. } => "feature_disabled",
            MetricsError::Config(_) => "config",
            MetricsError::Io(_) => "io",
            MetricsError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            MetricsError::Validation { .. } => RecoveryHint::FixRequest,
            MetricsError::NotFound { .. } => RecoveryHint::None,
            MetricsError::StoreUnavailable { .. } | MetricsError::Io(_) => RecoveryHint::RetryWithBackoff,
            MetricsError::FeatureDisabled { .. } => RecoveryHint::AlertOperator,
            MetricsError::Config(_) => RecoveryHint::FixConfiguration,
            MetricsError::Internal(_) => RecoveryHint::AlertOperator,
        }
    }

    /// HTTP status the outer layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            MetricsError::Validation { .. } => 400,
            MetricsError::NotFound { .. } => 404,
            MetricsError::StoreUnavailable { .. } | MetricsError::FeatureDisabled { .. } => 503,
            MetricsError::Config(_) | MetricsError::Io(_) | MetricsError::Internal(_) => 500,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Nothing to do; the answer is final
    None,
    /// The caller must change the request
    FixRequest,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Fix configuration and restart
    FixConfiguration,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_and_retryability() {
        let v = MetricsError::validation("value", "must be finite");
        assert_eq!(v.status_code(), 400);
        assert!(!v.is_retryable());
        assert_eq!(v.to_string(), "invalid value: must be finite");

        let s = MetricsError::store_unavailable("scan", "timed out after 2000ms");
        assert_eq!(s.status_code(), 503);
        assert!(s.is_retryable());
        assert_eq!(s.recovery_hint(), RecoveryHint::RetryWithBackoff);

        let f = MetricsError::feature_disabled("metrics");
        assert_eq!(f.status_code(), 503);
        assert!(!f.is_retryable());
        assert_eq!(f.category(), "feature_disabled");
    }

    #[test]
    fn test_config_error_converts() {
        let err: MetricsError = ConfigError::invalid_value("ingest.max_batch_size", "must be > 0").into();
        assert_eq!(err.category(), "config");
        assert_eq!(err.status_code(), 500);
    }
}
