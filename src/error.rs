// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every layer of the exporter:
// - Per-cycle errors (source unavailable, deadline) abort one refresh only
// - Per-entry problems are never errors; they become skip reasons
// - Configuration errors are fatal at startup
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ----------------------------------------------------------------------------
// 4.1 Core Exporter Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Source Store Errors ----
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    // ---- Refresh Cycle Errors ----
    #[error("Refresh of '{domain}' exceeded its deadline of {timeout_ms}ms")]
    DeadlineExceeded { domain: String, timeout_ms: u64 },

    // ---- Exposition Errors ----
    #[error("Exposition error: {0}")]
    Exposition(String),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable by a later refresh cycle.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Source(e) => e.is_recoverable(),
            ExporterError::DeadlineExceeded { .. } => true,
            ExporterError::Exposition(_) => true,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Source(SourceError::DeadlineExceeded { .. }) => "deadline",
            ExporterError::Source(_) => "source",
            ExporterError::DeadlineExceeded { .. } => "deadline",
            ExporterError::Exposition(_) => "exposition",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ExporterError::Config(_) => RecoveryHint::FixConfiguration,
            ExporterError::Source(e) => e.recovery_hint(),
            ExporterError::DeadlineExceeded { .. } => RecoveryHint::RetryNextCycle,
            ExporterError::Internal(_) => RecoveryHint::AlertOperator,
            _ => RecoveryHint::RetryNextCycle,
        }
    }

    pub fn deadline(domain: impl Into<String>, timeout_ms: u64) -> Self {
        ExporterError::DeadlineExceeded {
            domain: domain.into(),
            timeout_ms,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Keep serving the last snapshot and retry on the next cycle
    RetryNextCycle,
    /// Drop the store connection and reconnect
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
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
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Source Store Errors
// ----------------------------------------------------------------------------

/// Errors from the key/value source store.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source '{endpoint}' unavailable: {message}")]
    Unavailable { endpoint: String, message: String },

    #[error("Deadline exceeded during '{operation}'")]
    DeadlineExceeded { operation: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Unknown database '{name}'")]
    UnknownDatabase { name: String },
}

impl SourceError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SourceError::UnknownDatabase { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SourceError::Unavailable { .. } => RecoveryHint::Reconnect,
            SourceError::Protocol { .. } => RecoveryHint::Reconnect,
            SourceError::DeadlineExceeded { .. } => RecoveryHint::RetryNextCycle,
            SourceError::UnknownDatabase { .. } => RecoveryHint::FixConfiguration,
        }
    }

    pub fn unavailable(endpoint: impl Into<String>, message: impl Display) -> Self {
        SourceError::Unavailable {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn deadline(operation: impl Into<String>) -> Self {
        SourceError::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        SourceError::Protocol {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Skip Reasons
// ----------------------------------------------------------------------------

/// Why an input record did not produce a metric record.
///
/// Malformed keys and missing fields are recovered locally; the `Over*`
/// variants are deliberate bounding outcomes rather than failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Key did not carry the expected prefix or decoded to nothing
    MalformedKey,
    /// A field needed to build the record was empty or absent
    MissingRequiredField,
    /// Entity beyond the per-domain entity cap
    OverParentCap,
    /// Child beyond the per-entity child cap
    OverChildCap,
    /// Aggregate series beyond its series cap
    OverSeriesCap,
    /// Raw entry beyond the processing ceiling
    OverEntryCap,
    /// Child whose parent was not emitted
    ParentSkipped,
    /// Excluded by configuration
    Filtered,
}

impl SkipReason {
    /// All reasons, in exposition order.
    pub const ALL: [SkipReason; 8] = [
        SkipReason::MalformedKey,
        SkipReason::MissingRequiredField,
        SkipReason::OverParentCap,
        SkipReason::OverChildCap,
        SkipReason::OverSeriesCap,
        SkipReason::OverEntryCap,
        SkipReason::ParentSkipped,
        SkipReason::Filtered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MalformedKey => "malformed_key",
            SkipReason::MissingRequiredField => "missing_required_field",
            SkipReason::OverParentCap => "over_parent_cap",
            SkipReason::OverChildCap => "over_child_cap",
            SkipReason::OverSeriesCap => "over_series_cap",
            SkipReason::OverEntryCap => "over_entry_cap",
            SkipReason::ParentSkipped => "parent_skipped",
            SkipReason::Filtered => "filtered",
        }
    }

    /// Whether this outcome comes from a configured bound.
    pub fn is_over_capacity(&self) -> bool {
        matches!(
            self,
            SkipReason::OverParentCap
                | SkipReason::OverChildCap
                | SkipReason::OverSeriesCap
                | SkipReason::OverEntryCap
        )
    }
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

/// Result type for source store operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_is_recoverable() {
        let err = ExporterError::deadline("vlan", 2000);
        assert!(err.is_recoverable());
        assert_eq!(err.category(), "deadline");
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryNextCycle);
        assert_eq!(err.to_string(), "Refresh of 'vlan' exceeded its deadline of 2000ms");
    }

    #[test]
    fn test_source_errors_convert() {
        let err: ExporterError = SourceError::unavailable("tcp://127.0.0.1:6379", "refused").into();
        assert_eq!(err.category(), "source");
        assert_eq!(err.recovery_hint(), RecoveryHint::Reconnect);

        let err: ExporterError = SourceError::deadline("SCAN").into();
        assert_eq!(err.category(), "deadline");
    }

    #[test]
    fn test_source_hints_drive_reconnects() {
        assert_eq!(SourceError::protocol("bad header").recovery_hint(), RecoveryHint::Reconnect);
        assert_eq!(SourceError::deadline("HGETALL").recovery_hint(), RecoveryHint::RetryNextCycle);

        let err = SourceError::UnknownDatabase { name: "FLEX_DB".into() };
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);

        let err: ExporterError = SourceError::protocol("bad header").into();
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::Reconnect);
    }

    #[test]
    fn test_config_errors_are_fatal() {
        let err: ExporterError = ConfigError::invalid_value("vlan.max_entities", "must be > 0").into();
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);
    }

    #[test]
    fn test_skip_reason_labels_unique() {
        let mut labels: Vec<&str> = SkipReason::ALL.iter().map(|r| r.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), SkipReason::ALL.len());
        assert!(SkipReason::OverChildCap.is_over_capacity());
        assert!(!SkipReason::MalformedKey.is_over_capacity());
    }
}
