//! Analytics error types.

use thiserror::Error;

/// Analytics errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyticsError {
    /// Input row is missing a declared column or carries an uncoercible value
    #[error("Schema mismatch at row {row}, column '{column}': {reason}")]
    SchemaMismatch {
        /// Zero-based input row
        row: usize,
        /// Offending column
        column: String,
        /// Why the value was rejected
        reason: String,
    },

    /// An operation references a column the table does not have
    #[error("Unresolved column '{column}'")]
    UnresolvedGroupKey {
        /// Name that failed to resolve
        column: String,
    },

    /// Rule set declared without a fallback label
    #[error("Rule set '{rule_set}' has no fallback label")]
    AmbiguousRuleSet {
        /// Name of the rule set
        rule_set: String,
    },

    /// A KPI formula produced a non-finite value. Indicates a missing guard.
    #[error("Division guard violated in formula '{formula}'")]
    DivisionGuardViolation {
        /// Formula text, `output = expression`
        formula: String,
    },

    /// An integer sum left the 64-bit range
    #[error("Integer overflow summing column '{column}'")]
    IntegerOverflow {
        /// Source column being summed
        column: String,
    },

    /// Column type does not fit the operation
    #[error("Type mismatch on column '{column}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Offending column
        column: String,
        /// Type the operation needs
        expected: String,
        /// Type the column declares
        found: String,
    },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration value could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Output serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for AnalyticsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<warehouse_domain::DomainError> for AnalyticsError {
    fn from(err: warehouse_domain::DomainError) -> Self {
        Self::InvalidParameter(err.to_string())
    }
}

impl AnalyticsError {
    pub(crate) fn unresolved(column: &str) -> Self {
        Self::UnresolvedGroupKey {
            column: column.to_string(),
        }
    }
}

/// Result type for analytics operations.
pub type Result<T> = std::result::Result<T, AnalyticsError>;
