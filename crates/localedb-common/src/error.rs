//! Error types shared across LocaleDB crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while parsing shared vocabulary types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    #[error("Unknown data domain: {0}")]
    UnknownDomain(String),

    #[error("Invalid FIPS code '{code}': {reason}")]
    InvalidFips { code: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CommonError {
    pub fn invalid_fips(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFips {
            code: code.into(),
            reason: reason.into(),
        }
    }
}
