// Error types for tunnelkeep

use thiserror::Error;

use crate::types::ErrorClass;

/// A single invalid or missing configuration field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Aggregated configuration failure. Config load never partially succeeds:
/// every invalid field is collected and reported in one error.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {}", .errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
pub struct ConfigError {
    pub errors: Vec<FieldError>,
}

impl ConfigError {
    pub fn single(field: &str, reason: &str) -> Self {
        Self {
            errors: vec![FieldError {
                field: field.to_string(),
                reason: reason.to_string(),
            }],
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Host key mismatch - possible man-in-the-middle. Never auto-retried.
    #[error("host key for {hostname} changed (expected {expected_fingerprint}, got {actual_fingerprint})")]
    TrustRejected {
        hostname: String,
        expected_fingerprint: String,
        actual_fingerprint: String,
    },

    /// Recoverable transport failure, drives backoff retry.
    #[error("connection failed ({class}): {message}")]
    Connection { class: ErrorClass, message: String },

    /// Failure binding a single local forward.
    #[error("failed to bind forward {spec}: {reason}")]
    Bind { spec: String, reason: String },

    /// Non-fatal persistence problem, logged but does not change control flow.
    #[error("persistence warning: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
