//! Common error types used across all Strato provisioners

use crate::output::OutputError;
use thiserror::Error;

/// Errors raised while composing resource declarations.
///
/// Validation and invariant failures are synchronous and abort provisioning
/// before any resource is declared. Engine-level failures (apply errors,
/// quota limits, naming collisions on the provider side) are surfaced by the
/// orchestration engine itself and never pass through this type.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Validation error on `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Missing configuration key: {key}")]
    MissingConfig { key: String },

    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("Duplicate resource `{name}` declared in stack")]
    DuplicateResource { name: String },

    #[error("Deferred value error: {0}")]
    Output(#[from] OutputError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ProvisionError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        ProvisionError::InvariantViolation {
            message: message.into(),
        }
    }
}

/// Result type alias for provisioning operations
pub type ProvisionResult<T> = Result<T, ProvisionError>;
