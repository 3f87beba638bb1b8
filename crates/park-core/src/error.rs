//! Domain-specific error types following panic-free policy.

use thiserror::Error;

use crate::SpaceId;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Space is not known to storage
    #[error("Space not found: {space_id}")]
    SpaceNotFound { space_id: SpaceId },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
