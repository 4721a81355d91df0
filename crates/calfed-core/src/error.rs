//! # Error Handling for the Calendar Federation Engine
//!
//! All engine operations return [`EngineError`], a single taxonomy shared
//! by the store, the ingestion pipeline, the mirror writer, and the
//! scheduling layer. Each variant carries a stable `code()` string so the
//! API layer can map errors to transport status without matching on Rust
//! types, and `retry_after()` surfaces back-pressure hints to callers.
//!
//! ## Categories
//!
//! - [`EngineError::Validation`] — malformed input; never retried
//! - [`EngineError::NotFound`] — unknown entity id; never retried
//! - [`EngineError::Conflict`] — an invariant would be violated
//! - [`EngineError::Transient`] — store/provider glitch; retried with backoff
//! - [`EngineError::Permanent`] — unrecoverable provider/auth failure
//! - [`EngineError::Cancelled`] — operation deadline passed

use std::time::Duration;

/// Result type for all engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Primary error type for all engine operations.
#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    /// Malformed input: bad enum value, missing required field, invalid
    /// IANA timezone, invalid date format. Surfaced to the caller and
    /// never retried by the engine.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Entity id unknown. Surfaced; never retried.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An invariant would be violated, e.g. a duplicate
    /// `(origin_account_id, origin_event_id)` with incompatible fields or
    /// a hold lost to a concurrent reservation.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Store unavailable, network glitch, provider 5xx/429. Retried with
    /// backoff at the appropriate layer; `retry_after` carries the
    /// provider's rate-limit hint or the engine's back-pressure hint.
    #[error("Transient error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Provider auth revoked, delegation revoked, or an unrecoverable
    /// mirror state. Surfaced on the health report; never auto-retried.
    #[error("Permanent error: {message}")]
    Permanent { message: String },

    /// The operation deadline passed before the work reached a safe point.
    #[error("Operation cancelled: {message}")]
    Cancelled { message: String },

    /// SQL layer failure. Treated as transient by queue redelivery.
    #[error("Database error: {message}")]
    Database { message: String },

    /// JSON (de)serialization failure at a record or payload boundary.
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl EngineError {
    /// Stable error code for transport mapping.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation_error",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Conflict { .. } => "conflict",
            EngineError::Transient { .. } => "transient",
            EngineError::Permanent { .. } => "permanent",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::Database { .. } => "database_error",
            EngineError::Serialization { .. } => "serialization_error",
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient { .. } | EngineError::Database { .. }
        )
    }

    /// Back-pressure / rate-limit hint, when one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for an unknown-entity failure.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for an invariant violation.
    pub fn conflict(message: impl Into<String>) -> Self {
        EngineError::Conflict {
            message: message.into(),
        }
    }

    /// Shorthand for a transient failure without a retry hint.
    pub fn transient(message: impl Into<String>) -> Self {
        EngineError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Transient failure carrying an explicit retry hint, used by
    /// rate-limited providers and ingestion back-pressure.
    pub fn retry_later(message: impl Into<String>, retry_after: Duration) -> Self {
        EngineError::Transient {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    /// Shorthand for an unrecoverable failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        EngineError::Permanent {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization {
            message: error.to_string(),
        }
    }
}

#[cfg(feature = "database")]
impl From<diesel::result::Error> for EngineError {
    fn from(error: diesel::result::Error) -> Self {
        EngineError::Database {
            message: error.to_string(),
        }
    }
}

#[cfg(feature = "database")]
impl From<diesel::r2d2::PoolError> for EngineError {
    fn from(error: diesel::r2d2::PoolError) -> Self {
        EngineError::Database {
            message: format!("connection pool error: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::validation("x").code(), "validation_error");
        assert_eq!(EngineError::not_found("hold", "hold_1").code(), "not_found");
        assert_eq!(EngineError::transient("x").code(), "transient");
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(EngineError::transient("store gone").is_retryable());
        assert!(!EngineError::validation("bad enum").is_retryable());
        assert!(!EngineError::permanent("auth revoked").is_retryable());
    }

    #[test]
    fn retry_after_surfaces_hint() {
        let err = EngineError::retry_later("backlog", Duration::from_secs(30));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(EngineError::transient("x").retry_after(), None);
    }
}
