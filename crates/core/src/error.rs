//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only. Guard violations come in two flavours that
/// callers must be able to tell apart: a state guard (`InvalidTransition`) and a
/// capability guard (`Unauthorized`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. discount outside 0..=100).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. editing locked pricing inputs).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The aggregate is not in a state that allows the requested transition.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conflict occurred (stale version, duplicate registration).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The acting principal lacks the capability required by the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Guard violations are user-facing and never worth retrying.
    pub fn is_guard_violation(&self) -> bool {
        matches!(self, Self::InvalidTransition(_) | Self::Unauthorized(_))
    }
}
