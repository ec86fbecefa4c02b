//! Error taxonomy for the analytics engine.
//!
//! Every public engine operation returns [`Result`]. An error carries a
//! machine-readable [`ErrorKind`] plus a human-readable message; the kind
//! is what gets recorded on failed queries and mapped to HTTP statuses.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Bad request parameters. Detected locally, nothing is dispatched.
    ValidationError,
    /// A requested group id is not part of the federation membership.
    UnknownGroup,
    /// A filter uses an unsupported operator, field or value type.
    InvalidFilter,
    /// Too many sites were excluded during collection.
    InsufficientSites,
    /// Some sites were excluded. Only ever attached as a warning.
    PartialFailure,
    /// A group is too small for the requested test.
    InsufficientSampleSize,
    /// The contingency table has a zero expected cell or too few levels.
    DegenerateTable,
    /// An aggregate contains NaN or infinite values.
    CorruptAggregate,
    /// All groups have zero variance, so the test statistic is undefined.
    ZeroVariance,
    /// The query was cancelled (or interrupted) before completing.
    Cancelled,
    /// The overall query deadline was exceeded.
    Timeout,
    /// A remote answered with a non-success status and no body.
    EmptyResponse,
    /// Network or protocol failure.
    TransportError,
    /// The federation or query does not exist.
    NotFound,
    /// A state change was requested on a query that cannot make it.
    InvalidTransition,
    /// Unexpected internal failure (task panic, persistence error).
    Internal,
}

impl ErrorKind {
    /// HTTP status code this kind maps to at the service boundary.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::ValidationError | ErrorKind::InvalidFilter => 400,
            ErrorKind::UnknownGroup | ErrorKind::NotFound => 404,
            ErrorKind::Cancelled | ErrorKind::InvalidTransition => 409,
            ErrorKind::InsufficientSampleSize
            | ErrorKind::DegenerateTable
            | ErrorKind::ZeroVariance => 422,
            ErrorKind::CorruptAggregate
            | ErrorKind::EmptyResponse
            | ErrorKind::TransportError
            | ErrorKind::PartialFailure => 502,
            ErrorKind::InsufficientSites => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// Classify a non-success HTTP status received from a remote.
    pub fn from_http_status(status: u16, body_is_empty: bool) -> Self {
        if body_is_empty {
            return ErrorKind::EmptyResponse;
        }
        match status {
            400 => ErrorKind::ValidationError,
            404 => ErrorKind::NotFound,
            408 | 504 => ErrorKind::Timeout,
            _ => ErrorKind::TransportError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::UnknownGroup => "UnknownGroup",
            ErrorKind::InvalidFilter => "InvalidFilter",
            ErrorKind::InsufficientSites => "InsufficientSites",
            ErrorKind::PartialFailure => "PartialFailure",
            ErrorKind::InsufficientSampleSize => "InsufficientSampleSize",
            ErrorKind::DegenerateTable => "DegenerateTable",
            ErrorKind::CorruptAggregate => "CorruptAggregate",
            ErrorKind::ZeroVariance => "ZeroVariance",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::EmptyResponse => "EmptyResponse",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::Internal => "Internal",
        };
        write!(f, "{}", name)
    }
}

/// An engine error: kind plus message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AnalyticsError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AnalyticsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn unknown_group(group_id: &str) -> Self {
        Self::new(
            ErrorKind::UnknownGroup,
            format!("Group '{}' is not part of the federation", group_id),
        )
    }

    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFilter, message)
    }

    pub fn insufficient_sample(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientSampleSize, message)
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptAggregate, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Query was cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Reject NaN and infinite values with `CorruptAggregate`.
pub(crate) fn ensure_finite(value: f64, what: &str) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(AnalyticsError::corrupt(format!(
            "{} is not a finite number ({})",
            what, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::ValidationError.http_status(), 400);
        assert_eq!(ErrorKind::UnknownGroup.http_status(), 404);
        assert_eq!(ErrorKind::InsufficientSites.http_status(), 503);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
        assert_eq!(ErrorKind::DegenerateTable.http_status(), 422);
    }

    #[test]
    fn test_empty_body_is_empty_response() {
        assert_eq!(ErrorKind::from_http_status(500, true), ErrorKind::EmptyResponse);
        assert_eq!(ErrorKind::from_http_status(404, true), ErrorKind::EmptyResponse);
        assert_eq!(ErrorKind::from_http_status(500, false), ErrorKind::TransportError);
        assert_eq!(ErrorKind::from_http_status(404, false), ErrorKind::NotFound);
    }

    #[test]
    fn test_display() {
        let err = AnalyticsError::unknown_group("ios");
        assert_eq!(err.to_string(), "UnknownGroup: Group 'ios' is not part of the federation");
    }

    #[test]
    fn test_ensure_finite() {
        assert!(ensure_finite(1.5, "sum").is_ok());
        let err = ensure_finite(f64::NAN, "sum").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CorruptAggregate);
        assert!(ensure_finite(f64::INFINITY, "sum").is_err());
    }
}
