//! Error types for API resources.

use thiserror::Error;

/// Errors that can occur when interpreting API resources.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The lifecycle state string is unknown.
    #[error("unknown reconcile state: {0}")]
    UnknownState(String),

    /// A max-unavailable value could not be interpreted.
    #[error("invalid max unavailable value: {0}")]
    InvalidMaxUnavailable(String),
}
