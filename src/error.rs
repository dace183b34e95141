//! Unified error handling for the trip tracker.
//!
//! Filter rejections are not errors; they are returned as values from
//! [`crate::filter::PointFilter::evaluate`]. This type covers the failures
//! that a caller actually has to act on: misconfiguration, lifecycle misuse,
//! storage and platform failures.

use thiserror::Error;

/// Unified error type for trip tracking operations.
#[derive(Debug, Clone, PartialEq, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error), uniffi(flat_error))]
pub enum TrackingError {
    /// A tunable constant is zero, negative or inconsistent with another
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },
    /// `start` was called while a session is still being tracked
    #[error("Session '{active_session_id}' is already being tracked")]
    SessionAlreadyActive { active_session_id: String },
    /// `stop` or `resume` found nothing to act on
    #[error("No active tracking session")]
    NoActiveSession,
    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// The OS location bridge refused a request
    #[error("Platform error: {message}")]
    Platform { message: String },
    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TrackingError {
    pub fn persistence(message: impl Into<String>) -> Self {
        TrackingError::Persistence {
            message: message.into(),
        }
    }

    pub fn platform(message: impl Into<String>) -> Self {
        TrackingError::Platform {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        TrackingError::InvalidConfig {
            message: message.into(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackingError {
    fn from(err: rusqlite::Error) -> Self {
        TrackingError::persistence(err.to_string())
    }
}

impl From<serde_json::Error> for TrackingError {
    fn from(err: serde_json::Error) -> Self {
        TrackingError::config(err.to_string())
    }
}

/// Result type alias for trip tracking operations.
pub type Result<T> = std::result::Result<T, TrackingError>;

/// Extension trait for converting Option to TrackingError.
pub trait OptionExt<T> {
    /// Convert Option to Result with [`TrackingError::NoActiveSession`].
    fn ok_or_no_session(self) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_no_session(self) -> Result<T> {
        self.ok_or(TrackingError::NoActiveSession)
    }
}
