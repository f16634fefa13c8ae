use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported while acquiring a position
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationError {
    /// The provider cannot determine a position right now but keeps trying
    #[error("location currently unknown")]
    LocationUnknown,
    #[error("location access denied")]
    PermissionDenied,
    #[error("location provider error: {0}")]
    Provider(String),
    /// No fix arrived before the session timeout
    #[error("timed out waiting for a location")]
    TimedOut,
}

impl LocationError {
    /// Transient errors do not end a session
    pub fn is_transient(&self) -> bool {
        matches!(self, LocationError::LocationUnknown)
    }
}

/// Failures from a reverse geocoding lookup
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeError {
    #[error("geocoding request failed: {0}")]
    Http(String),
    #[error("geocoding service returned status {0}")]
    Status(u16),
    #[error("could not decode geocoding response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GeocodeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GeocodeError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            GeocodeError::Status(status.as_u16())
        } else {
            GeocodeError::Http(err.to_string())
        }
    }
}
