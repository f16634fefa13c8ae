//! What a presentation layer should show for a given acquisition state.
//!
//! `ViewState` is derived from `AcquisitionState` on every transition and is
//! never stored on its own. Presenters only render it.

use serde::Serialize;
use std::fmt;

use crate::controller::{AcquisitionState, GeocodeState};
use crate::error::LocationError;

/// Status line shown while there is no fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusMessage {
    ServicesDisabled,
    ErrorGettingLocation,
    Searching,
    TapToStart,
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusMessage::ServicesDisabled => "Location Services Disabled",
            StatusMessage::ErrorGettingLocation => "Error Getting Location",
            StatusMessage::Searching => "Searching...",
            StatusMessage::TapToStart => "Tap 'Get My Location' to Start",
        };
        f.write_str(text)
    }
}

/// Address line shown under the coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "text")]
pub enum AddressLine {
    Blank,
    Formatted(String),
    Searching,
    Error,
    NotFound,
}

impl fmt::Display for AddressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressLine::Blank => Ok(()),
            AddressLine::Formatted(text) => f.write_str(text),
            AddressLine::Searching => f.write_str("Searching for Address..."),
            AddressLine::Error => f.write_str("Error Finding Address"),
            AddressLine::NotFound => f.write_str("No Address Found"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonLabel {
    Stop,
    GetMyLocation,
}

impl fmt::Display for ButtonLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ButtonLabel::Stop => f.write_str("Stop"),
            ButtonLabel::GetMyLocation => f.write_str("Get My Location"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewState {
    /// Latitude with 8 decimals, empty without a fix
    pub latitude: String,
    /// Longitude with 8 decimals, empty without a fix
    pub longitude: String,
    /// `None` hides the message label
    pub message: Option<StatusMessage>,
    pub address: AddressLine,
    pub tag_visible: bool,
    pub button: ButtonLabel,
}

impl ViewState {
    pub fn derive(state: &AcquisitionState, services_enabled: bool) -> Self {
        let button = if state.is_acquiring {
            ButtonLabel::Stop
        } else {
            ButtonLabel::GetMyLocation
        };

        let Some(fix) = state.best_fix else {
            let message = match &state.last_error {
                Some(LocationError::PermissionDenied) => StatusMessage::ServicesDisabled,
                Some(_) => StatusMessage::ErrorGettingLocation,
                None if !services_enabled => StatusMessage::ServicesDisabled,
                None if state.is_acquiring => StatusMessage::Searching,
                None => StatusMessage::TapToStart,
            };

            return Self {
                latitude: String::new(),
                longitude: String::new(),
                message: Some(message),
                address: AddressLine::Blank,
                tag_visible: false,
                button,
            };
        };

        let address = match (&state.placemark, state.geocode_state) {
            (Some(placemark), _) => AddressLine::Formatted(placemark.to_string()),
            (None, GeocodeState::InFlight) => AddressLine::Searching,
            (None, _) if state.geocode_error.is_some() => AddressLine::Error,
            (None, _) => AddressLine::NotFound,
        };

        Self {
            latitude: format!("{:.8}", fix.coordinate.latitude),
            longitude: format!("{:.8}", fix.coordinate.longitude),
            message: None,
            address,
            tag_visible: true,
            button,
        }
    }
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(message) => write!(f, "{message}")?,
            None => {
                write!(f, "{}, {}", self.latitude, self.longitude)?;
                let address = self.address.to_string();
                if !address.is_empty() {
                    write!(f, " | {}", address.replace('\n', ", "))?;
                }
            }
        }
        write!(f, " [{}]", self.button)
    }
}
