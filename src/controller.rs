//! Location acquisition decision logic.
//!
//! `LocationController` owns the `AcquisitionState` of the current session and
//! reacts to the events the outside world feeds it: permission requests, fixes,
//! provider failures, geocoding results and the session timeout. It never talks
//! to a device itself. Every handler returns a `Transition` listing the
//! `Command`s an adapter has to execute and the `ViewState` to render.
//!
//! A session begins when acquisition is requested while idle and ends when the
//! provider is stopped, either because a fix met the desired accuracy, because
//! fixes stopped improving, because of an error or timeout, or on request.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AcquisitionConfig;
use crate::error::{GeocodeError, LocationError};
use crate::fix::{Clock, Fix};
use crate::geocode::Address;
use crate::view::ViewState;

/// Generation token of an acquisition session
pub type SessionId = u64;

/// Authorization state of the app for location access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    NotDetermined,
    Denied,
    Restricted,
    Granted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeState {
    #[default]
    Idle,
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct AcquisitionState {
    /// Most accurate fix of the session
    pub best_fix: Option<Fix>,
    pub last_error: Option<LocationError>,
    /// True only between starting and stopping the provider
    pub is_acquiring: bool,
    pub geocode_state: GeocodeState,
    pub placemark: Option<Address>,
    /// Kept apart from `last_error`, it only affects the address line
    pub geocode_error: Option<GeocodeError>,
}

/// Instructions for the adapters around the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RequestPermission,
    ShowPermissionDeniedAlert,
    StartProvider { desired_accuracy: f64 },
    StopProvider,
    StartTimer { after: Duration, session: SessionId },
    CancelTimer,
    StartGeocode { fix: Fix, session: SessionId },
}

/// Outcome of handling one event
#[derive(Debug, Clone)]
pub struct Transition {
    pub commands: Vec<Command>,
    pub view: ViewState,
}

pub struct LocationController {
    config: AcquisitionConfig,
    clock: Arc<dyn Clock>,
    state: AcquisitionState,
    services_enabled: bool,
    session: SessionId,
}

impl LocationController {
    pub fn new(config: AcquisitionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: AcquisitionState::default(),
            services_enabled: true,
            session: 0,
        }
    }

    pub fn state(&self) -> &AcquisitionState {
        &self.state
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn services_enabled(&self) -> bool {
        self.services_enabled
    }

    /// Record whether location services are switched on device-wide
    pub fn set_services_enabled(&mut self, enabled: bool) {
        self.services_enabled = enabled;
    }

    pub fn view_state(&self) -> ViewState {
        ViewState::derive(&self.state, self.services_enabled)
    }

    fn transition(&self, commands: Vec<Command>) -> Transition {
        Transition {
            commands,
            view: self.view_state(),
        }
    }

    /// The user asked for their location, or tapped "Stop"
    pub fn request_acquisition(&mut self, permission: PermissionStatus) -> Transition {
        let commands = match permission {
            PermissionStatus::NotDetermined => {
                info!("Location permission not determined yet, requesting it");
                vec![Command::RequestPermission]
            }
            PermissionStatus::Denied | PermissionStatus::Restricted => {
                warn!("Location permission is {permission:?}");
                vec![Command::ShowPermissionDeniedAlert]
            }
            PermissionStatus::Granted if self.state.is_acquiring => {
                info!("Stopping session {} on request", self.session);
                self.stop_acquisition()
            }
            PermissionStatus::Granted => {
                self.reset_session();
                self.start_acquisition()
            }
        };

        self.transition(commands)
    }

    fn reset_session(&mut self) {
        self.state.best_fix = None;
        self.state.last_error = None;
        self.state.placemark = None;
        self.state.geocode_state = GeocodeState::Idle;
        self.state.geocode_error = None;
        self.session += 1;
    }

    fn start_acquisition(&mut self) -> Vec<Command> {
        if !self.services_enabled {
            warn!("Location services are disabled, not starting the provider");
            return Vec::new();
        }

        info!(
            "Starting session {} (desired accuracy {} m)",
            self.session, self.config.desired_accuracy_m
        );
        self.state.is_acquiring = true;

        vec![
            Command::StartProvider {
                desired_accuracy: self.config.desired_accuracy_m,
            },
            Command::StartTimer {
                after: self.config.timeout(),
                session: self.session,
            },
        ]
    }

    /// Stop the provider and cancel the timeout. No-op when already stopped.
    pub fn stop_acquisition(&mut self) -> Vec<Command> {
        if !self.state.is_acquiring {
            return Vec::new();
        }

        self.state.is_acquiring = false;
        debug!("Session {} stopped", self.session);
        vec![Command::CancelTimer, Command::StopProvider]
    }

    pub fn on_fix_received(&mut self, fix: Fix) -> Transition {
        if !self.state.is_acquiring {
            debug!("Ignoring fix outside of a session");
            return self.transition(Vec::new());
        }

        let age = fix.age(self.clock.now());
        if age > self.config.max_fix_age() {
            debug!("Ignoring cached fix, {} ms old", age.num_milliseconds());
            return self.transition(Vec::new());
        }

        if !fix.has_valid_accuracy() {
            debug!("Ignoring fix with invalid accuracy {}", fix.horizontal_accuracy);
            return self.transition(Vec::new());
        }

        let previous = self.state.best_fix;
        let distance = previous
            .map(|best| best.distance_to(&fix))
            .unwrap_or(f64::INFINITY);
        let improves = previous.is_none_or(|best| best.horizontal_accuracy > fix.horizontal_accuracy);

        let mut commands = Vec::new();

        if improves {
            debug!(
                "Accepted fix {} (accuracy {} m)",
                fix.coordinate, fix.horizontal_accuracy
            );
            self.state.last_error = None;
            self.state.best_fix = Some(fix);

            if fix.horizontal_accuracy <= self.config.desired_accuracy_m {
                info!("Desired accuracy reached, done acquiring");
                commands.extend(self.stop_acquisition());
            } else if self.is_stagnant(previous, &fix, distance) {
                info!("Fixes stopped improving, done acquiring");
                commands.extend(self.stop_acquisition());
            }

            if self.state.geocode_state != GeocodeState::InFlight {
                self.state.geocode_state = GeocodeState::InFlight;
                commands.push(Command::StartGeocode {
                    fix,
                    session: self.session,
                });
            }
        } else if self.is_stagnant(previous, &fix, distance) {
            info!("No better fix in a while, done acquiring");
            commands.extend(self.stop_acquisition());
        }

        self.transition(commands)
    }

    /// A fix within the stagnation distance of the previous best, taken long after it
    fn is_stagnant(&self, previous: Option<Fix>, fix: &Fix, distance: f64) -> bool {
        match previous {
            Some(previous) => {
                distance < self.config.stagnation_distance_m
                    && fix.timestamp - previous.timestamp > self.config.stagnation_interval()
            }
            None => false,
        }
    }

    pub fn on_fix_failed(&mut self, error: LocationError) -> Transition {
        if error.is_transient() {
            debug!("Provider reports {error}, still waiting");
            return self.transition(Vec::new());
        }

        if !self.state.is_acquiring {
            debug!("Ignoring provider error outside of a session: {error}");
            return self.transition(Vec::new());
        }

        warn!("Acquisition failed: {error}");
        self.state.last_error = Some(error);
        let commands = self.stop_acquisition();
        self.transition(commands)
    }

    pub fn on_geocode_completed(
        &mut self,
        session: SessionId,
        result: Result<Vec<Address>, GeocodeError>,
    ) -> Transition {
        if session != self.session || self.state.geocode_state != GeocodeState::InFlight {
            debug!("Discarding stale geocoding result for session {session}");
            return self.transition(Vec::new());
        }

        match result {
            Ok(mut addresses) if !addresses.is_empty() => {
                self.state.placemark = addresses.pop();
                self.state.geocode_state = GeocodeState::Succeeded;
                self.state.geocode_error = None;
                debug!("Found address for session {session}");
            }
            Ok(_) => {
                self.state.placemark = None;
                self.state.geocode_state = GeocodeState::Failed;
                self.state.geocode_error = None;
                debug!("No address found for session {session}");
            }
            Err(err) => {
                warn!("Reverse geocoding failed: {err}");
                self.state.placemark = None;
                self.state.geocode_state = GeocodeState::Failed;
                self.state.geocode_error = Some(err);
            }
        }

        self.transition(Vec::new())
    }

    pub fn on_timeout(&mut self, session: SessionId) -> Transition {
        if session != self.session || !self.state.is_acquiring || self.state.best_fix.is_some() {
            return self.transition(Vec::new());
        }

        warn!("No location after {:?}, giving up", self.config.timeout());
        self.state.last_error = Some(LocationError::TimedOut);
        let commands = self.stop_acquisition();
        self.transition(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::{Coordinate, ManualClock};
    use crate::view::{AddressLine, ButtonLabel, StatusMessage};
    use chrono::{DateTime, Utc};

    fn start_time() -> DateTime<Utc> {
        "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
    }

    fn controller() -> (LocationController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let controller = LocationController::new(AcquisitionConfig::default(), clock.clone());
        (controller, clock)
    }

    fn started() -> (LocationController, Arc<ManualClock>) {
        let (mut controller, clock) = controller();
        controller.request_acquisition(PermissionStatus::Granted);
        (controller, clock)
    }

    fn fix_now(clock: &ManualClock, latitude: f64, accuracy: f64) -> Fix {
        Fix::new(Coordinate::new(latitude, 4.8952), accuracy, clock.now())
    }

    fn geocode_count(commands: &[Command]) -> usize {
        commands
            .iter()
            .filter(|c| matches!(c, Command::StartGeocode { .. }))
            .count()
    }

    #[test]
    fn test_not_determined_requests_permission() {
        let (mut controller, _) = controller();
        let before = controller.state().clone();

        let transition = controller.request_acquisition(PermissionStatus::NotDetermined);

        assert_eq!(transition.commands, vec![Command::RequestPermission]);
        assert_eq!(controller.state(), &before);
        assert_eq!(transition.view.message, Some(StatusMessage::TapToStart));
    }

    #[test]
    fn test_denied_and_restricted_show_alert() {
        for status in [PermissionStatus::Denied, PermissionStatus::Restricted] {
            let (mut controller, _) = controller();
            let transition = controller.request_acquisition(status);

            assert_eq!(transition.commands, vec![Command::ShowPermissionDeniedAlert]);
            assert!(!controller.state().is_acquiring);
        }
    }

    #[test]
    fn test_granted_starts_session() {
        let (mut controller, _) = controller();
        let transition = controller.request_acquisition(PermissionStatus::Granted);

        assert_eq!(
            transition.commands,
            vec![
                Command::StartProvider {
                    desired_accuracy: 10.0
                },
                Command::StartTimer {
                    after: Duration::from_secs(60),
                    session: 1
                },
            ]
        );
        assert!(controller.state().is_acquiring);
        assert_eq!(transition.view.message, Some(StatusMessage::Searching));
        assert_eq!(transition.view.button, ButtonLabel::Stop);
    }

    #[test]
    fn test_huge_timeout_starts_session() {
        let clock = Arc::new(ManualClock::new(start_time()));
        let config: AcquisitionConfig =
            serde_yaml::from_str("timeout_secs: 1.0e20\nmax_fix_age_secs: -.inf\n").unwrap();
        let mut controller = LocationController::new(config, clock);

        let transition = controller.request_acquisition(PermissionStatus::Granted);

        assert!(controller.state().is_acquiring);
        assert!(transition.commands.contains(&Command::StartTimer {
            after: Duration::from_secs_f64(crate::config::MAX_INTERVAL_SECS),
            session: 1
        }));
    }

    #[test]
    fn test_granted_while_acquiring_stops() {
        let (mut controller, _) = started();
        let transition = controller.request_acquisition(PermissionStatus::Granted);

        assert_eq!(
            transition.commands,
            vec![Command::CancelTimer, Command::StopProvider]
        );
        assert!(!controller.state().is_acquiring);
        assert_eq!(transition.view.button, ButtonLabel::GetMyLocation);
    }

    #[test]
    fn test_services_disabled_does_not_start() {
        let (mut controller, _) = controller();
        controller.set_services_enabled(false);

        let transition = controller.request_acquisition(PermissionStatus::Granted);

        assert!(transition.commands.is_empty());
        assert!(!controller.state().is_acquiring);
        assert_eq!(transition.view.message, Some(StatusMessage::ServicesDisabled));
    }

    #[test]
    fn test_new_session_resets_fields() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.37, 5.0));
        controller.on_geocode_completed(1, Ok(vec![Address::default()]));
        assert!(controller.state().best_fix.is_some());

        let transition = controller.request_acquisition(PermissionStatus::Granted);

        let state = controller.state();
        assert_eq!(controller.session(), 2);
        assert!(state.best_fix.is_none());
        assert!(state.placemark.is_none());
        assert!(state.last_error.is_none());
        assert_eq!(state.geocode_state, GeocodeState::Idle);
        assert!(state.is_acquiring);
        assert_eq!(transition.view.message, Some(StatusMessage::Searching));
    }

    #[test]
    fn test_stale_fix_is_rejected() {
        let (mut controller, clock) = started();
        let old = Fix::new(
            Coordinate::new(52.37, 4.89),
            5.0,
            clock.now() - chrono::Duration::seconds(6),
        );

        let transition = controller.on_fix_received(old);

        assert!(transition.commands.is_empty());
        assert!(controller.state().best_fix.is_none());
    }

    #[test]
    fn test_negative_accuracy_is_rejected() {
        let (mut controller, clock) = started();

        let transition = controller.on_fix_received(fix_now(&clock, 52.37, -1.0));

        assert!(transition.commands.is_empty());
        assert!(controller.state().best_fix.is_none());
    }

    #[test]
    fn test_only_strictly_better_fix_replaces_best() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.37, 50.0));

        // Same accuracy, different place: not better
        controller.on_fix_received(fix_now(&clock, 52.38, 50.0));
        assert_eq!(controller.state().best_fix.unwrap().coordinate.latitude, 52.37);

        // Worse accuracy
        controller.on_fix_received(fix_now(&clock, 52.39, 80.0));
        assert_eq!(controller.state().best_fix.unwrap().coordinate.latitude, 52.37);

        // Better accuracy
        controller.on_fix_received(fix_now(&clock, 52.40, 30.0));
        let best = controller.state().best_fix.unwrap();
        assert_eq!(best.coordinate.latitude, 52.40);
        assert_eq!(best.horizontal_accuracy, 30.0);
        assert!(controller.state().is_acquiring);
    }

    #[test]
    fn test_desired_accuracy_stops_session() {
        let (mut controller, clock) = started();

        let transition = controller.on_fix_received(fix_now(&clock, 52.37, 8.0));

        assert!(transition.commands.contains(&Command::StopProvider));
        assert!(transition.commands.contains(&Command::CancelTimer));
        assert_eq!(geocode_count(&transition.commands), 1);
        assert!(!controller.state().is_acquiring);
        assert_eq!(transition.view.address, AddressLine::Searching);
        assert!(transition.view.tag_visible);

        // No more fixes until a new session starts
        let transition = controller.on_fix_received(fix_now(&clock, 52.38, 1.0));
        assert!(transition.commands.is_empty());
        assert_eq!(controller.state().best_fix.unwrap().horizontal_accuracy, 8.0);
    }

    #[test]
    fn test_accepted_fix_clears_error() {
        let (mut controller, clock) = started();
        controller.state.last_error = Some(LocationError::Provider("flaky".to_string()));

        controller.on_fix_received(fix_now(&clock, 52.37, 40.0));

        assert!(controller.state().last_error.is_none());
    }

    #[test]
    fn test_stagnation_cutoff_stops_session() {
        let (mut controller, clock) = started();
        let first = fix_now(&clock, 52.3702, 50.0);
        controller.on_fix_received(first);

        clock.advance(chrono::Duration::seconds(11));
        // ~0.5 m north of the first fix, no better
        let second = fix_now(&clock, 52.3702045, 50.0);
        let transition = controller.on_fix_received(second);

        assert_eq!(
            transition.commands,
            vec![Command::CancelTimer, Command::StopProvider]
        );
        assert!(!controller.state().is_acquiring);
        assert_eq!(controller.state().best_fix, Some(first));
    }

    #[test]
    fn test_stagnation_cutoff_with_improving_fix() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.3702, 50.0));
        controller.on_geocode_completed(1, Ok(Vec::new()));

        clock.advance(chrono::Duration::seconds(11));
        let transition = controller.on_fix_received(fix_now(&clock, 52.3702045, 40.0));

        assert!(transition.commands.contains(&Command::StopProvider));
        assert_eq!(geocode_count(&transition.commands), 1);
        assert_eq!(controller.state().best_fix.unwrap().horizontal_accuracy, 40.0);
    }

    #[test]
    fn test_no_stagnation_within_interval() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.3702, 50.0));

        clock.advance(chrono::Duration::seconds(9));
        let transition = controller.on_fix_received(fix_now(&clock, 52.3702045, 50.0));

        assert!(transition.commands.is_empty());
        assert!(controller.state().is_acquiring);
    }

    #[test]
    fn test_single_geocode_in_flight() {
        let (mut controller, clock) = started();

        let first = controller.on_fix_received(fix_now(&clock, 52.37, 100.0));
        assert_eq!(geocode_count(&first.commands), 1);
        assert_eq!(controller.state().geocode_state, GeocodeState::InFlight);

        let second = controller.on_fix_received(fix_now(&clock, 52.37, 60.0));
        assert_eq!(geocode_count(&second.commands), 0);

        controller.on_geocode_completed(1, Ok(vec![Address::default()]));
        let third = controller.on_fix_received(fix_now(&clock, 52.37, 30.0));
        assert_eq!(geocode_count(&third.commands), 1);
    }

    #[test]
    fn test_geocode_success_uses_last_address() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.37, 5.0));

        let first = Address {
            city: Some("First".to_string()),
            ..Address::default()
        };
        let last = Address {
            city: Some("Last".to_string()),
            ..Address::default()
        };
        let transition = controller.on_geocode_completed(1, Ok(vec![first, last.clone()]));

        assert_eq!(controller.state().placemark, Some(last));
        assert_eq!(controller.state().geocode_state, GeocodeState::Succeeded);
        assert_eq!(transition.view.address, AddressLine::Formatted("Last".to_string()));
    }

    #[test]
    fn test_geocode_empty_result() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.37, 5.0));

        let transition = controller.on_geocode_completed(1, Ok(Vec::new()));

        assert!(controller.state().placemark.is_none());
        assert_eq!(controller.state().geocode_state, GeocodeState::Failed);
        assert_eq!(transition.view.address, AddressLine::NotFound);
        assert_eq!(transition.view.address.to_string(), "No Address Found");
    }

    #[test]
    fn test_geocode_error_does_not_touch_location_error() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.37, 5.0));

        let transition =
            controller.on_geocode_completed(1, Err(GeocodeError::Http("offline".to_string())));

        assert_eq!(controller.state().geocode_state, GeocodeState::Failed);
        assert!(controller.state().geocode_error.is_some());
        assert!(controller.state().last_error.is_none());
        assert_eq!(transition.view.address, AddressLine::Error);
    }

    #[test]
    fn test_stale_geocode_result_is_discarded() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.37, 5.0));

        // New session before the lookup of session 1 returned
        controller.request_acquisition(PermissionStatus::Granted);
        controller.on_geocode_completed(1, Ok(vec![Address::default()]));

        assert!(controller.state().placemark.is_none());
        assert_eq!(controller.state().geocode_state, GeocodeState::Idle);
    }

    #[test]
    fn test_transient_error_is_ignored() {
        let (mut controller, _) = started();

        let transition = controller.on_fix_failed(LocationError::LocationUnknown);

        assert!(transition.commands.is_empty());
        assert!(controller.state().is_acquiring);
        assert!(controller.state().last_error.is_none());
    }

    #[test]
    fn test_provider_error_stops_session() {
        let (mut controller, _) = started();

        let transition = controller.on_fix_failed(LocationError::Provider("no signal".to_string()));

        assert_eq!(
            transition.commands,
            vec![Command::CancelTimer, Command::StopProvider]
        );
        assert_eq!(
            transition.view.message,
            Some(StatusMessage::ErrorGettingLocation)
        );
    }

    #[test]
    fn test_permission_denied_error_message() {
        let (mut controller, _) = started();

        let transition = controller.on_fix_failed(LocationError::PermissionDenied);

        assert!(!controller.state().is_acquiring);
        assert_eq!(transition.view.message, Some(StatusMessage::ServicesDisabled));
    }

    #[test]
    fn test_timeout_without_fix() {
        let (mut controller, _) = started();

        let transition = controller.on_timeout(1);

        assert_eq!(controller.state().last_error, Some(LocationError::TimedOut));
        assert_eq!(
            transition.commands,
            vec![Command::CancelTimer, Command::StopProvider]
        );
        assert_eq!(
            transition.view.message,
            Some(StatusMessage::ErrorGettingLocation)
        );
    }

    #[test]
    fn test_timeout_is_noop_with_fix_or_after_stop() {
        let (mut controller, clock) = started();
        controller.on_fix_received(fix_now(&clock, 52.37, 50.0));
        let transition = controller.on_timeout(1);
        assert!(transition.commands.is_empty());
        assert!(controller.state().last_error.is_none());
        assert!(controller.state().is_acquiring);

        let (mut controller, _) = started();
        controller.request_acquisition(PermissionStatus::Granted);
        let transition = controller.on_timeout(1);
        assert!(transition.commands.is_empty());
        assert!(controller.state().last_error.is_none());
    }

    #[test]
    fn test_timeout_from_previous_session_is_ignored() {
        let (mut controller, _) = started();
        controller.request_acquisition(PermissionStatus::Granted);
        controller.request_acquisition(PermissionStatus::Granted);
        assert_eq!(controller.session(), 2);

        let transition = controller.on_timeout(1);

        assert!(transition.commands.is_empty());
        assert!(controller.state().is_acquiring);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut controller, _) = started();

        assert_eq!(controller.stop_acquisition().len(), 2);
        assert!(controller.stop_acquisition().is_empty());
    }
}
