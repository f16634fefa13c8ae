//! Session driver for mylocations.
//!
//! The controller is a plain state machine. `SessionDriver` is the adapter that
//! gives it a runtime: it owns the controller and every collaborator on a single
//! task, pulls `Event`s off one channel so state changes never race, and turns
//! the controller's `Command`s into calls on the injected providers. Timers and
//! geocoding lookups run as spawned tasks that report back through the same
//! channel, tagged with the session they belong to.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AcquisitionConfig;
use crate::controller::{
    AcquisitionState, Command, GeocodeState, LocationController, PermissionStatus, SessionId,
    Transition,
};
use crate::error::{GeocodeError, LocationError};
use crate::fix::{Clock, Fix};
use crate::geocode::{Address, GeocodingService};
use crate::view::ViewState;

/// Everything the driver reacts to
#[derive(Debug)]
pub enum Event {
    /// The user asked for a location (or to stop)
    Acquire,
    Fix(Fix),
    FixFailed(LocationError),
    GeocodeCompleted {
        session: SessionId,
        result: Result<Vec<Address>, GeocodeError>,
    },
    Timeout {
        session: SessionId,
    },
    Shutdown,
}

/// Handle collaborators use to feed events back to the driver
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Returns false once the driver is gone
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Device location service
pub trait LocationProvider: Send {
    fn start(&mut self, desired_accuracy: f64, sink: EventSink);
    fn stop(&mut self);
}

/// Authorization and device-wide location settings
pub trait PermissionProvider: Send {
    fn current_status(&self) -> PermissionStatus;
    fn services_enabled(&self) -> bool;
    /// Ask the user. The answer surfaces later as an `Event::Acquire`.
    fn request_permission(&mut self, sink: EventSink);
}

/// Renders whatever the controller decided
pub trait Presenter: Send {
    fn render(&mut self, view: &ViewState);
    fn show_permission_denied_alert(&mut self);
}

pub struct SessionDriver {
    controller: LocationController,
    provider: Box<dyn LocationProvider>,
    permissions: Box<dyn PermissionProvider>,
    geocoder: Arc<dyn GeocodingService>,
    presenter: Box<dyn Presenter>,
    sink: EventSink,
    events: mpsc::UnboundedReceiver<Event>,
    timer: Option<JoinHandle<()>>,
    awaiting_permission: bool,
}

impl SessionDriver {
    pub fn new(
        config: AcquisitionConfig,
        clock: Arc<dyn Clock>,
        provider: Box<dyn LocationProvider>,
        permissions: Box<dyn PermissionProvider>,
        geocoder: Arc<dyn GeocodingService>,
        presenter: Box<dyn Presenter>,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();

        Self {
            controller: LocationController::new(config, clock),
            provider,
            permissions,
            geocoder,
            presenter,
            sink: EventSink { tx },
            events,
            timer: None,
            awaiting_permission: false,
        }
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn state(&self) -> &AcquisitionState {
        self.controller.state()
    }

    pub fn view_state(&self) -> ViewState {
        self.controller.view_state()
    }

    /// No session running, no lookup pending and no permission prompt open
    pub fn is_settled(&self) -> bool {
        let state = self.controller.state();
        !state.is_acquiring
            && state.geocode_state != GeocodeState::InFlight
            && !self.awaiting_permission
    }

    /// Request a location and process events until everything has settled.
    /// Returns the final state.
    pub async fn run_until_settled(&mut self) -> AcquisitionState {
        if !self.sink.send(Event::Acquire) {
            warn!("Driver gone before the session started");
        }

        while let Some(event) = self.events.recv().await {
            if !self.handle(event) {
                break;
            }
            if self.is_settled() {
                break;
            }
        }

        self.controller.state().clone()
    }

    /// Process one event. Returns false on shutdown.
    pub fn handle(&mut self, event: Event) -> bool {
        debug!("Handling {event:?}");

        let transition = match event {
            Event::Acquire => {
                self.awaiting_permission = false;
                self.controller
                    .set_services_enabled(self.permissions.services_enabled());
                let status = self.permissions.current_status();
                self.controller.request_acquisition(status)
            }
            Event::Fix(fix) => self.controller.on_fix_received(fix),
            Event::FixFailed(error) => self.controller.on_fix_failed(error),
            Event::GeocodeCompleted { session, result } => {
                self.controller.on_geocode_completed(session, result)
            }
            Event::Timeout { session } => self.controller.on_timeout(session),
            Event::Shutdown => {
                info!("Shutting down session driver");
                let commands = self.controller.stop_acquisition();
                self.execute(commands);
                return false;
            }
        };

        self.apply(transition);
        true
    }

    fn apply(&mut self, transition: Transition) {
        self.execute(transition.commands);
        self.presenter.render(&transition.view);
    }

    fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::RequestPermission => {
                    self.awaiting_permission = true;
                    self.permissions.request_permission(self.sink.clone());
                }
                Command::ShowPermissionDeniedAlert => {
                    self.presenter.show_permission_denied_alert();
                }
                Command::StartProvider { desired_accuracy } => {
                    self.provider.start(desired_accuracy, self.sink.clone());
                }
                Command::StopProvider => self.provider.stop(),
                Command::StartTimer { after, session } => {
                    self.cancel_timer();
                    let sink = self.sink.clone();
                    self.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        if !sink.send(Event::Timeout { session }) {
                            warn!("Driver gone before the session timed out");
                        }
                    }));
                }
                Command::CancelTimer => self.cancel_timer(),
                Command::StartGeocode { fix, session } => {
                    let geocoder = Arc::clone(&self.geocoder);
                    let sink = self.sink.clone();
                    tokio::spawn(async move {
                        let result = geocoder
                            .reverse_geocode(fix.coordinate.latitude, fix.coordinate.longitude)
                            .await;
                        if !sink.send(Event::GeocodeCompleted { session, result }) {
                            warn!("Driver gone before geocoding finished");
                        }
                    });
                }
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Permission provider with a fixed answer, as the command line has no prompt
#[derive(Debug, Clone)]
pub struct StaticPermissions {
    status: PermissionStatus,
    services_enabled: bool,
    grant_on_request: bool,
}

impl StaticPermissions {
    pub fn new(status: PermissionStatus, services_enabled: bool) -> Self {
        Self {
            status,
            services_enabled,
            grant_on_request: true,
        }
    }

    /// Answer a permission request with "denied" instead of "granted"
    pub fn deny_on_request(mut self) -> Self {
        self.grant_on_request = false;
        self
    }
}

impl PermissionProvider for StaticPermissions {
    fn current_status(&self) -> PermissionStatus {
        self.status
    }

    fn services_enabled(&self) -> bool {
        self.services_enabled
    }

    fn request_permission(&mut self, sink: EventSink) {
        self.status = if self.grant_on_request {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        info!("Location permission answered: {:?}", self.status);
        if !sink.send(Event::Acquire) {
            warn!("Driver gone before the permission answer arrived");
        }
    }
}
