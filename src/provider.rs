//! Location providers usable without a device.
//!
//! `ReplayProvider` plays back a recorded track file, `SyntheticProvider`
//! invents fixes that converge on a target. Both run on a spawned task that
//! feeds the session driver and is aborted when the provider is stopped.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::LocationError;
use crate::fix::{Coordinate, Fix};
use crate::session::{Event, EventSink, LocationProvider};

/// Meters per degree of latitude, close enough for jitter
const METERS_PER_DEGREE: f64 = 111_195.0;

/// Oldest backdating a track step may ask for, one year
const MAX_AGE_SECS: f64 = 365.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Unknown,
    Denied,
    Provider,
}

/// One entry of a recorded track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackStep {
    Fix {
        latitude: f64,
        longitude: f64,
        accuracy: f64,
        /// Wait this long before delivering the fix
        #[serde(default)]
        delay_ms: u64,
        /// Backdate the fix, to mimic cached readings
        #[serde(default)]
        age_secs: f64,
    },
    Error {
        kind: ProviderErrorKind,
        #[serde(default)]
        delay_ms: u64,
        #[serde(default)]
        message: Option<String>,
    },
}

impl TrackStep {
    fn delay(&self) -> Duration {
        match self {
            TrackStep::Fix { delay_ms, .. } | TrackStep::Error { delay_ms, .. } => {
                Duration::from_millis(*delay_ms)
            }
        }
    }

    /// Turn the step into the event a real provider would deliver now
    fn to_event(&self) -> Event {
        match self {
            TrackStep::Fix {
                latitude,
                longitude,
                accuracy,
                age_secs,
                ..
            } => {
                let now = Utc::now();
                // Anything that cannot be backdated is as stale as it gets
                let timestamp = chrono::Duration::try_milliseconds((age_secs * 1000.0) as i64)
                    .and_then(|age| now.checked_sub_signed(age))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                Event::Fix(Fix::new(
                    Coordinate::new(*latitude, *longitude),
                    *accuracy,
                    timestamp,
                ))
            }
            TrackStep::Error { kind, message, .. } => Event::FixFailed(match kind {
                ProviderErrorKind::Unknown => LocationError::LocationUnknown,
                ProviderErrorKind::Denied => LocationError::PermissionDenied,
                ProviderErrorKind::Provider => LocationError::Provider(
                    message.clone().unwrap_or_else(|| "unspecified".to_string()),
                ),
            }),
        }
    }
}

/// A recorded sequence of provider callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Track {
    pub steps: Vec<TrackStep>,
}

impl Track {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read track from {}", path.display()))?;

        Self::from_yaml(&yaml)
            .with_context(|| format!("Failed to parse track from {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let steps: Vec<TrackStep> = serde_yaml::from_str(yaml)?;

        for (index, step) in steps.iter().enumerate() {
            if let TrackStep::Fix { age_secs, .. } = step {
                if !(0.0..=MAX_AGE_SECS).contains(age_secs) {
                    bail!(
                        "Step {}: age_secs must be between 0 and {MAX_AGE_SECS}, got {age_secs}",
                        index + 1
                    );
                }
            }
        }

        Ok(Self { steps })
    }
}

/// Replays a `Track` in real time
pub struct ReplayProvider {
    track: Track,
    task: Option<JoinHandle<()>>,
}

impl ReplayProvider {
    pub fn new(track: Track) -> Self {
        Self { track, task: None }
    }
}

impl LocationProvider for ReplayProvider {
    fn start(&mut self, desired_accuracy: f64, sink: EventSink) {
        self.stop();
        info!(
            "Replaying {} track steps (desired accuracy {desired_accuracy} m)",
            self.track.steps.len()
        );

        let steps = self.track.steps.clone();
        self.task = Some(tokio::spawn(async move {
            for step in steps {
                tokio::time::sleep(step.delay()).await;
                if !sink.send(step.to_event()) {
                    break;
                }
            }
            debug!("Track replay finished");
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Produces fixes around a target with accuracy halving on every reading
pub struct SyntheticProvider {
    target: Coordinate,
    interval: Duration,
    initial_accuracy: f64,
    seed: Option<u64>,
    task: Option<JoinHandle<()>>,
}

impl SyntheticProvider {
    pub fn new(target: Coordinate, interval: Duration) -> Self {
        Self {
            target,
            interval,
            initial_accuracy: 100.0,
            seed: None,
            task: None,
        }
    }

    /// Make the jitter reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl LocationProvider for SyntheticProvider {
    fn start(&mut self, desired_accuracy: f64, sink: EventSink) {
        self.stop();
        info!(
            "Simulating fixes near {} (desired accuracy {desired_accuracy} m)",
            self.target
        );

        let target = self.target;
        let interval = self.interval;
        let mut accuracy = self.initial_accuracy;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let spread = accuracy / METERS_PER_DEGREE;
                let coordinate = Coordinate::new(
                    target.latitude + rng.gen_range(-spread..=spread),
                    target.longitude + rng.gen_range(-spread..=spread),
                );
                let fix = Fix::new(coordinate, accuracy, Utc::now());

                if !sink.send(Event::Fix(fix)) {
                    break;
                }
                accuracy = (accuracy / 2.0).max(desired_accuracy / 2.0);
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_track() -> Result<()> {
        let track = Track::from_yaml(
            r#"
- type: fix
  latitude: 41.8781
  longitude: -87.6298
  accuracy: 65.0
  delay_ms: 100
- type: error
  kind: unknown
- type: fix
  latitude: 41.8781
  longitude: -87.6298
  accuracy: 5.0
  age_secs: 30
"#,
        )?;

        assert_eq!(track.steps.len(), 3);
        assert_eq!(
            track.steps[0],
            TrackStep::Fix {
                latitude: 41.8781,
                longitude: -87.6298,
                accuracy: 65.0,
                delay_ms: 100,
                age_secs: 0.0,
            }
        );
        assert_eq!(track.steps[0].delay(), Duration::from_millis(100));
        assert!(matches!(
            track.steps[1],
            TrackStep::Error {
                kind: ProviderErrorKind::Unknown,
                ..
            }
        ));

        Ok(())
    }

    #[test]
    fn test_step_events() {
        let cached = TrackStep::Fix {
            latitude: 1.0,
            longitude: 2.0,
            accuracy: 5.0,
            delay_ms: 0,
            age_secs: 30.0,
        };
        match cached.to_event() {
            Event::Fix(fix) => assert!(fix.age(Utc::now()) >= chrono::Duration::seconds(30)),
            other => panic!("unexpected event {other:?}"),
        }

        let failure = TrackStep::Error {
            kind: ProviderErrorKind::Provider,
            delay_ms: 0,
            message: Some("antenna unplugged".to_string()),
        };
        match failure.to_event() {
            Event::FixFailed(error) => assert_eq!(
                error,
                LocationError::Provider("antenna unplugged".to_string())
            ),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_age_is_rejected() {
        for age in ["1.0e20", "-.inf", ".nan", "-1"] {
            let yaml = format!(
                "- type: fix\n  latitude: 1.0\n  longitude: 2.0\n  accuracy: 5.0\n  age_secs: {age}\n"
            );
            let err = Track::from_yaml(&yaml).unwrap_err();
            assert!(err.to_string().contains("age_secs"), "age {age}: {err}");
        }
    }

    #[test]
    fn test_unrepresentable_age_yields_stale_fix() {
        let step = TrackStep::Fix {
            latitude: 1.0,
            longitude: 2.0,
            accuracy: 5.0,
            delay_ms: 0,
            age_secs: f64::NEG_INFINITY,
        };

        match step.to_event() {
            Event::Fix(fix) => assert_eq!(fix.timestamp, DateTime::<Utc>::MIN_UTC),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_load_track_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            "- type: error\n  kind: denied\n- type: error\n  kind: provider"
        )?;

        let track = Track::load_from_file(file.path())?;
        assert_eq!(track.steps.len(), 2);

        Ok(())
    }

    #[test]
    fn test_invalid_track_file() {
        assert!(Track::from_yaml("- type: teleport").is_err());
        assert!(Track::load_from_file(Path::new("/nonexistent/track.yaml")).is_err());
    }
}
