use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
}

/// Upper bound for every configured interval, one year
pub const MAX_INTERVAL_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Seconds clamped into `0..=MAX_INTERVAL_SECS`, NaN counts as zero
fn clamp_secs(secs: f64) -> f64 {
    if secs.is_nan() {
        0.0
    } else {
        secs.clamp(0.0, MAX_INTERVAL_SECS)
    }
}

fn clamp_delta(secs: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((clamp_secs(secs) * 1000.0) as i64)
}

/// Thresholds that drive the acquisition state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// A fix at least this accurate ends the session
    pub desired_accuracy_m: f64,
    /// Give up when no fix arrived within this many seconds
    pub timeout_secs: f64,
    /// Fixes older than this are cached readings and get ignored
    pub max_fix_age_secs: f64,
    /// Fixes closer than this to the best one count as "no movement"
    pub stagnation_distance_m: f64,
    /// How long without movement before the session is cut off
    pub stagnation_interval_secs: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            desired_accuracy_m: 10.0,
            timeout_secs: 60.0,
            max_fix_age_secs: 5.0,
            stagnation_distance_m: 1.0,
            stagnation_interval_secs: 10.0,
        }
    }
}

impl AcquisitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(clamp_secs(self.timeout_secs))
    }

    pub fn max_fix_age(&self) -> chrono::Duration {
        clamp_delta(self.max_fix_age_secs)
    }

    pub fn stagnation_interval(&self) -> chrono::Duration {
        clamp_delta(self.stagnation_interval_secs)
    }

    /// Reject thresholds that are not finite, negative, or intervals beyond a year
    pub fn validate(&self) -> Result<()> {
        let distances = [
            ("desired_accuracy_m", self.desired_accuracy_m),
            ("stagnation_distance_m", self.stagnation_distance_m),
        ];
        let intervals = [
            ("timeout_secs", self.timeout_secs),
            ("max_fix_age_secs", self.max_fix_age_secs),
            ("stagnation_interval_secs", self.stagnation_interval_secs),
        ];

        for (name, value) in distances.iter().chain(intervals.iter()) {
            if !value.is_finite() || *value < 0.0 {
                bail!("acquisition.{name} must be a finite, non-negative number, got {value}");
            }
        }
        for (name, value) in intervals {
            if value > MAX_INTERVAL_SECS {
                bail!("acquisition.{name} must be at most {MAX_INTERVAL_SECS} seconds, got {value}");
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeocoderKind {
    #[default]
    Mock,
    Nominatim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub kind: GeocoderKind,
    pub base_url: String,
    pub user_agent: String,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            kind: GeocoderKind::Mock,
            base_url: "https://nominatim.openstreetmap.org/".to_string(),
            user_agent: format!("mylocations/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config
            .acquisition
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;

        Ok(config)
    }

    pub fn get_config_path(config_arg: &Option<PathBuf>) -> PathBuf {
        config_arg
            .clone()
            .unwrap_or_else(|| PathBuf::from("mylocations.yaml"))
    }
}
