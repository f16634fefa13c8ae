use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mylocations::config::Config;
use mylocations::controller::{AcquisitionState, PermissionStatus};
use mylocations::fix::{Coordinate, SystemClock};
use mylocations::geocode::create_geocoding_service;
use mylocations::provider::{ReplayProvider, SyntheticProvider, Track};
use mylocations::session::{LocationProvider, Presenter, SessionDriver, StaticPermissions};
use mylocations::view::ViewState;

#[derive(Parser)]
#[command(author, version, about = "Find out where you are, and what's there")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize with a default config file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,

        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show the configuration in use
    Status {
        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Acquire a location and look up its address
    Locate {
        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Replay provider callbacks from a YAML track file
        #[arg(short, long, value_name = "FILE", conflicts_with = "near")]
        track: Option<PathBuf>,

        /// Simulate fixes converging on LAT,LON
        #[arg(long, value_name = "LAT,LON", value_parser = parse_coordinate)]
        near: Option<Coordinate>,

        /// Location permission to report
        #[arg(long, value_enum, default_value_t = Permission::Granted)]
        permission: Permission,

        /// Pretend location services are switched off device-wide
        #[arg(long)]
        services_disabled: bool,

        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Permission {
    Granted,
    Denied,
    Restricted,
    NotDetermined,
}

impl From<Permission> for PermissionStatus {
    fn from(permission: Permission) -> Self {
        match permission {
            Permission::Granted => PermissionStatus::Granted,
            Permission::Denied => PermissionStatus::Denied,
            Permission::Restricted => PermissionStatus::Restricted,
            Permission::NotDetermined => PermissionStatus::NotDetermined,
        }
    }
}

fn parse_coordinate(value: &str) -> Result<Coordinate, String> {
    let (lat, lon) = value
        .split_once(',')
        .ok_or_else(|| format!("expected LAT,LON but got '{value}'"))?;
    let latitude: f64 = lat.trim().parse().map_err(|e| format!("bad latitude: {e}"))?;
    let longitude: f64 = lon.trim().parse().map_err(|e| format!("bad longitude: {e}"))?;

    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(format!("coordinate out of range: {value}"));
    }
    Ok(Coordinate::new(latitude, longitude))
}

/// Prints every distinct view state on its own line
#[derive(Default)]
struct ConsolePresenter {
    last: Option<ViewState>,
}

impl Presenter for ConsolePresenter {
    fn render(&mut self, view: &ViewState) {
        if self.last.as_ref() != Some(view) {
            println!("{view}");
            self.last = Some(view.clone());
        }
    }

    fn show_permission_denied_alert(&mut self) {
        println!("Location Services Disabled");
        println!("Please enable location services for this app in Settings.");
    }
}

#[derive(Serialize)]
struct LocateReport {
    state: AcquisitionState,
    view: ViewState,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force, config } => init_config(&config, force),
        Commands::Status { config } => {
            let config_data = load_config(&config)?;
            println!("mylocations Status");
            println!("Configuration:");
            println!(
                "  Desired accuracy: {} m",
                config_data.acquisition.desired_accuracy_m
            );
            println!("  Timeout: {} s", config_data.acquisition.timeout_secs);
            println!(
                "  Max fix age: {} s",
                config_data.acquisition.max_fix_age_secs
            );
            println!(
                "  Stagnation cutoff: {} m over {} s",
                config_data.acquisition.stagnation_distance_m,
                config_data.acquisition.stagnation_interval_secs
            );
            println!("  Geocoder: {:?}", config_data.geocoder.kind);
            println!("  Geocoder URL: {}", config_data.geocoder.base_url);
            Ok(())
        }
        Commands::Locate {
            config,
            track,
            near,
            permission,
            services_disabled,
            json,
        } => {
            let config_data = load_config(&config)?;

            let provider: Box<dyn LocationProvider> = match (track, near) {
                (Some(path), _) => Box::new(ReplayProvider::new(Track::load_from_file(&path)?)),
                (None, Some(target)) => {
                    Box::new(SyntheticProvider::new(target, Duration::from_millis(500)))
                }
                (None, None) => anyhow::bail!("Pass either --track FILE or --near LAT,LON"),
            };

            let geocoder = create_geocoding_service(&config_data.geocoder)
                .context("Failed to set up geocoding service")?;
            let permissions = StaticPermissions::new(permission.into(), !services_disabled);

            let mut driver = SessionDriver::new(
                config_data.acquisition.clone(),
                Arc::new(SystemClock),
                provider,
                Box::new(permissions),
                geocoder,
                Box::new(ConsolePresenter::default()),
            );

            info!("Starting location session");
            let state = driver.run_until_settled().await;

            if json {
                let report = LocateReport {
                    view: driver.view_state(),
                    state,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            }

            Ok(())
        }
    }
}

fn init_config(config_path_opt: &Option<PathBuf>, force: bool) -> Result<()> {
    let config_path = Config::get_config_path(config_path_opt);

    if config_path.exists() && !force {
        println!("Config file already exists at {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    let config = Config::default();
    config
        .save_to_file(&config_path)
        .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

    println!("Created config file at {}", config_path.display());
    Ok(())
}

fn load_config(config_path_opt: &Option<PathBuf>) -> Result<Config> {
    let config_path = Config::get_config_path(config_path_opt);

    if !config_path.exists() {
        anyhow::bail!(
            "Config file not found at {}. Run 'mylocations init' to create one.",
            config_path.display()
        );
    }

    Config::load_from_file(&config_path)
}
