//! # rust_daq_scan
//!
//! Command-line front end of the scan engine. Hardware is simulated by the mock modules
//! declared in the configuration file.
//!
//! ```bash
//! rust_daq_scan run --config config/scan.example.toml
//! rust_daq_scan estimate --config config/scan.example.toml
//! rust_daq_scan topologies
//! ```

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use rust_daq_scan::acquisition::{AcquisitionCoordinator, ScanEvent};
use rust_daq_scan::config::Settings;
use rust_daq_scan::hardware::mock::{MockActuator, MockDetector};
use rust_daq_scan::hardware::{ActuatorHandle, DetectorHandle};
use rust_daq_scan::logging;
use rust_daq_scan::scan::{PositionGenerator, TopologyKind};
use rust_daq_scan::storage::ScanStore;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Scan engine for the rust_daq acquisition suite
#[derive(Parser, Debug)]
#[command(name = "rust_daq_scan")]
#[command(version)]
#[command(about = "Run and inspect scans on simulated hardware")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Arm and run the configured scan
    Run {
        /// Scan configuration file (TOML)
        #[arg(short, long, default_value = "config/scan.toml")]
        config: PathBuf,
    },
    /// Print the number of steps and the scan shape without touching hardware
    Estimate {
        /// Scan configuration file (TOML)
        #[arg(short, long, default_value = "config/scan.toml")]
        config: PathBuf,
    },
    /// List the available topologies
    Topologies,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Estimate { config } => estimate(config),
        Command::Topologies => {
            topologies();
            Ok(())
        }
    }
}

fn load(path: &Path) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    logging::init_from_config(&settings.application);
    Ok(settings)
}

async fn run(path: PathBuf) -> Result<()> {
    let settings = load(&path)?;

    let actuators: Vec<Arc<MockActuator>> = settings
        .actuators
        .iter()
        .map(|spec| Arc::new(MockActuator::from_spec(spec.clone())))
        .collect();
    let mut detectors: Vec<Arc<dyn DetectorHandle>> = Vec::with_capacity(settings.detectors.len());
    for spec in &settings.detectors {
        let mut detector = MockDetector::from_spec(spec.clone());
        if let Some(follows) = &spec.follows {
            let Some(actuator) = actuators.iter().find(|a| a.name() == follows.as_str()) else {
                bail!("Detector '{}' follows unknown actuator '{}'", spec.name, follows);
            };
            detector = detector.follow(actuator);
        }
        detectors.push(Arc::new(detector));
    }
    let actuators: Vec<Arc<dyn ActuatorHandle>> = actuators
        .into_iter()
        .map(|a| a as Arc<dyn ActuatorHandle>)
        .collect();

    let mut coordinator = AcquisitionCoordinator::new(actuators, detectors)
        .with_settings(serde_json::to_value(&settings)?)
        .with_flush_on_commit(settings.storage.flush_on_commit);
    if settings.storage.enabled {
        let container = settings.container_path(&Local::now().format("%Y%m%d").to_string());
        let store = ScanStore::create_or_open(&container, &settings.application.name)
            .with_context(|| format!("Failed to open container {}", container.display()))?;
        coordinator = coordinator.with_store(store);
    } else {
        warn!("Storage disabled, scan data will not be persisted");
    }

    let mut events = coordinator.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ScanEvent::StepComplete(preview)) => {
                    println!(
                        "[{}/{}] average {} at {:?}",
                        preview.step + 1,
                        preview.total,
                        preview.average,
                        preview.position.values()
                    );
                }
                Ok(ScanEvent::ScanDone { .. }) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    });

    let stop = coordinator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping at the next step");
            stop.request_stop();
        }
    });

    coordinator
        .arm(settings.scan_config())
        .await
        .context("Failed to arm the scan")?;
    let outcome = coordinator.run().await;
    let _ = progress.await;

    let summary = outcome.context("Scan failed")?;
    println!(
        "Scan {} ({}): {}/{} steps committed{}",
        summary.uid,
        summary.state.as_status(),
        summary.committed_steps,
        summary.planned_steps,
        summary
            .scan_path
            .map(|path| format!(", saved under {}", path))
            .unwrap_or_default()
    );
    Ok(())
}

fn estimate(path: PathBuf) -> Result<()> {
    let settings = load(&path)?;
    let scan = settings.scan_config();
    let generator =
        PositionGenerator::configure(scan.topology.clone(), scan.actuators.clone(), scan.steps_limit)?;
    let steps = generator.evaluate_steps();

    println!("Topology:       {}", generator.kind());
    println!("Actuators:      {}", scan.actuators.join(", "));
    println!("Steps per pass: {}", steps);
    println!("Averages:       {}", scan.n_average);
    println!("Total steps:    {}", steps.saturating_mul(scan.n_average));
    if generator.kind() == TopologyKind::Adaptive1D {
        println!("Shape:          [{}] (upper bound)", steps);
    } else {
        let topology = generator.generate()?;
        println!("Shape:          {:?}", topology.shape());
    }
    Ok(())
}

fn topologies() {
    println!("{:<24} {:<10} DESCRIPTION", "KIND", "ACTUATORS");
    for kind in TopologyKind::all() {
        let actuators = kind
            .required_actuators()
            .map_or_else(|| "any".to_string(), |n| n.to_string());
        println!("{:<24} {:<10} {}", kind.as_str(), actuators, kind.description());
    }
}
