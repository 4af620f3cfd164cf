//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `RUSTDAQ_`, nested keys separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! RUSTDAQ_APPLICATION__LOG_LEVEL=debug
//! RUSTDAQ_SCAN__N_AVERAGE=4
//! RUSTDAQ_TIMING__ACTUATOR_TIMEOUT=30s
//! RUSTDAQ_STORAGE__OUTPUT_DIR=/data/lab
//! ```
//!
//! # Example
//!
//! ```toml
//! [scan]
//! n_average = 1
//!
//! [scan.topology]
//! kind = "linear_1d"
//! axis = { start = 0.0, stop = 10.0, step = 2.0 }
//!
//! [[actuators]]
//! name = "stage_x"
//!
//! [[detectors]]
//! name = "power_meter"
//! channels = [{ name = "power" }]
//! ```
//!
//! A loaded [`Settings`] is mutable application state. When a scan is armed, the part the
//! engine needs is frozen into a [`ScanConfig`] snapshot, so later edits never reach a
//! running scan.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DaqError, DaqResult};
use crate::hardware::mock::{MockActuatorSpec, MockChannelKind, MockDetectorSpec};
use crate::scan::{PositionGenerator, TopologyKind, TopologyParams};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Scan definition
    pub scan: ScanSection,
    /// Pauses and wait budgets
    #[serde(default)]
    pub timing: TimingConfig,
    /// Scan container settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Adaptive scan settings
    #[serde(default)]
    pub adaptive: AdaptiveSection,
    /// Actuators, in binding order. Simulated by the `run` subcommand.
    #[serde(default)]
    pub actuators: Vec<MockActuatorSpec>,
    /// Detectors, in binding order. Their channel lists set the persisted channel order.
    #[serde(default)]
    pub detectors: Vec<MockDetectorSpec>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, written in the container root attributes
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Scan definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSection {
    /// Topology and its axis parameters
    pub topology: TopologyParams,
    /// Number of passes over all positions
    #[serde(default = "default_n_average")]
    pub n_average: usize,
    /// Largest accepted number of steps, all averaging passes included
    #[serde(default = "default_steps_limit")]
    pub steps_limit: usize,
}

/// Pauses and wait budgets of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Pause between move completion and the grab commands
    #[serde(default, with = "humantime_serde")]
    pub wait_time_between: Duration,
    /// Pause after each committed step
    #[serde(default, with = "humantime_serde")]
    pub wait_time: Duration,
    /// Budget of the WaitMove phase
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub actuator_timeout: Duration,
    /// Budget of the WaitGrab phase
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub detector_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            wait_time_between: Duration::ZERO,
            wait_time: Duration::ZERO,
            actuator_timeout: default_timeout(),
            detector_timeout: default_timeout(),
        }
    }
}

/// Scan container configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persist scans at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Directory holding the containers
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Container name prefix; the date is appended
    #[serde(default = "default_base_name")]
    pub base_name: String,
    /// Flush arrays to disk after every step
    #[serde(default = "default_enabled")]
    pub flush_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_output_dir(),
            base_name: default_base_name(),
            flush_on_commit: true,
        }
    }
}

/// Adaptive scan configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveSection {
    /// Scalar channel fed back to the learner, as `"detector/channel"`
    #[serde(default)]
    pub probe: Option<String>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "rust_daq_scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_n_average() -> usize {
    1
}

fn default_steps_limit() -> usize {
    1_000_000
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_enabled() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Data")
}

fn default_base_name() -> String {
    "Dataset".to_string()
}

// ============================================================================
// Scan snapshot
// ============================================================================

/// Detector binding with its declared channel order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorBinding {
    /// Bound name.
    pub name: String,
    /// Declared channel order; undeclared channels follow in first-seen order.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl DetectorBinding {
    /// Binding with the given channel order.
    pub fn new<S: Into<String>>(name: impl Into<String>, channels: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            channels: channels.into_iter().map(Into::into).collect(),
        }
    }
}

/// Immutable snapshot of everything a scan needs, captured when the scan is armed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Topology and its axis parameters.
    pub topology: TopologyParams,
    /// Actuator names, in binding order.
    pub actuators: Vec<String>,
    /// Detectors, in binding order.
    pub detectors: Vec<DetectorBinding>,
    /// Number of passes over all positions.
    pub n_average: usize,
    /// Largest accepted number of steps, all averaging passes included.
    pub steps_limit: usize,
    /// Pauses and wait budgets.
    pub timing: TimingConfig,
    /// Adaptive feedback channel, `"detector/channel"`.
    pub adaptive_probe: Option<String>,
}

impl ScanConfig {
    /// Snapshot with default averaging, limit and timing.
    pub fn new(
        topology: TopologyParams,
        actuators: Vec<String>,
        detectors: Vec<DetectorBinding>,
    ) -> Self {
        Self {
            topology,
            actuators,
            detectors,
            n_average: default_n_average(),
            steps_limit: default_steps_limit(),
            timing: TimingConfig::default(),
            adaptive_probe: None,
        }
    }

    /// Set the number of averaging passes.
    pub fn with_n_average(mut self, n_average: usize) -> Self {
        self.n_average = n_average;
        self
    }

    /// Set the step ceiling.
    pub fn with_steps_limit(mut self, steps_limit: usize) -> Self {
        self.steps_limit = steps_limit;
        self
    }

    /// Set pauses and wait budgets.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Set the adaptive feedback channel.
    pub fn with_probe(mut self, probe: impl Into<String>) -> Self {
        self.adaptive_probe = Some(probe.into());
        self
    }

    /// Split the probe into `(detector index, channel name)`.
    pub fn probe(&self) -> DaqResult<Option<(usize, String)>> {
        let Some(probe) = &self.adaptive_probe else {
            return Ok(None);
        };
        let (detector, channel) = probe.split_once('/').ok_or_else(|| {
            DaqError::Configuration(format!(
                "adaptive probe '{}' must be written 'detector/channel'",
                probe
            ))
        })?;
        let index = self
            .detectors
            .iter()
            .position(|d| d.name == detector)
            .ok_or_else(|| {
                DaqError::Configuration(format!(
                    "adaptive probe refers to unknown detector '{}'",
                    detector
                ))
            })?;
        Ok(Some((index, channel.to_string())))
    }

    /// Structural checks that do not need hardware.
    pub fn validate(&self) -> DaqResult<()> {
        if self.n_average == 0 {
            return Err(DaqError::Configuration(
                "n_average must be at least 1".to_string(),
            ));
        }
        if self.steps_limit == 0 {
            return Err(DaqError::Configuration(
                "steps_limit must be greater than 0".to_string(),
            ));
        }
        if self.timing.actuator_timeout.is_zero() || self.timing.detector_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "wait timeouts must be greater than 0".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for detector in &self.detectors {
            if detector.name.is_empty() || !names.insert(detector.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate or empty detector name: '{}'",
                    detector.name
                )));
            }
            let mut channels = HashSet::new();
            for channel in &detector.channels {
                if !channels.insert(channel.as_str()) {
                    return Err(DaqError::Configuration(format!(
                        "Duplicate channel '{}' on detector '{}'",
                        channel, detector.name
                    )));
                }
            }
        }

        let generator = PositionGenerator::configure(
            self.topology.clone(),
            self.actuators.clone(),
            self.steps_limit,
        )?;
        // every pass is stored, so the ceiling applies to all of them
        let steps = generator.evaluate_steps().saturating_mul(self.n_average);
        if steps > self.steps_limit {
            return Err(DaqError::ScanTooLarge {
                steps,
                limit: self.steps_limit,
            });
        }

        if self.topology.kind() == TopologyKind::Adaptive1D {
            if self.n_average != 1 {
                return Err(DaqError::Configuration(
                    "adaptive scans do not support averaging".to_string(),
                ));
            }
            if self.probe()?.is_none() {
                return Err(DaqError::Configuration(
                    "adaptive scans need a probe channel ('detector/channel')".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file and `RUSTDAQ_` environment variables.
    ///
    /// Environment variables take precedence over the file. The result is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUSTDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Actuator and detector names are unique and non-empty
    /// - The topology matches the number of actuators and its parameters are sound
    /// - The adaptive probe names a declared scalar channel
    /// - Storage naming is usable
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.enabled && self.storage.base_name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "storage.base_name cannot be empty".to_string(),
            ));
        }

        let scan = self.scan_config();
        scan.validate()?;

        if let Some((index, channel)) = scan.probe()? {
            let detector = &self.detectors[index];
            match detector.channels.iter().find(|c| c.name == channel) {
                Some(spec) if spec.kind == MockChannelKind::Scalar => {}
                Some(_) => {
                    return Err(DaqError::Configuration(format!(
                        "adaptive probe '{}/{}' must be a scalar channel",
                        detector.name, channel
                    )))
                }
                None => {
                    return Err(DaqError::Configuration(format!(
                        "adaptive probe channel '{}' is not declared on '{}'",
                        channel, detector.name
                    )))
                }
            }
        }

        for detector in &self.detectors {
            for channel in &detector.channels {
                let empty = match channel.kind {
                    MockChannelKind::Scalar => false,
                    MockChannelKind::Trace => channel.length == 0,
                    MockChannelKind::Image => channel.width == 0 || channel.height == 0,
                };
                if empty {
                    return Err(DaqError::Configuration(format!(
                        "channel '{}' of '{}' has an empty shape",
                        channel.name, detector.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Freeze the scan-relevant part of the settings.
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            topology: self.scan.topology.clone(),
            actuators: self.actuators.iter().map(|a| a.name.clone()).collect(),
            detectors: self
                .detectors
                .iter()
                .map(|d| DetectorBinding::new(d.name.clone(), d.channels.iter().map(|c| c.name.clone())))
                .collect(),
            n_average: self.scan.n_average,
            steps_limit: self.scan.steps_limit,
            timing: self.timing,
            adaptive_probe: self.adaptive.probe.clone(),
        }
    }

    /// Container directory for scans taken on `date` (`YYYYMMDD`).
    pub fn container_path(&self, date: &str) -> PathBuf {
        self.storage
            .output_dir
            .join(format!("{}_{}", self.storage.base_name, date))
    }
}
