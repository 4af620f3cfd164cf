//! Scan engine of the rust_daq acquisition suite.
//!
//! A scan turns a topology description into an ordered list of positions, drives every
//! position through the bound actuators and detectors, and writes the results into a
//! hierarchical container:
//!
//! - [`scan`]: the `PositionGenerator` and the topologies it knows.
//! - [`acquisition`]: the `AcquisitionCoordinator` running the step state machine.
//! - [`storage`]: the persistence layer (groups, memory-mapped arrays, scan layout).
//! - [`hardware`]: collaborator traits and mock modules.
//! - [`config`]: figment-based settings and the immutable `ScanConfig` snapshot.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod scan;
pub mod storage;

pub use acquisition::{AcquisitionCoordinator, ScanEvent, ScanState, ScanSummary, StopHandle};
pub use config::{ScanConfig, Settings};
pub use error::{DaqError, DaqResult, ErrorCategory};
pub use scan::{PositionGenerator, ScanTopology, TopologyKind, TopologyParams};
