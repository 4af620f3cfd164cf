//! Scan execution: the coordinator, its state machine and the events it publishes.

mod barrier;
pub mod coordinator;
pub mod state;

pub use coordinator::{AcquisitionCoordinator, ScanSummary, StopHandle};
pub use state::{Phase, ScanEvent, ScanState, StatusLevel, StepPreview};
