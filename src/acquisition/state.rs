//! Scan states and the events the coordinator publishes.

use serde::{Deserialize, Serialize};

use crate::data::Channel;
use crate::scan::ScanPosition;

/// Sub-state of a running step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Issuing move commands.
    Moving,
    /// Waiting for every actuator to report completion.
    WaitMove,
    /// Issuing grab commands.
    Grabbing,
    /// Waiting for every detector to report data.
    WaitGrab,
    /// Writing the merged step record.
    Committing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Moving => "Moving",
            Phase::WaitMove => "WaitMove",
            Phase::Grabbing => "Grabbing",
            Phase::WaitGrab => "WaitGrab",
            Phase::Committing => "Committing",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a scan.
///
/// `Idle -> Armed -> Running(..)* -> Done | Aborted | TimedOut`. A finished coordinator can
/// be armed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanState {
    /// Nothing configured yet.
    Idle,
    /// Modules checked, topology generated, storage laid out.
    Armed,
    /// Executing a step.
    Running(Phase),
    /// Every step committed, or the adaptive learner converged.
    Done,
    /// Stopped on request or by a non-timeout failure.
    Aborted,
    /// A wait phase ran out of time.
    TimedOut,
}

impl ScanState {
    /// True for `Done`, `Aborted` and `TimedOut`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Done | ScanState::Aborted | ScanState::TimedOut)
    }

    /// Status string persisted in the scan group.
    pub fn as_status(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Armed => "armed",
            ScanState::Running(_) => "running",
            ScanState::Done => "done",
            ScanState::Aborted => "aborted",
            ScanState::TimedOut => "timeout",
        }
    }
}

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    /// Progress information.
    Info,
    /// Something unusual that does not stop the scan.
    Warning,
    /// The scan is stopping because of it.
    Error,
}

impl StatusLevel {
    /// Lower-case name, as written in the scan log.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLevel::Info => "info",
            StatusLevel::Warning => "warning",
            StatusLevel::Error => "error",
        }
    }
}

/// Reduced view of a committed step for live display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPreview {
    /// Step number within the current pass.
    pub step: usize,
    /// Planned steps per pass.
    pub total: usize,
    /// Averaging pass.
    pub average: usize,
    /// Storage index the step was written at.
    pub index: Vec<usize>,
    /// Position the actuators were driven to.
    pub position: ScanPosition,
    /// `(detector, channel)` pairs. Images are reduced to their column sums.
    pub channels: Vec<(String, Channel)>,
}

/// Notification published on the coordinator's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanEvent {
    /// Human-readable status (`Update_Status`).
    Status {
        /// Message.
        text: String,
        /// Severity.
        level: StatusLevel,
    },
    /// A step is about to run (`Update_scan_index`).
    ScanIndex {
        /// Step number within the pass.
        index: usize,
        /// Averaging pass.
        average: usize,
    },
    /// A step was committed.
    StepComplete(StepPreview),
    /// The scan reached a terminal state (`Scan_done`).
    ScanDone {
        /// Terminal state.
        state: ScanState,
        /// Steps committed.
        committed_steps: usize,
    },
    /// A wait phase ran out of time (`Timeout`).
    Timeout {
        /// Phase that timed out.
        phase: Phase,
        /// Modules that never reported.
        pending: Vec<String>,
    },
}
