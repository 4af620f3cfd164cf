//! Hardware collaborator contracts.
//!
//! The scan engine never talks to a driver directly. It commands [`ActuatorHandle`]s and
//! [`DetectorHandle`]s, and learns about completion through [`HardwareEvent`]s pushed into
//! an [`EventSink`] that the coordinator hands out when a module is connected. Modules only
//! ever hold that sink, never any coordinator state.
//!
//! Commands return as soon as they are accepted. `Ok(())` from [`ActuatorHandle::move_to`]
//! does not mean the move is finished; a [`HardwareEvent::MoveDone`] does.

pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::data::DetectorPayload;

/// Completion notification from a hardware module.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    /// An actuator reached its target.
    MoveDone {
        /// Actuator name.
        actuator: String,
        /// Position actually reached.
        position: f64,
    },
    /// A detector finished a grab.
    DataReady(DetectorPayload),
}

/// One-way reporting surface handed to hardware modules.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<HardwareEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the coordinator listens on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HardwareEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a finished move. Returns false once nobody listens anymore.
    pub fn move_done(&self, actuator: impl Into<String>, position: f64) -> bool {
        self.tx
            .send(HardwareEvent::MoveDone {
                actuator: actuator.into(),
                position,
            })
            .is_ok()
    }

    /// Report a finished grab. Returns false once nobody listens anymore.
    pub fn data_ready(&self, payload: DetectorPayload) -> bool {
        self.tx.send(HardwareEvent::DataReady(payload)).is_ok()
    }
}

/// Where the data of a grab will end up, for detectors that store data themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHint {
    /// Container path of the detector group, e.g. `/Raw_datas/Scan000/Det000`.
    pub group_path: String,
    /// Storage index of the step.
    pub index: Vec<usize>,
}

/// A controllable physical axis.
#[async_trait]
pub trait ActuatorHandle: Send + Sync {
    /// Name the actuator is bound under.
    fn name(&self) -> &str;

    /// True once the module finished its own initialization.
    async fn is_initialized(&self) -> bool;

    /// Start reporting completions into `sink`.
    async fn connect(&self, sink: EventSink) -> Result<()>;

    /// Stop reporting completions.
    async fn disconnect(&self) -> Result<()>;

    /// Start a move to `target`. Completion is reported as [`HardwareEvent::MoveDone`].
    async fn move_to(&self, target: f64) -> Result<()>;

    /// Halt any motion in progress.
    async fn stop(&self) -> Result<()>;

    /// Module settings, persisted next to the data.
    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Object(serde_json::Map::new())
    }
}

/// An instrument producing scalar, 1-D or 2-D channels.
#[async_trait]
pub trait DetectorHandle: Send + Sync {
    /// Name the detector is bound under.
    fn name(&self) -> &str;

    /// True once the module finished its own initialization.
    async fn is_initialized(&self) -> bool;

    /// Start reporting completions into `sink`.
    async fn connect(&self, sink: EventSink) -> Result<()>;

    /// Stop reporting completions.
    async fn disconnect(&self) -> Result<()>;

    /// Start a grab. Completion is reported as [`HardwareEvent::DataReady`].
    async fn grab(&self, hint: Option<OutputHint>) -> Result<()>;

    /// Abort a grab in progress.
    async fn stop(&self) -> Result<()>;

    /// Module settings, persisted next to the data.
    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Object(serde_json::Map::new())
    }
}
