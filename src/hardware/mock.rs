//! Mock Hardware Implementations
//!
//! Simulated actuators and detectors for tests and for running scans without physical
//! hardware. All timing uses `tokio::time`, never `std::thread::sleep`, so tests running on
//! a paused clock stay deterministic.
//!
//! # Available Mocks
//!
//! - `MockActuator` - linear axis moving at a fixed speed, then settling
//! - `MockDetector` - scalar, 1-D and 2-D channels after a fixed grab latency
//!
//! Both expose switches for the failure modes a scan has to survive: modules that never
//! finished initializing, moves that never complete and grabs that hang.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::data::{Channel, ChannelAxis, DetectorPayload};
use crate::hardware::{ActuatorHandle, DetectorHandle, EventSink, OutputHint};

fn default_true() -> bool {
    true
}

fn default_speed() -> f64 {
    10.0
}

fn delay_from_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
}

// =============================================================================
// MockActuator - Simulated Motion Axis
// =============================================================================

/// Configuration of a [`MockActuator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockActuatorSpec {
    /// Bound name.
    pub name: String,
    /// Motion speed in units per second; 0 moves instantly.
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Settling time added after every move.
    #[serde(default, with = "humantime_serde")]
    pub settle: Duration,
    /// Accept moves but never report completion.
    #[serde(default)]
    pub never_completes: bool,
    /// Report an initialized state.
    #[serde(default = "default_true")]
    pub initialized: bool,
}

impl MockActuatorSpec {
    /// Instantaneous, initialized actuator.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            speed: 0.0,
            settle: Duration::ZERO,
            never_completes: false,
            initialized: true,
        }
    }
}

/// Mock actuator with realistic timing
///
/// A move takes `|target - position| / speed` plus the settling time, after which the
/// position is updated and `MoveDone` is reported.
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockActuator::new("stage_x").with_speed(10.0);
/// stage.connect(sink).await?;
/// stage.move_to(10.0).await?; // MoveDone arrives ~1 s later
/// ```
pub struct MockActuator {
    spec: MockActuatorSpec,
    position: Arc<RwLock<f64>>,
    sink: RwLock<Option<EventSink>>,
    never_completes: AtomicBool,
    moves: AtomicUsize,
    motion: Mutex<Option<JoinHandle<()>>>,
}

impl MockActuator {
    /// Instantaneous actuator at position 0.0.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_spec(MockActuatorSpec::new(name))
    }

    /// Actuator built from its configuration.
    pub fn from_spec(spec: MockActuatorSpec) -> Self {
        Self {
            never_completes: AtomicBool::new(spec.never_completes),
            spec,
            position: Arc::new(RwLock::new(0.0)),
            sink: RwLock::new(None),
            moves: AtomicUsize::new(0),
            motion: Mutex::new(None),
        }
    }

    /// Set the motion speed in units per second.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.spec.speed = speed;
        self
    }

    /// Set the settling time.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.spec.settle = settle;
        self
    }

    /// Report a non-initialized state.
    pub fn uninitialized(mut self) -> Self {
        self.spec.initialized = false;
        self
    }

    /// Switch completion reporting off (or back on) at run time.
    pub fn set_never_completes(&self, never: bool) {
        self.never_completes.store(never, Ordering::SeqCst);
    }

    /// Current position.
    pub async fn position(&self) -> f64 {
        *self.position.read().await
    }

    /// Number of move commands accepted.
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    pub(crate) fn position_handle(&self) -> Arc<RwLock<f64>> {
        Arc::clone(&self.position)
    }

    fn travel_time(&self, distance: f64) -> Duration {
        let motion = if self.spec.speed > 0.0 {
            delay_from_secs(distance.abs() / self.spec.speed)
        } else {
            Duration::ZERO
        };
        motion + self.spec.settle
    }
}

#[async_trait]
impl ActuatorHandle for MockActuator {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn is_initialized(&self) -> bool {
        self.spec.initialized
    }

    async fn connect(&self, sink: EventSink) -> Result<()> {
        *self.sink.write().await = Some(sink);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.sink.write().await.take();
        Ok(())
    }

    async fn move_to(&self, target: f64) -> Result<()> {
        if !self.spec.initialized {
            bail!("MockActuator '{}': not initialized", self.spec.name);
        }
        let sink = self
            .sink
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("MockActuator '{}': not connected", self.spec.name))?;

        let current = *self.position.read().await;
        let delay = self.travel_time(target - current);
        self.moves.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            actuator = %self.spec.name,
            from = current,
            to = target,
            delay_ms = delay.as_millis() as u64,
            "MockActuator moving"
        );

        if self.never_completes.load(Ordering::SeqCst) {
            return Ok(());
        }

        let position = Arc::clone(&self.position);
        let name = self.spec.name.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            *position.write().await = target;
            sink.move_done(name, target);
        });
        if let Some(previous) = self.motion.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(motion) = self.motion.lock().await.take() {
            motion.abort();
        }
        Ok(())
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::to_value(&self.spec).unwrap_or_default()
    }
}

// =============================================================================
// MockDetector - Simulated Detector
// =============================================================================

/// Dimensionality of a mock channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockChannelKind {
    /// One value per grab.
    #[default]
    Scalar,
    /// `length` samples per grab.
    Trace,
    /// `height x width` pixels per grab.
    Image,
}

/// One channel produced by a [`MockDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockChannelSpec {
    /// Channel name.
    pub name: String,
    /// Dimensionality.
    #[serde(default)]
    pub kind: MockChannelKind,
    /// Trace length.
    #[serde(default)]
    pub length: usize,
    /// Image width.
    #[serde(default)]
    pub width: usize,
    /// Image height.
    #[serde(default)]
    pub height: usize,
}

impl MockChannelSpec {
    /// Scalar channel.
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MockChannelKind::Scalar,
            length: 0,
            width: 0,
            height: 0,
        }
    }

    /// Trace channel.
    pub fn trace(name: impl Into<String>, length: usize) -> Self {
        Self {
            kind: MockChannelKind::Trace,
            length,
            ..Self::scalar(name)
        }
    }

    /// Image channel.
    pub fn image(name: impl Into<String>, width: usize, height: usize) -> Self {
        Self {
            kind: MockChannelKind::Image,
            width,
            height,
            ..Self::scalar(name)
        }
    }
}

/// Signal a mock detector reports as a function of its input.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum MockSignal {
    /// The input itself.
    #[default]
    Ramp,
    /// Unit-height gaussian peak.
    Gaussian {
        /// Peak position.
        center: f64,
        /// Standard deviation.
        sigma: f64,
    },
    /// 0 below `edge`, 1 from `edge` on.
    Step {
        /// Edge position.
        edge: f64,
    },
}

impl MockSignal {
    /// Signal value at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        match self {
            MockSignal::Ramp => x,
            MockSignal::Gaussian { center, sigma } => {
                let z = (x - center) / sigma;
                (-0.5 * z * z).exp()
            }
            MockSignal::Step { edge } => {
                if x >= *edge {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Configuration of a [`MockDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockDetectorSpec {
    /// Bound name.
    pub name: String,
    /// Channels, in the order they are reported.
    pub channels: Vec<MockChannelSpec>,
    /// Time between a grab command and its data.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// Accept grabs but never report data.
    #[serde(default)]
    pub hang: bool,
    /// Report an initialized state.
    #[serde(default = "default_true")]
    pub initialized: bool,
    /// Actuator whose position drives the signal; the grab counter is used otherwise.
    #[serde(default)]
    pub follows: Option<String>,
    /// Signal shape.
    #[serde(default)]
    pub signal: MockSignal,
}

impl MockDetectorSpec {
    /// Initialized detector with no latency.
    pub fn new(name: impl Into<String>, channels: Vec<MockChannelSpec>) -> Self {
        Self {
            name: name.into(),
            channels,
            latency: Duration::ZERO,
            hang: false,
            initialized: true,
            follows: None,
            signal: MockSignal::Ramp,
        }
    }
}

/// Mock detector producing deterministic data.
///
/// Scalar channels report `signal(x)`; traces and images add the sample index to it, so
/// that every cell of a persisted array can be checked. `x` is the position of the
/// followed actuator, or the 1-based grab number.
pub struct MockDetector {
    spec: MockDetectorSpec,
    source: Option<Arc<RwLock<f64>>>,
    sink: RwLock<Option<EventSink>>,
    hang: AtomicBool,
    grabs: AtomicUsize,
    last_hint: Mutex<Option<OutputHint>>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl MockDetector {
    /// Detector built from its configuration.
    pub fn from_spec(spec: MockDetectorSpec) -> Self {
        Self {
            hang: AtomicBool::new(spec.hang),
            spec,
            source: None,
            sink: RwLock::new(None),
            grabs: AtomicUsize::new(0),
            last_hint: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Initialized, latency-free detector with the given channels.
    pub fn new(name: impl Into<String>, channels: Vec<MockChannelSpec>) -> Self {
        Self::from_spec(MockDetectorSpec::new(name, channels))
    }

    /// Drive the signal from the position of `actuator`.
    pub fn follow(mut self, actuator: &MockActuator) -> Self {
        self.spec.follows = Some(actuator.spec.name.clone());
        self.source = Some(actuator.position_handle());
        self
    }

    /// Set the signal shape.
    pub fn with_signal(mut self, signal: MockSignal) -> Self {
        self.spec.signal = signal;
        self
    }

    /// Set the grab latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.spec.latency = latency;
        self
    }

    /// Report a non-initialized state.
    pub fn uninitialized(mut self) -> Self {
        self.spec.initialized = false;
        self
    }

    /// Switch data reporting off (or back on) at run time.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Number of grab commands accepted.
    pub fn grab_count(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }

    /// Hint passed with the latest grab.
    pub async fn last_hint(&self) -> Option<OutputHint> {
        self.last_hint.lock().await.clone()
    }

    fn payload(&self, x: f64) -> DetectorPayload {
        let base = self.spec.signal.eval(x);
        let channels = self
            .spec
            .channels
            .iter()
            .map(|channel| match channel.kind {
                MockChannelKind::Scalar => Channel::scalar(&channel.name, base),
                MockChannelKind::Trace => Channel::trace(
                    &channel.name,
                    (0..channel.length).map(|i| base + i as f64).collect(),
                )
                .with_axis(ChannelAxis {
                    label: "sample".to_string(),
                    units: "index".to_string(),
                    index: 0,
                    data: (0..channel.length).map(|i| i as f64).collect(),
                }),
                MockChannelKind::Image => Channel::image(
                    &channel.name,
                    channel.width,
                    channel.height,
                    (0..channel.width * channel.height)
                        .map(|i| base + i as f64)
                        .collect(),
                ),
            })
            .collect();
        DetectorPayload::new(self.spec.name.clone(), channels)
    }
}

#[async_trait]
impl DetectorHandle for MockDetector {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn is_initialized(&self) -> bool {
        self.spec.initialized
    }

    async fn connect(&self, sink: EventSink) -> Result<()> {
        *self.sink.write().await = Some(sink);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.sink.write().await.take();
        Ok(())
    }

    async fn grab(&self, hint: Option<OutputHint>) -> Result<()> {
        if !self.spec.initialized {
            bail!("MockDetector '{}': not initialized", self.spec.name);
        }
        let sink = self
            .sink
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("MockDetector '{}': not connected", self.spec.name))?;

        let grab = self.grabs.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_hint.lock().await = hint;
        if self.hang.load(Ordering::SeqCst) {
            tracing::debug!(detector = %self.spec.name, grab, "MockDetector hanging");
            return Ok(());
        }

        let x = match &self.source {
            Some(source) => *source.read().await,
            None => grab as f64,
        };
        let payload = self.payload(x);
        let latency = self.spec.latency;
        let handle = tokio::spawn(async move {
            sleep(latency).await;
            sink.data_ready(payload);
        });
        if let Some(previous) = self.pending.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(pending) = self.pending.lock().await.take() {
            pending.abort();
        }
        Ok(())
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::to_value(&self.spec).unwrap_or_default()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareEvent;

    #[tokio::test(start_paused = true)]
    async fn test_mock_actuator_reports_after_travel_time() {
        let (sink, mut rx) = EventSink::channel();
        let stage = MockActuator::new("x").with_speed(10.0);
        stage.connect(sink).await.unwrap();

        let started = tokio::time::Instant::now();
        stage.move_to(10.0).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            HardwareEvent::MoveDone {
                actuator: "x".into(),
                position: 10.0
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(stage.position().await, 10.0);
        assert_eq!(stage.move_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_actuator_never_completes() {
        let (sink, mut rx) = EventSink::channel();
        let stage = MockActuator::new("x");
        stage.connect(sink).await.unwrap();
        stage.set_never_completes(true);
        stage.move_to(1.0).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_mock_actuator_requires_connection_and_init() {
        let stage = MockActuator::new("x");
        assert!(stage.move_to(1.0).await.is_err());

        let (sink, _rx) = EventSink::channel();
        let broken = MockActuator::new("y").uninitialized();
        broken.connect(sink).await.unwrap();
        assert!(!broken.is_initialized().await);
        assert!(broken.move_to(1.0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_detector_payload() {
        let (sink, mut rx) = EventSink::channel();
        let detector = MockDetector::new(
            "cam",
            vec![
                MockChannelSpec::scalar("sum"),
                MockChannelSpec::trace("profile", 3),
                MockChannelSpec::image("frame", 2, 2),
            ],
        )
        .with_latency(Duration::from_millis(30));
        detector.connect(sink).await.unwrap();
        detector.grab(None).await.unwrap();

        match rx.recv().await.unwrap() {
            HardwareEvent::DataReady(payload) => {
                assert_eq!(payload.detector, "cam");
                assert_eq!(payload.channels.len(), 3);
                assert_eq!(payload.channels[0].data.as_scalar(), Some(1.0));
                assert_eq!(payload.channels[1].data.as_slice(), &[1.0, 2.0, 3.0]);
                assert_eq!(payload.channels[1].axes.len(), 1);
                assert_eq!(payload.channels[2].data.shape(), vec![2, 2]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_detector_follows_actuator() {
        let (sink, mut rx) = EventSink::channel();
        let stage = MockActuator::new("x");
        let detector = MockDetector::new("pd", vec![MockChannelSpec::scalar("v")])
            .follow(&stage)
            .with_signal(MockSignal::Step { edge: 0.5 });
        stage.connect(sink.clone()).await.unwrap();
        detector.connect(sink).await.unwrap();

        stage.move_to(0.7).await.unwrap();
        rx.recv().await.unwrap();
        detector.grab(None).await.unwrap();
        match rx.recv().await.unwrap() {
            HardwareEvent::DataReady(payload) => {
                assert_eq!(payload.channels[0].data.as_scalar(), Some(1.0));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_detector_hang() {
        let (sink, mut rx) = EventSink::channel();
        let detector = MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]);
        detector.connect(sink).await.unwrap();
        detector.set_hang(true);
        detector.grab(None).await.unwrap();
        assert_eq!(detector.grab_count(), 1);
        assert!(tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .is_err());
    }
}
