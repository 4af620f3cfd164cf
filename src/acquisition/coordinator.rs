//! Step-by-step scan execution.
//!
//! The coordinator is the only writer of a scan. It runs one step at a time:
//!
//! ```text
//! Moving -> WaitMove -> Grabbing -> WaitGrab -> Committing
//! ```
//!
//! Every actuator must report `MoveDone` before any grab is issued, and every detector must
//! report `DataReady` before the step is committed. Both waits are bounded; running out of
//! time ends the whole scan as `TimedOut`.
//!
//! A stop request is honored at the next step boundary, before the next move. A step that
//! has started runs through its grab and commit (or to a timeout).

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::acquisition::barrier::PendingSet;
use crate::acquisition::state::{Phase, ScanEvent, ScanState, StatusLevel, StepPreview};
use crate::config::ScanConfig;
use crate::data::{Channel, ChannelData, DetectorPayload};
use crate::error::{DaqError, DaqResult};
use crate::hardware::{ActuatorHandle, DetectorHandle, EventSink, HardwareEvent, OutputHint};
use crate::scan::{AdaptiveLearner, PositionGenerator, ScanPosition, ScanTopology};
use crate::storage::saver::ModuleLayout;
use crate::storage::{ScanLayout, ScanSaver, ScanStore};

const EVENT_CAPACITY: usize = 1024;

/// Cloneable handle requesting a running scan to stop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    requested: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    /// Ask the scan to stop at the next step boundary.
    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once a stop was requested for the current scan.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of a scan that ran to a terminal state without an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    /// Scan identifier.
    pub uid: String,
    /// `Done`, or `Aborted` when stopped on request.
    pub state: ScanState,
    /// Steps written.
    pub committed_steps: usize,
    /// Steps planned over all averaging passes (the step cap for adaptive scans).
    pub planned_steps: usize,
    /// Container path of the scan group, when persisting.
    pub scan_path: Option<String>,
}

struct ArmedScan {
    uid: String,
    config: ScanConfig,
    topology: ScanTopology,
}

struct ActiveScan {
    saver: Option<ScanSaver>,
    rx: mpsc::UnboundedReceiver<HardwareEvent>,
    _sink: EventSink,
    phase: Phase,
    committed: usize,
}

struct Step<'a> {
    step: usize,
    total: usize,
    average: usize,
    position: &'a ScanPosition,
    index: Vec<usize>,
}

fn hardware_error(module: &str, action: &str, err: anyhow::Error) -> DaqError {
    DaqError::Instrument(format!("'{}' failed to {}: {:#}", module, action, err))
}

/// Drop completions left over from earlier phases, such as a duplicated `DataReady`.
fn discard_stale(scan: &mut ActiveScan) {
    while let Ok(event) = scan.rx.try_recv() {
        debug!(phase = %scan.phase, ?event, "Discarding stale completion");
    }
}

fn check_binding<'a>(
    role: &str,
    configured: impl ExactSizeIterator<Item = &'a str>,
    bound: impl ExactSizeIterator<Item = &'a str>,
) -> DaqResult<()> {
    let configured: Vec<&str> = configured.collect();
    let bound: Vec<&str> = bound.collect();
    if configured != bound {
        return Err(DaqError::Assignment(format!(
            "configured {} order {:?} does not match the bound modules {:?}",
            role, configured, bound
        )));
    }
    Ok(())
}

/// Drives generated positions through the hardware and commits the results.
///
/// # Example
///
/// ```rust,ignore
/// let mut coordinator = AcquisitionCoordinator::new(actuators, detectors)
///     .with_store(ScanStore::create_or_open(&path, "rust_daq_scan")?);
/// let mut events = coordinator.subscribe();
/// coordinator.arm(settings.scan_config()).await?;
/// let summary = coordinator.run().await?;
/// ```
pub struct AcquisitionCoordinator {
    actuators: Vec<Arc<dyn ActuatorHandle>>,
    detectors: Vec<Arc<dyn DetectorHandle>>,
    store: Option<ScanStore>,
    settings: serde_json::Value,
    flush_on_commit: bool,
    events: broadcast::Sender<ScanEvent>,
    state: watch::Sender<ScanState>,
    stop: StopHandle,
    armed: Option<ArmedScan>,
}

impl AcquisitionCoordinator {
    /// Coordinator over modules bound in the given order. Nothing is persisted until a
    /// store is attached.
    pub fn new(
        actuators: Vec<Arc<dyn ActuatorHandle>>,
        detectors: Vec<Arc<dyn DetectorHandle>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            actuators,
            detectors,
            store: None,
            settings: serde_json::Value::Object(serde_json::Map::new()),
            flush_on_commit: true,
            events,
            state,
            stop: StopHandle::default(),
            armed: None,
        }
    }

    /// Persist scans into `store`.
    pub fn with_store(mut self, store: ScanStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Application settings written into each scan group.
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    /// Flush arrays after every commit (default) or only when the scan ends.
    pub fn with_flush_on_commit(mut self, flush: bool) -> Self {
        self.flush_on_commit = flush;
        self
    }

    /// Receive status, progress and completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Handle to stop the scan from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Topology of the armed scan.
    pub fn armed_topology(&self) -> Option<&ScanTopology> {
        self.armed.as_ref().map(|armed| &armed.topology)
    }

    fn set_state(&self, state: ScanState) {
        self.state.send_replace(state);
    }

    fn status(&self, saver: Option<&ScanSaver>, level: StatusLevel, text: impl Into<String>) {
        let text = text.into();
        match level {
            StatusLevel::Info => info!("{}", text),
            StatusLevel::Warning => warn!("{}", text),
            StatusLevel::Error => error!("{}", text),
        }
        if let Some(saver) = saver {
            if let Err(e) = saver.log(level.as_str(), &text) {
                warn!(error = %e, "Could not append to the scan log");
            }
        }
        let _ = self.events.send(ScanEvent::Status { text, level });
    }

    /// Check the modules, generate the topology and capture `config` for the next run.
    ///
    /// Fails with a configuration error when a module is not initialized or the topology
    /// is invalid, and with an assignment error when the configured names do not match the
    /// bound modules. The coordinator state is left untouched on failure.
    pub async fn arm(&mut self, config: ScanConfig) -> DaqResult<()> {
        match self.prepare(config).await {
            Ok(armed) => {
                info!(
                    uid = %armed.uid,
                    kind = %armed.config.topology.kind(),
                    steps = armed.topology.len(),
                    n_average = armed.config.n_average,
                    "Scan armed"
                );
                self.stop.reset();
                self.armed = Some(armed);
                self.set_state(ScanState::Armed);
                Ok(())
            }
            Err(e) => {
                self.status(None, StatusLevel::Error, format!("Scan cannot start: {}", e));
                Err(e)
            }
        }
    }

    async fn prepare(&self, config: ScanConfig) -> DaqResult<ArmedScan> {
        if matches!(self.state(), ScanState::Running(_)) {
            return Err(DaqError::Configuration("a scan is already running".to_string()));
        }
        config.validate()?;
        check_binding(
            "actuator",
            config.actuators.iter().map(String::as_str),
            self.actuators.iter().map(|a| a.name()),
        )?;
        check_binding(
            "detector",
            config.detectors.iter().map(|d| d.name.as_str()),
            self.detectors.iter().map(|d| d.name()),
        )?;

        for actuator in &self.actuators {
            if !actuator.is_initialized().await {
                return Err(DaqError::ModuleNotInitialized(actuator.name().to_string()));
            }
        }
        for detector in &self.detectors {
            if !detector.is_initialized().await {
                return Err(DaqError::ModuleNotInitialized(detector.name().to_string()));
            }
        }

        let generator = PositionGenerator::configure(
            config.topology.clone(),
            config.actuators.clone(),
            config.steps_limit,
        )?;
        let topology = generator.generate()?;
        Ok(ArmedScan {
            uid: Uuid::new_v4().to_string(),
            config,
            topology,
        })
    }

    /// Run the armed scan to a terminal state.
    ///
    /// Returns the summary when the scan completed or was stopped on request. Timeouts,
    /// assignment, hardware and persistence failures abort the scan and are returned as
    /// errors after the terminal state and the `ScanDone` event were published.
    pub async fn run(&mut self) -> DaqResult<ScanSummary> {
        let armed = self
            .armed
            .take()
            .ok_or_else(|| DaqError::Configuration("no scan is armed".to_string()))?;
        let span = tracing::info_span!("scan", uid = %armed.uid);
        self.execute(armed).instrument(span).await
    }

    async fn execute(&self, armed: ArmedScan) -> DaqResult<ScanSummary> {
        let ArmedScan {
            uid,
            config,
            topology,
        } = armed;
        let (sink, rx) = EventSink::channel();
        let mut scan = ActiveScan {
            saver: None,
            rx,
            _sink: sink.clone(),
            phase: Phase::Moving,
            committed: 0,
        };

        let mut outcome = match self.open(&mut scan, &uid, &config, &topology, sink).await {
            Ok(()) => {
                self.status(scan.saver.as_ref(), StatusLevel::Info, "Scan started");
                self.acquire(&mut scan, &config, &topology).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            if let DaqError::Timeout { pending, .. } = e {
                let _ = self.events.send(ScanEvent::Timeout {
                    phase: scan.phase,
                    pending: pending.clone(),
                });
            }
            self.status(
                scan.saver.as_ref(),
                StatusLevel::Error,
                format!("Scan aborted ({}): {}", e.category(), e),
            );
            self.halt_modules().await;
        } else if outcome.as_ref().is_ok_and(|state| *state == ScanState::Aborted) {
            self.status(scan.saver.as_ref(), StatusLevel::Warning, "Scan stopped");
        } else {
            self.status(scan.saver.as_ref(), StatusLevel::Info, "Scan done");
        }
        self.disconnect_modules().await;

        let terminal = match &outcome {
            Ok(state) => *state,
            Err(e) if e.is_timeout() => ScanState::TimedOut,
            Err(_) => ScanState::Aborted,
        };
        if let Some(saver) = scan.saver.as_mut() {
            if let Err(e) = saver.finish(terminal.as_status(), scan.committed) {
                error!(error = %e, "Could not close the scan group");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        let terminal = match &outcome {
            Ok(state) => *state,
            Err(e) if e.is_timeout() => ScanState::TimedOut,
            Err(_) => ScanState::Aborted,
        };

        let _ = self.events.send(ScanEvent::ScanDone {
            state: terminal,
            committed_steps: scan.committed,
        });
        self.set_state(terminal);
        info!(
            state = terminal.as_status(),
            committed_steps = scan.committed,
            "Scan finished"
        );

        outcome.map(|state| ScanSummary {
            uid,
            state,
            committed_steps: scan.committed,
            planned_steps: topology.len() * config.n_average,
            scan_path: scan.saver.as_ref().map(|s| s.scan_path().to_string()),
        })
    }

    async fn open(
        &self,
        scan: &mut ActiveScan,
        uid: &str,
        config: &ScanConfig,
        topology: &ScanTopology,
        sink: EventSink,
    ) -> DaqResult<()> {
        for actuator in &self.actuators {
            actuator
                .connect(sink.clone())
                .await
                .map_err(|e| hardware_error(actuator.name(), "connect", e))?;
        }
        for detector in &self.detectors {
            detector
                .connect(sink.clone())
                .await
                .map_err(|e| hardware_error(detector.name(), "connect", e))?;
        }

        if let Some(store) = &self.store {
            let layout = ScanLayout {
                uid,
                topology,
                n_average: config.n_average,
                settings: self.settings.clone(),
                scan_settings: serde_json::to_value(config)?,
                actuators: self
                    .actuators
                    .iter()
                    .map(|a| ModuleLayout {
                        name: a.name().to_string(),
                        settings: a.settings(),
                        channels: Vec::new(),
                    })
                    .collect(),
                detectors: self
                    .detectors
                    .iter()
                    .zip(&config.detectors)
                    .map(|(d, binding)| ModuleLayout {
                        name: d.name().to_string(),
                        settings: d.settings(),
                        channels: binding.channels.clone(),
                    })
                    .collect(),
                flush_on_commit: self.flush_on_commit,
            };
            scan.saver = Some(ScanSaver::begin(store.clone(), layout)?);
        }
        Ok(())
    }

    async fn acquire(
        &self,
        scan: &mut ActiveScan,
        config: &ScanConfig,
        topology: &ScanTopology,
    ) -> DaqResult<ScanState> {
        if topology.is_adaptive() {
            return self.acquire_adaptive(scan, config, topology).await;
        }

        let total = topology.len();
        for average in 0..config.n_average {
            for (step, position) in topology.positions().iter().enumerate() {
                if self.stop.is_requested() {
                    return Ok(ScanState::Aborted);
                }
                let mut index = topology.index_for(step, position)?;
                if config.n_average > 1 {
                    index.insert(0, average);
                }
                let step = Step {
                    step,
                    total,
                    average,
                    position,
                    index,
                };
                self.run_step(scan, config, step).await?;
            }
        }
        Ok(ScanState::Done)
    }

    async fn acquire_adaptive(
        &self,
        scan: &mut ActiveScan,
        config: &ScanConfig,
        topology: &ScanTopology,
    ) -> DaqResult<ScanState> {
        let params = topology
            .adaptive_params()
            .cloned()
            .ok_or_else(|| DaqError::Configuration("adaptive parameters missing".to_string()))?;
        let (probe_detector, probe_channel) = config.probe()?.ok_or_else(|| {
            DaqError::Configuration("adaptive scans need a probe channel".to_string())
        })?;

        let mut learner = AdaptiveLearner::new(params);
        let total = topology.len();
        let mut step = 0;
        while let Some(x) = learner.ask() {
            if self.stop.is_requested() {
                return Ok(ScanState::Aborted);
            }
            let position = ScanPosition::from_values(topology.actuators(), &[x]);
            let index = topology.index_for(step, &position)?;
            if let Some(saver) = scan.saver.as_mut() {
                saver.record_position(step, &position)?;
            }
            let current = Step {
                step,
                total,
                average: 0,
                position: &position,
                index,
            };
            let payloads = self.run_step(scan, config, current).await?;
            let y = payloads
                .get(probe_detector)
                .and_then(|p| p.channel(&probe_channel))
                .and_then(|c| c.data.as_scalar())
                .ok_or_else(|| {
                    DaqError::Instrument(format!(
                        "probe channel '{}' missing or not scalar",
                        probe_channel
                    ))
                })?;
            learner.tell(x, y);
            debug!(scan_index = step, x, y, loss = learner.loss(), "Adaptive point measured");
            step += 1;
        }
        Ok(ScanState::Done)
    }

    fn enter(&self, scan: &mut ActiveScan, phase: Phase) {
        scan.phase = phase;
        self.set_state(ScanState::Running(phase));
    }

    /// One Moving -> WaitMove -> Grabbing -> WaitGrab -> Committing cycle.
    ///
    /// A started step always runs to its commit. Stop requests are honored by the
    /// callers, before the next move is commanded.
    async fn run_step(
        &self,
        scan: &mut ActiveScan,
        config: &ScanConfig,
        step: Step<'_>,
    ) -> DaqResult<Vec<DetectorPayload>> {
        let _ = self.events.send(ScanEvent::ScanIndex {
            index: step.step,
            average: step.average,
        });
        debug!(scan_index = step.step, average = step.average, index = ?step.index, "Step started");

        self.enter(scan, Phase::Moving);
        discard_stale(scan);
        if step.position.len() != self.actuators.len() {
            return Err(DaqError::Assignment(format!(
                "position has {} coordinates for {} actuators",
                step.position.len(),
                self.actuators.len()
            )));
        }
        for (actuator, (name, target)) in self.actuators.iter().zip(step.position.iter()) {
            if actuator.name() != name {
                return Err(DaqError::Assignment(format!(
                    "coordinate for '{}' sent to actuator '{}'",
                    name,
                    actuator.name()
                )));
            }
            actuator
                .move_to(target)
                .await
                .map_err(|e| hardware_error(actuator.name(), "move", e))?;
        }

        self.enter(scan, Phase::WaitMove);
        let moved = PendingSet::new(self.actuators.iter().map(|a| a.name()));
        self.wait_phase(scan, Phase::WaitMove, moved, config.timing.actuator_timeout)
            .await?;

        if !config.timing.wait_time_between.is_zero() {
            sleep(config.timing.wait_time_between).await;
        }

        self.enter(scan, Phase::Grabbing);
        discard_stale(scan);
        for (k, detector) in self.detectors.iter().enumerate() {
            let hint = scan
                .saver
                .as_ref()
                .and_then(|saver| saver.detector_path(k))
                .map(|group_path| OutputHint {
                    group_path: group_path.to_string(),
                    index: step.index.clone(),
                });
            detector
                .grab(hint)
                .await
                .map_err(|e| hardware_error(detector.name(), "grab", e))?;
        }

        self.enter(scan, Phase::WaitGrab);
        let grabbed = PendingSet::new(self.detectors.iter().map(|d| d.name()));
        let mut reported: Vec<DetectorPayload> = self
            .wait_phase(scan, Phase::WaitGrab, grabbed, config.timing.detector_timeout)
            .await?
            .into_iter()
            .filter_map(|event| match event {
                HardwareEvent::DataReady(payload) => Some(payload),
                HardwareEvent::MoveDone { .. } => None,
            })
            .collect();
        let payloads = self
            .detectors
            .iter()
            .map(|detector| {
                let at = reported
                    .iter()
                    .position(|p| p.detector == detector.name())
                    .ok_or_else(|| {
                        DaqError::Assignment(format!("no data from '{}'", detector.name()))
                    })?;
                Ok(reported.swap_remove(at))
            })
            .collect::<DaqResult<Vec<_>>>()?;

        self.enter(scan, Phase::Committing);
        if let Some(saver) = scan.saver.as_mut() {
            saver.commit(&step.index, &payloads)?;
        }
        scan.committed += 1;
        let _ = self.events.send(ScanEvent::StepComplete(StepPreview {
            step: step.step,
            total: step.total,
            average: step.average,
            index: step.index,
            position: step.position.clone(),
            channels: preview_channels(&payloads),
        }));

        if !config.timing.wait_time.is_zero() {
            sleep(config.timing.wait_time).await;
        }
        Ok(payloads)
    }

    /// Wait until every module in `pending` reported, or `budget` runs out.
    async fn wait_phase(
        &self,
        scan: &mut ActiveScan,
        phase: Phase,
        mut pending: PendingSet,
        budget: Duration,
    ) -> DaqResult<Vec<HardwareEvent>> {
        let deadline = Instant::now() + budget;
        let mut received = Vec::new();
        let mut stop_seen = self.stop.is_requested();

        while !pending.is_empty() {
            tokio::select! {
                event = scan.rx.recv() => {
                    let Some(event) = event else {
                        return Err(DaqError::Instrument("hardware event channel closed".to_string()));
                    };
                    let (module, expected) = match &event {
                        HardwareEvent::MoveDone { actuator, .. } => {
                            (actuator.clone(), phase == Phase::WaitMove)
                        }
                        HardwareEvent::DataReady(payload) => {
                            (payload.detector.clone(), phase == Phase::WaitGrab)
                        }
                    };
                    if expected && pending.complete(&module) {
                        debug!(%phase, module = %module, remaining = pending.pending().len(), "Completion received");
                        received.push(event);
                    } else {
                        debug!(%phase, module = %module, "Ignoring unexpected completion");
                    }
                }
                _ = sleep_until(deadline) => {
                    return Err(DaqError::Timeout {
                        phase: phase.to_string(),
                        budget,
                        pending: pending.pending().to_vec(),
                    });
                }
                _ = self.stop.requested(), if !stop_seen => {
                    stop_seen = true;
                    self.status(
                        scan.saver.as_ref(),
                        StatusLevel::Warning,
                        format!("Stop requested during {}, finishing the phase", phase),
                    );
                }
            }
        }
        Ok(received)
    }

    async fn halt_modules(&self) {
        for actuator in &self.actuators {
            if let Err(e) = actuator.stop().await {
                warn!(actuator = %actuator.name(), error = %e, "Failed to stop actuator");
            }
        }
        for detector in &self.detectors {
            if let Err(e) = detector.stop().await {
                warn!(detector = %detector.name(), error = %e, "Failed to stop detector");
            }
        }
    }

    async fn disconnect_modules(&self) {
        for actuator in &self.actuators {
            if let Err(e) = actuator.disconnect().await {
                warn!(actuator = %actuator.name(), error = %e, "Failed to disconnect actuator");
            }
        }
        for detector in &self.detectors {
            if let Err(e) = detector.disconnect().await {
                warn!(detector = %detector.name(), error = %e, "Failed to disconnect detector");
            }
        }
    }
}

/// `(detector, channel)` pairs of a step, images reduced to their column sums.
fn preview_channels(payloads: &[DetectorPayload]) -> Vec<(String, Channel)> {
    payloads
        .iter()
        .flat_map(|payload| {
            payload
                .channels
                .iter()
                .map(move |channel| (payload.detector.clone(), reduce_for_preview(channel)))
        })
        .collect()
}

fn reduce_for_preview(channel: &Channel) -> Channel {
    match &channel.data {
        ChannelData::Image { width, pixels, .. } => {
            let mut sums = vec![0.0; *width];
            for row in pixels.chunks((*width).max(1)) {
                for (sum, value) in sums.iter_mut().zip(row) {
                    *sum += value;
                }
            }
            Channel::trace(channel.name.clone(), sums)
        }
        _ => channel.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorBinding, TimingConfig};
    use crate::hardware::mock::{MockActuator, MockChannelSpec, MockDetector};
    use crate::scan::{AxisRange, TopologyParams};
    use tracing_test::traced_test;

    fn linear_config(stop: f64) -> ScanConfig {
        ScanConfig::new(
            TopologyParams::Linear1D {
                axis: AxisRange::new(0.0, stop, 1.0),
            },
            vec!["x".into()],
            vec![DetectorBinding::new("pd", ["v"])],
        )
    }

    fn bench(
        detector: MockDetector,
    ) -> (Arc<MockActuator>, Arc<MockDetector>, AcquisitionCoordinator) {
        let stage = Arc::new(MockActuator::new("x"));
        let detector = Arc::new(detector.follow(&stage));
        let coordinator = AcquisitionCoordinator::new(
            vec![stage.clone() as Arc<dyn ActuatorHandle>],
            vec![detector.clone() as Arc<dyn DetectorHandle>],
        );
        (stage, detector, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_without_store_reaches_done() {
        let (stage, detector, mut coordinator) =
            bench(MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]));
        let mut events = coordinator.subscribe();
        coordinator.arm(linear_config(3.0)).await.unwrap();
        assert_eq!(coordinator.state(), ScanState::Armed);

        let summary = coordinator.run().await.unwrap();
        assert_eq!(summary.state, ScanState::Done);
        assert_eq!(summary.committed_steps, 4);
        assert_eq!(summary.scan_path, None);
        assert_eq!(stage.move_count(), 4);
        assert_eq!(detector.grab_count(), 4);
        assert_eq!(coordinator.state(), ScanState::Done);

        let mut previews = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ScanEvent::StepComplete(preview) = event {
                previews.push(preview.channels[0].1.data.as_scalar());
            }
        }
        assert_eq!(previews, vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_status_messages_are_logged() {
        let (_stage, _detector, mut coordinator) =
            bench(MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]));
        coordinator.arm(linear_config(1.0)).await.unwrap();
        coordinator.run().await.unwrap();
        assert!(logs_contain("Scan armed"));
        assert!(logs_contain("Scan started"));
        assert!(logs_contain("Scan done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_actuator_timeout_never_grabs() {
        let (stage, detector, mut coordinator) =
            bench(MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]));
        stage.set_never_completes(true);
        let timing = TimingConfig {
            actuator_timeout: Duration::from_millis(200),
            ..TimingConfig::default()
        };
        coordinator
            .arm(linear_config(3.0).with_timing(timing))
            .await
            .unwrap();

        let err = coordinator.run().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(coordinator.state(), ScanState::TimedOut);
        assert_eq!(detector.grab_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run_commits_nothing() {
        let (_stage, detector, mut coordinator) =
            bench(MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]));
        coordinator.arm(linear_config(3.0)).await.unwrap();
        coordinator.stop_handle().request_stop();

        let summary = coordinator.run().await.unwrap();
        assert_eq!(summary.state, ScanState::Aborted);
        assert_eq!(summary.committed_steps, 0);
        assert_eq!(detector.grab_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_move_still_commits_step() {
        let stage = Arc::new(MockActuator::new("x").with_speed(1.0));
        let detector = Arc::new(
            MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]).follow(&stage),
        );
        let mut coordinator = AcquisitionCoordinator::new(
            vec![stage.clone() as Arc<dyn ActuatorHandle>],
            vec![detector.clone() as Arc<dyn DetectorHandle>],
        );
        let config = ScanConfig::new(
            TopologyParams::Linear1D {
                axis: AxisRange::new(1.0, 3.0, 1.0),
            },
            vec!["x".into()],
            vec![DetectorBinding::new("pd", ["v"])],
        );
        coordinator.arm(config).await.unwrap();

        // the first move (0 -> 1) takes one second
        let stop = coordinator.stop_handle();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            stop.request_stop();
        });

        let summary = coordinator.run().await.unwrap();
        assert_eq!(summary.state, ScanState::Aborted);
        assert_eq!(summary.committed_steps, 1);
        assert_eq!(stage.move_count(), 1);
        assert_eq!(detector.grab_count(), 1);
    }

    /// Reports every grab twice, the copy arriving late.
    struct EchoDetector {
        sink: tokio::sync::RwLock<Option<EventSink>>,
        grabs: std::sync::atomic::AtomicUsize,
        echo_delay: Duration,
    }

    #[async_trait::async_trait]
    impl DetectorHandle for EchoDetector {
        fn name(&self) -> &str {
            "echo"
        }

        async fn is_initialized(&self) -> bool {
            true
        }

        async fn connect(&self, sink: EventSink) -> anyhow::Result<()> {
            *self.sink.write().await = Some(sink);
            Ok(())
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            self.sink.write().await.take();
            Ok(())
        }

        async fn grab(&self, _hint: Option<OutputHint>) -> anyhow::Result<()> {
            let sink = self
                .sink
                .read()
                .await
                .clone()
                .ok_or_else(|| anyhow::anyhow!("not connected"))?;
            let grab = self.grabs.fetch_add(1, Ordering::SeqCst) as f64;
            let payload = DetectorPayload::new("echo", vec![Channel::scalar("v", grab)]);
            sink.data_ready(payload.clone());
            let delay = self.echo_delay;
            tokio::spawn(async move {
                sleep(delay).await;
                sink.data_ready(payload);
            });
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_duplicate_completion_is_not_taken_for_next_step() {
        let stage = Arc::new(MockActuator::new("x"));
        let detector = Arc::new(EchoDetector {
            sink: tokio::sync::RwLock::new(None),
            grabs: std::sync::atomic::AtomicUsize::new(0),
            echo_delay: Duration::from_millis(10),
        });
        let mut coordinator = AcquisitionCoordinator::new(
            vec![stage as Arc<dyn ActuatorHandle>],
            vec![detector as Arc<dyn DetectorHandle>],
        );
        // the copy of each grab lands during the next step's pause before grabbing
        let timing = TimingConfig {
            wait_time_between: Duration::from_millis(50),
            ..TimingConfig::default()
        };
        let config = ScanConfig::new(
            TopologyParams::Linear1D {
                axis: AxisRange::new(0.0, 2.0, 1.0),
            },
            vec!["x".into()],
            vec![DetectorBinding::new("echo", ["v"])],
        )
        .with_timing(timing);
        let mut events = coordinator.subscribe();
        coordinator.arm(config).await.unwrap();
        coordinator.run().await.unwrap();

        let mut previews = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ScanEvent::StepComplete(preview) = event {
                previews.push(preview.channels[0].1.data.as_scalar());
            }
        }
        assert_eq!(previews, vec![Some(0.0), Some(1.0), Some(2.0)]);
    }

    #[tokio::test]
    async fn test_uninitialized_module_prevents_arming() {
        let (_stage, _detector, mut coordinator) = bench(
            MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]).uninitialized(),
        );
        let err = coordinator.arm(linear_config(3.0)).await.unwrap_err();
        assert!(matches!(err, DaqError::ModuleNotInitialized(ref name) if name == "pd"));
        assert_eq!(coordinator.state(), ScanState::Idle);
        assert!(coordinator.run().await.is_err());
    }

    #[tokio::test]
    async fn test_binding_mismatch_is_assignment_error() {
        let (_stage, _detector, mut coordinator) =
            bench(MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]));
        let mut config = linear_config(3.0);
        config.actuators = vec!["y".into()];
        let err = coordinator.arm(config).await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Assignment);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_scan_uses_probe() {
        let (_stage, detector, mut coordinator) =
            bench(MockDetector::new("pd", vec![MockChannelSpec::scalar("v")]));
        let config = ScanConfig::new(
            TopologyParams::Adaptive1D(crate::scan::AdaptiveParams {
                start: 0.0,
                stop: 1.0,
                loss: crate::scan::LossKind::Uniform,
                loss_goal: 0.3,
                max_steps: 20,
            }),
            vec!["x".into()],
            vec![DetectorBinding::new("pd", ["v"])],
        )
        .with_probe("pd/v");
        coordinator.arm(config).await.unwrap();
        let summary = coordinator.run().await.unwrap();
        assert_eq!(summary.state, ScanState::Done);
        // 0, 1, 0.5, 0.75, 0.25: every interval is then below 0.3
        assert_eq!(summary.committed_steps, 5);
        assert_eq!(detector.grab_count(), 5);
    }

    #[test]
    fn test_image_preview_is_column_sums() {
        let image = Channel::image("frame", 2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let reduced = reduce_for_preview(&image);
        assert_eq!(reduced.data.as_slice(), &[4.0, 6.0]);
        let scalar = Channel::scalar("v", 1.0);
        assert_eq!(reduce_for_preview(&scalar), scalar);
    }
}
