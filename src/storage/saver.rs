//! Scan layout inside a container.
//!
//! ```text
//! /Raw_datas/Scan000                 scan attributes, logger.jsonl
//!     scan_x_axis, scan_x_axis_unique   navigation axes (x, y, z, then a3, a4, ...)
//!     Move000                        {Move_name, type = "move", settings}
//!     Det000                         {Detector_name, type = "det", settings}
//!         Data0D/CH000               nav_shape
//!         Data1D/CH000               nav_shape + [len], CH000_axis_0 alongside
//!         Data2D/CH000               nav_shape + [height, width]
//! ```
//!
//! Channel arrays are allocated the first time a channel reports, because hardware only
//! tells its data shape when data arrives. The shape is then fixed for the scan.

use chrono::Utc;
use serde_json::{json, Value};

use crate::data::{Channel, DetectorPayload};
use crate::error::{DaqError, DaqResult};
use crate::scan::{ScanPosition, ScanTopology, TopologyKind};
use crate::storage::{Attributes, Group, PersistedArray, ScanStore};

/// Name and settings of one bound module, with its declared channel order for detectors.
#[derive(Debug, Clone)]
pub struct ModuleLayout {
    /// Bound name.
    pub name: String,
    /// Settings persisted in the module group.
    pub settings: Value,
    /// Declared channel order (detectors only).
    pub channels: Vec<String>,
}

/// Everything needed to lay out a new scan group.
#[derive(Debug, Clone)]
pub struct ScanLayout<'a> {
    /// Scan identifier.
    pub uid: &'a str,
    /// Generated topology.
    pub topology: &'a ScanTopology,
    /// Number of passes over the positions.
    pub n_average: usize,
    /// Full application settings.
    pub settings: Value,
    /// Immutable scan configuration snapshot.
    pub scan_settings: Value,
    /// Actuators, in binding order.
    pub actuators: Vec<ModuleLayout>,
    /// Detectors, in binding order.
    pub detectors: Vec<ModuleLayout>,
    /// Flush every array after each commit.
    pub flush_on_commit: bool,
}

/// Navigation axis name of actuator `k`.
pub fn axis_label(k: usize) -> String {
    match k {
        0 => "x".to_string(),
        1 => "y".to_string(),
        2 => "z".to_string(),
        _ => format!("a{}", k),
    }
}

struct ChannelSlot {
    name: String,
    path: String,
    intrinsic: Vec<usize>,
    array: PersistedArray,
}

struct DetectorSlot {
    name: String,
    group: Group,
    declared: Vec<String>,
    channels: Vec<ChannelSlot>,
    next_number: [usize; 3],
}

/// Writes one scan into a container.
pub struct ScanSaver {
    store: ScanStore,
    scan: Group,
    kind: TopologyKind,
    nav_shape: Vec<usize>,
    detectors: Vec<DetectorSlot>,
    adaptive_axis: Option<PersistedArray>,
    flush_on_commit: bool,
}

impl std::fmt::Debug for ScanSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSaver")
            .field("scan", &self.scan.path())
            .field("nav_shape", &self.nav_shape)
            .finish()
    }
}

fn attrs_of(pairs: Vec<(&str, Value)>) -> Attributes {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

impl ScanSaver {
    /// Create the next `Scan{NNN}` group and its static content.
    pub fn begin(store: ScanStore, layout: ScanLayout<'_>) -> DaqResult<Self> {
        let topology = layout.topology;
        let raw = store.ensure_group("/Raw_datas")?;
        let scan_name = store.next_scan_name(&raw)?;
        let scan = store.ensure_group(&raw.child_path(&scan_name))?;

        let mut nav_shape = Vec::with_capacity(topology.shape().len() + 1);
        if layout.n_average > 1 {
            nav_shape.push(layout.n_average);
        }
        nav_shape.extend_from_slice(topology.shape());

        let kind = topology.kind();
        scan.set_attrs(attrs_of(vec![
            ("scan_type", json!(kind.scan_type())),
            ("scan_subtype", json!(kind.scan_subtype())),
            ("uid", json!(layout.uid)),
            ("settings", layout.settings),
            ("scan_settings", layout.scan_settings),
            ("start_time", json!(Utc::now().to_rfc3339())),
            ("status", json!("running")),
            ("n_average", json!(layout.n_average)),
            ("shape", json!(nav_shape)),
            ("distribution", json!(topology.distribution())),
            ("committed_steps", json!(0)),
        ]))?;

        let mut adaptive_axis = None;
        for (k, actuator) in layout.actuators.iter().enumerate() {
            let label = axis_label(k);
            let axis_attrs = || {
                attrs_of(vec![
                    ("label", json!(actuator.name)),
                    ("units", json!("")),
                    ("axis", json!(k)),
                    ("data_type", json!("navigation")),
                ])
            };
            let name = format!("scan_{}_axis", label);
            if topology.is_adaptive() {
                adaptive_axis = Some(store.allocate_channel_array(
                    &scan,
                    &name,
                    topology.shape(),
                    axis_attrs(),
                )?);
                continue;
            }
            let values: Vec<f64> = topology
                .positions()
                .iter()
                .map(|p| p.values().get(k).copied().unwrap_or(f64::NAN))
                .collect();
            let mut axis =
                store.allocate_channel_array(&scan, &name, &[values.len()], axis_attrs())?;
            axis.write_at(&[], &values)?;

            let unique = topology.axes_unique().get(k).cloned().unwrap_or_default();
            let mut unique_axis = store.allocate_channel_array(
                &scan,
                &format!("{}_unique", name),
                &[unique.len()],
                axis_attrs(),
            )?;
            unique_axis.write_at(&[], &unique)?;
        }

        for (k, actuator) in layout.actuators.iter().enumerate() {
            let group = store.ensure_group(&scan.child_path(&format!("Move{:03}", k)))?;
            group.set_attrs(attrs_of(vec![
                ("Move_name", json!(actuator.name)),
                ("type", json!("move")),
                ("settings", actuator.settings.clone()),
            ]))?;
        }

        let mut detectors = Vec::with_capacity(layout.detectors.len());
        for (k, detector) in layout.detectors.into_iter().enumerate() {
            let group = store.ensure_group(&scan.child_path(&format!("Det{:03}", k)))?;
            group.set_attrs(attrs_of(vec![
                ("Detector_name", json!(detector.name)),
                ("type", json!("det")),
                ("settings", detector.settings),
                ("channels", json!(detector.channels)),
            ]))?;
            detectors.push(DetectorSlot {
                name: detector.name,
                group,
                declared: detector.channels,
                channels: Vec::new(),
                next_number: [0; 3],
            });
        }

        tracing::info!(scan = %scan.path(), shape = ?nav_shape, "Scan group created");
        Ok(Self {
            store,
            scan,
            kind,
            nav_shape,
            detectors,
            adaptive_axis,
            flush_on_commit: layout.flush_on_commit,
        })
    }

    /// Container path of the scan group.
    pub fn scan_path(&self) -> &str {
        self.scan.path()
    }

    /// The scan group.
    pub fn scan_group(&self) -> &Group {
        &self.scan
    }

    /// Container path of the `k`-th detector group.
    pub fn detector_path(&self, k: usize) -> Option<&str> {
        self.detectors.get(k).map(|d| d.group.path())
    }

    /// Navigation shape, including the averaging dimension.
    pub fn nav_shape(&self) -> &[usize] {
        &self.nav_shape
    }

    /// `(detector, channel, array path)` for every allocated channel.
    pub fn channel_paths(&self) -> Vec<(String, String, String)> {
        self.detectors
            .iter()
            .flat_map(|d| {
                d.channels
                    .iter()
                    .map(|c| (d.name.clone(), c.name.clone(), c.path.clone()))
            })
            .collect()
    }

    /// Write the merged payloads of one step at `index`.
    ///
    /// `payloads` must follow the detector binding order. Writing an index again replaces
    /// its previous content.
    pub fn commit(&mut self, index: &[usize], payloads: &[DetectorPayload]) -> DaqResult<()> {
        if index.len() != self.nav_shape.len() {
            return Err(DaqError::Persistence(format!(
                "index {:?} does not match navigation shape {:?}",
                index, self.nav_shape
            )));
        }
        if payloads.len() != self.detectors.len() {
            return Err(DaqError::Assignment(format!(
                "{} payloads for {} detectors",
                payloads.len(),
                self.detectors.len()
            )));
        }
        if index.iter().zip(&self.nav_shape).any(|(i, dim)| i >= dim) {
            return Err(DaqError::Persistence(format!(
                "index {:?} is out of bounds for navigation shape {:?}",
                index, self.nav_shape
            )));
        }

        // Every payload is checked and every new array allocated before the first cell
        // is written, so a rejected step leaves no partial data at `index`.
        let mut planned: Vec<(usize, usize, &Channel)> = Vec::new();
        for (d, (slot, payload)) in self.detectors.iter().zip(payloads).enumerate() {
            if slot.name != payload.detector {
                return Err(DaqError::Assignment(format!(
                    "payload of '{}' found where '{}' was expected",
                    payload.detector, slot.name
                )));
            }
            let mut ordered: Vec<(usize, usize, &Channel)> = payload
                .channels
                .iter()
                .enumerate()
                .map(|(seen, channel)| {
                    let declared = slot
                        .declared
                        .iter()
                        .position(|name| *name == channel.name)
                        .unwrap_or(usize::MAX);
                    (declared, seen, channel)
                })
                .collect();
            ordered.sort_by_key(|(declared, seen, _)| (*declared, *seen));

            let first = planned.len();
            for (_, _, channel) in ordered {
                let earlier = planned[first..]
                    .iter()
                    .map(|(_, _, c)| *c)
                    .find(|c| c.name == channel.name);
                check_channel(slot, earlier, channel)?;
                planned.push((d, 0, channel));
            }
        }
        for (d, position, channel) in planned.iter_mut() {
            *position = ensure_channel(
                &self.store,
                &mut self.detectors[*d],
                self.kind,
                &self.nav_shape,
                *channel,
            )?;
        }
        for (d, position, channel) in planned {
            let target = &mut self.detectors[d].channels[position];
            ScanStore::write_at(&mut target.array, index, channel.data.as_slice())?;
        }

        if self.flush_on_commit {
            self.flush()?;
        }
        Ok(())
    }

    /// Record the position visited at `step` of an adaptive scan.
    pub fn record_position(&mut self, step: usize, position: &ScanPosition) -> DaqResult<()> {
        if let Some(axis) = self.adaptive_axis.as_mut() {
            let value = position.values().first().copied().unwrap_or(f64::NAN);
            axis.write_at(&[step], &[value])?;
        }
        Ok(())
    }

    /// Append a status message to the scan log.
    pub fn log(&self, level: &str, text: &str) -> DaqResult<()> {
        self.scan.append_log(level, text)
    }

    fn flush(&self) -> DaqResult<()> {
        for detector in &self.detectors {
            for channel in &detector.channels {
                channel.array.flush()?;
            }
        }
        if let Some(axis) = &self.adaptive_axis {
            axis.flush()?;
        }
        Ok(())
    }

    /// Record the final status and flush everything.
    pub fn finish(&mut self, status: &str, committed_steps: usize) -> DaqResult<()> {
        self.flush()?;
        self.scan.set_attrs(attrs_of(vec![
            ("stop_time", json!(Utc::now().to_rfc3339())),
            ("status", json!(status)),
            ("committed_steps", json!(committed_steps)),
        ]))?;
        tracing::info!(scan = %self.scan.path(), status, committed_steps, "Scan group closed");
        Ok(())
    }
}

/// Reject a channel whose data cannot be stored in its (existing or pending) array.
fn check_channel(
    slot: &DetectorSlot,
    earlier: Option<&Channel>,
    channel: &Channel,
) -> DaqResult<()> {
    if !channel.data.is_consistent() {
        return Err(DaqError::Persistence(format!(
            "channel '{}' of '{}' has {} samples for shape {:?}",
            channel.name,
            slot.name,
            channel.data.as_slice().len(),
            channel.data.shape()
        )));
    }
    let intrinsic = channel.data.shape();
    let fixed = slot
        .channels
        .iter()
        .find(|c| c.name == channel.name)
        .map(|c| c.intrinsic.clone())
        .or_else(|| earlier.map(|c| c.data.shape()));
    match fixed {
        Some(fixed) if fixed != intrinsic => Err(DaqError::Persistence(format!(
            "channel '{}' of '{}' changed shape from {:?} to {:?}",
            channel.name, slot.name, fixed, intrinsic
        ))),
        _ => Ok(()),
    }
}

/// Position of the channel's array in `slot`, allocating it on first use.
fn ensure_channel(
    store: &ScanStore,
    slot: &mut DetectorSlot,
    kind: TopologyKind,
    nav_shape: &[usize],
    channel: &Channel,
) -> DaqResult<usize> {
    if let Some(position) = slot.channels.iter().position(|c| c.name == channel.name) {
        return Ok(position);
    }

    let intrinsic = channel.data.shape();
    let data_type = channel.data.data_type();
    let ndim = channel.data.ndim();
    let group = store.ensure_group(&slot.group.child_path(data_type))?;
    let array_name = format!("CH{:03}", slot.next_number[ndim]);
    slot.next_number[ndim] += 1;

    let mut shape = nav_shape.to_vec();
    shape.extend_from_slice(&intrinsic);
    let attrs = attrs_of(vec![
        ("scan_type", json!(kind.scan_type())),
        ("data_type", json!(data_type)),
        ("data_name", json!(channel.name)),
        ("detector", json!(slot.name)),
        ("shape", json!(shape)),
        ("nav_shape", json!(nav_shape)),
    ]);
    let array = store.allocate_channel_array(&group, &array_name, &shape, attrs)?;

    for axis in &channel.axes {
        let axis_name = format!("{}_axis_{}", array_name, axis.index);
        let axis_attrs = attrs_of(vec![
            ("label", json!(axis.label)),
            ("units", json!(axis.units)),
            ("index", json!(axis.index)),
            ("data_type", json!("axis")),
        ]);
        let mut axis_array =
            store.allocate_channel_array(&group, &axis_name, &[axis.data.len()], axis_attrs)?;
        axis_array.write_at(&[], &axis.data)?;
    }

    tracing::debug!(
        detector = %slot.name,
        channel = %channel.name,
        array = %group.child_path(&array_name),
        "Channel allocated"
    );
    slot.channels.push(ChannelSlot {
        name: channel.name.clone(),
        path: group.child_path(&array_name),
        intrinsic,
        array,
    });
    Ok(slot.channels.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{AxisRange, PositionGenerator, TopologyParams};
    use tempfile::tempdir;

    fn layout<'a>(topology: &'a ScanTopology, n_average: usize) -> ScanLayout<'a> {
        ScanLayout {
            uid: "test-uid",
            topology,
            n_average,
            settings: json!({}),
            scan_settings: json!({"n_average": n_average}),
            actuators: vec![ModuleLayout {
                name: "stage".into(),
                settings: json!({"speed": 1.0}),
                channels: Vec::new(),
            }],
            detectors: vec![ModuleLayout {
                name: "cam".into(),
                settings: json!({}),
                channels: vec!["sum".into(), "profile".into()],
            }],
            flush_on_commit: true,
        }
    }

    fn linear(n: f64) -> ScanTopology {
        PositionGenerator::configure(
            TopologyParams::Linear1D {
                axis: AxisRange::new(0.0, n - 1.0, 1.0),
            },
            vec!["stage".into()],
            1000,
        )
        .unwrap()
        .generate()
        .unwrap()
    }

    #[test]
    fn test_layout_and_declared_channel_order() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let topology = linear(3.0);
        let mut saver = ScanSaver::begin(store.clone(), layout(&topology, 1)).unwrap();
        assert_eq!(saver.scan_path(), "/Raw_datas/Scan000");

        // reported in reverse, with an undeclared channel first
        let payload = DetectorPayload::new(
            "cam",
            vec![
                Channel::scalar("extra", 9.0),
                Channel::trace("profile", vec![1.0, 2.0]),
                Channel::scalar("sum", 5.0),
            ],
        );
        saver.commit(&[1], &[payload]).unwrap();

        let paths = saver.channel_paths();
        assert_eq!(paths[0].1, "sum");
        assert_eq!(paths[0].2, "/Raw_datas/Scan000/Det000/Data0D/CH000");
        assert_eq!(paths[1].2, "/Raw_datas/Scan000/Det000/Data1D/CH000");
        assert_eq!(paths[2].1, "extra");
        assert_eq!(paths[2].2, "/Raw_datas/Scan000/Det000/Data0D/CH001");

        let sum = store.open_array(&paths[0].2).unwrap();
        assert_eq!(sum.to_vec().unwrap(), vec![0.0, 5.0, 0.0]);
        let profile = store.open_array(&paths[1].2).unwrap();
        assert_eq!(profile.shape(), &[3, 2]);
        let attrs = store.array_attrs(&paths[1].2).unwrap();
        assert_eq!(attrs["data_type"], "Data1D");
        assert_eq!(attrs["data_name"], "profile");
        assert_eq!(attrs["scan_type"], "Scan1D");

        let axis = store.open_array("/Raw_datas/Scan000/scan_x_axis").unwrap();
        assert_eq!(axis.to_vec().unwrap(), vec![0.0, 1.0, 2.0]);
        let mover = store.group("/Raw_datas/Scan000/Move000").unwrap();
        assert_eq!(mover.attr("type").unwrap(), Some(json!("move")));
        assert_eq!(mover.attr("Move_name").unwrap(), Some(json!("stage")));
    }

    #[test]
    fn test_shape_change_is_persistence_error() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let topology = linear(2.0);
        let mut saver = ScanSaver::begin(store, layout(&topology, 1)).unwrap();
        let first = DetectorPayload::new("cam", vec![Channel::trace("profile", vec![1.0])]);
        saver.commit(&[0], &[first]).unwrap();
        let second = DetectorPayload::new("cam", vec![Channel::trace("profile", vec![1.0, 2.0])]);
        let err = saver.commit(&[1], &[second]).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Persistence);
    }

    #[test]
    fn test_rejected_step_leaves_index_untouched() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let topology = linear(3.0);
        let mut saver = ScanSaver::begin(store.clone(), layout(&topology, 1)).unwrap();
        let first = DetectorPayload::new(
            "cam",
            vec![
                Channel::scalar("sum", 1.0),
                Channel::trace("profile", vec![1.0]),
            ],
        );
        saver.commit(&[0], &[first]).unwrap();

        // "sum" sorts before "profile" and would have been written first
        let second = DetectorPayload::new(
            "cam",
            vec![
                Channel::scalar("sum", 42.0),
                Channel::trace("profile", vec![1.0, 2.0]),
            ],
        );
        let err = saver.commit(&[1], &[second]).unwrap_err();
        assert!(err.to_string().contains("changed shape"));

        let sum = store
            .open_array("/Raw_datas/Scan000/Det000/Data0D/CH000")
            .unwrap();
        assert_eq!(sum.to_vec().unwrap(), vec![1.0, 0.0, 0.0]);
        let profile = store
            .open_array("/Raw_datas/Scan000/Det000/Data1D/CH000")
            .unwrap();
        assert_eq!(profile.to_vec().unwrap(), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_out_of_bounds_index_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let topology = linear(2.0);
        let mut saver = ScanSaver::begin(store, layout(&topology, 1)).unwrap();
        let payload = DetectorPayload::new("cam", vec![Channel::scalar("sum", 3.0)]);
        assert!(saver.commit(&[2], &[payload]).is_err());
        assert!(saver.channel_paths().is_empty());
    }

    #[test]
    fn test_averaging_adds_leading_dimension() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let topology = linear(2.0);
        let mut saver = ScanSaver::begin(store.clone(), layout(&topology, 3)).unwrap();
        assert_eq!(saver.nav_shape(), &[3, 2]);
        let payload = DetectorPayload::new("cam", vec![Channel::scalar("sum", 7.0)]);
        saver.commit(&[2, 1], &[payload.clone()]).unwrap();
        assert!(saver.commit(&[1], &[payload]).is_err());

        let sum = store
            .open_array("/Raw_datas/Scan000/Det000/Data0D/CH000")
            .unwrap();
        assert_eq!(sum.to_vec().unwrap(), vec![0.0, 0.0, 0.0, 0.0, 0.0, 7.0]);
    }

    #[test]
    fn test_reopen_appends_next_scan() {
        let dir = tempdir().unwrap();
        let topology = linear(2.0);
        {
            let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
            let mut saver = ScanSaver::begin(store, layout(&topology, 1)).unwrap();
            saver.finish("done", 0).unwrap();
        }
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let saver = ScanSaver::begin(store.clone(), layout(&topology, 1)).unwrap();
        assert_eq!(saver.scan_path(), "/Raw_datas/Scan001");
        let first = store.group("/Raw_datas/Scan000").unwrap();
        assert_eq!(first.attr("status").unwrap(), Some(json!("done")));
    }
}
