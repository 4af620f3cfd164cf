//! Scan topology: the ordered positions of a scan plus the metadata needed to map a
//! step back onto a multi-dimensional storage index.

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult};
use crate::scan::adaptive::AdaptiveParams;
use crate::scan::axis::nearest_index;

// =============================================================================
// Topology Kinds
// =============================================================================

/// Every scan topology the generator can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyKind {
    /// One axis, linear progression.
    #[serde(rename = "linear_1d")]
    Linear1D,
    /// One axis, linear values in shuffled order.
    #[serde(rename = "random_1d")]
    Random1D,
    /// One axis, union of ranges and isolated values.
    #[serde(rename = "sparse_1d")]
    Sparse1D,
    /// Two axes, raster with the second axis fastest.
    #[serde(rename = "linear_2d")]
    Linear2D,
    /// Two axes, raster reversing the fast axis on every other row.
    #[serde(rename = "back_and_forth_2d")]
    BackAndForth2D,
    /// Two axes, raster in shuffled order.
    #[serde(rename = "random_2d")]
    Random2D,
    /// Two axes, square spiral from the center outwards.
    #[serde(rename = "spiral_2d")]
    Spiral2D,
    /// N axes, cartesian product with the last axis fastest.
    #[serde(rename = "sequential")]
    Sequential,
    /// Explicit list of N-dimensional points.
    #[serde(rename = "tabular")]
    Tabular,
    /// Polyline through N-dimensional points, resampled at a fixed spacing.
    #[serde(rename = "tabular_sub_segmented")]
    TabularSubSegmented,
    /// One axis, positions chosen at run time from the measured signal.
    #[serde(rename = "adaptive_1d")]
    Adaptive1D,
}

impl TopologyKind {
    /// All kinds, in catalog order.
    pub fn all() -> &'static [TopologyKind] {
        &[
            TopologyKind::Linear1D,
            TopologyKind::Random1D,
            TopologyKind::Sparse1D,
            TopologyKind::Linear2D,
            TopologyKind::BackAndForth2D,
            TopologyKind::Random2D,
            TopologyKind::Spiral2D,
            TopologyKind::Sequential,
            TopologyKind::Tabular,
            TopologyKind::TabularSubSegmented,
            TopologyKind::Adaptive1D,
        ]
    }

    /// Configuration key of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyKind::Linear1D => "linear_1d",
            TopologyKind::Random1D => "random_1d",
            TopologyKind::Sparse1D => "sparse_1d",
            TopologyKind::Linear2D => "linear_2d",
            TopologyKind::BackAndForth2D => "back_and_forth_2d",
            TopologyKind::Random2D => "random_2d",
            TopologyKind::Spiral2D => "spiral_2d",
            TopologyKind::Sequential => "sequential",
            TopologyKind::Tabular => "tabular",
            TopologyKind::TabularSubSegmented => "tabular_sub_segmented",
            TopologyKind::Adaptive1D => "adaptive_1d",
        }
    }

    /// One-line human description.
    pub fn description(&self) -> &'static str {
        match self {
            TopologyKind::Linear1D => "Linear scan of one actuator from start to stop",
            TopologyKind::Random1D => "Linear values of one actuator visited in random order",
            TopologyKind::Sparse1D => {
                "Union of start:step:stop ranges and single values for one actuator"
            }
            TopologyKind::Linear2D => "Raster scan of two actuators, second one fastest",
            TopologyKind::BackAndForth2D => {
                "Raster scan of two actuators, fast axis reversed on every other row"
            }
            TopologyKind::Random2D => "Raster positions of two actuators in random order",
            TopologyKind::Spiral2D => "Square spiral of two actuators around a center",
            TopologyKind::Sequential => "Nested scan of N actuators, last one fastest",
            TopologyKind::Tabular => "Explicit list of positions for N actuators",
            TopologyKind::TabularSubSegmented => {
                "Polyline through N-dimensional points sampled at a fixed spacing"
            }
            TopologyKind::Adaptive1D => {
                "One actuator, next position chosen from the measured signal"
            }
        }
    }

    /// Number of actuators the kind requires, or `None` when it accepts any number.
    pub fn required_actuators(&self) -> Option<usize> {
        match self {
            TopologyKind::Linear1D
            | TopologyKind::Random1D
            | TopologyKind::Sparse1D
            | TopologyKind::Adaptive1D => Some(1),
            TopologyKind::Linear2D
            | TopologyKind::BackAndForth2D
            | TopologyKind::Random2D
            | TopologyKind::Spiral2D => Some(2),
            TopologyKind::Sequential
            | TopologyKind::Tabular
            | TopologyKind::TabularSubSegmented => None,
        }
    }

    /// Family name written in the `scan_type` attribute.
    pub fn scan_type(&self) -> &'static str {
        match self {
            TopologyKind::Linear1D | TopologyKind::Random1D | TopologyKind::Sparse1D => "Scan1D",
            TopologyKind::Linear2D
            | TopologyKind::BackAndForth2D
            | TopologyKind::Random2D
            | TopologyKind::Spiral2D => "Scan2D",
            TopologyKind::Sequential => "Sequential",
            TopologyKind::Tabular | TopologyKind::TabularSubSegmented => "Tabular",
            TopologyKind::Adaptive1D => "Adaptive",
        }
    }

    /// Variant name written in the `scan_subtype` attribute.
    pub fn scan_subtype(&self) -> &'static str {
        match self {
            TopologyKind::Linear1D
            | TopologyKind::Linear2D
            | TopologyKind::Sequential
            | TopologyKind::Tabular => "Linear",
            TopologyKind::Random1D | TopologyKind::Random2D => "Random",
            TopologyKind::Sparse1D => "Sparse",
            TopologyKind::BackAndForth2D => "LinearBackForth",
            TopologyKind::Spiral2D => "Spiral",
            TopologyKind::TabularSubSegmented => "SubSegmented",
            TopologyKind::Adaptive1D => "Adaptive",
        }
    }
}

impl std::fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How positions populate the navigation space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Positions lie on a rectilinear grid; storage is indexed per axis.
    Uniform,
    /// Positions are arbitrary; storage is indexed by emission order.
    Spread,
}

/// Rule mapping a (step, position) pair onto a storage index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexRule {
    /// Nearest match of each coordinate in the axis' unique sorted values.
    Grid,
    /// Step number along a single navigation dimension.
    Emission,
}

// =============================================================================
// Positions
// =============================================================================

/// One ordered `(actuator, value)` tuple per bound actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPosition {
    coordinates: Vec<(String, f64)>,
}

impl ScanPosition {
    /// Build a position from explicit pairs.
    pub fn new(coordinates: Vec<(String, f64)>) -> Self {
        Self { coordinates }
    }

    /// Zip actuator names with values.
    pub fn from_values(actuators: &[String], values: &[f64]) -> Self {
        Self {
            coordinates: actuators
                .iter()
                .cloned()
                .zip(values.iter().copied())
                .collect(),
        }
    }

    /// Number of coordinates.
    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    /// True when the position has no coordinate.
    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// Iterate over `(actuator, value)` pairs in binding order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.coordinates.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Values only, in binding order.
    pub fn values(&self) -> Vec<f64> {
        self.coordinates.iter().map(|(_, value)| *value).collect()
    }

    /// Value targeted for `actuator`, if present.
    pub fn value_of(&self, actuator: &str) -> Option<f64> {
        self.coordinates
            .iter()
            .find(|(name, _)| name == actuator)
            .map(|(_, value)| *value)
    }
}

// =============================================================================
// Topology
// =============================================================================

/// Result of [`PositionGenerator::generate`](crate::scan::PositionGenerator::generate).
///
/// Immutable once built. For the adaptive kind the position list is empty and positions
/// are produced during the scan by an [`AdaptiveLearner`](crate::scan::AdaptiveLearner).
#[derive(Debug, Clone)]
pub struct ScanTopology {
    kind: TopologyKind,
    actuators: Vec<String>,
    positions: Vec<ScanPosition>,
    axes_unique: Vec<Vec<f64>>,
    distribution: Distribution,
    shape: Vec<usize>,
    rule: IndexRule,
    adaptive: Option<AdaptiveParams>,
}

impl ScanTopology {
    pub(crate) fn grid(
        kind: TopologyKind,
        actuators: Vec<String>,
        positions: Vec<ScanPosition>,
        axes_unique: Vec<Vec<f64>>,
    ) -> Self {
        let shape = axes_unique.iter().map(Vec::len).collect();
        Self {
            kind,
            actuators,
            positions,
            axes_unique,
            distribution: Distribution::Uniform,
            shape,
            rule: IndexRule::Grid,
            adaptive: None,
        }
    }

    pub(crate) fn spread(
        kind: TopologyKind,
        actuators: Vec<String>,
        positions: Vec<ScanPosition>,
        axes_unique: Vec<Vec<f64>>,
        distribution: Distribution,
    ) -> Self {
        let shape = vec![positions.len()];
        Self {
            kind,
            actuators,
            positions,
            axes_unique,
            distribution,
            shape,
            rule: IndexRule::Emission,
            adaptive: None,
        }
    }

    pub(crate) fn adaptive(actuators: Vec<String>, params: AdaptiveParams) -> Self {
        Self {
            kind: TopologyKind::Adaptive1D,
            actuators,
            positions: Vec::new(),
            axes_unique: vec![Vec::new()],
            distribution: Distribution::Spread,
            shape: vec![params.max_steps],
            rule: IndexRule::Emission,
            adaptive: Some(params),
        }
    }

    /// Kind that produced this topology.
    pub fn kind(&self) -> TopologyKind {
        self.kind
    }

    /// Actuator names in binding order.
    pub fn actuators(&self) -> &[String] {
        &self.actuators
    }

    /// Ordered positions (empty for adaptive scans).
    pub fn positions(&self) -> &[ScanPosition] {
        &self.positions
    }

    /// Position of step `step`, if precomputed.
    pub fn position(&self, step: usize) -> Option<&ScanPosition> {
        self.positions.get(step)
    }

    /// Number of planned steps. For adaptive scans this is the step cap.
    pub fn len(&self) -> usize {
        match &self.adaptive {
            Some(params) => params.max_steps,
            None => self.positions.len(),
        }
    }

    /// True when no step is planned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted unique values of each axis.
    pub fn axes_unique(&self) -> &[Vec<f64>] {
        &self.axes_unique
    }

    /// Uniform or spread.
    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Navigation shape used to allocate storage (without the averaging dimension).
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// True when positions are produced during the scan.
    pub fn is_adaptive(&self) -> bool {
        self.adaptive.is_some()
    }

    /// Adaptive parameters, when this is an adaptive topology.
    pub fn adaptive_params(&self) -> Option<&AdaptiveParams> {
        self.adaptive.as_ref()
    }

    /// Storage index of step `step` located at `position`.
    ///
    /// The result always has as many entries as [`shape`](Self::shape). Grid topologies
    /// look every coordinate up in the axis' unique values, so a given position maps to the
    /// same cell regardless of the order in which positions were visited.
    pub fn index_for(&self, step: usize, position: &ScanPosition) -> DaqResult<Vec<usize>> {
        match self.rule {
            IndexRule::Emission => {
                let bound = self.shape.first().copied().unwrap_or(0);
                if step >= bound {
                    return Err(DaqError::Persistence(format!(
                        "step {} is outside the scan shape {:?}",
                        step, self.shape
                    )));
                }
                Ok(vec![step])
            }
            IndexRule::Grid => {
                if position.len() != self.axes_unique.len() {
                    return Err(DaqError::Assignment(format!(
                        "position has {} coordinates, topology has {} axes",
                        position.len(),
                        self.axes_unique.len()
                    )));
                }
                position
                    .iter()
                    .zip(self.actuators.iter().zip(&self.axes_unique))
                    .map(|((name, value), (expected, axis))| {
                        if name != expected {
                            return Err(DaqError::Assignment(format!(
                                "coordinate for '{}' found where '{}' was expected",
                                name, expected
                            )));
                        }
                        nearest_index(axis, value).ok_or_else(|| {
                            DaqError::Persistence(format!(
                                "value {} of '{}' cannot be placed on its axis",
                                value, name
                            ))
                        })
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_complete() {
        let kinds = TopologyKind::all();
        assert_eq!(kinds.len(), 11);
        for kind in kinds {
            assert!(!kind.description().is_empty());
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_grid_index_rejects_wrong_actuator() {
        let actuators = vec!["x".to_string(), "y".to_string()];
        let topology = ScanTopology::grid(
            TopologyKind::Linear2D,
            actuators,
            Vec::new(),
            vec![vec![0.0, 1.0], vec![0.0, 1.0]],
        );
        let swapped = ScanPosition::new(vec![("y".into(), 0.0), ("x".into(), 1.0)]);
        let err = topology.index_for(0, &swapped).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Assignment);

        let good = ScanPosition::new(vec![("x".into(), 1.0), ("y".into(), 0.0)]);
        assert_eq!(topology.index_for(3, &good).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_emission_index_is_bounded() {
        let actuators = vec!["x".to_string()];
        let positions = vec![
            ScanPosition::from_values(&actuators, &[1.0]),
            ScanPosition::from_values(&actuators, &[1.0]),
        ];
        let topology = ScanTopology::spread(
            TopologyKind::Sparse1D,
            actuators,
            positions.clone(),
            vec![vec![1.0]],
            Distribution::Uniform,
        );
        assert_eq!(topology.index_for(1, &positions[1]).unwrap(), vec![1]);
        assert!(topology.index_for(2, &positions[1]).is_err());
    }
}
