//! Position generation.
//!
//! A [`PositionGenerator`] turns a declarative [`TopologyParams`] description into the
//! ordered list of positions a scan visits, plus the information needed to place every
//! step in the multi-dimensional storage arrays. Generation is pure computation: no I/O
//! and no hardware.
//!
//! ```rust,ignore
//! let generator = PositionGenerator::configure(
//!     TopologyParams::Linear1D { axis: AxisRange::new(0.0, 10.0, 2.0) },
//!     vec!["stage_x".into()],
//!     10_000,
//! )?;
//! assert_eq!(generator.evaluate_steps(), 6);
//! let topology = generator.generate()?;
//! ```

pub mod adaptive;
pub mod axis;
mod grid;
mod linear;
mod sequential;
mod tabular;
pub mod topology;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{DaqError, DaqResult};

pub use adaptive::{AdaptiveLearner, AdaptiveParams, LossKind};
pub use axis::AxisRange;
pub use linear::parse_sparse;
pub use topology::{Distribution, ScanPosition, ScanTopology, TopologyKind};

/// Declarative description of a scan topology, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TopologyParams {
    /// Linear progression of one actuator.
    #[serde(rename = "linear_1d")]
    Linear1D {
        /// Axis range.
        axis: AxisRange,
    },
    /// Linear values of one actuator in shuffled order.
    #[serde(rename = "random_1d")]
    Random1D {
        /// Axis range.
        axis: AxisRange,
        /// Optional seed making the shuffle reproducible.
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Union of ranges and isolated values of one actuator.
    #[serde(rename = "sparse_1d")]
    Sparse1D {
        /// Range list, e.g. `"0:0.5:5, 7, 10:1:12"`.
        expression: String,
    },
    /// Raster of two actuators.
    #[serde(rename = "linear_2d")]
    Linear2D {
        /// Slow axis then fast axis.
        axes: [AxisRange; 2],
    },
    /// Raster of two actuators, reversing the fast axis on odd rows.
    #[serde(rename = "back_and_forth_2d")]
    BackAndForth2D {
        /// Slow axis then fast axis.
        axes: [AxisRange; 2],
    },
    /// Raster of two actuators in shuffled order.
    #[serde(rename = "random_2d")]
    Random2D {
        /// Slow axis then fast axis.
        axes: [AxisRange; 2],
        /// Optional seed making the shuffle reproducible.
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Square spiral of two actuators.
    #[serde(rename = "spiral_2d")]
    Spiral2D {
        /// Center of the spiral.
        center: [f64; 2],
        /// Maximum excursion from the center on each axis.
        rmax: [f64; 2],
        /// Ring spacing on each axis.
        rstep: [f64; 2],
    },
    /// Cartesian product of N actuators, last one fastest.
    #[serde(rename = "sequential")]
    Sequential {
        /// One range per actuator, in binding order.
        axes: Vec<AxisRange>,
    },
    /// Explicit positions.
    #[serde(rename = "tabular")]
    Tabular {
        /// One row per step, one column per actuator.
        rows: Vec<Vec<f64>>,
    },
    /// Polyline through explicit vertices, resampled every `spacing`.
    #[serde(rename = "tabular_sub_segmented")]
    TabularSubSegmented {
        /// Polyline vertices, one column per actuator.
        points: Vec<Vec<f64>>,
        /// Distance between samples along the polyline.
        spacing: f64,
    },
    /// Loss-guided sampling of one actuator.
    #[serde(rename = "adaptive_1d")]
    Adaptive1D(AdaptiveParams),
}

impl TopologyParams {
    /// Kind described by these parameters.
    pub fn kind(&self) -> TopologyKind {
        match self {
            TopologyParams::Linear1D { .. } => TopologyKind::Linear1D,
            TopologyParams::Random1D { .. } => TopologyKind::Random1D,
            TopologyParams::Sparse1D { .. } => TopologyKind::Sparse1D,
            TopologyParams::Linear2D { .. } => TopologyKind::Linear2D,
            TopologyParams::BackAndForth2D { .. } => TopologyKind::BackAndForth2D,
            TopologyParams::Random2D { .. } => TopologyKind::Random2D,
            TopologyParams::Spiral2D { .. } => TopologyKind::Spiral2D,
            TopologyParams::Sequential { .. } => TopologyKind::Sequential,
            TopologyParams::Tabular { .. } => TopologyKind::Tabular,
            TopologyParams::TabularSubSegmented { .. } => TopologyKind::TabularSubSegmented,
            TopologyParams::Adaptive1D(_) => TopologyKind::Adaptive1D,
        }
    }

    /// Check the parameters against the bound actuators and return the step count.
    fn validate(&self, actuators: &[String]) -> DaqResult<usize> {
        let kind = self.kind();
        if let Some(required) = kind.required_actuators() {
            if actuators.len() != required {
                return Err(DaqError::Configuration(format!(
                    "topology '{}' needs {} actuator(s), got {}",
                    kind,
                    required,
                    actuators.len()
                )));
            }
        }
        let width = actuators.len();
        let non_finite = || {
            DaqError::Configuration(format!("topology '{}' has a non-finite parameter", kind))
        };

        match self {
            TopologyParams::Linear1D { axis } | TopologyParams::Random1D { axis, .. } => {
                if !axis.is_finite() {
                    return Err(non_finite());
                }
                Ok(axis.count())
            }
            TopologyParams::Sparse1D { expression } => linear::sparse_count(expression),
            TopologyParams::Linear2D { axes }
            | TopologyParams::BackAndForth2D { axes }
            | TopologyParams::Random2D { axes, .. } => {
                if !axes.iter().all(AxisRange::is_finite) {
                    return Err(non_finite());
                }
                Ok(grid::raster_count(axes))
            }
            TopologyParams::Spiral2D {
                center,
                rmax,
                rstep,
            } => {
                if !center.iter().chain(rmax).chain(rstep).all(|v| v.is_finite()) {
                    return Err(non_finite());
                }
                Ok(grid::spiral_count(grid::spiral_rings(rmax, rstep)?))
            }
            TopologyParams::Sequential { axes } => {
                if axes.len() != width {
                    return Err(DaqError::Configuration(format!(
                        "sequential scan has {} axes for {} actuators",
                        axes.len(),
                        width
                    )));
                }
                if !axes.iter().all(AxisRange::is_finite) {
                    return Err(non_finite());
                }
                Ok(sequential::sequential_count(axes))
            }
            TopologyParams::Tabular { rows } => {
                check_rows(kind, rows, width)?;
                Ok(rows.len())
            }
            TopologyParams::TabularSubSegmented { points, spacing } => {
                check_rows(kind, points, width)?;
                if !(spacing.is_finite() && *spacing > 0.0) {
                    return Err(DaqError::Configuration(format!(
                        "sub-segment spacing must be positive, got {}",
                        spacing
                    )));
                }
                Ok(tabular::sub_segmented_count(points, *spacing))
            }
            TopologyParams::Adaptive1D(params) => {
                if !(params.start.is_finite() && params.stop.is_finite()) {
                    return Err(non_finite());
                }
                if params.start == params.stop {
                    return Err(DaqError::Configuration(
                        "adaptive scan needs distinct start and stop".to_string(),
                    ));
                }
                if !(params.loss_goal.is_finite() && params.loss_goal > 0.0) {
                    return Err(DaqError::Configuration(format!(
                        "adaptive loss goal must be positive, got {}",
                        params.loss_goal
                    )));
                }
                if params.max_steps < 2 {
                    return Err(DaqError::Configuration(
                        "adaptive scan needs at least 2 steps".to_string(),
                    ));
                }
                Ok(params.max_steps)
            }
        }
    }
}

fn check_rows(kind: TopologyKind, rows: &[Vec<f64>], width: usize) -> DaqResult<()> {
    if rows.is_empty() {
        return Err(DaqError::Configuration(format!(
            "topology '{}' needs at least one row",
            kind
        )));
    }
    for (i, row) in rows.iter().enumerate() {
        if row.len() != width {
            return Err(DaqError::Configuration(format!(
                "row {} has {} values for {} actuators",
                i,
                row.len(),
                width
            )));
        }
        if !row.iter().all(|v| v.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "row {} has a non-finite value",
                i
            )));
        }
    }
    Ok(())
}

/// In-place Fisher-Yates shuffle, reproducible when seeded.
pub(crate) fn shuffle(positions: &mut [ScanPosition], seed: Option<u64>) {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    positions.shuffle(&mut rng);
}

// =============================================================================
// PositionGenerator
// =============================================================================

/// Validated topology bound to an ordered actuator list.
#[derive(Debug, Clone)]
pub struct PositionGenerator {
    params: TopologyParams,
    actuators: Vec<String>,
    steps: usize,
}

impl PositionGenerator {
    /// Validate `params` for `actuators` and reject scans above `steps_limit`.
    ///
    /// Degenerate axes are not an error: they collapse to their start value.
    pub fn configure(
        params: TopologyParams,
        actuators: Vec<String>,
        steps_limit: usize,
    ) -> DaqResult<Self> {
        if actuators.is_empty() {
            return Err(DaqError::Configuration(
                "a scan needs at least one actuator".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for name in &actuators {
            if name.is_empty() || !seen.insert(name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "actuator names must be unique and non-empty, got {:?}",
                    actuators
                )));
            }
        }

        let steps = params.validate(&actuators)?;
        if steps > steps_limit {
            return Err(DaqError::ScanTooLarge {
                steps,
                limit: steps_limit,
            });
        }
        Ok(Self {
            params,
            actuators,
            steps,
        })
    }

    /// Configured topology kind.
    pub fn kind(&self) -> TopologyKind {
        self.params.kind()
    }

    /// Bound actuators, in order.
    pub fn actuators(&self) -> &[String] {
        &self.actuators
    }

    /// Parameters this generator was configured with.
    pub fn params(&self) -> &TopologyParams {
        &self.params
    }

    /// Step count, computed without materializing positions.
    ///
    /// Equal to the number of generated positions for every non-adaptive kind; for the
    /// adaptive kind it is the step cap.
    pub fn evaluate_steps(&self) -> usize {
        self.steps
    }

    /// Materialize the topology.
    pub fn generate(&self) -> DaqResult<ScanTopology> {
        let actuators = self.actuators.clone();
        let topology = match &self.params {
            TopologyParams::Linear1D { axis } => linear::linear(actuators, axis),
            TopologyParams::Random1D { axis, seed } => linear::random(actuators, axis, *seed),
            TopologyParams::Sparse1D { expression } => linear::sparse(actuators, expression)?,
            TopologyParams::Linear2D { axes } => grid::linear(actuators, axes),
            TopologyParams::BackAndForth2D { axes } => grid::back_and_forth(actuators, axes),
            TopologyParams::Random2D { axes, seed } => grid::random(actuators, axes, *seed),
            TopologyParams::Spiral2D {
                center,
                rmax,
                rstep,
            } => grid::spiral(actuators, center, rmax, rstep)?,
            TopologyParams::Sequential { axes } => sequential::sequential(actuators, axes),
            TopologyParams::Tabular { rows } => tabular::tabular(actuators, rows),
            TopologyParams::TabularSubSegmented { points, spacing } => {
                tabular::sub_segmented(actuators, points, *spacing)
            }
            TopologyParams::Adaptive1D(params) => {
                ScanTopology::adaptive(actuators, params.clone())
            }
        };
        tracing::debug!(
            kind = %self.kind(),
            steps = topology.len(),
            shape = ?topology.shape(),
            "Generated scan topology"
        );
        Ok(topology)
    }
}
