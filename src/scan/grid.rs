//! Two-dimensional topologies: raster, back-and-forth, random and spiral.

use crate::error::{DaqError, DaqResult};
use crate::scan::axis::{unique_sorted, AxisRange, STEP_EPSILON};
use crate::scan::shuffle;
use crate::scan::topology::{ScanPosition, ScanTopology, TopologyKind};

/// Row-major raster, first axis slowest. With `snake` set, odd rows run backwards.
fn raster(actuators: &[String], axes: &[AxisRange; 2], snake: bool) -> Vec<ScanPosition> {
    let slow = axes[0].values();
    let fast = axes[1].values();
    let mut positions = Vec::with_capacity(slow.len() * fast.len());
    for (row, x) in slow.iter().enumerate() {
        let columns: Vec<f64> = if snake && row % 2 == 1 {
            fast.iter().rev().copied().collect()
        } else {
            fast.clone()
        };
        positions.extend(
            columns
                .into_iter()
                .map(|y| ScanPosition::from_values(actuators, &[*x, y])),
        );
    }
    positions
}

fn unique_axes(axes: &[AxisRange; 2]) -> Vec<Vec<f64>> {
    axes.iter().map(|axis| unique_sorted(axis.values())).collect()
}

pub(crate) fn linear(actuators: Vec<String>, axes: &[AxisRange; 2]) -> ScanTopology {
    let positions = raster(&actuators, axes, false);
    ScanTopology::grid(TopologyKind::Linear2D, actuators, positions, unique_axes(axes))
}

pub(crate) fn back_and_forth(actuators: Vec<String>, axes: &[AxisRange; 2]) -> ScanTopology {
    let positions = raster(&actuators, axes, true);
    ScanTopology::grid(
        TopologyKind::BackAndForth2D,
        actuators,
        positions,
        unique_axes(axes),
    )
}

pub(crate) fn random(
    actuators: Vec<String>,
    axes: &[AxisRange; 2],
    seed: Option<u64>,
) -> ScanTopology {
    let mut positions = raster(&actuators, axes, false);
    shuffle(&mut positions, seed);
    ScanTopology::grid(TopologyKind::Random2D, actuators, positions, unique_axes(axes))
}

pub(crate) fn raster_count(axes: &[AxisRange; 2]) -> usize {
    axes[0].count().saturating_mul(axes[1].count())
}

// =============================================================================
// Spiral
// =============================================================================

/// Number of rings of a spiral, `trunc(rmax / rstep)`, shared by both axes.
///
/// A (near) zero radius or step on either axis, or a radius pointing against the step,
/// collapses the spiral onto its center and yields 0.
pub(crate) fn spiral_rings(rmax: &[f64; 2], rstep: &[f64; 2]) -> DaqResult<usize> {
    let mut rings = [0usize; 2];
    for k in 0..2 {
        let ratio = rmax[k] / rstep[k];
        if rstep[k].abs() < STEP_EPSILON || rmax[k].abs() < STEP_EPSILON || !(ratio > 0.0) {
            return Ok(0);
        }
        // tolerate representation error such as 0.3 / 0.1 = 2.9999999999999996
        rings[k] = (ratio + 1e-9).trunc() as usize;
    }
    if rings[0] != rings[1] {
        return Err(DaqError::Configuration(format!(
            "spiral needs the same number of rings on both axes, got {} and {}",
            rings[0], rings[1]
        )));
    }
    Ok(rings[0])
}

pub(crate) fn spiral_count(rings: usize) -> usize {
    let side = rings.saturating_mul(2).saturating_add(1);
    side.saturating_mul(side)
}

/// Integer ring offsets of a square spiral, center first.
///
/// Each turn walks `leg` steps along x then `leg` steps along y, the direction flipping
/// between turns and `leg` growing by one, until `(2 * rings + 1)^2` points exist.
fn spiral_offsets(rings: usize) -> Vec<(i64, i64)> {
    let total = spiral_count(rings);
    let mut offsets = Vec::with_capacity(total);
    let (mut x, mut y) = (0i64, 0i64);
    offsets.push((x, y));
    let mut leg = 1usize;
    while offsets.len() < total {
        let direction = if leg % 2 == 1 { 1 } else { -1 };
        for along_x in [true, false] {
            for _ in 0..leg {
                if offsets.len() >= total {
                    return offsets;
                }
                if along_x {
                    x += direction;
                } else {
                    y += direction;
                }
                offsets.push((x, y));
            }
        }
        leg += 1;
    }
    offsets
}

pub(crate) fn spiral(
    actuators: Vec<String>,
    center: &[f64; 2],
    rmax: &[f64; 2],
    rstep: &[f64; 2],
) -> DaqResult<ScanTopology> {
    let rings = spiral_rings(rmax, rstep)?;
    let positions: Vec<ScanPosition> = spiral_offsets(rings)
        .into_iter()
        .map(|(ix, iy)| {
            ScanPosition::from_values(
                &actuators,
                &[
                    center[0] + ix as f64 * rstep[0],
                    center[1] + iy as f64 * rstep[1],
                ],
            )
        })
        .collect();
    let axes_unique = (0..2)
        .map(|k| unique_sorted(positions.iter().map(|p| p.values()[k])))
        .collect();
    Ok(ScanTopology::grid(
        TopologyKind::Spiral2D,
        actuators,
        positions,
        axes_unique,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn xy() -> Vec<String> {
        vec!["x".to_string(), "y".to_string()]
    }

    fn axes() -> [AxisRange; 2] {
        [AxisRange::new(0.0, 2.0, 1.0), AxisRange::new(0.0, 1.0, 0.5)]
    }

    #[test]
    fn test_raster_last_axis_fastest() {
        let topology = linear(xy(), &axes());
        let values: Vec<Vec<f64>> = topology.positions().iter().map(|p| p.values()).collect();
        assert_eq!(values.len(), 9);
        assert_eq!(values[0], vec![0.0, 0.0]);
        assert_eq!(values[1], vec![0.0, 0.5]);
        assert_eq!(values[3], vec![1.0, 0.0]);
        assert_eq!(topology.shape(), &[3, 3]);
    }

    #[test]
    fn test_index_bijection_is_row_major() {
        let topology = linear(xy(), &axes());
        let shape = topology.shape().to_vec();
        let mut seen = HashSet::new();
        for (step, position) in topology.positions().iter().enumerate() {
            let index = topology.index_for(step, position).unwrap();
            assert_eq!(index[0] * shape[1] + index[1], step);
            assert!(seen.insert(index));
        }
        assert_eq!(seen.len(), shape[0] * shape[1]);
    }

    #[test]
    fn test_back_and_forth_reverses_odd_rows() {
        let topology = back_and_forth(xy(), &axes());
        let ys: Vec<f64> = topology.positions().iter().map(|p| p.values()[1]).collect();
        assert_eq!(ys, vec![0.0, 0.5, 1.0, 1.0, 0.5, 0.0, 0.0, 0.5, 1.0]);
        // every cell is still written exactly once
        let cells: HashSet<Vec<usize>> = topology
            .positions()
            .iter()
            .enumerate()
            .map(|(step, p)| topology.index_for(step, p).unwrap())
            .collect();
        assert_eq!(cells.len(), 9);
    }

    #[test]
    fn test_random_2d_is_set_equal() {
        let big = [AxisRange::new(0.0, 9.0, 1.0), AxisRange::new(0.0, 9.0, 1.0)];
        let reference = linear(xy(), &big);
        let shuffled = random(xy(), &big, Some(42));
        let as_bits = |t: &ScanTopology| -> Vec<Vec<u64>> {
            t.positions()
                .iter()
                .map(|p| p.values().iter().map(|v| v.to_bits()).collect())
                .collect()
        };
        let a = as_bits(&reference);
        let b = as_bits(&shuffled);
        assert_ne!(a, b);
        let set_a: HashSet<_> = a.into_iter().collect();
        let set_b: HashSet<_> = b.into_iter().collect();
        assert_eq!(set_a, set_b);
    }

    #[test]
    fn test_spiral_point_count_and_extent() {
        let topology = spiral(xy(), &[1.0, -1.0], &[10.0, 10.0], &[2.0, 2.0]).unwrap();
        assert_eq!(topology.positions().len(), 121);
        assert_eq!(topology.shape(), &[11, 11]);
        assert_eq!(topology.positions()[0].values(), vec![1.0, -1.0]);
        for position in topology.positions() {
            let values = position.values();
            assert!((values[0] - 1.0).abs() <= 10.0 + 1.0);
            assert!((values[1] + 1.0).abs() <= 10.0 + 1.0);
        }
        let cells: HashSet<Vec<usize>> = topology
            .positions()
            .iter()
            .enumerate()
            .map(|(step, p)| topology.index_for(step, p).unwrap())
            .collect();
        assert_eq!(cells.len(), 121);
    }

    #[test]
    fn test_spiral_first_ring_order() {
        let offsets = spiral_offsets(1);
        assert_eq!(
            &offsets[..5],
            &[(0, 0), (1, 0), (1, 1), (0, 1), (-1, 1)]
        );
        assert_eq!(offsets.len(), 9);
    }

    #[test]
    fn test_spiral_rejects_unequal_rings() {
        let err = spiral(xy(), &[0.0, 0.0], &[10.0, 4.0], &[2.0, 2.0]).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }

    #[test]
    fn test_degenerate_spiral_is_center() {
        let topology = spiral(xy(), &[3.0, 4.0], &[0.0, 0.0], &[1.0, 1.0]).unwrap();
        assert_eq!(topology.positions().len(), 1);
        assert_eq!(topology.positions()[0].values(), vec![3.0, 4.0]);
    }
}
