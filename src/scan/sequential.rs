//! N-axis sequential scan: an odometer over per-axis linear values.

use crate::scan::axis::{unique_sorted, AxisRange};
use crate::scan::topology::{ScanPosition, ScanTopology, TopologyKind};

pub(crate) fn sequential_count(axes: &[AxisRange]) -> usize {
    axes.iter()
        .fold(1usize, |total, axis| total.saturating_mul(axis.count()))
}

/// Cartesian product of the axes, the last axis varying fastest.
///
/// The last digit advances every step; when it wraps, the carry moves one axis to the
/// left. The scan ends when the first axis would wrap.
pub(crate) fn sequential(actuators: Vec<String>, axes: &[AxisRange]) -> ScanTopology {
    let values: Vec<Vec<f64>> = axes.iter().map(AxisRange::values).collect();
    let total = sequential_count(axes);
    let mut digits = vec![0usize; values.len()];
    let mut positions = Vec::with_capacity(total);

    for _ in 0..total {
        let coordinates: Vec<f64> = digits
            .iter()
            .zip(&values)
            .map(|(digit, axis)| axis[*digit])
            .collect();
        positions.push(ScanPosition::from_values(&actuators, &coordinates));

        for k in (0..values.len()).rev() {
            digits[k] += 1;
            if digits[k] < values[k].len() {
                break;
            }
            digits[k] = 0;
        }
    }

    let axes_unique = values
        .into_iter()
        .map(unique_sorted)
        .collect();
    ScanTopology::grid(TopologyKind::Sequential, actuators, positions, axes_unique)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odometer_order() {
        let actuators = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let axes = [
            AxisRange::new(0.0, 1.0, 1.0),
            AxisRange::new(0.0, 2.0, 1.0),
            AxisRange::new(10.0, 11.0, 1.0),
        ];
        let topology = sequential(actuators, &axes);
        let values: Vec<Vec<f64>> = topology.positions().iter().map(|p| p.values()).collect();
        assert_eq!(values.len(), sequential_count(&axes));
        assert_eq!(values.len(), 12);
        assert_eq!(values[0], vec![0.0, 0.0, 10.0]);
        assert_eq!(values[1], vec![0.0, 0.0, 11.0]);
        assert_eq!(values[2], vec![0.0, 1.0, 10.0]);
        assert_eq!(values[6], vec![1.0, 0.0, 10.0]);
        assert_eq!(values[11], vec![1.0, 2.0, 11.0]);
        assert_eq!(topology.shape(), &[2, 3, 2]);
    }

    #[test]
    fn test_degenerate_axis_is_held_constant() {
        let actuators = vec!["a".to_string(), "b".to_string()];
        let axes = [AxisRange::new(5.0, 5.0, 1.0), AxisRange::new(0.0, 2.0, 1.0)];
        let topology = sequential(actuators, &axes);
        assert_eq!(topology.positions().len(), 3);
        assert!(topology.positions().iter().all(|p| p.values()[0] == 5.0));
    }

    #[test]
    fn test_index_matches_odometer_digits() {
        let actuators = vec!["a".to_string(), "b".to_string()];
        let axes = [AxisRange::new(2.0, 0.0, -1.0), AxisRange::new(0.0, 1.0, 1.0)];
        let topology = sequential(actuators, &axes);
        // first axis runs downwards, storage is ascending
        let first = topology.position(0).unwrap();
        assert_eq!(topology.index_for(0, first).unwrap(), vec![2, 0]);
    }
}
