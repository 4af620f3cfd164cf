//! One-dimensional topologies: linear, random and sparse.

use crate::error::{DaqError, DaqResult};
use crate::scan::axis::{unique_sorted, AxisRange};
use crate::scan::shuffle;
use crate::scan::topology::{Distribution, ScanPosition, ScanTopology, TopologyKind};

fn positions_from(actuators: &[String], values: &[f64]) -> Vec<ScanPosition> {
    values
        .iter()
        .map(|value| ScanPosition::from_values(actuators, &[*value]))
        .collect()
}

pub(crate) fn linear(actuators: Vec<String>, axis: &AxisRange) -> ScanTopology {
    let values = axis.values();
    let positions = positions_from(&actuators, &values);
    ScanTopology::grid(
        TopologyKind::Linear1D,
        actuators,
        positions,
        vec![unique_sorted(values)],
    )
}

pub(crate) fn random(actuators: Vec<String>, axis: &AxisRange, seed: Option<u64>) -> ScanTopology {
    let values = axis.values();
    let mut positions = positions_from(&actuators, &values);
    shuffle(&mut positions, seed);
    ScanTopology::grid(
        TopologyKind::Random1D,
        actuators,
        positions,
        vec![unique_sorted(values)],
    )
}

pub(crate) fn sparse(actuators: Vec<String>, expression: &str) -> DaqResult<ScanTopology> {
    let values = parse_sparse(expression)?;
    let positions = positions_from(&actuators, &values);
    Ok(ScanTopology::spread(
        TopologyKind::Sparse1D,
        actuators,
        positions,
        vec![unique_sorted(values)],
        Distribution::Uniform,
    ))
}

/// Expand a sparse range list such as `"0:0.5:2, 5, 10:1:12"`.
///
/// Entries are separated by commas or whitespace. `start:step:stop` expands like a linear
/// axis, a bare number is a single point. Order is preserved and duplicates are kept.
pub fn parse_sparse(expression: &str) -> DaqResult<Vec<f64>> {
    let mut values = Vec::new();
    for token in expression
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
    {
        let numbers = token
            .split(':')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                DaqError::Configuration(format!("invalid sparse entry '{}': {}", token, e))
            })?;
        if numbers.iter().any(|n| !n.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "sparse entry '{}' is not finite",
                token
            )));
        }
        match numbers.as_slice() {
            [value] => values.push(*value),
            [start, step, stop] => values.extend(AxisRange::new(*start, *stop, *step).values()),
            _ => {
                return Err(DaqError::Configuration(format!(
                    "sparse entry '{}' must be 'value' or 'start:step:stop'",
                    token
                )))
            }
        }
    }
    if values.is_empty() {
        return Err(DaqError::Configuration(
            "sparse expression contains no position".to_string(),
        ));
    }
    Ok(values)
}

/// Number of positions a sparse expression expands to.
pub(crate) fn sparse_count(expression: &str) -> DaqResult<usize> {
    parse_sparse(expression).map(|values| values.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> Vec<String> {
        vec!["x".to_string()]
    }

    #[test]
    fn test_linear_positions() {
        let topology = linear(x(), &AxisRange::new(0.0, 10.0, 2.0));
        let values: Vec<f64> = topology.positions().iter().map(|p| p.values()[0]).collect();
        assert_eq!(values, vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_eq!(topology.shape(), &[6]);
    }

    #[test]
    fn test_random_is_permutation_of_linear() {
        let axis = AxisRange::new(0.0, 100.0, 1.0);
        let reference = linear(x(), &axis);
        let shuffled = random(x(), &axis, None);

        let mut a: Vec<f64> = reference.positions().iter().map(|p| p.values()[0]).collect();
        let b: Vec<f64> = shuffled.positions().iter().map(|p| p.values()[0]).collect();
        assert_ne!(a, b);

        let mut b_sorted = b.clone();
        a.sort_by(f64::total_cmp);
        b_sorted.sort_by(f64::total_cmp);
        assert_eq!(a, b_sorted);
    }

    #[test]
    fn test_random_index_points_to_value() {
        let topology = random(x(), &AxisRange::new(0.0, 4.0, 1.0), Some(7));
        for (step, position) in topology.positions().iter().enumerate() {
            let index = topology.index_for(step, position).unwrap();
            assert_eq!(topology.axes_unique()[0][index[0]], position.values()[0]);
        }
    }

    #[test]
    fn test_sparse_expansion() {
        let values = parse_sparse("0:1:2, 5 10:0.5:11").unwrap();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 5.0, 10.0, 10.5, 11.0]);
    }

    #[test]
    fn test_sparse_rejects_malformed_entries() {
        assert!(parse_sparse("0:1").is_err());
        assert!(parse_sparse("abc").is_err());
        assert!(parse_sparse(" , ").is_err());
    }

    #[test]
    fn test_sparse_keeps_duplicates_in_emission_order() {
        let topology = sparse(x(), "1, 1, 2").unwrap();
        assert_eq!(topology.shape(), &[3]);
        assert_eq!(topology.axes_unique()[0], vec![1.0, 2.0]);
        assert_eq!(topology.distribution(), Distribution::Uniform);
        let second = topology.position(1).unwrap().clone();
        assert_eq!(topology.index_for(1, &second).unwrap(), vec![1]);
    }
}
