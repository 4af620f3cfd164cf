//! Tabular topologies: literal rows, or a polyline resampled at a fixed spacing.

use crate::scan::axis::unique_sorted;
use crate::scan::topology::{Distribution, ScanPosition, ScanTopology, TopologyKind};

fn spread(kind: TopologyKind, actuators: Vec<String>, rows: Vec<Vec<f64>>) -> ScanTopology {
    let axes_unique = (0..actuators.len())
        .map(|k| unique_sorted(rows.iter().map(|row| row[k])))
        .collect();
    let positions = rows
        .iter()
        .map(|row| ScanPosition::from_values(&actuators, row))
        .collect();
    ScanTopology::spread(kind, actuators, positions, axes_unique, Distribution::Spread)
}

pub(crate) fn tabular(actuators: Vec<String>, rows: &[Vec<f64>]) -> ScanTopology {
    spread(TopologyKind::Tabular, actuators, rows.to_vec())
}

fn segment_length(from: &[f64], to: &[f64]) -> f64 {
    from.iter()
        .zip(to)
        .map(|(a, b)| (b - a) * (b - a))
        .sum::<f64>()
        .sqrt()
}

/// Samples taken on one segment: every `n` with `n * spacing < length`.
fn segment_samples(length: f64, spacing: f64) -> usize {
    if length <= 0.0 {
        0
    } else {
        (length / spacing).ceil() as usize
    }
}

pub(crate) fn sub_segmented_count(points: &[Vec<f64>], spacing: f64) -> usize {
    points
        .windows(2)
        .map(|pair| segment_samples(segment_length(&pair[0], &pair[1]), spacing))
        .fold(1usize, usize::saturating_add)
}

/// Walk the polyline through `points`, one sample every `spacing`.
///
/// Segment ends are left out so that vertices are not repeated; the final vertex is
/// always appended.
pub(crate) fn sub_segmented(
    actuators: Vec<String>,
    points: &[Vec<f64>],
    spacing: f64,
) -> ScanTopology {
    let mut rows = Vec::with_capacity(sub_segmented_count(points, spacing));
    for pair in points.windows(2) {
        let (from, to) = (&pair[0], &pair[1]);
        let length = segment_length(from, to);
        for n in 0..segment_samples(length, spacing) {
            let fraction = n as f64 * spacing / length;
            rows.push(
                from.iter()
                    .zip(to)
                    .map(|(a, b)| a + (b - a) * fraction)
                    .collect(),
            );
        }
    }
    if let Some(last) = points.last() {
        rows.push(last.clone());
    }
    spread(TopologyKind::TabularSubSegmented, actuators, rows)
}
