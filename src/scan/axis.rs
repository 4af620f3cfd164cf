//! Axis ranges and the numeric helpers shared by every topology.

use serde::{Deserialize, Serialize};

/// Step magnitudes below this are treated as zero.
pub const STEP_EPSILON: f64 = 1e-12;

/// Start/stop/step description of one scan axis.
///
/// An axis is *degenerate* when its step is (nearly) zero, when `start == stop`, or when
/// the sign of `stop - start` disagrees with the sign of `step`. A degenerate axis does
/// not fail: it collapses to the single `start` value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// First value of the axis.
    pub start: f64,
    /// Value the axis runs towards (included when reached within tolerance).
    pub stop: f64,
    /// Signed increment between successive values.
    pub step: f64,
}

impl AxisRange {
    /// Create a new axis range.
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// True when all three parameters are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.start.is_finite() && self.stop.is_finite() && self.step.is_finite()
    }

    /// True when this axis collapses to its start value.
    pub fn is_degenerate(&self) -> bool {
        if self.step.abs() < STEP_EPSILON || self.start == self.stop {
            return true;
        }
        (self.stop - self.start).signum() != self.step.signum()
    }

    /// Number of values [`values`](Self::values) produces, computed in closed form.
    pub fn count(&self) -> usize {
        if self.is_degenerate() {
            return 1;
        }
        let span = (self.stop - self.start) / self.step;
        let mut count = span.ceil().max(1.0) as usize;
        let last = self.start + (count as f64 - 1.0) * self.step;
        if (last + self.step - self.stop).abs() < STEP_EPSILON {
            count = count.saturating_add(1);
        }
        count
    }

    /// Arithmetic progression from `start` towards `stop`.
    ///
    /// The endpoint is included when it lies on the grid, otherwise the progression stops
    /// at the last value before `stop`.
    pub fn values(&self) -> Vec<f64> {
        if self.is_degenerate() {
            return vec![self.start];
        }
        (0..self.count())
            .map(|i| self.start + i as f64 * self.step)
            .collect()
    }
}

/// Sorted copy of `values` with duplicates removed.
pub fn unique_sorted(values: impl IntoIterator<Item = f64>) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.into_iter().collect();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup_by(|a, b| (*a - *b).abs() <= STEP_EPSILON * b.abs().max(1.0));
    sorted
}

/// Index of the entry of the ascending slice `sorted` closest to `value`.
pub fn nearest_index(sorted: &[f64], value: f64) -> Option<usize> {
    if sorted.is_empty() || value.is_nan() {
        return None;
    }
    let upper = sorted.partition_point(|v| *v < value);
    if upper == 0 {
        return Some(0);
    }
    if upper >= sorted.len() {
        return Some(sorted.len() - 1);
    }
    let below = value - sorted[upper - 1];
    let above = sorted[upper] - value;
    Some(if above < below { upper } else { upper - 1 })
}
