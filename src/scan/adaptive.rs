//! Adaptive 1-D sampling.
//!
//! The learner starts with both interval boundaries and then repeatedly bisects the
//! interval with the largest loss, until every interval scores below the loss goal or
//! the step cap is reached. Losses are computed on coordinates normalized by the x range
//! and the observed y range, so the goal is independent of units.

use serde::{Deserialize, Serialize};

/// Loss used to rank intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Euclidean length of the interval in normalized (x, y) space.
    #[default]
    Default,
    /// Area of the triangles formed with neighbouring points, plus small length terms.
    Curvature,
    /// Interval width only, which degrades to uniform sampling.
    Uniform,
}

fn default_loss_goal() -> f64 {
    0.01
}

/// Parameters of an adaptive scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveParams {
    /// First boundary of the interval.
    pub start: f64,
    /// Second boundary of the interval.
    pub stop: f64,
    /// Interval ranking.
    #[serde(default)]
    pub loss: LossKind,
    /// The scan ends once the largest interval loss falls below this value.
    #[serde(default = "default_loss_goal")]
    pub loss_goal: f64,
    /// Hard cap on the number of steps.
    pub max_steps: usize,
}

/// Ask/tell driver producing the next position of an adaptive scan.
#[derive(Debug, Clone)]
pub struct AdaptiveLearner {
    params: AdaptiveParams,
    /// Observations sorted by x.
    points: Vec<(f64, f64)>,
    asked: usize,
}

impl AdaptiveLearner {
    /// Create a learner with no observation.
    pub fn new(params: AdaptiveParams) -> Self {
        Self {
            params,
            points: Vec::new(),
            asked: 0,
        }
    }

    /// Number of positions handed out so far.
    pub fn asked(&self) -> usize {
        self.asked
    }

    /// Observations, sorted by x.
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Next x to measure, or `None` once the goal or the step cap is reached.
    pub fn ask(&mut self) -> Option<f64> {
        if self.asked >= self.params.max_steps {
            return None;
        }
        let next = match self.asked {
            0 => Some(self.params.start),
            1 => Some(self.params.stop),
            _ => {
                let (index, loss) = self.worst_interval()?;
                if loss < self.params.loss_goal {
                    None
                } else {
                    let (x0, _) = self.points[index];
                    let (x1, _) = self.points[index + 1];
                    Some(0.5 * (x0 + x1))
                }
            }
        };
        if next.is_some() {
            self.asked += 1;
        }
        next
    }

    /// Record the measured value at `x`. A repeated x replaces the earlier value.
    pub fn tell(&mut self, x: f64, y: f64) {
        let at = self.points.partition_point(|(px, _)| *px < x);
        match self.points.get_mut(at) {
            Some(point) if point.0 == x => point.1 = y,
            _ => self.points.insert(at, (x, y)),
        }
    }

    /// Largest interval loss, infinite while fewer than two points are known.
    pub fn loss(&self) -> f64 {
        self.worst_interval()
            .map_or(f64::INFINITY, |(_, loss)| loss)
    }

    fn worst_interval(&self) -> Option<(usize, f64)> {
        if self.points.len() < 2 {
            return None;
        }
        let normalized = self.normalized();
        (0..normalized.len() - 1)
            .map(|i| (i, self.interval_loss(&normalized, i)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn normalized(&self) -> Vec<(f64, f64)> {
        let x_scale = (self.params.stop - self.params.start).abs().max(f64::MIN_POSITIVE);
        let (y_min, y_max) = self
            .points
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, y)| {
                (lo.min(*y), hi.max(*y))
            });
        let y_scale = if y_max > y_min { y_max - y_min } else { 1.0 };
        self.points
            .iter()
            .map(|(x, y)| (x / x_scale, y / y_scale))
            .collect()
    }

    fn interval_loss(&self, points: &[(f64, f64)], i: usize) -> f64 {
        let (x0, y0) = points[i];
        let (x1, y1) = points[i + 1];
        let uniform = (x1 - x0).abs();
        let default = (x1 - x0).hypot(y1 - y0);
        match self.params.loss {
            LossKind::Uniform => uniform,
            LossKind::Default => default,
            LossKind::Curvature => {
                let mut areas = Vec::with_capacity(2);
                if i > 0 {
                    areas.push(triangle_area(points[i - 1], points[i], points[i + 1]));
                }
                if i + 2 < points.len() {
                    areas.push(triangle_area(points[i], points[i + 1], points[i + 2]));
                }
                let triangle = if areas.is_empty() {
                    0.0
                } else {
                    (areas.iter().sum::<f64>() / areas.len() as f64).sqrt()
                };
                triangle + 0.02 * default + 0.02 * uniform
            }
        }
    }
}

fn triangle_area(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    0.5 * ((b.0 - a.0) * (c.1 - a.1) - (c.0 - a.0) * (b.1 - a.1)).abs()
}
