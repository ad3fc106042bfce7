//! Fitness accumulators over the scored phase.

use serde::{Deserialize, Serialize};

/// Scoring rule applied during the scored phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FitnessMetric {
    /// Distance of the mean body position from the start
    MeanDistance,
    /// Rate of progress of the trailing body along x
    MeanXv,
    /// Time-normalised height of the mean position
    CumulativeZ,
    /// Total per-body travel plus a small displacement bonus
    Movement,
    /// Mean distance, measured from a re-anchored start after a delay
    After,
    /// Composite of movement, lateral position and body count
    Walk,
}

/// Running fitness state for one evaluation
#[derive(Debug, Clone)]
pub struct Fitness {
    metric: FitnessMetric,
    start: [f32; 3],
    prev: Vec<[f32; 3]>,
    elapsed: f32,
    total_time: f32,
    after_time: f32,
    anchored: bool,
    cumulative: f32,
    score: f32,
}

impl Fitness {
    /// Start scoring from the body positions recorded at the end of relax
    pub fn new(metric: FitnessMetric, start: &[[f32; 3]], total_time: f32, after_time: f32) -> Self {
        Self {
            metric,
            start: mean(start),
            prev: start.to_vec(),
            elapsed: 0.0,
            total_time: total_time.max(f32::EPSILON),
            after_time,
            anchored: false,
            cumulative: 0.0,
            score: 0.0,
        }
    }

    pub fn metric(&self) -> FitnessMetric {
        self.metric
    }

    /// Mean position the score is measured against
    pub fn start(&self) -> [f32; 3] {
        self.start
    }

    /// Fold in one tick of body positions
    pub fn update(&mut self, positions: &[[f32; 3]], dt: f32) {
        self.elapsed += dt;
        let centre = mean(positions);
        match self.metric {
            FitnessMetric::MeanDistance => {
                self.score = distance(centre, self.start);
            }
            FitnessMetric::MeanXv => {
                let min_x = positions.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min);
                self.score = if positions.is_empty() {
                    0.0
                } else {
                    (min_x - self.start[0]) / self.elapsed
                };
            }
            FitnessMetric::CumulativeZ => {
                self.cumulative += centre[2] * dt / self.total_time;
                self.score = self.cumulative;
            }
            FitnessMetric::Movement => {
                self.cumulative += self.travel(positions) + distance(centre, self.start) / 500.0;
                self.score = self.cumulative;
            }
            FitnessMetric::After => {
                if self.elapsed >= self.after_time {
                    if !self.anchored {
                        self.start = centre;
                        self.anchored = true;
                    }
                    self.score = distance(centre, self.start);
                }
            }
            FitnessMetric::Walk => {
                self.cumulative += self.travel(positions);
                self.score = self.cumulative / 100.0 + 100.0 * centre[1] + positions.len() as f32;
            }
        }
        self.prev.clear();
        self.prev.extend_from_slice(positions);
    }

    fn travel(&self, positions: &[[f32; 3]]) -> f32 {
        positions
            .iter()
            .zip(&self.prev)
            .map(|(&now, &before)| distance(now, before))
            .sum()
    }

    pub fn score(&self) -> f32 {
        self.score
    }
}

/// Unweighted mean of a set of positions
pub fn mean(positions: &[[f32; 3]]) -> [f32; 3] {
    if positions.is_empty() {
        return [0.0; 3];
    }
    let mut m = [0.0; 3];
    for p in positions {
        for a in 0..3 {
            m[a] += p[a];
        }
    }
    let n = positions.len() as f32;
    [m[0] / n, m[1] / n, m[2] / n]
}

pub fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}
