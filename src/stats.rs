//! Statistics tracking for evolution runs.

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Score distribution of one generation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    /// Generation index the scores belong to
    pub generation: u32,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    /// Individuals with a score (including failures)
    pub evaluated: usize,
    /// Individuals whose evaluation failed (score -1)
    pub failed: usize,
}

impl ScoreSummary {
    /// Summarise a generation's scores; `None` entries are skipped
    pub fn from_scores(generation: u32, scores: &[Option<f32>]) -> Self {
        let scored: Vec<f32> = scores.iter().flatten().copied().collect();
        if scored.is_empty() {
            return Self {
                generation,
                ..Self::default()
            };
        }
        let min = scored.iter().copied().fold(f32::INFINITY, f32::min);
        let max = scored.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Self {
            generation,
            min,
            max,
            mean: scored.iter().sum::<f32>() / scored.len() as f32,
            evaluated: scored.len(),
            failed: scored.iter().filter(|&&s| s < 0.0).count(),
        }
    }

    /// Format as a one-line summary
    pub fn summary(&self) -> String {
        format!(
            "Gen:{:4} | Max:{:9.3} | Mean:{:9.3} | Min:{:9.3} | Eval:{:3} | Failed:{:3}",
            self.generation, self.max, self.mean, self.min, self.evaluated, self.failed
        )
    }
}

/// Counts of mutation operators applied
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationStats {
    pub edge_deletions: usize,
    pub edge_additions: usize,
    pub part_deletions: usize,
    pub part_clones: usize,
    pub input_map_edits: usize,
    pub scalar_edits: usize,
    pub network_edits: usize,
}

impl MutationStats {
    pub fn total(&self) -> usize {
        self.edge_deletions
            + self.edge_additions
            + self.part_deletions
            + self.part_clones
            + self.input_map_edits
            + self.scalar_edits
            + self.network_edits
    }

    /// Format as a one-line summary
    pub fn summary(&self) -> String {
        format!(
            "Edges -{} +{} | Parts -{} +{} | Map:{} | Scalars:{} | Net:{}",
            self.edge_deletions,
            self.edge_additions,
            self.part_deletions,
            self.part_clones,
            self.input_map_edits,
            self.scalar_edits,
            self.network_edits
        )
    }
}

impl AddAssign for MutationStats {
    fn add_assign(&mut self, other: Self) {
        self.edge_deletions += other.edge_deletions;
        self.edge_additions += other.edge_additions;
        self.part_deletions += other.part_deletions;
        self.part_clones += other.part_clones;
        self.input_map_edits += other.input_map_edits;
        self.scalar_edits += other.scalar_edits;
        self.network_edits += other.network_edits;
    }
}

/// Historical statistics for a whole run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsHistory {
    pub scores: Vec<ScoreSummary>,
    /// Mutation counts per generation, indexed like `scores`
    pub mutations: Vec<MutationStats>,
}

impl StatsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one generation
    pub fn record(&mut self, scores: ScoreSummary, mutations: MutationStats) {
        self.scores.push(scores);
        self.mutations.push(mutations);
    }

    /// Best score over time
    pub fn max_series(&self) -> Vec<(u32, f32)> {
        self.scores.iter().map(|s| (s.generation, s.max)).collect()
    }

    /// Mean score over time
    pub fn mean_series(&self) -> Vec<(u32, f32)> {
        self.scores.iter().map(|s| (s.generation, s.mean)).collect()
    }

    /// Save history to a JSON file
    pub fn save_json(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    /// Load history from a JSON file
    pub fn load_json(path: &str) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_from_scores() {
        let s = ScoreSummary::from_scores(3, &[Some(1.0), None, Some(-1.0), Some(4.0)]);
        assert_eq!(s.generation, 3);
        assert_eq!(s.evaluated, 3);
        assert_eq!(s.failed, 1);
        assert_eq!(s.max, 4.0);
        assert_eq!(s.min, -1.0);
        assert!((s.mean - 4.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_summary_of_nothing() {
        let s = ScoreSummary::from_scores(0, &[None, None]);
        assert_eq!(s.evaluated, 0);
        assert_eq!(s.max, 0.0);
    }

    #[test]
    fn test_mutation_stats_accumulate() {
        let mut a = MutationStats {
            edge_deletions: 1,
            scalar_edits: 4,
            ..MutationStats::default()
        };
        a += MutationStats {
            part_clones: 2,
            ..MutationStats::default()
        };
        assert_eq!(a.total(), 7);
    }

    #[test]
    fn test_history_json_roundtrip() {
        let mut history = StatsHistory::new();
        for g in 0..4 {
            history.record(
                ScoreSummary::from_scores(g, &[Some(g as f32)]),
                MutationStats::default(),
            );
        }
        assert_eq!(history.max_series()[3], (3, 3.0));

        let path = std::env::temp_dir().join("morphevo_test_stats.json");
        let path = path.to_string_lossy().to_string();
        history.save_json(&path).unwrap();
        let loaded = StatsHistory::load_json(&path).unwrap();
        assert_eq!(loaded, history);
        std::fs::remove_file(&path).ok();
    }
}
