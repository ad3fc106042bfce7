//! Configuration system for evolution runs.
//!
//! Supports YAML configuration files with sensible defaults.

use crate::evolution::GaKind;
use crate::neural::{NodeKind, Topology, UpdateStyle};
use crate::sim::{FitnessMetric, SimKind};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(default)]
    pub fitness: FitnessConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Run identity and persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Root key of the generation in the store
    pub name: String,
    /// Seed for every named random stream
    pub seed: u64,
    /// Store URL (`mem://name`, `file://dir` or a bare directory)
    pub store: String,
}

/// Genetic algorithm configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub ga: GaKind,
    pub population: usize,
    /// Generation index at which the run stops
    pub final_generation: u32,
    /// Per-element mutation probability
    pub mutation_rate: f32,
    pub mutation_kind: MutationKind,
    /// Share of the population copied verbatim by the elite GA
    pub elite_fraction: f32,
    /// Cap on genotype parts when cloning
    pub max_genotype_parts: usize,
    /// Genotype parts in a fresh random individual
    pub initial_parts: usize,
    /// Attempts before a zero-mutation clone is fatal
    pub max_mutation_retries: u32,
}

/// How numeric genes are mutated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    /// Resample uniformly over the legal range
    Uniform,
    /// Perturb by N(0, 0.1 * range) and clamp
    Gauss,
}

impl MutationKind {
    pub fn is_gauss(&self) -> bool {
        matches!(self, MutationKind::Gauss)
    }
}

/// Control network shape shared by every body part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub node_kind: NodeKind,
    pub topology: Topology,
    /// Fan-in for random-k
    pub k: usize,
    /// Neighbourhood radius for 1d / 2d
    pub radius: usize,
    /// Internal node count
    pub nodes: usize,
    /// Nodes accepting external inputs
    pub inputs: usize,
    /// Nodes readable from neighbours
    pub outputs: usize,
    /// Quantisation levels (0 = continuous)
    pub quanta: u32,
    pub update_style: UpdateStyle,
    /// All nodes of a network share one parameter block
    pub shared_params: bool,
}

/// Physics simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub kind: SimKind,
    /// Scored phase length in seconds
    pub trial_time: f32,
    /// Phenotypes with more parts are rejected
    pub max_parts: usize,
    /// Loose relax threshold and cheaper solver settings
    pub fast_physics: bool,
    /// Standard deviation of sensor noise
    pub sensor_noise: f32,
    /// Vertical gravity (negative is down)
    pub gravity: f32,
    /// Longest relax phase in seconds
    pub relax_time: f32,
    /// Sliding window over which body speeds are summed
    pub relax_window: f32,
    pub relax_threshold: f32,
    pub fast_relax_threshold: f32,
    /// Allowed body-part length range
    pub min_length: f32,
    pub max_length: f32,
    /// Any body faster than this aborts the evaluation
    pub blowup_speed: f32,
    /// Proportional gain of the joint motor controller
    pub motor_gain: f32,
    /// Maximum torque per motor axis
    pub motor_force: f32,
}

/// Fitness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitnessConfig {
    pub metric: FitnessMetric,
    /// Delay before the `after` metric starts scoring
    pub after_time: f32,
}

/// Master/worker coordination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Local worker threads for `run`
    pub workers: usize,
    /// Master poll interval
    pub poll_interval_ms: u64,
    /// Worker back-off when idle or after a conflict
    pub idle_sleep_ms: u64,
    /// Conflicts tolerated per operation before giving up
    pub conflict_retries: u32,
    /// Concurrent reservations allowed per individual
    pub busy_limit: u32,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Generations between info-level summaries
    pub stats_interval: u32,
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: "run".to_string(),
            seed: 42,
            store: "mem://default".to_string(),
        }
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            ga: GaKind::Elite,
            population: 10,
            final_generation: 50,
            mutation_rate: 0.05,
            mutation_kind: MutationKind::Uniform,
            elite_fraction: 0.2,
            max_genotype_parts: 8,
            initial_parts: 3,
            max_mutation_retries: 100,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_kind: NodeKind::Sigmoid,
            topology: Topology::Full,
            k: 3,
            radius: 1,
            nodes: 6,
            inputs: 2,
            outputs: 2,
            quanta: 0,
            update_style: UpdateStyle::Sync,
            shared_params: false,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            kind: SimKind::Bpg,
            trial_time: 30.0,
            max_parts: 32,
            fast_physics: false,
            sensor_noise: 0.0,
            gravity: -9.81,
            relax_time: 10.0,
            relax_window: 2.0,
            relax_threshold: 0.005,
            fast_relax_threshold: 30.0,
            min_length: 2.0,
            max_length: 8.0,
            blowup_speed: 150.0,
            motor_gain: 1.6,
            motor_force: 400.0,
        }
    }
}

impl Default for FitnessConfig {
    fn default() -> Self {
        Self {
            metric: FitnessMetric::MeanDistance,
            after_time: 10.0,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 1000,
            idle_sleep_ms: 1000,
            conflict_retries: 20,
            busy_limit: 2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stats_interval: 1,
            log_level: "info".to_string(),
        }
    }
}

impl SimConfig {
    /// Relax convergence threshold for the configured physics mode
    pub fn relax_limit(&self) -> f32 {
        if self.fast_physics {
            self.fast_relax_threshold
        } else {
            self.relax_threshold
        }
    }

    /// Root body length: midpoint of the allowed range, clamped to [3, 10]
    pub fn root_length(&self) -> f32 {
        ((self.min_length + self.max_length) / 2.0).clamp(3.0, 10.0)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.run.name.trim().is_empty() {
            return invalid("run name must not be empty");
        }
        if self.evolution.population == 0 {
            return invalid("population must be > 0");
        }
        if !(self.evolution.mutation_rate > 0.0 && self.evolution.mutation_rate < 1.0) {
            return invalid("mutation_rate must be in (0, 1)");
        }
        if self.evolution.final_generation == 0 {
            return invalid("final_generation must be > 0");
        }
        if !(0.0..=1.0).contains(&self.evolution.elite_fraction) {
            return invalid("elite_fraction must be in [0, 1]");
        }
        if self.evolution.max_genotype_parts == 0 || self.evolution.initial_parts == 0 {
            return invalid("genotype part counts must be > 0");
        }
        let net = &self.network;
        if net.nodes < net.inputs + net.outputs {
            return invalid("internal node count must cover inputs + outputs");
        }
        if net.quanta == 1 {
            return invalid("quanta must be 0 (continuous) or >= 2");
        }
        if net.topology == Topology::RandomK && (net.k == 0 || net.k >= net.nodes) {
            return invalid("random-k needs 0 < k < nodes");
        }
        if self.sim.trial_time <= 0.0 {
            return invalid("trial_time must be > 0");
        }
        if self.sim.max_parts < 2 {
            return invalid("max_parts must be >= 2");
        }
        if self.sim.min_length <= 0.0 || self.sim.min_length > self.sim.max_length {
            return invalid("length range must be positive and ordered");
        }
        if self.coordinator.busy_limit == 0 {
            return invalid("busy_limit must be > 0");
        }
        Ok(())
    }
}

/// Errors raised while loading or validating configuration
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Parse(e) => write!(f, "Parse error: {}", e),
            Self::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Parse(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let loaded: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_enum_names() {
        let yaml = "network:\n  node_kind: wallen\n  topology: random-k\n  update_style: async\n\
                    evolution:\n  ga: steady-state\n  mutation_kind: gauss\n\
                    fitness:\n  metric: cumulative-z\nsim:\n  kind: pole-balance\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.node_kind, NodeKind::Wallen);
        assert_eq!(config.network.topology, Topology::RandomK);
        assert_eq!(config.network.update_style, UpdateStyle::Async);
        assert_eq!(config.evolution.ga, GaKind::SteadyState);
        assert_eq!(config.fitness.metric, FitnessMetric::CumulativeZ);
        assert_eq!(config.sim.kind, SimKind::PoleBalance);
        // unspecified fields fall back to defaults
        assert_eq!(config.evolution.population, 10);
    }

    #[test]
    fn test_unknown_node_kind_rejected() {
        let yaml = "network:\n  node_kind: hopfield\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut c = Config::default();
        c.network.quanta = 1;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.evolution.mutation_rate = 1.0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.network.topology = Topology::RandomK;
        c.network.k = c.network.nodes;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.network.inputs = 5;
        c.network.outputs = 5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let path = std::env::temp_dir().join("morphevo_test_config.yaml");
        let mut config = Config::default();
        config.run.name = "hinge".to_string();
        config.save(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.run.name, "hinge");
        std::fs::remove_file(&path).ok();
    }
}
