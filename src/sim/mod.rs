//! Evaluation of genotypes by simulation.
//!
//! Two simulations are available: the articulated-body world (`bpg`) and the
//! pole-balance task (`pole-balance`). Physics failures never escape as
//! errors from [`Simulator::evaluate`]; they are scored [`FAILED_SCORE`].

mod bpg_sim;
mod fitness;
mod pole;
mod trace;

pub use bpg_sim::BpgSim;
pub use fitness::{distance, mean, Fitness, FitnessMetric};
pub use pole::{balance, NetworkController, PdController, PoleController, PoleState, MAXF};
pub use trace::{Trace, TraceWriter};

use crate::bpg::{BodyPartGraph, BpgError};
use crate::config::Config;
use crate::rng;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Score recorded for an evaluation that failed in the physics
pub const FAILED_SCORE: f32 = -1.0;

/// Pole angle at the start of a balance trial
pub const POLE_START_ANGLE: f32 = 0.01;

/// Which simulation scores a genotype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimKind {
    Bpg,
    PoleBalance,
}

/// Result of a completed scored run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimOutcome {
    pub score: f32,
    /// Ticks of the scored phase
    pub ticks: u64,
    /// Ticks spent relaxing before scoring began
    pub relax_ticks: u64,
}

/// Why an evaluation could not produce a score
#[derive(Debug)]
pub enum SimError {
    TooFewParts { parts: usize },
    TooManyParts { parts: usize, limit: usize },
    /// The body never came to rest
    RelaxFailed { seconds: f32 },
    /// A body moved faster than the blow-up limit
    BlowUp { tick: u64, speed: f32 },
    /// NaN or infinity in the physics state
    NonFinite { tick: u64 },
    /// The genotype breaks a graph invariant; not a physics failure
    Structural(BpgError),
    /// Writing the signal log failed
    Io(std::io::Error),
}

impl SimError {
    /// Failures that are scored as [`FAILED_SCORE`] instead of propagated
    pub fn is_physics(&self) -> bool {
        matches!(
            self,
            Self::TooFewParts { .. }
                | Self::TooManyParts { .. }
                | Self::RelaxFailed { .. }
                | Self::BlowUp { .. }
                | Self::NonFinite { .. }
        )
    }
}

impl std::fmt::Display for SimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewParts { parts } => write!(f, "Too few body parts: {}", parts),
            Self::TooManyParts { parts, limit } => {
                write!(f, "Too many body parts: {} (limit {})", parts, limit)
            }
            Self::RelaxFailed { seconds } => write!(f, "Relax did not converge in {}s", seconds),
            Self::BlowUp { tick, speed } => {
                write!(f, "Simulation blew up at tick {} (speed {:.1})", tick, speed)
            }
            Self::NonFinite { tick } => write!(f, "Non-finite physics state at tick {}", tick),
            Self::Structural(e) => write!(f, "{}", e),
            Self::Io(e) => write!(f, "Trace error: {}", e),
        }
    }
}

impl std::error::Error for SimError {}

impl From<BpgError> for SimError {
    fn from(e: BpgError) -> Self {
        SimError::Structural(e)
    }
}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self {
        SimError::Io(e)
    }
}

/// Anything that can score a genotype.
///
/// `genotype` is mutable because wiring chosen during the evaluation is
/// remembered on it. Every random draw derives from `seed`.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, genotype: &mut BodyPartGraph, seed: u64) -> Result<f32, SimError>;
}

/// Evaluator driven by the run configuration
#[derive(Debug, Clone)]
pub struct Simulator {
    config: Config,
}

impl Simulator {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Evaluate without failure mapping, optionally writing a signal log
    pub fn run(
        &self,
        genotype: &mut BodyPartGraph,
        seed: u64,
        trace: Option<Box<dyn Write>>,
    ) -> Result<SimOutcome, SimError> {
        match self.config.sim.kind {
            SimKind::Bpg => {
                let mut sim = BpgSim::new(genotype, &self.config.sim, seed)?;
                if let Some(out) = trace {
                    sim.attach_trace(out)?;
                }
                sim.relax()?;
                sim.run(&self.config.fitness)
            }
            SimKind::PoleBalance => {
                let network = genotype
                    .root_part()
                    .and_then(|p| p.network.clone())
                    .ok_or_else(|| BpgError::Structural("genotype has no root network".to_string()))?;
                let controller_rng = rng::stream(seed, rng::NETWORK, 0);
                let mut controller = NetworkController::new(network, controller_rng);
                let score = balance(&mut controller, POLE_START_ANGLE, self.config.sim.trial_time);
                Ok(SimOutcome {
                    score,
                    ticks: (score / crate::neural::DT).round() as u64,
                    relax_ticks: 0,
                })
            }
        }
    }
}

impl Evaluator for Simulator {
    fn evaluate(&self, genotype: &mut BodyPartGraph, seed: u64) -> Result<f32, SimError> {
        match self.run(genotype, seed, None) {
            Ok(outcome) => {
                log::debug!(
                    "eval: score {:.4} after {} ticks ({} relax)",
                    outcome.score,
                    outcome.ticks,
                    outcome.relax_ticks
                );
                Ok(outcome.score)
            }
            Err(e) if e.is_physics() => {
                log::debug!("eval: failed ({})", e);
                Ok(FAILED_SCORE)
            }
            Err(e) => Err(e),
        }
    }
}
