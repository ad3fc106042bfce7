//! Body-part graphs: genotype arena, unrolling, wiring and mutation.

mod graph;
mod mutations;
mod part;
mod resolver;
mod unroll;

pub use graph::{BodyPartGraph, PartId};
pub use part::{
    orthogonal, random_unit, BodyPart, Edge, InputMap, InputSource, JointKind,
    RECURSIVE_LIMIT_MAX, SCALE_MAX, SCALE_MIN,
};
pub use resolver::{check_connected, connect_input_nodes};
pub use unroll::MAX_UNROLLED_PARTS;

/// Errors from graph construction, unrolling and repair
#[derive(Debug, Clone, PartialEq)]
pub enum BpgError {
    /// An invariant does not hold; indicates a bug
    Structural(String),
    /// Unrolling produced more parts than allowed
    UnrollTooLarge { limit: usize },
    /// A socket stayed unconnected after the resolver ran
    Unconnected { part: PartId, socket: crate::neural::Signal },
}

impl std::fmt::Display for BpgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structural(msg) => write!(f, "Structural error: {}", msg),
            Self::UnrollTooLarge { limit } => {
                write!(f, "Unrolled phenotype exceeds {} parts", limit)
            }
            Self::Unconnected { part, socket } => {
                write!(f, "Part {} socket {} left unconnected", part, socket)
            }
        }
    }
}

impl std::error::Error for BpgError {}
