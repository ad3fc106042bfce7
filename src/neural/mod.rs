//! Control networks for body parts.
//!
//! Implements a bank of heterogeneous neurons with:
//! - Seven continuous/oscillatory/spiking kinds plus logical lookup nodes
//! - Ring, torus, random-k and fully connected topologies
//! - Synchronous or asynchronous update
//! - Cross-network external inputs carrying weights

mod mutations;
mod network;
mod node;
mod signal;

pub use network::{Network, Topology, UpdateStyle};
pub use node::{
    logical_table_len, mutate_scalar, quantise, random_weight, sigmoid, InputSums, Node, NodeKind,
    Params, State, Tap, DT, WEIGHT_MAX, WALLEN_KINDS,
};
pub use signal::{ExternalInput, Signal};
