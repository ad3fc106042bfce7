//! # MORPHEVO
//!
//! Co-evolution of body shape and control networks for simulated
//! articulated creatures.
//!
//! ## Features
//!
//! - **Body-part graphs**: cyclic genotypes unrolled into finite bodies
//! - **Control networks**: eight neuron kinds, sync or async update
//! - **Physics**: capsule bodies and motorised joints via Rapier
//! - **Distributed**: master and workers share a versioned object store
//! - **Reproducible**: every random draw comes from a named seeded stream
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use morphevo::{Config, Generation, Simulator};
//!
//! let config = Config::default();
//! let mut gen = Generation::new(&config).unwrap();
//!
//! // Evaluate and breed in-process until the final generation
//! gen.run_local(&Simulator::new(&config), 1).unwrap();
//!
//! if let Some(best) = gen.best() {
//!     println!("Best score: {:?}", best.score);
//! }
//! ```
//!
//! ## Master and workers
//!
//! ```rust,no_run
//! use morphevo::{store, Config, Coordinator, Simulator};
//!
//! let config = Config::default();
//! let store = store::connect("file://runs").unwrap();
//! let coordinator = Coordinator::new(store, &config);
//! coordinator.create_or_resume(&config).unwrap();
//!
//! // Usually in separate processes
//! coordinator.worker(&Simulator::new(&config), "host-a").unwrap();
//! coordinator.master().unwrap();
//! ```

pub mod bpg;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod evolution;
pub mod neural;
pub mod rng;
pub mod sim;
pub mod stats;
pub mod store;

// Re-export main types
pub use bpg::BodyPartGraph;
pub use config::Config;
pub use coordinator::Coordinator;
pub use evolution::{GaKind, Generation, Individual};
pub use sim::{Evaluator, Simulator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
