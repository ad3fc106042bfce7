//! Control network: connectivity, topology and stepping.

use super::node::{logical_base, random_weight, Node, NodeKind, Params, Tap};
use crate::config::NetworkConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// How internal nodes are wired to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    #[serde(rename = "1d")]
    Ring,
    #[serde(rename = "2d")]
    Torus,
    #[serde(rename = "random-k")]
    RandomK,
    #[serde(rename = "full")]
    Full,
}

/// Synchronous (all pre, then all post) or asynchronous (random single
/// nodes) update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStyle {
    Sync,
    Async,
}

/// Per-body-part control network
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub nodes: Vec<Node>,
    /// Nodes that receive external inputs
    pub inputs: Vec<usize>,
    /// Nodes readable by neighbours and motors
    pub outputs: Vec<usize>,
    pub topology: Topology,
    /// Neighbourhood radius for ring / torus
    pub radius: usize,
    /// Fan-in for random-k
    pub k: usize,
    pub update_style: UpdateStyle,
    /// Quanta (0 = continuous)
    pub quanta: u32,
    /// All nodes read one shared parameter block
    pub shared_params: bool,
}

impl Network {
    /// Build a randomly parameterised network from configuration
    pub fn random<R: Rng + ?Sized>(config: &NetworkConfig, rng: &mut R) -> Self {
        let n = config.nodes.max(1);
        let q = config.quanta;

        let shared = Arc::new(Params::random(config.node_kind, q, rng));
        let nodes = (0..n)
            .map(|_| {
                if config.shared_params {
                    Node::new(Arc::clone(&shared))
                } else {
                    Node::new(Arc::new(Params::random(config.node_kind, q, rng)))
                }
            })
            .collect();

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let n_in = config.inputs.min(n);
        let n_out = config.outputs.min(n - n_in);
        let mut inputs: Vec<usize> = order[..n_in].to_vec();
        let mut outputs: Vec<usize> = order[n_in..n_in + n_out].to_vec();
        inputs.sort_unstable();
        outputs.sort_unstable();

        let mut net = Self {
            nodes,
            inputs,
            outputs,
            topology: config.topology,
            radius: config.radius.max(1),
            k: config.k,
            update_style: config.update_style,
            quanta: q,
            shared_params: config.shared_params,
        };
        net.connect_topology(rng);
        net.reset(rng);
        net
    }

    /// (Re)build internal connectivity and draw fresh weights
    pub fn connect_topology<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let n = self.nodes.len();
        for i in 0..n {
            let sources = self.neighbours(i, rng);
            let weights = sources.iter().map(|_| random_weight(rng, self.quanta)).collect();
            let node = &mut self.nodes[i];
            node.inputs = sources;
            node.weights = weights;
        }
        self.fit_logical_tables(rng);
    }

    /// Internal sources of node `i` under the current topology
    fn neighbours<R: Rng + ?Sized>(&self, i: usize, rng: &mut R) -> Vec<usize> {
        let n = self.nodes.len();
        let mut set = BTreeSet::new();
        match self.topology {
            Topology::Ring => {
                for d in 1..=self.radius {
                    set.insert((i + d) % n);
                    set.insert((i + n - d % n) % n);
                }
            }
            Topology::Torus => {
                let w = (n as f32).sqrt().ceil().max(1.0) as usize;
                let h = (n + w - 1) / w;
                let (x, y) = ((i % w) as isize, (i / w) as isize);
                let r = self.radius as isize;
                for dy in -r..=r {
                    for dx in -r..=r {
                        if dx.abs() + dy.abs() > r {
                            continue;
                        }
                        let nx = (x + dx).rem_euclid(w as isize) as usize;
                        let ny = (y + dy).rem_euclid(h as isize) as usize;
                        let j = ny * w + nx;
                        if j < n {
                            set.insert(j);
                        }
                    }
                }
            }
            Topology::RandomK => {
                let mut others: Vec<usize> = (0..n).filter(|&j| j != i).collect();
                others.shuffle(rng);
                set.extend(others.into_iter().take(self.k));
            }
            Topology::Full => set.extend(0..n),
        }
        set.remove(&i);
        set.into_iter().collect()
    }

    /// Grow or shrink logical lookup tables to match fan-in
    pub fn fit_logical_tables<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let q = self.quanta;
        for node in &mut self.nodes {
            node.fit_logical_table(q, rng);
        }
    }

    /// Randomise every node's internal state
    pub fn reset<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let q = self.quanta;
        for node in &mut self.nodes {
            node.reset(q, rng);
        }
    }

    /// Advance the network by one tick
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let q = self.quanta;
        match self.update_style {
            UpdateStyle::Sync => {
                let taps = self.taps();
                for node in &mut self.nodes {
                    node.pre_update(&taps, q);
                }
                for node in &mut self.nodes {
                    node.post_update(q);
                }
            }
            UpdateStyle::Async => {
                let n = self.nodes.len();
                for _ in 0..n {
                    let i = rng.gen_range(0..n);
                    let taps = self.taps();
                    let node = &mut self.nodes[i];
                    node.pre_update(&taps, q);
                    node.post_update(q);
                }
            }
        }
    }

    fn taps(&self) -> Vec<Tap> {
        self.nodes.iter().map(Node::tap).collect()
    }

    pub fn kind(&self) -> NodeKind {
        self.nodes
            .first()
            .map(Node::kind)
            .unwrap_or(NodeKind::Sigmoid)
    }

    pub fn is_input(&self, i: usize) -> bool {
        self.inputs.binary_search(&i).is_ok()
    }

    pub fn is_output(&self, i: usize) -> bool {
        self.outputs.binary_search(&i).is_ok()
    }

    /// Drop every external input (before re-wiring a fresh phenotype)
    pub fn clear_external(&mut self) {
        for node in &mut self.nodes {
            node.external.clear();
        }
    }

    /// Value a neighbour or motor reads from node `i`
    pub fn signal(&self, i: usize) -> f32 {
        self.nodes.get(i).map(Node::sensor_value).unwrap_or(0.0)
    }

    /// Swap two nodes' positions in the topology.
    ///
    /// Parameters, state, weights and external-input tables move together;
    /// the wiring (who feeds which position) stays with the position.
    pub fn swap_nodes<R: Rng + ?Sized>(&mut self, a: usize, b: usize, rng: &mut R) {
        if a == b || a >= self.nodes.len() || b >= self.nodes.len() {
            return;
        }
        let q = self.quanta;
        let (lo, hi) = (a.min(b), a.max(b));
        let (left, right) = self.nodes.split_at_mut(hi);
        let (x, y) = (&mut left[lo], &mut right[0]);
        std::mem::swap(&mut x.params, &mut y.params);
        std::mem::swap(&mut x.state, &mut y.state);
        std::mem::swap(&mut x.output, &mut y.output);
        std::mem::swap(&mut x.weights, &mut y.weights);
        std::mem::swap(&mut x.external, &mut y.external);
        for node in [x, y] {
            let fan_in = node.inputs.len();
            node.weights.truncate(fan_in);
            while node.weights.len() < fan_in {
                node.weights.push(random_weight(rng, q));
            }
        }
        self.fit_logical_tables(rng);
    }

    /// Number of tunable parameters (weights plus per-node scalars)
    pub fn parameter_count(&self) -> usize {
        self.nodes.iter().map(|n| n.weights.len() + 1).sum()
    }

    /// Structural validity: indices in range, weights finite, outputs in [0, 1]
    pub fn is_valid(&self) -> bool {
        let n = self.nodes.len();
        let base = logical_base(self.quanta) as u8;
        self.inputs.iter().all(|&i| i < n)
            && self.outputs.iter().all(|&i| i < n)
            && self.nodes.iter().enumerate().all(|(i, node)| {
                node.inputs.len() == node.weights.len()
                    && node.inputs.iter().all(|&j| j < n && j != i)
                    && node.weights.iter().all(|w| w.is_finite())
                    && node.state_in_domain()
                    && match &*node.params {
                        Params::Logical { table } => table.iter().all(|&d| d < base),
                        _ => true,
                    }
            })
    }
}
