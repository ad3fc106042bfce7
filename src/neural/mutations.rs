//! Control network mutations.

use super::network::Network;
use super::node::{mutate_scalar, quantise, WEIGHT_MAX};
use rand::Rng;
use std::sync::Arc;

impl Network {
    /// Mutate node parameters, weights and node placement at rate `p`.
    ///
    /// Returns the number of individual edits. `p == 0` leaves the network
    /// untouched.
    pub fn mutate<R: Rng + ?Sized>(&mut self, p: f32, gauss: bool, rng: &mut R) -> usize {
        if p <= 0.0 || self.nodes.is_empty() {
            return 0;
        }
        let q = self.quanta;
        let mut count = 0;

        // Parameters: a shared block is mutated once and re-linked
        if self.shared_params {
            let mut params = (*self.nodes[0].params).clone();
            let edits = params.mutate(p, gauss, q, rng);
            if edits > 0 {
                let shared = Arc::new(params);
                for node in &mut self.nodes {
                    node.params = Arc::clone(&shared);
                }
                count += edits;
            }
        } else {
            for node in &mut self.nodes {
                count += Arc::make_mut(&mut node.params).mutate(p, gauss, q, rng);
            }
        }

        count += self.mutate_weights(p, gauss, rng);

        // Topology: swap two positions
        if self.nodes.len() > 1 && rng.gen::<f32>() < p {
            let a = rng.gen_range(0..self.nodes.len());
            let b = rng.gen_range(0..self.nodes.len());
            if a != b {
                self.swap_nodes(a, b, rng);
                count += 1;
            }
        }

        self.fit_logical_tables(rng);
        count
    }

    /// Mutate internal and external weights independently with rate `p`
    pub fn mutate_weights<R: Rng + ?Sized>(&mut self, p: f32, gauss: bool, rng: &mut R) -> usize {
        let q = self.quanta;
        let mut count = 0;
        for node in &mut self.nodes {
            for w in node.weights.iter_mut() {
                if rng.gen::<f32>() < p {
                    let v = mutate_scalar(*w, -WEIGHT_MAX, WEIGHT_MAX, gauss, rng);
                    *w = quantise(v, -WEIGHT_MAX, WEIGHT_MAX, q);
                    count += 1;
                }
            }
        }
        count
    }
}
