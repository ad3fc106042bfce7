//! Body-part graph mutation and repair.

use super::graph::BodyPartGraph;
use super::part::Edge;
use super::resolver::connect_input_nodes;
use super::BpgError;
use crate::neural::{Signal, WEIGHT_MAX};
use crate::stats::MutationStats;
use rand::Rng;

impl BodyPartGraph {
    /// Mutate the genotype at rate `p`.
    ///
    /// Operators run in a fixed order: edge deletion, edge addition, part
    /// deletion, clone-and-attach (up to `max_parts`), input-map edits, then
    /// per-part scalars and networks. The graph is repaired with
    /// [`BodyPartGraph::fixup`] after every structural deletion and once at
    /// the end. `p == 0` leaves the graph untouched.
    pub fn mutate<R: Rng + ?Sized>(
        &mut self,
        p: f32,
        gauss: bool,
        max_parts: usize,
        rng: &mut R,
    ) -> Result<MutationStats, BpgError> {
        let mut stats = MutationStats::default();
        if p <= 0.0 || self.is_empty() {
            return Ok(stats);
        }

        // 1. edge deletion
        for i in 0..self.len() {
            let mut j = 0;
            while j < self.parts[i].edges.len() {
                if rng.gen::<f32>() < p {
                    self.parts[i].edges.remove(j);
                    stats.edge_deletions += 1;
                    self.fixup(rng)?;
                } else {
                    j += 1;
                }
            }
        }

        // 2. edge addition
        let n = self.len();
        for i in 0..n {
            if rng.gen::<f32>() < p {
                let child = rng.gen_range(0..n);
                let edge = Edge::random(child, rng);
                self.parts[i].edges.push(edge);
                stats.edge_additions += 1;
            }
        }

        // 3. part deletion
        let mut i = 0;
        while i < self.len() {
            if self.len() > 1 && rng.gen::<f32>() < p {
                self.remove_part(i, rng);
                stats.part_deletions += 1;
                self.fixup(rng)?;
            } else {
                i += 1;
            }
        }

        // 4. clone and attach
        let n = self.len();
        for i in 0..n {
            if self.len() >= max_parts {
                break;
            }
            if rng.gen::<f32>() >= p {
                continue;
            }
            let mut clone = self.parts[i].clone();
            clone.edges.clear();
            let (scalars, network) = clone.mutate_scalars(p, gauss, rng);
            let id = self.add_part(clone);
            let total = self.len();
            for _ in 0..rng.gen_range(0..=2) {
                let edge = Edge::random(rng.gen_range(0..total), rng);
                self.parts[id].edges.push(edge);
            }
            for _ in 0..rng.gen_range(1..=2) {
                let from = rng.gen_range(0..total);
                let edge = Edge::random(id, rng);
                self.parts[from].edges.push(edge);
            }
            stats.part_clones += 1;
            stats.scalar_edits += scalars;
            stats.network_edits += network;
        }

        // 5. input-map edits
        for part in &mut self.parts {
            if part.input_map.is_empty() || rng.gen::<f32>() >= p {
                continue;
            }
            let sockets: Vec<Signal> = part.input_map.keys().copied().collect();
            let socket = sockets[rng.gen_range(0..sockets.len())];
            if let Some(sources) = part.input_map.get_mut(&socket) {
                if !sources.is_empty() {
                    let k = rng.gen_range(0..sources.len());
                    if rng.gen_bool(0.5) {
                        sources.remove(k);
                    } else {
                        sources[k].weight = rng.gen_range(-WEIGHT_MAX..=WEIGHT_MAX);
                    }
                    stats.input_map_edits += 1;
                }
            }
            part.input_map.retain(|_, sources| !sources.is_empty());
        }

        // 6. scalars and networks
        for part in &mut self.parts {
            let (scalars, network) = part.mutate_scalars(p, gauss, rng);
            stats.scalar_edits += scalars;
            stats.network_edits += network;
        }

        if stats.total() > 0 {
            self.fixup(rng)?;
        }
        Ok(stats)
    }

    /// Restore graph invariants after a structural change.
    ///
    /// Drops dangling edges, re-elects a missing root, prunes input-map
    /// entries that no longer name a valid source, re-runs the resolver over
    /// a fresh unroll and finally sanity-checks the result.
    pub fn fixup<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), BpgError> {
        let n = self.len();
        if n == 0 {
            self.root = None;
            return Ok(());
        }
        for part in &mut self.parts {
            part.edges.retain(|e| e.child < n);
        }
        if !matches!(self.root, Some(r) if r < n) {
            let root = rng.gen_range(0..n);
            log::debug!("fixup: re-elected root {}", root);
            self.root = Some(root);
        }

        for i in 0..n {
            let mut map = std::mem::take(&mut self.parts[i].input_map);
            let own = self.parts[i].network.as_ref();
            map.retain(|socket, _| match *socket {
                Signal::Node(k) => own.map_or(false, |net| net.is_input(k)),
                Signal::Motor(slot) => slot < 3,
                _ => false,
            });
            for sources in map.values_mut() {
                sources.retain(|s| self.is_source(s.part, s.signal));
            }
            map.retain(|_, sources| !sources.is_empty());
            self.parts[i].input_map = map;
        }

        match self.unroll(false) {
            Ok(mut phenotype) => {
                connect_input_nodes(&mut phenotype, self, rng)?;
            }
            Err(BpgError::UnrollTooLarge { limit }) => {
                log::debug!("fixup: phenotype exceeds {} parts, wiring deferred", limit);
            }
            Err(e) => return Err(e),
        }
        self.sanity_check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvolutionConfig, NetworkConfig};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn genotype(rng: &mut ChaCha8Rng) -> BodyPartGraph {
        let evo = EvolutionConfig {
            initial_parts: 4,
            ..EvolutionConfig::default()
        };
        BodyPartGraph::random(&evo, &NetworkConfig::default(), rng)
    }

    #[test]
    fn test_zero_rate_is_noop() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut g = genotype(&mut rng);
        let before = g.clone();
        let stats = g.mutate(0.0, false, 8, &mut rng).unwrap();
        assert_eq!(stats.total(), 0);
        assert_eq!(g, before);
    }

    #[test]
    fn test_full_rate_keeps_invariants() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut g = genotype(&mut rng);
        for _ in 0..100 {
            let stats = g.mutate(1.0, false, 8, &mut rng).unwrap();
            assert!(stats.total() > 0);
            assert!(g.sanity_check().is_ok());
            assert!(g.len() <= 8);
            assert!(matches!(g.root, Some(r) if r < g.len()));
        }
    }

    #[test]
    fn test_gauss_mutation_keeps_invariants() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut g = genotype(&mut rng);
        for _ in 0..100 {
            g.mutate(0.2, true, 8, &mut rng).unwrap();
            assert!(g.sanity_check().is_ok());
            for part in &g.parts {
                assert!(part.lostops.iter().zip(&part.histops).all(|(lo, hi)| lo <= hi));
            }
        }
    }

    #[test]
    fn test_fixup_reelects_root_and_prunes_map() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut g = genotype(&mut rng);
        g.root = None;
        g.parts[1].input_map.insert(
            Signal::Motor(0),
            vec![crate::bpg::InputSource {
                part: 99,
                signal: Signal::Contact,
                weight: 1.0,
            }],
        );
        g.parts[0].edges.push(Edge::new(42, 1, false));
        g.fixup(&mut rng).unwrap();
        assert!(g.root.is_some());
        assert!(g.parts[0].edges.iter().all(|e| e.child < g.len()));
        assert!(g.parts[1]
            .input_map
            .values()
            .flatten()
            .all(|s| s.part < g.len()));
    }

    #[test]
    fn test_fixup_completes_wiring() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut g = genotype(&mut rng);
        g.fixup(&mut rng).unwrap();
        let mut ph = g.unroll(false).unwrap();
        assert_eq!(connect_input_nodes(&mut ph, &mut g, &mut rng).unwrap(), 0);
        assert!(crate::bpg::check_connected(&ph).is_ok());
    }
}
