//! Recursion-bounded expansion of a genotype into a phenotype tree.

use super::graph::{BodyPartGraph, PartId};
use super::part::{Edge, InputMap};
use super::BpgError;

/// Hard cap on phenotype size; deeper expansions are rejected
pub const MAX_UNROLLED_PARTS: usize = 256;

impl BodyPartGraph {
    /// Unroll into an acyclic phenotype rooted at part 0.
    ///
    /// Each genotype part carries an instance counter that is raised while
    /// traversal is below it and lowered on return. An edge from P into C is
    /// taken when
    /// `((P.count < P.limit && !terminal) || (P.count == P.limit && terminal))
    ///  && C.count < C.limit`,
    /// with edges visited in insertion order. The root is always
    /// instantiated once. `skip_network` leaves every phenotype network empty.
    ///
    /// Parallel edges can still multiply instances, so expansion also stops
    /// once the phenotype holds `total_recursive_limit() + 1` parts; edges
    /// reached after that point are not taken.
    pub fn unroll(&self, skip_network: bool) -> Result<BodyPartGraph, BpgError> {
        let mut phenotype = BodyPartGraph {
            parts: Vec::new(),
            root: None,
            unrolled: true,
        };
        let Some(root) = self.root else {
            return Ok(phenotype);
        };
        if root >= self.parts.len() {
            return Err(BpgError::Structural(format!("root {} out of range", root)));
        }

        let mut counts = vec![0u8; self.parts.len()];
        let mut unroller = Unroller {
            genotype: self,
            phenotype: &mut phenotype,
            counts: &mut counts,
            budget: self.total_recursive_limit() + 1,
            skip_network,
        };
        unroller.instantiate(root, None)?;

        if counts.iter().any(|&c| c != 0) {
            return Err(BpgError::Structural("unroll counters unbalanced".to_string()));
        }
        phenotype.root = Some(0);
        Ok(phenotype)
    }
}

struct Unroller<'a> {
    genotype: &'a BodyPartGraph,
    phenotype: &'a mut BodyPartGraph,
    counts: &'a mut [u8],
    budget: usize,
    skip_network: bool,
}

impl Unroller<'_> {
    fn instantiate(&mut self, gid: PartId, parent: Option<(PartId, Edge)>) -> Result<PartId, BpgError> {
        if self.phenotype.parts.len() >= MAX_UNROLLED_PARTS {
            return Err(BpgError::UnrollTooLarge {
                limit: MAX_UNROLLED_PARTS,
            });
        }
        let genotype = self.genotype;
        let template = &genotype.parts[gid];
        let mut part = template.clone();
        part.edges = Vec::new();
        part.input_map = InputMap::new();
        part.genotype = Some(gid);
        part.motor_input = [None; 3];
        if self.skip_network {
            part.network = None;
        } else if let Some(net) = part.network.as_mut() {
            net.clear_external();
        }
        let pid = self.phenotype.add_part(part);
        if let Some((parent_pid, edge)) = parent {
            self.phenotype.parts[parent_pid]
                .edges
                .push(Edge::new(pid, edge.joint_end, edge.terminal_only));
        }

        let limit = template.recursive_limit;
        for edge in &template.edges {
            let child = edge.child;
            let Some(child_part) = genotype.parts.get(child) else {
                return Err(BpgError::Structural(format!(
                    "edge from {} into missing part {}",
                    gid, child
                )));
            };
            let count = self.counts[gid];
            let open = (count < limit && !edge.terminal_only) || (count == limit && edge.terminal_only);
            if !open || self.counts[child] >= child_part.recursive_limit {
                continue;
            }
            if self.phenotype.parts.len() >= self.budget {
                break;
            }
            self.counts[gid] += 1;
            let result = self.instantiate(child, Some((pid, *edge)));
            self.counts[gid] -= 1;
            result?;
        }
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpg::BodyPart;
    use crate::config::{EvolutionConfig, NetworkConfig};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn graph(limits: &[u8], rng: &mut ChaCha8Rng) -> BodyPartGraph {
        let mut bpg = BodyPartGraph::new();
        for &l in limits {
            let mut part = BodyPart::random(&NetworkConfig::default(), rng);
            part.recursive_limit = l;
            bpg.add_part(part);
        }
        bpg.root = Some(0);
        bpg
    }

    #[test]
    fn test_empty_graph_unrolls_empty() {
        let ph = BodyPartGraph::new().unroll(false).unwrap();
        assert!(ph.is_empty());
        assert!(ph.unrolled);
        assert_eq!(ph.root, None);
    }

    #[test]
    fn test_zero_limits_yield_single_root() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut bpg = graph(&[0, 0, 0], &mut rng);
        bpg.parts[0].edges.push(Edge::new(1, 1, false));
        bpg.parts[0].edges.push(Edge::new(2, -1, true));
        bpg.parts[1].edges.push(Edge::new(2, 1, false));
        let ph = bpg.unroll(false).unwrap();
        assert_eq!(ph.len(), 1);
        assert!(ph.parts[0].edges.is_empty());
        assert_eq!(ph.parts[0].genotype, Some(0));
    }

    #[test]
    fn test_chain_unrolls_once_per_part() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut bpg = graph(&[1, 1, 1], &mut rng);
        bpg.parts[0].edges.push(Edge::new(1, 1, false));
        bpg.parts[1].edges.push(Edge::new(2, 1, false));
        let ph = bpg.unroll(false).unwrap();
        assert_eq!(ph.len(), 3);
        assert!(ph.len() <= bpg.total_recursive_limit() + 1);
        let back: Vec<_> = ph.parts.iter().map(|p| p.genotype).collect();
        assert_eq!(back, vec![Some(0), Some(1), Some(2)]);
        assert!(ph.sanity_check().is_ok());
    }

    #[test]
    fn test_self_loop_bounded_by_limit() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut bpg = graph(&[3], &mut rng);
        bpg.parts[0].edges.push(Edge::new(0, 1, false));
        let ph = bpg.unroll(false).unwrap();
        assert_eq!(ph.len(), 4);
        assert!(ph.len() <= bpg.total_recursive_limit() + 1);
        assert_eq!(ph.bfs(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_terminal_children_only_on_final_instance() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut bpg = graph(&[2, 1], &mut rng);
        bpg.parts[0].edges.push(Edge::new(0, 1, false));
        bpg.parts[0].edges.push(Edge::new(1, -1, true));
        let ph = bpg.unroll(false).unwrap();
        // root, root, root(final) + one terminal child
        assert_eq!(ph.len(), 4);
        let children: Vec<_> = ph.parts.iter().filter(|p| p.genotype == Some(1)).collect();
        assert_eq!(children.len(), 1);
        let holder = ph.parent(3).unwrap();
        assert_eq!(ph.parts[holder].genotype, Some(0));
        assert!(ph.parts[holder].edges.len() == 1 && holder == 2);
    }

    #[test]
    fn test_unroll_is_deterministic_and_skips_networks() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut bpg = graph(&[2, 2, 1], &mut rng);
        bpg.parts[0].edges.push(Edge::new(1, 1, false));
        bpg.parts[1].edges.push(Edge::new(1, -1, false));
        bpg.parts[1].edges.push(Edge::new(2, 1, true));
        let a = bpg.unroll(false).unwrap();
        let b = bpg.unroll(false).unwrap();
        assert_eq!(a, b);
        let bare = bpg.unroll(true).unwrap();
        assert_eq!(bare.len(), a.len());
        assert!(bare.parts.iter().all(|p| p.network.is_none()));
    }

    #[test]
    fn test_parallel_edges_stay_within_limit_sum() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut bpg = graph(&[3, 3], &mut rng);
        for from in 0..2 {
            for to in 0..2 {
                for _ in 0..3 {
                    bpg.parts[from].edges.push(Edge::new(to, 1, false));
                }
            }
        }
        let ph = bpg.unroll(true).unwrap();
        assert_eq!(ph.len(), bpg.total_recursive_limit() + 1);
        assert!(ph.sanity_check().is_ok());
        assert_eq!(ph, bpg.unroll(true).unwrap());
    }

    #[test]
    fn test_two_self_loops_do_not_branch_past_limit() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut bpg = graph(&[3], &mut rng);
        bpg.parts[0].edges.push(Edge::new(0, 1, false));
        bpg.parts[0].edges.push(Edge::new(0, -1, false));
        let ph = bpg.unroll(true).unwrap();
        assert_eq!(ph.len(), 4);
        // the first edge is followed to full depth before the second is tried
        assert_eq!(ph.bfs(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_heavily_mutated_graphs_respect_limit_sum() {
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let evo = EvolutionConfig::default();
        let mut bpg = BodyPartGraph::random(&evo, &NetworkConfig::default(), &mut rng);
        bpg.fixup(&mut rng).unwrap();
        for round in 0..100 {
            bpg.mutate(1.0, false, evo.max_genotype_parts, &mut rng).unwrap();
            let ph = bpg.unroll(true).unwrap();
            let bound = bpg.total_recursive_limit() + 1;
            assert!(ph.len() <= bound, "round {}: {} parts > {}", round, ph.len(), bound);
            assert!(!ph.is_empty());
        }
    }

    #[test]
    fn test_oversized_limit_sum_is_capped() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut bpg = graph(&[3; 100], &mut rng);
        for i in 0..100 {
            bpg.parts[i].edges.push(Edge::new(i, 1, false));
            if i + 1 < 100 {
                bpg.parts[i].edges.push(Edge::new(i + 1, 1, false));
            }
        }
        assert_eq!(
            bpg.unroll(true),
            Err(BpgError::UnrollTooLarge {
                limit: MAX_UNROLLED_PARTS
            })
        );
    }
}
