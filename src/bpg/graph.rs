//! Body-part graph arena.

use super::part::{BodyPart, Edge, RECURSIVE_LIMIT_MAX};
use super::BpgError;
use crate::config::{EvolutionConfig, NetworkConfig};
use crate::neural::Signal;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Handle of a part inside its graph
pub type PartId = usize;

/// Ordered container of body parts with a designated root.
///
/// The genotype form may be cyclic and contain self-loops; the phenotype
/// form produced by [`BodyPartGraph::unroll`] is a tree rooted at part 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyPartGraph {
    pub parts: Vec<BodyPart>,
    pub root: Option<PartId>,
    pub unrolled: bool,
}

impl BodyPartGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Random genotype: `initial_parts` parts hung off a random tree
    pub fn random<R: Rng + ?Sized>(
        evo: &EvolutionConfig,
        net: &NetworkConfig,
        rng: &mut R,
    ) -> Self {
        let mut bpg = Self::new();
        let n = evo.initial_parts.clamp(1, evo.max_genotype_parts.max(1));
        for i in 0..n {
            let mut part = BodyPart::random(net, rng);
            part.recursive_limit = rng.gen_range(1..=RECURSIVE_LIMIT_MAX);
            let id = bpg.add_part(part);
            if i > 0 {
                let parent = rng.gen_range(0..i);
                let end = if rng.gen_bool(0.5) { 1 } else { -1 };
                bpg.parts[parent].edges.push(Edge::new(id, end, false));
            }
        }
        bpg.root = Some(0);
        bpg
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn add_part(&mut self, part: BodyPart) -> PartId {
        self.parts.push(part);
        self.parts.len() - 1
    }

    pub fn root_part(&self) -> Option<&BodyPart> {
        self.root.and_then(|r| self.parts.get(r))
    }

    pub fn edge_count(&self) -> usize {
        self.parts.iter().map(|p| p.edges.len()).sum()
    }

    /// Parts in breadth-first order from the root, each visited once
    pub fn bfs(&self) -> Vec<PartId> {
        let mut order = Vec::with_capacity(self.parts.len());
        let Some(root) = self.root.filter(|&r| r < self.parts.len()) else {
            return order;
        };
        let mut seen = vec![false; self.parts.len()];
        let mut queue = VecDeque::from([root]);
        seen[root] = true;
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in self.parts[id].children() {
                if child < seen.len() && !seen[child] {
                    seen[child] = true;
                    queue.push_back(child);
                }
            }
        }
        order
    }

    /// Parts with an edge into `id`
    pub fn parents(&self, id: PartId) -> Vec<PartId> {
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.children().any(|c| c == id))
            .map(|(i, _)| i)
            .collect()
    }

    /// Parent of a phenotype part (phenotype parts have at most one)
    pub fn parent(&self, id: PartId) -> Option<PartId> {
        self.parents(id).into_iter().next()
    }

    /// `{id} ∪ children ∪ parents`, deduplicated in that order
    pub fn neighbours(&self, id: PartId) -> Vec<PartId> {
        let mut out = vec![id];
        for n in self.parts[id].children().chain(self.parents(id)) {
            if !out.contains(&n) {
                out.push(n);
            }
        }
        out
    }

    pub fn total_recursive_limit(&self) -> usize {
        self.parts.iter().map(|p| p.recursive_limit as usize).sum()
    }

    /// Remove a part, redirecting edges that pointed at it to a random
    /// survivor. Returns false when the part is the last one.
    pub fn remove_part<R: Rng + ?Sized>(&mut self, id: PartId, rng: &mut R) -> bool {
        let n = self.parts.len();
        if id >= n || n == 1 {
            return false;
        }
        for part in &mut self.parts {
            for edge in &mut part.edges {
                if edge.child == id {
                    let mut target = rng.gen_range(0..n - 1);
                    if target >= id {
                        target += 1;
                    }
                    edge.child = target;
                }
            }
        }
        self.parts.remove(id);

        for part in &mut self.parts {
            for edge in &mut part.edges {
                if edge.child > id {
                    edge.child -= 1;
                }
            }
            for sources in part.input_map.values_mut() {
                sources.retain(|s| s.part != id);
                for s in sources.iter_mut() {
                    if s.part > id {
                        s.part -= 1;
                    }
                }
            }
            part.input_map.retain(|_, sources| !sources.is_empty());
        }
        self.root = match self.root {
            Some(r) if r == id => None,
            Some(r) if r > id => Some(r - 1),
            other => other,
        };
        true
    }

    /// True if `signal` of part `part` can feed another socket
    pub fn is_source(&self, part: PartId, signal: Signal) -> bool {
        let Some(p) = self.parts.get(part) else {
            return false;
        };
        match signal {
            Signal::Node(i) => p.network.as_ref().map_or(false, |net| net.is_output(i)),
            Signal::Joint(a) => a < 3,
            Signal::Contact => true,
            Signal::Motor(_) => false,
        }
    }

    /// Check the structural invariants every graph must satisfy
    pub fn sanity_check(&self) -> Result<(), BpgError> {
        let n = self.parts.len();
        if n == 0 {
            return match self.root {
                None => Ok(()),
                Some(r) => Err(BpgError::Structural(format!("root {} in empty graph", r))),
            };
        }
        match self.root {
            Some(r) if r < n => {}
            other => {
                return Err(BpgError::Structural(format!("bad root {:?}", other)));
            }
        }
        for (i, part) in self.parts.iter().enumerate() {
            for edge in &part.edges {
                if edge.child >= n {
                    return Err(BpgError::Structural(format!(
                        "part {} has edge to missing part {}",
                        i, edge.child
                    )));
                }
                if edge.joint_end != 1 && edge.joint_end != -1 {
                    return Err(BpgError::Structural(format!("part {} has bad joint end", i)));
                }
            }
            for (socket, sources) in &part.input_map {
                if !matches!(socket, Signal::Node(_) | Signal::Motor(_)) {
                    return Err(BpgError::Structural(format!(
                        "part {} maps non-socket {}",
                        i, socket
                    )));
                }
                if let Some(s) = sources.iter().find(|s| !self.is_source(s.part, s.signal)) {
                    return Err(BpgError::Structural(format!(
                        "part {} input map references {} of part {}",
                        i, s.signal, s.part
                    )));
                }
            }
            if let Some(net) = &part.network {
                if !net.is_valid() {
                    return Err(BpgError::Structural(format!("part {} network invalid", i)));
                }
            }
            if self.unrolled {
                if part.genotype.is_none() {
                    return Err(BpgError::Structural(format!(
                        "phenotype part {} lacks a genotype",
                        i
                    )));
                }
                if part.motor_input.iter().flatten().any(|m| m.part >= n) {
                    return Err(BpgError::Structural(format!(
                        "part {} motor source out of range",
                        i
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpg::part::InputSource;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn random_graph(parts: usize, seed: u64) -> BodyPartGraph {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let evo = EvolutionConfig {
            initial_parts: parts,
            ..EvolutionConfig::default()
        };
        BodyPartGraph::random(&evo, &NetworkConfig::default(), &mut rng)
    }

    #[test]
    fn test_random_graph_is_sane_tree() {
        let bpg = random_graph(5, 1);
        assert_eq!(bpg.len(), 5);
        assert_eq!(bpg.edge_count(), 4);
        assert_eq!(bpg.bfs().len(), 5);
        assert!(bpg.sanity_check().is_ok());
    }

    #[test]
    fn test_neighbours_include_self_children_parents() {
        let mut bpg = random_graph(3, 2);
        for p in &mut bpg.parts {
            p.edges.clear();
        }
        bpg.parts[0].edges.push(Edge::new(1, 1, false));
        bpg.parts[1].edges.push(Edge::new(2, -1, false));
        assert_eq!(bpg.neighbours(1), vec![1, 2, 0]);
        assert_eq!(bpg.parent(2), Some(1));
        assert_eq!(bpg.parent(0), None);
    }

    #[test]
    fn test_remove_part_redirects_and_renumbers() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut bpg = random_graph(4, 3);
        let src = bpg.parts[3]
            .network
            .as_ref()
            .and_then(|n| n.outputs.first().copied())
            .unwrap();
        bpg.parts[0].input_map.insert(
            Signal::Motor(2),
            vec![InputSource {
                part: 3,
                signal: Signal::Node(src),
                weight: 1.0,
            }],
        );
        assert!(bpg.remove_part(1, &mut rng));
        assert_eq!(bpg.len(), 3);
        assert_eq!(bpg.root, Some(0));
        assert_eq!(bpg.parts[0].input_map[&Signal::Motor(2)][0].part, 2);
        assert!(bpg.sanity_check().is_ok());
    }

    #[test]
    fn test_remove_root_clears_root() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut bpg = random_graph(2, 4);
        assert!(bpg.remove_part(0, &mut rng));
        assert_eq!(bpg.root, None);
        assert!(bpg.sanity_check().is_err());
        assert!(!bpg.remove_part(0, &mut rng));
    }

    #[test]
    fn test_sanity_rejects_dangling_edge() {
        let mut bpg = random_graph(2, 5);
        bpg.parts[0].edges.push(Edge::new(7, 1, false));
        assert!(matches!(bpg.sanity_check(), Err(BpgError::Structural(_))));
    }
}
