//! Input-map resolver.
//!
//! Wires every open socket of a phenotype (network input nodes and enabled
//! motor slots) to a source among its neighbours. Choices are remembered on
//! the genotype part, keyed by genotype handle, so that later unrolls of the
//! same genotype reproduce the same wiring and only genuinely new sockets
//! draw fresh random sources.

use super::graph::{BodyPartGraph, PartId};
use super::part::InputSource;
use super::BpgError;
use crate::neural::{random_weight, ExternalInput, Signal};
use rand::Rng;

/// Connect every open socket of `phenotype`, back-annotating new choices
/// onto `genotype`. Returns the number of input-map entries added.
pub fn connect_input_nodes<R: Rng + ?Sized>(
    phenotype: &mut BodyPartGraph,
    genotype: &mut BodyPartGraph,
    rng: &mut R,
) -> Result<usize, BpgError> {
    if !phenotype.unrolled {
        return Err(BpgError::Structural(
            "resolver needs an unrolled phenotype".to_string(),
        ));
    }
    let mut added = 0;
    for pid in 0..phenotype.len() {
        let gid = phenotype.parts[pid]
            .genotype
            .filter(|&g| g < genotype.len())
            .ok_or_else(|| {
                BpgError::Structural(format!("phenotype part {} has no valid genotype", pid))
            })?;
        let neighbours = phenotype.neighbours(pid);
        let quanta = phenotype.parts[pid]
            .network
            .as_ref()
            .map_or(0, |n| n.quanta);

        for socket in open_sockets(phenotype, pid) {
            let remembered = genotype.parts[gid]
                .input_map
                .get(&socket)
                .and_then(|sources| recall(phenotype, pid, socket, &neighbours, sources));

            let (src, signal, weight) = match remembered {
                Some(choice) => choice,
                None => {
                    let candidates = candidates(phenotype, pid, socket, &neighbours);
                    if candidates.is_empty() {
                        return Err(BpgError::Unconnected { part: pid, socket });
                    }
                    let (src, signal) = candidates[rng.gen_range(0..candidates.len())];
                    let weight = random_weight(rng, quanta);
                    let src_genotype = phenotype.parts[src].genotype.unwrap_or(gid);
                    genotype.parts[gid]
                        .input_map
                        .entry(socket)
                        .or_default()
                        .push(InputSource {
                            part: src_genotype,
                            signal,
                            weight,
                        });
                    log::trace!(
                        "resolver: part {} {} <- part {} {} (new)",
                        pid,
                        socket,
                        src,
                        signal
                    );
                    added += 1;
                    (src, signal, weight)
                }
            };
            install(phenotype, pid, socket, ExternalInput::new(src, signal, weight));
        }
    }
    Ok(added)
}

/// Every input node has an external source and every enabled motor slot is
/// filled.
pub fn check_connected(phenotype: &BodyPartGraph) -> Result<(), BpgError> {
    for pid in 0..phenotype.len() {
        if let Some(&socket) = open_sockets(phenotype, pid).first() {
            return Err(BpgError::Unconnected { part: pid, socket });
        }
    }
    Ok(())
}

/// Sockets of part `pid` still waiting for a source
fn open_sockets(phenotype: &BodyPartGraph, pid: PartId) -> Vec<Signal> {
    let part = &phenotype.parts[pid];
    let mut sockets = Vec::new();
    if let Some(net) = &part.network {
        for &i in &net.inputs {
            if net.nodes.get(i).map_or(false, |n| n.external.is_empty()) {
                sockets.push(Signal::Node(i));
            }
        }
    }
    if phenotype.root != Some(pid) {
        for &slot in part.joint.motor_slots() {
            if part.motor_input[slot as usize].is_none() {
                sockets.push(Signal::Motor(slot));
            }
        }
    }
    sockets
}

/// First remembered source that fits the current neighbourhood
fn recall(
    phenotype: &BodyPartGraph,
    pid: PartId,
    socket: Signal,
    neighbours: &[PartId],
    sources: &[InputSource],
) -> Option<(PartId, Signal, f32)> {
    sources.iter().find_map(|source| {
        neighbours
            .iter()
            .copied()
            .find(|&q| {
                phenotype.parts[q].genotype == Some(source.part)
                    && admissible(phenotype, pid, socket, q, source.signal)
            })
            .map(|q| (q, source.signal, source.weight))
    })
}

/// All admissible (source part, signal) pairs among the neighbours
fn candidates(
    phenotype: &BodyPartGraph,
    pid: PartId,
    socket: Signal,
    neighbours: &[PartId],
) -> Vec<(PartId, Signal)> {
    let mut out = Vec::new();
    for &q in neighbours {
        let part = &phenotype.parts[q];
        let mut signals: Vec<Signal> = part
            .network
            .as_ref()
            .map(|n| n.outputs.iter().map(|&i| Signal::Node(i)).collect())
            .unwrap_or_default();
        signals.extend(part.joint.motor_slots().iter().map(|&a| Signal::Joint(a)));
        signals.push(Signal::Contact);
        out.extend(
            signals
                .into_iter()
                .filter(|&s| admissible(phenotype, pid, socket, q, s))
                .map(|s| (q, s)),
        );
    }
    out
}

/// Wiring constraints for feeding `socket` of `pid` from `signal` of `src`
fn admissible(
    phenotype: &BodyPartGraph,
    pid: PartId,
    socket: Signal,
    src: PartId,
    signal: Signal,
) -> bool {
    let Some(part) = phenotype.parts.get(src) else {
        return false;
    };
    match signal {
        Signal::Node(i) => {
            let is_output = part.network.as_ref().map_or(false, |n| n.is_output(i));
            match socket {
                // input nodes never read their own network
                Signal::Node(_) => is_output && src != pid,
                _ => is_output,
            }
        }
        Signal::Joint(a) => phenotype.root != Some(src) && part.joint.enables(a),
        Signal::Contact => true,
        Signal::Motor(_) => false,
    }
}

fn install(phenotype: &mut BodyPartGraph, pid: PartId, socket: Signal, input: ExternalInput) {
    let part = &mut phenotype.parts[pid];
    match socket {
        Signal::Node(i) => {
            if let Some(node) = part.network.as_mut().and_then(|n| n.nodes.get_mut(i)) {
                node.external.push(input);
            }
        }
        Signal::Motor(slot) => part.motor_input[slot as usize] = Some(input),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvolutionConfig, NetworkConfig};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn genotype(seed: u64) -> BodyPartGraph {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let evo = EvolutionConfig {
            initial_parts: 4,
            ..EvolutionConfig::default()
        };
        BodyPartGraph::random(&evo, &NetworkConfig::default(), &mut rng)
    }

    #[test]
    fn test_connect_fills_every_socket() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut g = genotype(1);
        let mut ph = g.unroll(false).unwrap();
        assert!(check_connected(&ph).is_err());
        let added = connect_input_nodes(&mut ph, &mut g, &mut rng).unwrap();
        assert!(added > 0);
        assert!(check_connected(&ph).is_ok());
        assert!(g.sanity_check().is_ok());
        assert!(ph.parts[0].motor_input.iter().all(Option::is_none));
    }

    #[test]
    fn test_second_connect_adds_nothing() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut g = genotype(2);
        let mut ph = g.unroll(false).unwrap();
        connect_input_nodes(&mut ph, &mut g, &mut rng).unwrap();
        let entries: usize = g.parts.iter().map(|p| p.input_map_len()).sum();
        assert_eq!(connect_input_nodes(&mut ph, &mut g, &mut rng).unwrap(), 0);
        let after: usize = g.parts.iter().map(|p| p.input_map_len()).sum();
        assert_eq!(entries, after);
    }

    #[test]
    fn test_reunroll_reproduces_wiring() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut g = genotype(3);
        let mut first = g.unroll(false).unwrap();
        connect_input_nodes(&mut first, &mut g, &mut rng).unwrap();
        let mut second = g.unroll(false).unwrap();
        assert_eq!(connect_input_nodes(&mut second, &mut g, &mut rng).unwrap(), 0);
        for (a, b) in first.parts.iter().zip(&second.parts) {
            assert_eq!(a.motor_input, b.motor_input);
            let ext = |p: &crate::bpg::BodyPart| {
                p.network
                    .as_ref()
                    .map(|n| n.nodes.iter().map(|x| x.external.clone()).collect::<Vec<_>>())
            };
            assert_eq!(ext(a), ext(b));
        }
    }

    #[test]
    fn test_input_nodes_never_read_own_network() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for seed in 0..10 {
            let mut g = genotype(seed);
            let mut ph = g.unroll(false).unwrap();
            connect_input_nodes(&mut ph, &mut g, &mut rng).unwrap();
            for (pid, part) in ph.parts.iter().enumerate() {
                let Some(net) = &part.network else { continue };
                for &i in &net.inputs {
                    for ext in &net.nodes[i].external {
                        assert!(!(ext.part == pid && matches!(ext.signal, Signal::Node(_))));
                        assert!(!ext.signal.is_motor());
                    }
                }
            }
        }
    }

    #[test]
    fn test_unrolled_required() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut g = genotype(5);
        let mut not_unrolled = g.clone();
        assert!(connect_input_nodes(&mut not_unrolled, &mut g, &mut rng).is_err());
    }
}
