//! Integration tests for MORPHEVO

use morphevo::bpg::{orthogonal, BodyPart, BodyPartGraph, Edge, InputSource, JointKind};
use morphevo::checkpoint::Checkpoint;
use morphevo::config::{EvolutionConfig, NetworkConfig};
use morphevo::coordinator::run_threaded;
use morphevo::evolution::GaKind;
use morphevo::neural::{Params, Signal, WEIGHT_MAX};
use morphevo::sim::{balance, BpgSim, Evaluator, FitnessMetric, PdController, SimError, SimKind, Trace};
use morphevo::store::{self, FileStore, MemoryStore, ObjectStore};
use morphevo::{Config, Generation, Simulator};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

/// Scores by part count; cheap and deterministic
struct PartCount;

impl Evaluator for PartCount {
    fn evaluate(&self, genotype: &mut BodyPartGraph, _seed: u64) -> Result<f32, SimError> {
        Ok(genotype.len() as f32)
    }
}

/// Hinge chain of equal parts along +z, or laid flat along +x
fn hinge_chain(parts: usize, flat: bool) -> BodyPartGraph {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut g = BodyPartGraph::new();
    for i in 0..parts {
        let mut part = BodyPart::random(&NetworkConfig::default(), &mut rng);
        part.scale = 1.0;
        part.joint = JointKind::Hinge;
        part.rotation_axis = [0.0, 1.0, 0.0];
        part.rotation_angle = if flat && i == 0 { FRAC_PI_2 } else { 0.0 };
        part.axis1 = [1.0, 0.0, 0.0];
        part.axis2 = orthogonal(part.axis1);
        part.lostops = [-1.0; 3];
        part.histops = [1.0; 3];
        part.recursive_limit = 1;
        if i + 1 < parts {
            part.edges.push(Edge::new(i + 1, 1, false));
        }
        g.add_part(part);
    }
    g.root = Some(0);
    g
}

fn vacuum_config(trial_time: f32) -> Config {
    let mut config = Config::default();
    config.sim.gravity = 0.0;
    config.sim.trial_time = trial_time;
    config.fitness.metric = FitnessMetric::MeanDistance;
    config
}

fn coordinated_config(name: &str, ga: GaKind, population: usize, final_generation: u32) -> Config {
    let mut config = Config::default();
    config.run.name = name.to_string();
    config.evolution.ga = ga;
    config.evolution.population = population;
    config.evolution.final_generation = final_generation;
    config.coordinator.poll_interval_ms = 1;
    config.coordinator.idle_sleep_ms = 1;
    config.coordinator.conflict_retries = 10_000;
    config
}

#[test]
fn test_vacuum_chain_does_not_translate() {
    let mut g = hinge_chain(3, true);
    let outcome = Simulator::new(&vacuum_config(2.0)).run(&mut g, 3, None).unwrap();
    assert_eq!(outcome.ticks, 100);
    assert!(outcome.score < 0.05, "score {}", outcome.score);
}

#[test]
fn test_constant_motor_drive_bends_chain_to_its_stops() {
    let mut g = hinge_chain(3, false);
    let held = Arc::new(Params::Sine {
        step: 0.0,
        amplitude: 1.0,
        offset: FRAC_PI_2,
    });
    let mut rng = ChaCha8Rng::seed_from_u64(12);
    for (gid, part) in g.parts.iter_mut().enumerate() {
        let net = part.network.as_mut().unwrap();
        let q = net.quanta;
        for node in &mut net.nodes {
            node.params = held.clone();
            node.reset(q, &mut rng);
        }
        let out = net.outputs[0];
        if gid > 0 {
            part.input_map.insert(
                Signal::Motor(2),
                vec![InputSource {
                    part: gid,
                    signal: Signal::Node(out),
                    weight: WEIGHT_MAX,
                }],
            );
        }
    }

    let config = vacuum_config(1.0);
    let mut sim = BpgSim::new(&mut g, &config.sim, 5).unwrap();
    sim.relax().unwrap();
    let outcome = sim.run(&config.fitness).unwrap();
    assert_eq!(outcome.ticks, 50);
    for pid in 1..3 {
        let angle = sim.joint_angle(pid, 2).unwrap();
        assert!((angle - 1.0).abs() < 0.02, "part {} angle {}", pid, angle);
    }
    assert!(outcome.score < 0.05, "score {}", outcome.score);
}

#[test]
fn test_unrolled_mutants_stay_within_recursive_limits() {
    let mut rng = ChaCha8Rng::seed_from_u64(4321);
    let evo = EvolutionConfig::default();
    let mut g = BodyPartGraph::random(&evo, &NetworkConfig::default(), &mut rng);
    g.fixup(&mut rng).unwrap();
    for step in 0..100 {
        g.mutate(1.0, false, evo.max_genotype_parts, &mut rng).unwrap();
        let phenotype = g.unroll(true).unwrap();
        let bound = g.total_recursive_limit() + 1;
        assert!(
            phenotype.len() <= bound,
            "step {}: {} parts, bound {}",
            step,
            phenotype.len(),
            bound
        );
        assert!(phenotype.sanity_check().is_ok());
    }
}

#[test]
fn test_pole_balance_pd_survives_full_trial() {
    let score = balance(&mut PdController::default(), 0.01, 30.0);
    assert!((score - 30.0).abs() < 1e-3, "score {}", score);
}

#[test]
fn test_elite_tiny_population_is_monotone() {
    let mut config = Config::default();
    config.evolution.population = 3;
    config.evolution.final_generation = 5;
    config.evolution.mutation_rate = 0.01;
    config.sim.trial_time = 1.0;
    config.sim.relax_time = 2.0;
    config.fitness.metric = FitnessMetric::MeanDistance;

    let mut gen = Generation::new(&config).unwrap();
    gen.run_local(&Simulator::new(&config), 1).unwrap();

    assert!(gen.is_finished());
    let max = gen.scores.max_series();
    assert_eq!(max.len(), 6);
    for w in max.windows(2) {
        assert!(w[1].1 >= w[0].1, "max fell from {} to {}", w[0].1, w[1].1);
    }
}

#[test]
fn test_mutation_keeps_graph_integrity() {
    let mut rng = ChaCha8Rng::seed_from_u64(1234);
    let evo = EvolutionConfig::default();
    let mut g = BodyPartGraph::random(&evo, &NetworkConfig::default(), &mut rng);
    g.fixup(&mut rng).unwrap();
    for step in 0..100 {
        g.mutate(1.0, false, evo.max_genotype_parts, &mut rng).unwrap();
        if let Err(e) = g.sanity_check() {
            panic!("step {}: {}", step, e);
        }
        assert!(g.len() <= evo.max_genotype_parts);
        for part in &g.parts {
            assert!(part.edges.iter().all(|e| e.child < g.len()));
        }
    }
}

#[test]
fn test_steady_state_with_ten_workers() {
    let config = coordinated_config("steady", GaKind::SteadyState, 5, 10);
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let gen = run_threaded(store.clone(), &config, &PartCount, 10).unwrap();

    assert!(gen.is_finished());
    assert!(gen.left_to_eval().is_empty());
    assert_eq!(gen.individuals.len(), 5);
    assert_eq!(gen.individuals.iter().filter(|i| i.score.is_some()).count(), 5);
    assert!(gen.individuals.iter().all(|i| i.busy <= 2));

    let (_, stored) = store.get("steady").unwrap().unwrap();
    assert_eq!(stored, gen);
}

#[test]
fn test_signal_log_shape() {
    let mut g = hinge_chain(3, false);
    let path = std::env::temp_dir().join("morphevo_test_integration_trace.tsv");
    let file = std::fs::File::create(&path).unwrap();
    let outcome = Simulator::new(&vacuum_config(0.5))
        .run(&mut g, 3, Some(Box::new(file)))
        .unwrap();

    let trace = Trace::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(trace.rows.len() as u64, outcome.ticks);
    assert_eq!(trace.columns[0], "time");
    // one hinge motor and one joint axis on each non-root part
    let nodes = NetworkConfig::default().nodes;
    assert_eq!(trace.columns.len(), 1 + 3 * (nodes + 1) + 2 * (1 + 1));
    let time = trace.column("time").unwrap();
    assert!(time.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn test_file_store_threaded_run() {
    let dir = std::env::temp_dir().join("morphevo_test_integration_store");
    std::fs::remove_dir_all(&dir).ok();
    let config = coordinated_config("filerun", GaKind::Elite, 3, 2);
    let store: Arc<dyn ObjectStore> = Arc::new(FileStore::open(&dir).unwrap());
    let gen = run_threaded(store.clone(), &config, &PartCount, 2).unwrap();
    assert!(gen.is_finished());
    assert_eq!(gen.generation, 2);

    let reopened = store::connect(&format!("file://{}", dir.display())).unwrap();
    let (_, loaded) = reopened.get("filerun").unwrap().unwrap();
    assert_eq!(loaded.generation, 2);
    assert!(loaded.is_finished());

    assert!(reopened.pack_upto(chrono::Utc::now() + chrono::Duration::hours(1)).unwrap() > 0);
    assert!(reopened.get("filerun").unwrap().is_some());
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_pole_scores_do_not_depend_on_worker_count() {
    let mut config = coordinated_config("pole", GaKind::Elite, 4, 1);
    config.sim.kind = SimKind::PoleBalance;
    config.sim.trial_time = 3.0;
    let sim = Simulator::new(&config);

    let mut local = Generation::new(&config).unwrap();
    local.evaluate_local(&sim).unwrap();

    let threaded = run_threaded(Arc::new(MemoryStore::new()), &config, &sim, 3).unwrap();

    let first: Vec<Option<f32>> = threaded.prev_gen.iter().map(|i| i.score).collect();
    let expected: Vec<Option<f32>> = local.individuals.iter().map(|i| i.score).collect();
    assert_eq!(first, expected);
}

#[test]
fn test_export_checkpoint_of_finished_run() {
    let config = coordinated_config("export", GaKind::Rank, 3, 2);
    let gen = run_threaded(Arc::new(MemoryStore::new()), &config, &PartCount, 0).unwrap();
    let path = std::env::temp_dir().join("morphevo_test_export.bin");
    Checkpoint::new("export", gen.clone()).save(&path).unwrap();
    let loaded = Checkpoint::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded.run_name, "export");
    assert_eq!(loaded.generation, gen);
    assert_eq!(loaded.generation.scores.scores.len(), 3);
}
