//! Performance benchmarks for MORPHEVO

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use morphevo::checkpoint::Checkpoint;
use morphevo::config::{EvolutionConfig, NetworkConfig};
use morphevo::neural::{Network, NodeKind, UpdateStyle};
use morphevo::{rng, BodyPartGraph, Config, Generation};

fn benchmark_network_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("network_step");

    for kind in [NodeKind::Sigmoid, NodeKind::Beer, NodeKind::Srm, NodeKind::Logical] {
        for style in [UpdateStyle::Sync, UpdateStyle::Async] {
            let config = NetworkConfig {
                node_kind: kind,
                update_style: style,
                nodes: 12,
                ..NetworkConfig::default()
            };
            let mut r = rng::stream(42, rng::NETWORK, 0);
            let mut net = Network::random(&config, &mut r);
            net.reset(&mut r);

            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", kind), format!("{:?}", style)),
                &style,
                |b, _| {
                    b.iter(|| {
                        net.step(&mut r);
                    });
                },
            );
        }
    }

    group.finish();
}

fn random_genotype(seed: u64) -> BodyPartGraph {
    let mut r = rng::stream(seed, rng::INIT, 0);
    let evo = EvolutionConfig {
        initial_parts: 4,
        ..EvolutionConfig::default()
    };
    let mut g = BodyPartGraph::random(&evo, &NetworkConfig::default(), &mut r);
    for part in &mut g.parts {
        part.recursive_limit = 2;
    }
    g
}

fn benchmark_unroll(c: &mut Criterion) {
    let g = random_genotype(7);

    c.bench_function("bpg_unroll", |b| {
        b.iter(|| black_box(&g).unroll(false));
    });

    c.bench_function("bpg_unroll_skip_network", |b| {
        b.iter(|| black_box(&g).unroll(true));
    });
}

fn benchmark_mutation(c: &mut Criterion) {
    let g = random_genotype(9);
    let max_parts = EvolutionConfig::default().max_genotype_parts;

    c.bench_function("bpg_mutation", |b| {
        let mut r = rng::stream(9, rng::MUTATION, 0);
        b.iter(|| {
            let mut clone = g.clone();
            clone.mutate(0.05, false, max_parts, &mut r)
        });
    });
}

fn benchmark_checkpoint(c: &mut Criterion) {
    let mut config = Config::default();
    config.evolution.population = 50;
    let gen = match Generation::new(&config) {
        Ok(gen) => gen,
        Err(e) => panic!("generation: {}", e),
    };
    let checkpoint = Checkpoint::new("bench", gen);

    c.bench_function("checkpoint_serialize", |b| {
        b.iter(|| black_box(&checkpoint).to_bytes().unwrap());
    });

    let serialized = checkpoint.to_bytes().unwrap();

    c.bench_function("checkpoint_deserialize", |b| {
        b.iter(|| Checkpoint::from_bytes(black_box(&serialized)).unwrap());
    });
}

criterion_group!(
    benches,
    benchmark_network_step,
    benchmark_unroll,
    benchmark_mutation,
    benchmark_checkpoint,
);

criterion_main!(benches);
