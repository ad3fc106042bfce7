//! Evolution engine: individuals, generations and the four GAs.

use crate::bpg::{BodyPartGraph, BpgError};
use crate::config::{Config, MutationKind};
use crate::rng;
use crate::sim::{Evaluator, SimError};
use crate::stats::{MutationStats, ScoreSummary, StatsHistory};
use chrono::{DateTime, Utc};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Genetic algorithm driving a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GaKind {
    /// Top fraction survives verbatim, the rest are mutated elite clones
    Elite,
    /// Linear-rank roulette selection
    Rank,
    /// Binary tournaments
    Tournament,
    /// No generational boundary; children replace the worst individual
    SteadyState,
}

/// A genotype plus its evaluation bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    /// Unique within a run; also keys the evaluation seed
    pub id: u64,
    pub bpg: BodyPartGraph,
    /// `None` until evaluated; -1 marks a failed evaluation
    pub score: Option<f32>,
    pub parent_fitness: Option<f32>,
    /// Mutation operators applied when this individual was bred
    pub mutations: usize,
    pub created_in_generation: u32,
    /// Workers that have reserved this individual
    pub busy: u32,
}

impl Individual {
    pub fn new(id: u64, bpg: BodyPartGraph, generation: u32) -> Self {
        Self {
            id,
            bpg,
            score: None,
            parent_fitness: None,
            mutations: 0,
            created_in_generation: generation,
            busy: 0,
        }
    }

    /// Score used for ranking; unscored individuals sort last
    pub fn fitness(&self) -> f32 {
        self.score.unwrap_or(f32::NEG_INFINITY)
    }
}

/// Errors raised by the evolution engine
#[derive(Debug)]
pub enum EvolutionError {
    /// No mutated clone differed from its parent
    MutationExhausted { retries: u32 },
    Structural(BpgError),
    EmptyPopulation,
    /// The generation still has unscored individuals
    NotReady { left: usize },
    Evaluation(SimError),
}

impl std::fmt::Display for EvolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MutationExhausted { retries } => {
                write!(f, "No mutation applied after {} attempts", retries)
            }
            Self::Structural(e) => write!(f, "{}", e),
            Self::EmptyPopulation => write!(f, "Population is empty"),
            Self::NotReady { left } => write!(f, "{} individuals still unscored", left),
            Self::Evaluation(e) => write!(f, "Evaluation error: {}", e),
        }
    }
}

impl std::error::Error for EvolutionError {}

impl From<BpgError> for EvolutionError {
    fn from(e: BpgError) -> Self {
        EvolutionError::Structural(e)
    }
}

impl From<SimError> for EvolutionError {
    fn from(e: SimError) -> Self {
        match e {
            SimError::Structural(e) => EvolutionError::Structural(e),
            other => EvolutionError::Evaluation(other),
        }
    }
}

/// Mutation settings copied out of a generation while breeding
#[derive(Debug, Clone, Copy)]
struct Breeding {
    seed: u64,
    rate: f32,
    gauss: bool,
    max_parts: usize,
    retries: u32,
}

impl Breeding {
    /// Mutated clone of `parent`; retried until at least one operator fires
    fn child(
        &self,
        parent: &Individual,
        id: u64,
        generation: u32,
    ) -> Result<(Individual, MutationStats), EvolutionError> {
        let mut rng = rng::stream(self.seed, rng::MUTATION, id);
        let retries = self.retries.max(1);
        for attempt in 0..retries {
            let mut bpg = parent.bpg.clone();
            let stats = bpg.mutate(self.rate, self.gauss, self.max_parts, &mut rng)?;
            if stats.total() > 0 {
                let child = Individual {
                    id,
                    bpg,
                    score: None,
                    parent_fitness: parent.score,
                    mutations: stats.total(),
                    created_in_generation: generation,
                    busy: 0,
                };
                return Ok((child, stats));
            }
            log::trace!("breed: clone {} of {} unchanged (attempt {})", id, parent.id, attempt + 1);
        }
        Err(EvolutionError::MutationExhausted { retries })
    }
}

/// A population plus everything the master and workers share about a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub individuals: Vec<Individual>,
    /// Generation index; in steady-state, the number of children processed
    pub generation: u32,
    pub final_generation: u32,
    /// Snapshot of the previous generation
    pub prev_gen: Vec<Individual>,
    pub scores: StatsHistory,
    /// Mutations applied while breeding the current generation
    pub mutation_stats: MutationStats,
    pub ga: GaKind,
    pub mutation_rate: f32,
    pub mutation_kind: MutationKind,
    pub elite_fraction: f32,
    pub max_parts: usize,
    pub max_retries: u32,
    pub seed: u64,
    pub next_id: u64,
    /// Steady-state exchange: evaluated children keyed by worker host
    pub scratch: BTreeMap<String, Vec<Individual>>,
    pub paused: bool,
    pub finished: bool,
    pub updated_at: DateTime<Utc>,
}

impl Generation {
    /// Fresh random population with every individual unscored
    pub fn new(config: &Config) -> Result<Self, EvolutionError> {
        let evo = &config.evolution;
        if evo.population == 0 {
            return Err(EvolutionError::EmptyPopulation);
        }
        let mut rng = rng::stream(config.run.seed, rng::INIT, 0);
        let mut individuals = Vec::with_capacity(evo.population);
        for id in 0..evo.population as u64 {
            let mut bpg = BodyPartGraph::random(evo, &config.network, &mut rng);
            bpg.fixup(&mut rng)?;
            individuals.push(Individual::new(id, bpg, 0));
        }
        log::info!(
            "Created generation of {} individuals ({:?} GA)",
            individuals.len(),
            evo.ga
        );
        Ok(Self {
            individuals,
            generation: 0,
            final_generation: evo.final_generation,
            prev_gen: Vec::new(),
            scores: StatsHistory::new(),
            mutation_stats: MutationStats::default(),
            ga: evo.ga,
            mutation_rate: evo.mutation_rate,
            mutation_kind: evo.mutation_kind,
            elite_fraction: evo.elite_fraction,
            max_parts: evo.max_genotype_parts,
            max_retries: evo.max_mutation_retries,
            seed: config.run.seed,
            next_id: evo.population as u64,
            scratch: BTreeMap::new(),
            paused: false,
            finished: false,
            updated_at: Utc::now(),
        })
    }

    fn breeding(&self) -> Breeding {
        Breeding {
            seed: self.seed,
            rate: self.mutation_rate,
            gauss: self.mutation_kind.is_gauss(),
            max_parts: self.max_parts,
            retries: self.max_retries,
        }
    }

    /// Indices of individuals still waiting for a score
    pub fn left_to_eval(&self) -> Vec<usize> {
        self.individuals
            .iter()
            .enumerate()
            .filter(|(_, ind)| ind.score.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Best-scored individual
    pub fn best(&self) -> Option<&Individual> {
        self.individuals
            .iter()
            .filter(|ind| ind.score.is_some())
            .max_by(|a, b| {
                a.fitness()
                    .partial_cmp(&b.fitness())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Indices sorted best first
    pub fn ranked(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.individuals.len()).collect();
        order.sort_by(|&a, &b| {
            self.individuals[b]
                .fitness()
                .partial_cmp(&self.individuals[a].fitness())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order
    }

    /// Reserve an unscored individual, preferring the least busy.
    ///
    /// Individuals whose busy counter reached `busy_limit` are skipped.
    pub fn reserve(&mut self, busy_limit: u32) -> Option<usize> {
        let index = self
            .left_to_eval()
            .into_iter()
            .filter(|&i| self.individuals[i].busy < busy_limit)
            .min_by_key(|&i| self.individuals[i].busy)?;
        self.individuals[index].busy += 1;
        self.updated_at = Utc::now();
        Some(index)
    }

    /// Store a score if slot `index` still holds individual `id` unscored
    pub fn record_score(&mut self, index: usize, id: u64, score: f32) -> bool {
        match self.individuals.get_mut(index) {
            Some(ind) if ind.id == id && ind.score.is_none() => {
                ind.score = Some(score);
                self.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Evaluate every unscored individual in parallel
    pub fn evaluate_local(&mut self, evaluator: &dyn Evaluator) -> Result<usize, EvolutionError> {
        let seed = self.seed;
        let results: Vec<Result<(), SimError>> = self
            .individuals
            .par_iter_mut()
            .filter(|ind| ind.score.is_none())
            .map(|ind| {
                let score = evaluator.evaluate(&mut ind.bpg, rng::seed(seed, rng::EVAL, ind.id))?;
                ind.score = Some(score);
                Ok(())
            })
            .collect();
        let count = results.len();
        for result in results {
            result?;
        }
        if count > 0 {
            self.updated_at = Utc::now();
        }
        Ok(count)
    }

    /// Append the current generation's summary to the history
    pub fn record_summary(&mut self) -> ScoreSummary {
        let scores: Vec<Option<f32>> = self.individuals.iter().map(|i| i.score).collect();
        let summary = ScoreSummary::from_scores(self.generation, &scores);
        self.scores.record(summary.clone(), self.mutation_stats);
        summary
    }

    /// One master pass.
    ///
    /// Generational GAs breed the next generation once every individual is
    /// scored; steady-state absorbs deposited children. Returns whether the
    /// generation changed.
    pub fn master_step(&mut self) -> Result<bool, EvolutionError> {
        if self.finished || self.paused {
            return Ok(false);
        }
        if self.ga == GaKind::SteadyState {
            let absorbed = self.absorb();
            if self.generation >= self.final_generation && self.left_to_eval().is_empty() {
                self.finish();
                return Ok(true);
            }
            return Ok(absorbed > 0);
        }
        if !self.left_to_eval().is_empty() {
            return Ok(false);
        }
        if self.generation >= self.final_generation {
            self.finish();
        } else {
            self.advance()?;
        }
        Ok(true)
    }

    fn finish(&mut self) {
        let summary = self.record_summary();
        log::info!("Run finished: {}", summary.summary());
        self.finished = true;
        self.updated_at = Utc::now();
    }

    /// Summarise, then replace the population with the next generation
    pub fn advance(&mut self) -> Result<(), EvolutionError> {
        if self.individuals.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }
        let left = self.left_to_eval().len();
        if left > 0 {
            return Err(EvolutionError::NotReady { left });
        }
        let summary = self.record_summary();
        log::debug!("{}", summary.summary());

        let mut rng = rng::stream(self.seed, rng::GA, self.generation as u64);
        self.mutation_stats = MutationStats::default();
        let next = match self.ga {
            GaKind::Elite => self.breed_elite()?,
            GaKind::Rank => self.breed_rank(&mut rng)?,
            GaKind::Tournament => self.breed_tournament(&mut rng)?,
            GaKind::SteadyState => return Ok(()),
        };
        self.prev_gen = std::mem::replace(&mut self.individuals, next);
        self.generation += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn breed_child(&mut self, parent: usize) -> Result<Individual, EvolutionError> {
        let id = self.next_id;
        self.next_id += 1;
        let (child, stats) =
            self.breeding()
                .child(&self.individuals[parent], id, self.generation + 1)?;
        self.mutation_stats += stats;
        Ok(child)
    }

    fn breed_elite(&mut self) -> Result<Vec<Individual>, EvolutionError> {
        let n = self.individuals.len();
        let ranked = self.ranked();
        let elites = ((n as f32 * self.elite_fraction) as usize).clamp(1, n);
        let mut next: Vec<Individual> = ranked[..elites]
            .iter()
            .map(|&i| {
                let mut elite = self.individuals[i].clone();
                elite.busy = 0;
                elite
            })
            .collect();
        let mut k = 0;
        while next.len() < n {
            next.push(self.breed_child(ranked[k % elites])?);
            k += 1;
        }
        Ok(next)
    }

    fn breed_rank<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Vec<Individual>, EvolutionError> {
        let n = self.individuals.len();
        let ranked = self.ranked();
        let total = (n * (n + 1)) as f32;
        let mut next = Vec::with_capacity(n);
        for _ in 0..n {
            let mut draw = rng.gen::<f32>();
            let mut pick = ranked[n - 1];
            for (r, &i) in ranked.iter().enumerate() {
                let p = 2.0 * (n - r) as f32 / total;
                if draw < p {
                    pick = i;
                    break;
                }
                draw -= p;
            }
            next.push(self.breed_child(pick)?);
        }
        Ok(next)
    }

    fn breed_tournament<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> Result<Vec<Individual>, EvolutionError> {
        let n = self.individuals.len();
        let mut next = Vec::with_capacity(n);
        for _ in 0..n {
            let a = rng.gen_range(0..n);
            let b = rng.gen_range(0..n);
            let winner = if self.individuals[a].fitness() >= self.individuals[b].fitness() {
                a
            } else {
                b
            };
            next.push(self.breed_child(winner)?);
        }
        Ok(next)
    }

    /// Steady-state: mutate a clone of a random scored parent.
    ///
    /// Returns `None` while nothing has been scored yet.
    pub fn steady_state_child(&mut self) -> Result<Option<Individual>, EvolutionError> {
        if self.individuals.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }
        let scored: Vec<usize> = (0..self.individuals.len())
            .filter(|&i| self.individuals[i].score.is_some())
            .collect();
        if scored.is_empty() {
            return Ok(None);
        }
        let id = self.next_id;
        self.next_id += 1;
        let mut rng = rng::stream(self.seed, rng::GA, id);
        let parent = scored[rng.gen_range(0..scored.len())];
        let (child, stats) = self
            .breeding()
            .child(&self.individuals[parent], id, self.generation)?;
        self.mutation_stats += stats;
        Ok(Some(child))
    }

    /// Leave an evaluated child for the master
    pub fn deposit(&mut self, host: &str, child: Individual) {
        self.scratch.entry(host.to_string()).or_default().push(child);
        self.updated_at = Utc::now();
    }

    /// Steady-state master pass over every deposited child.
    ///
    /// Each child fills an unscored, unreserved slot if there is one, and
    /// otherwise replaces the globally worst individual when it scores
    /// higher. Individuals older than three population turnovers are
    /// queued for re-evaluation. Returns the number of children processed.
    pub fn absorb(&mut self) -> usize {
        let children: Vec<Individual> = std::mem::take(&mut self.scratch)
            .into_values()
            .flatten()
            .collect();
        let n = self.individuals.len() as u32;
        let mut processed = 0;
        for mut child in children {
            if self.generation >= self.final_generation {
                break;
            }
            child.busy = 0;
            let open = self
                .individuals
                .iter()
                .position(|ind| ind.score.is_none() && ind.busy == 0);
            let target = match open {
                Some(i) => Some(i),
                None => self
                    .ranked()
                    .last()
                    .copied()
                    .filter(|&worst| child.fitness() > self.individuals[worst].fitness()),
            };
            if let Some(i) = target {
                log::debug!(
                    "steady-state: child {} ({:.4}) replaces {}",
                    child.id,
                    child.fitness(),
                    self.individuals[i].id
                );
                self.individuals[i] = child;
            }
            processed += 1;
            self.generation += 1;

            for ind in &mut self.individuals {
                if self.generation.saturating_sub(ind.created_in_generation) > 3 * n && ind.score.is_some() {
                    ind.score = None;
                    ind.busy = 0;
                    ind.created_in_generation = self.generation;
                }
            }
            if n > 0 && self.generation % n == 0 {
                let summary = self.record_summary();
                self.mutation_stats = MutationStats::default();
                log::debug!("{}", summary.summary());
            }
        }
        if processed > 0 {
            self.updated_at = Utc::now();
        }
        processed
    }

    /// Evaluate and breed in-process until the run finishes
    pub fn run_local(&mut self, evaluator: &dyn Evaluator, stats_interval: u32) -> Result<(), EvolutionError> {
        let interval = stats_interval.max(1);
        while !self.finished {
            self.evaluate_local(evaluator)?;
            if self.ga == GaKind::SteadyState && self.generation < self.final_generation {
                let mut children = Vec::new();
                for _ in 0..self.individuals.len() {
                    if let Some(child) = self.steady_state_child()? {
                        children.push(child);
                    }
                }
                let seed = self.seed;
                children
                    .par_iter_mut()
                    .map(|child| -> Result<(), SimError> {
                        let score =
                            evaluator.evaluate(&mut child.bpg, rng::seed(seed, rng::EVAL, child.id))?;
                        child.score = Some(score);
                        Ok(())
                    })
                    .collect::<Result<Vec<()>, SimError>>()?;
                for child in children {
                    self.deposit("local", child);
                }
            }
            let before = self.scores.scores.len();
            self.master_step()?;
            if self.scores.scores.len() > before {
                if let Some(summary) = self.scores.scores.last() {
                    if summary.generation % interval == 0 || self.finished {
                        log::info!("{}", summary.summary());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores by part count; never fails
    struct PartCount;

    impl Evaluator for PartCount {
        fn evaluate(&self, genotype: &mut BodyPartGraph, _seed: u64) -> Result<f32, SimError> {
            Ok(genotype.len() as f32)
        }
    }

    fn config(ga: GaKind, population: usize, final_generation: u32) -> Config {
        let mut config = Config::default();
        config.evolution.ga = ga;
        config.evolution.population = population;
        config.evolution.final_generation = final_generation;
        config.evolution.mutation_rate = 0.05;
        config
    }

    #[test]
    fn test_new_generation_is_unscored() {
        let gen = Generation::new(&config(GaKind::Elite, 6, 3)).unwrap();
        assert_eq!(gen.individuals.len(), 6);
        assert_eq!(gen.left_to_eval().len(), 6);
        assert_eq!(gen.next_id, 6);
        assert!(gen.individuals.iter().all(|i| i.bpg.sanity_check().is_ok()));
    }

    #[test]
    fn test_empty_population_rejected() {
        assert!(matches!(
            Generation::new(&config(GaKind::Elite, 0, 3)),
            Err(EvolutionError::EmptyPopulation)
        ));
    }

    #[test]
    fn test_advance_requires_scores() {
        let mut gen = Generation::new(&config(GaKind::Elite, 4, 3)).unwrap();
        assert!(matches!(gen.advance(), Err(EvolutionError::NotReady { left: 4 })));
    }

    #[test]
    fn test_elite_keeps_best_and_scores() {
        let mut gen = Generation::new(&config(GaKind::Elite, 5, 3)).unwrap();
        for (i, ind) in gen.individuals.iter_mut().enumerate() {
            ind.score = Some(i as f32);
        }
        let best_id = gen.individuals[4].id;
        gen.advance().unwrap();
        assert_eq!(gen.generation, 1);
        assert_eq!(gen.individuals.len(), 5);
        assert_eq!(gen.individuals[0].id, best_id);
        assert_eq!(gen.individuals[0].score, Some(4.0));
        assert_eq!(gen.left_to_eval().len(), 4);
        assert!(gen.individuals[1..].iter().all(|i| i.mutations > 0));
        assert!(gen.individuals[1..].iter().all(|i| i.parent_fitness == Some(4.0)));
        assert_eq!(gen.prev_gen.len(), 5);
        assert_eq!(gen.scores.scores[0].max, 4.0);
    }

    #[test]
    fn test_rank_and_tournament_replace_everyone() {
        for ga in [GaKind::Rank, GaKind::Tournament] {
            let mut gen = Generation::new(&config(ga, 4, 3)).unwrap();
            gen.evaluate_local(&PartCount).unwrap();
            gen.advance().unwrap();
            assert_eq!(gen.left_to_eval().len(), 4);
            assert!(gen.individuals.iter().all(|i| i.id >= 4));
            assert!(gen.mutation_stats.total() > 0);
        }
    }

    #[test]
    fn test_reserve_prefers_least_busy() {
        let mut gen = Generation::new(&config(GaKind::Elite, 3, 3)).unwrap();
        let first = gen.reserve(2).unwrap();
        let second = gen.reserve(2).unwrap();
        assert_ne!(first, second);
        for _ in 0..10 {
            gen.reserve(2);
        }
        assert!(gen.individuals.iter().all(|i| i.busy <= 2));
        assert!(gen.reserve(2).is_none());
    }

    #[test]
    fn test_stale_score_is_dropped() {
        let mut gen = Generation::new(&config(GaKind::Elite, 3, 3)).unwrap();
        assert!(!gen.record_score(0, 99, 1.0));
        assert!(gen.record_score(0, gen.individuals[0].id, 1.0));
        assert!(!gen.record_score(0, gen.individuals[0].id, 2.0));
        assert_eq!(gen.individuals[0].score, Some(1.0));
    }

    #[test]
    fn test_run_local_elite_is_monotone() {
        let mut gen = Generation::new(&config(GaKind::Elite, 4, 5)).unwrap();
        gen.run_local(&PartCount, 1).unwrap();
        assert!(gen.is_finished());
        assert_eq!(gen.generation, 5);
        let max = gen.scores.max_series();
        assert_eq!(max.len(), 6);
        assert!(max.windows(2).all(|w| w[1].1 >= w[0].1));
    }

    #[test]
    fn test_steady_state_replaces_worst() {
        let mut gen = Generation::new(&config(GaKind::SteadyState, 3, 100)).unwrap();
        for (i, ind) in gen.individuals.iter_mut().enumerate() {
            ind.score = Some(i as f32);
        }
        let mut child = gen.steady_state_child().unwrap().unwrap();
        child.score = Some(10.0);
        let child_id = child.id;
        gen.deposit("a", child);
        let mut loser = gen.steady_state_child().unwrap().unwrap();
        loser.score = Some(-1.0);
        gen.deposit("b", loser);

        assert_eq!(gen.absorb(), 2);
        assert!(gen.scratch.is_empty());
        assert_eq!(gen.generation, 2);
        let ids: Vec<u64> = gen.individuals.iter().map(|i| i.id).collect();
        assert!(ids.contains(&child_id));
        assert!(!ids.contains(&0));
        assert_eq!(gen.individuals.len(), 3);
    }

    #[test]
    fn test_steady_state_clears_old_scores() {
        let mut gen = Generation::new(&config(GaKind::SteadyState, 2, 100)).unwrap();
        for ind in &mut gen.individuals {
            ind.score = Some(1.0);
        }
        for _ in 0..7 {
            let mut child = gen.steady_state_child().unwrap().unwrap();
            child.score = Some(0.0);
            gen.deposit("a", child);
            gen.absorb();
        }
        assert_eq!(gen.generation, 7);
        assert!(!gen.left_to_eval().is_empty());
    }

    #[test]
    fn test_run_local_steady_state_finishes() {
        let mut gen = Generation::new(&config(GaKind::SteadyState, 3, 9)).unwrap();
        gen.run_local(&PartCount, 1).unwrap();
        assert!(gen.is_finished());
        assert!(gen.left_to_eval().is_empty());
        assert_eq!(gen.generation, 9);
    }
}
