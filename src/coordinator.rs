//! Master and worker roles over a shared [`ObjectStore`].
//!
//! The master advances the generation once every individual is scored (or,
//! in steady-state, absorbs deposited children). Workers reserve unscored
//! individuals through the busy counter, evaluate them and write the score
//! back. Every write goes through a transaction that is retried on conflict.

use crate::config::{Config, CoordinatorConfig};
use crate::evolution::{EvolutionError, GaKind, Generation, Individual};
use crate::rng;
use crate::sim::{Evaluator, SimError};
use crate::stats::ScoreSummary;
use crate::store::{self, ObjectStore, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Errors that stop a master or worker
#[derive(Debug)]
pub enum CoordinatorError {
    Store(StoreError),
    Evolution(EvolutionError),
    /// Conflicts kept coming after the configured number of retries
    ConflictLimit { retries: u32 },
    /// The run does not exist in the store
    MissingRun(String),
    /// A role thread panicked
    Thread(String),
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Store error: {}", e),
            Self::Evolution(e) => write!(f, "Evolution error: {}", e),
            Self::ConflictLimit { retries } => {
                write!(f, "Gave up after {} conflicting commits", retries)
            }
            Self::MissingRun(name) => write!(f, "Run '{}' not found in store", name),
            Self::Thread(msg) => write!(f, "Thread failed: {}", msg),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<EvolutionError> for CoordinatorError {
    fn from(e: EvolutionError) -> Self {
        Self::Evolution(e)
    }
}

impl From<SimError> for CoordinatorError {
    fn from(e: SimError) -> Self {
        Self::Evolution(e.into())
    }
}

/// Work a worker picked up in one transaction
enum Job {
    Score {
        index: usize,
        id: u64,
        individual: Individual,
    },
    Child(Individual),
}

/// Handle on one run in one store; cloned into each role thread
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn ObjectStore>,
    run: String,
    settings: CoordinatorConfig,
    stats_interval: u32,
    shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn ObjectStore>, config: &Config) -> Self {
        Self {
            store,
            run: config.run.name.clone(),
            settings: config.coordinator.clone(),
            stats_interval: config.logging.stats_interval.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Ask every role sharing this handle to return at its next check
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn idle(&self) {
        std::thread::sleep(Duration::from_millis(self.settings.idle_sleep_ms));
    }

    /// Current generation of the run
    pub fn load(&self) -> Result<(u64, Generation), CoordinatorError> {
        self.store.sync()?;
        self.store
            .get(&self.run)?
            .ok_or_else(|| CoordinatorError::MissingRun(self.run.clone()))
    }

    /// Store a fresh random generation under the run name
    pub fn create(&self, config: &Config) -> Result<u64, CoordinatorError> {
        let generation = Generation::new(config)?;
        let version = self.store.commit(&self.run, &generation, None)?;
        log::info!("Created run '{}' (version {})", self.run, version);
        Ok(version)
    }

    /// Create the run unless it already exists
    pub fn create_or_resume(&self, config: &Config) -> Result<(), CoordinatorError> {
        self.store.sync()?;
        if self.store.get(&self.run)?.is_some() {
            log::info!("Resuming run '{}'", self.run);
            return Ok(());
        }
        self.create(config).map(|_| ())
    }

    /// Transaction with conflict retries; `edit` returning `None` aborts
    fn transact<T>(
        &self,
        edit: impl FnMut(&mut Generation) -> Option<T>,
    ) -> Result<Option<T>, CoordinatorError> {
        let retries = self.settings.conflict_retries;
        let backoff = Duration::from_millis(self.settings.idle_sleep_ms.min(100));
        match store::update(&*self.store, &self.run, retries, backoff, edit) {
            Err(e) if e.is_conflict() => Err(CoordinatorError::ConflictLimit { retries }),
            Err(StoreError::NotFound(_)) => Err(CoordinatorError::MissingRun(self.run.clone())),
            other => Ok(other?),
        }
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), CoordinatorError> {
        self.transact(|gen| {
            gen.paused = paused;
            Some(())
        })?;
        log::info!("Run '{}' {}", self.run, if paused { "paused" } else { "resumed" });
        Ok(())
    }

    /// One master step committed to the store.
    ///
    /// Returns the summary recorded by the step, if any, and whether the run
    /// is finished. `None` means nothing changed.
    pub fn master_pass(&self) -> Result<Option<(bool, Option<ScoreSummary>)>, CoordinatorError> {
        let mut failure = None;
        let outcome = self.transact(|gen| {
            let before = gen.scores.scores.len();
            match gen.master_step() {
                Ok(true) => {
                    let summary = if gen.scores.scores.len() > before {
                        gen.scores.scores.last().cloned()
                    } else {
                        None
                    };
                    Some((gen.is_finished(), summary))
                }
                Ok(false) => None,
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(e.into());
        }
        Ok(outcome)
    }

    /// Master loop; returns the finished generation
    pub fn master(&self) -> Result<Generation, CoordinatorError> {
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        log::info!("Master started for run '{}'", self.run);
        loop {
            if self.is_shut_down() {
                log::info!("Master stopping on shutdown");
                return Ok(self.load()?.1);
            }
            let (_, gen) = self.load()?;
            if gen.is_finished() {
                return Ok(gen);
            }
            if gen.paused {
                std::thread::sleep(poll);
                continue;
            }
            match self.master_pass()? {
                Some((finished, summary)) => {
                    if let Some(summary) = summary {
                        if summary.generation % self.stats_interval == 0 || finished {
                            log::info!("{}", summary.summary());
                        }
                    }
                    if finished {
                        return Ok(self.load()?.1);
                    }
                }
                None => std::thread::sleep(poll),
            }
        }
    }

    /// Reserve an individual, or in steady-state allocate a child
    fn claim(&self) -> Result<Option<Job>, CoordinatorError> {
        let busy_limit = self.settings.busy_limit;
        let mut failure = None;
        let job = self.transact(|gen| {
            if gen.is_finished() || gen.paused {
                return None;
            }
            if let Some(index) = gen.reserve(busy_limit) {
                let individual = gen.individuals[index].clone();
                return Some(Job::Score {
                    index,
                    id: individual.id,
                    individual,
                });
            }
            if gen.ga != GaKind::SteadyState || gen.generation >= gen.final_generation {
                return None;
            }
            match gen.steady_state_child() {
                Ok(child) => child.map(Job::Child),
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(e.into());
        }
        Ok(job)
    }

    /// Worker loop; returns the number of evaluations performed
    pub fn worker(&self, evaluator: &dyn Evaluator, host: &str) -> Result<usize, CoordinatorError> {
        log::info!("Worker '{}' started for run '{}'", host, self.run);
        let mut evaluations = 0;
        loop {
            if self.is_shut_down() {
                return Ok(evaluations);
            }
            let (_, gen) = self.load()?;
            if gen.is_finished() {
                log::info!("Worker '{}' done after {} evaluations", host, evaluations);
                return Ok(evaluations);
            }
            if gen.paused {
                self.idle();
                continue;
            }
            let seed = gen.seed;
            match self.claim()? {
                Some(Job::Score {
                    index,
                    id,
                    mut individual,
                }) => {
                    let score = evaluator.evaluate(&mut individual.bpg, rng::seed(seed, rng::EVAL, id))?;
                    log::debug!("{}: individual {} scored {:.4}", host, id, score);
                    let recorded = self.transact(|gen| {
                        if gen.record_score(index, id, score) {
                            gen.individuals[index].bpg = individual.bpg.clone();
                            Some(())
                        } else {
                            None
                        }
                    })?;
                    if recorded.is_none() {
                        log::debug!("{}: score for {} arrived late, dropped", host, id);
                    }
                    evaluations += 1;
                }
                Some(Job::Child(mut child)) => {
                    let score = evaluator.evaluate(&mut child.bpg, rng::seed(seed, rng::EVAL, child.id))?;
                    log::debug!("{}: child {} scored {:.4}", host, child.id, score);
                    child.score = Some(score);
                    let deposited = self.transact(|gen| {
                        if gen.is_finished() || gen.generation >= gen.final_generation {
                            return None;
                        }
                        gen.deposit(host, child.clone());
                        Some(())
                    })?;
                    if deposited.is_none() {
                        log::debug!("{}: run ended before child {} was deposited", host, child.id);
                    }
                    evaluations += 1;
                }
                None => self.idle(),
            }
        }
    }
}

/// Create or resume the run, then drive it to completion on this host.
///
/// With `workers == 0` the population is evaluated in-process with rayon
/// and the result committed once; otherwise a master thread and `workers`
/// worker threads share the store.
pub fn run_threaded(
    store: Arc<dyn ObjectStore>,
    config: &Config,
    evaluator: &dyn Evaluator,
    workers: usize,
) -> Result<Generation, CoordinatorError> {
    let coordinator = Coordinator::new(store, config);
    coordinator.create_or_resume(config)?;

    if workers == 0 {
        let (version, mut gen) = coordinator.load()?;
        gen.run_local(evaluator, config.logging.stats_interval)?;
        coordinator
            .store
            .commit(&config.run.name, &gen, Some(version))?;
        return Ok(gen);
    }

    std::thread::scope(|scope| {
        let master = {
            let c = coordinator.clone();
            scope.spawn(move || {
                let result = c.master();
                if result.is_err() {
                    c.shutdown();
                }
                result
            })
        };
        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let c = coordinator.clone();
                scope.spawn(move || {
                    let result = c.worker(evaluator, &format!("local-{}", i));
                    if result.is_err() {
                        c.shutdown();
                    }
                    result
                })
            })
            .collect();

        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    log::error!("Worker failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    coordinator.shutdown();
                    first_error.get_or_insert(CoordinatorError::Thread("worker panicked".to_string()));
                }
            }
        }
        let result = match master.join() {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::Thread("master panicked".to_string())),
        };
        match (result, first_error) {
            (_, Some(e)) => Err(e),
            (result, None) => result,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpg::BodyPartGraph;
    use crate::store::MemoryStore;

    struct PartCount;

    impl Evaluator for PartCount {
        fn evaluate(&self, genotype: &mut BodyPartGraph, _seed: u64) -> Result<f32, SimError> {
            Ok(genotype.len() as f32)
        }
    }

    fn config(ga: GaKind, population: usize, final_generation: u32) -> Config {
        let mut config = Config::default();
        config.run.name = "test".to_string();
        config.evolution.ga = ga;
        config.evolution.population = population;
        config.evolution.final_generation = final_generation;
        config.coordinator.poll_interval_ms = 1;
        config.coordinator.idle_sleep_ms = 1;
        config.coordinator.conflict_retries = 1000;
        config
    }

    #[test]
    fn test_missing_run() {
        let c = Coordinator::new(Arc::new(MemoryStore::new()), &config(GaKind::Elite, 2, 1));
        assert!(matches!(c.load(), Err(CoordinatorError::MissingRun(_))));
        assert!(matches!(c.set_paused(true), Err(CoordinatorError::MissingRun(_))));
    }

    #[test]
    fn test_create_twice_conflicts() {
        let cfg = config(GaKind::Elite, 2, 1);
        let c = Coordinator::new(Arc::new(MemoryStore::new()), &cfg);
        c.create(&cfg).unwrap();
        assert!(matches!(c.create(&cfg), Err(CoordinatorError::Store(e)) if e.is_conflict()));
        c.create_or_resume(&cfg).unwrap();
    }

    #[test]
    fn test_master_waits_for_scores() {
        let cfg = config(GaKind::Elite, 3, 2);
        let c = Coordinator::new(Arc::new(MemoryStore::new()), &cfg);
        c.create(&cfg).unwrap();
        assert!(c.master_pass().unwrap().is_none());

        let (version, mut gen) = c.load().unwrap();
        gen.evaluate_local(&PartCount).unwrap();
        c.store().commit("test", &gen, Some(version)).unwrap();
        let (finished, summary) = c.master_pass().unwrap().unwrap();
        assert!(!finished);
        assert_eq!(summary.unwrap().generation, 0);
        assert_eq!(c.load().unwrap().1.generation, 1);
    }

    #[test]
    fn test_paused_run_is_left_alone() {
        let cfg = config(GaKind::Elite, 2, 2);
        let c = Coordinator::new(Arc::new(MemoryStore::new()), &cfg);
        c.create(&cfg).unwrap();
        c.set_paused(true).unwrap();
        assert!(c.claim().unwrap().is_none());
        c.set_paused(false).unwrap();
        assert!(matches!(c.claim().unwrap(), Some(Job::Score { .. })));
    }

    #[test]
    fn test_threaded_elite_run_finishes() {
        let cfg = config(GaKind::Elite, 4, 3);
        let gen = run_threaded(Arc::new(MemoryStore::new()), &cfg, &PartCount, 3).unwrap();
        assert!(gen.is_finished());
        assert_eq!(gen.generation, 3);
        assert_eq!(gen.scores.scores.len(), 4);
        assert!(gen.left_to_eval().is_empty());
    }

    #[test]
    fn test_local_run_commits_result() {
        let cfg = config(GaKind::Tournament, 3, 2);
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let gen = run_threaded(store.clone(), &cfg, &PartCount, 0).unwrap();
        assert!(gen.is_finished());
        let (version, stored) = store.get("test").unwrap().unwrap();
        assert_eq!(version, 2);
        assert_eq!(stored, gen);
    }

    #[test]
    fn test_worker_exits_on_finished_run() {
        let cfg = config(GaKind::Elite, 2, 1);
        let c = Coordinator::new(Arc::new(MemoryStore::new()), &cfg);
        c.create(&cfg).unwrap();
        c.transact(|gen| {
            gen.finished = true;
            Some(())
        })
        .unwrap();
        assert_eq!(c.worker(&PartCount, "w").unwrap(), 0);
    }
}
