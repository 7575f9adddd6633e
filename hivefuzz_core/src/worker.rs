use crate::corpus::SeedCorpus;
use crate::device::WorkerId;
use crate::executor::{ExecutionOutcome, Executor};
use crate::findings::FindingStore;
use crate::input::CandidateInput;
use crate::mutator::{MutationError, MutationStrategy};
use crate::state::RunControl;
use crate::stats::StatsHandle;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Minimum wall time between executions-per-second recomputations.
const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Pause before retrying after the seed pool turned out to be empty.
const NO_SEEDS_BACKOFF: Duration = Duration::from_millis(500);

/// Final counters of a worker that left its loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub id: WorkerId,
    pub iterations: u64,
}

/// Executions counted since the last rate recomputation.
#[derive(Debug)]
struct RateWindow {
    started: Instant,
    executions: u64,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            executions: 0,
        }
    }

    /// Counts one execution; returns a fresh rate once the window has elapsed.
    fn tick(&mut self) -> Option<f64> {
        self.executions += 1;
        let elapsed = self.started.elapsed();
        if elapsed < RATE_WINDOW {
            return None;
        }
        let rate = self.executions as f64 / elapsed.as_secs_f64();
        *self = Self::new();
        Some(rate)
    }
}

/// One independent fuzzing stream for a `(device, instance)` pair.
pub struct Worker {
    id: WorkerId,
    strategy: Box<dyn MutationStrategy>,
    executor: Box<dyn Executor>,
    corpus: Arc<SeedCorpus>,
    findings: FindingStore,
    stats: StatsHandle,
    control: RunControl,
    batch_size: usize,
    iterations: u64,
    /// Artifact counters continue after this value.
    artifact_base: u64,
    rate: RateWindow,
    starved: bool,
}

impl Worker {
    pub fn new(
        strategy: Box<dyn MutationStrategy>,
        executor: Box<dyn Executor>,
        corpus: Arc<SeedCorpus>,
        findings: FindingStore,
        stats: StatsHandle,
        control: RunControl,
        batch_size: usize,
    ) -> Self {
        let id = stats.id().clone();
        let artifact_base = findings.last_counter(&id).unwrap_or_else(|e| {
            warn!("Worker {id}: failed to scan existing findings: {e}");
            0
        });
        Self {
            id,
            strategy,
            executor,
            corpus,
            findings,
            stats,
            control,
            batch_size: batch_size.max(1),
            iterations: 0,
            artifact_base,
            rate: RateWindow::new(),
            starved: false,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Fuzzes until the run leaves `Running`.
    pub fn run(mut self) -> WorkerExit {
        debug!(
            "Worker {} started with {} strategy",
            self.id,
            self.strategy.name()
        );
        while self.control.is_running() {
            let seeds = self.corpus.snapshot();
            match self.strategy.generate(&seeds, self.batch_size) {
                Ok(batch) => {
                    if self.starved {
                        info!("Worker {}: seeds available again", self.id);
                        self.starved = false;
                    }
                    self.execute_batch(batch);
                }
                Err(MutationError::NoSeeds) => self.wait_for_seeds(),
            }
        }
        self.stats.set_execs_per_sec(0.0);
        debug!("Worker {} stopped after {} iterations", self.id, self.iterations);
        WorkerExit {
            id: self.id,
            iterations: self.iterations,
        }
    }

    fn wait_for_seeds(&mut self) {
        if !self.starved {
            warn!(
                "Worker {}: no usable seeds in {:?}, retrying",
                self.id,
                self.corpus.dir()
            );
            self.starved = true;
        }
        // Nothing executes while starved.
        self.rate = RateWindow::new();
        self.stats.set_execs_per_sec(0.0);
        if !self.control.sleep_while_running(NO_SEEDS_BACKOFF) {
            return;
        }
        if let Err(e) = self.corpus.reload() {
            warn!("Worker {}: failed to reload seeds: {e}", self.id);
        }
    }

    /// Executes candidates in order, stopping early once the run leaves `Running`.
    ///
    /// Returns the number of candidates executed.
    pub fn execute_batch(&mut self, batch: Vec<CandidateInput>) -> usize {
        let mut executed = 0;
        for input in batch {
            if !self.control.is_running() {
                break;
            }
            let outcome = self.executor.execute_sync(&input);
            self.iterations += 1;
            self.stats.add_iterations(1);
            self.record_outcome(&input, outcome);
            if let Some(rate) = self.rate.tick() {
                self.stats.set_execs_per_sec(rate);
            }
            executed += 1;
        }
        executed
    }

    fn record_outcome(&mut self, input: &CandidateInput, outcome: ExecutionOutcome) {
        let counter = self.artifact_base + self.iterations;
        match outcome {
            ExecutionOutcome::Normal => {}
            ExecutionOutcome::Crash { status, stderr } => {
                self.stats.record_crash();
                match self
                    .findings
                    .persist_crash(&self.id, counter, input, &status, &stderr)
                {
                    Ok(artifact) => debug!(
                        "Worker {}: crash (return code {status}) saved to {:?}",
                        self.id, artifact.input_path
                    ),
                    Err(e) => error!("Worker {}: failed to persist crash input: {e}", self.id),
                }
            }
            ExecutionOutcome::Hang => {
                self.stats.record_hang();
                match self.findings.persist_hang(&self.id, counter, input) {
                    Ok(path) => debug!("Worker {}: hang saved to {path:?}", self.id),
                    Err(e) => error!("Worker {}: failed to persist hang input: {e}", self.id),
                }
            }
            ExecutionOutcome::ExecutionError(msg) => {
                error!("Error in {}: {msg}", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptor;
    use crate::executor::{CrashStatus, InProcessExecutor};
    use crate::findings::{OutputLayout, count_artifacts};
    use crate::mutator::RandomBitFlip;
    use crate::stats::StatsRegistry;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::{TempDir, tempdir};

    /// Replays a fixed outcome for every input.
    struct FixedOutcome(ExecutionOutcome);

    impl Executor for FixedOutcome {
        fn execute_sync(&mut self, _input: &CandidateInput) -> ExecutionOutcome {
            self.0.clone()
        }
    }

    struct Fixture {
        _out: TempDir,
        layout: OutputLayout,
        registry: StatsRegistry,
        control: RunControl,
    }

    impl Fixture {
        fn new() -> Self {
            let out = tempdir().unwrap();
            let layout = OutputLayout::new(out.path());
            layout
                .prepare(&DeviceDescriptor::new("CPU", "CPU", 1, 5))
                .unwrap();
            let control = RunControl::new();
            control.start().unwrap();
            Self {
                _out: out,
                layout,
                registry: StatsRegistry::new(),
                control,
            }
        }

        fn worker(&self, executor: Box<dyn Executor>, seeds: Vec<Vec<u8>>) -> Worker {
            let stats = self
                .registry
                .register(WorkerId::new("CPU", 0), "CPU")
                .unwrap();
            Worker::new(
                Box::new(RandomBitFlip::new(ChaCha8Rng::seed_from_u64(0))),
                executor,
                Arc::new(SeedCorpus::from_seeds(seeds)),
                self.layout.findings("CPU"),
                stats,
                self.control.clone(),
                DEFAULT_BATCH_SIZE,
            )
        }
    }

    fn candidates(n: usize) -> Vec<CandidateInput> {
        (0..n).map(|i| CandidateInput::from(vec![i as u8; 4])).collect()
    }

    #[test]
    fn five_crashes_produce_five_artifact_pairs() {
        let fixture = Fixture::new();
        let crash = ExecutionOutcome::Crash {
            status: CrashStatus::Code(1),
            stderr: "segfault\n".to_string(),
        };
        let mut worker = fixture.worker(Box::new(FixedOutcome(crash)), vec![vec![0; 4]]);

        let inputs = candidates(5);
        assert_eq!(worker.execute_batch(inputs.clone()), 5);

        let snapshot = fixture.registry.snapshot();
        assert_eq!(snapshot.workers[0].crashes, 5);
        assert_eq!(snapshot.workers[0].iterations, 5);
        assert!(snapshot.workers[0].last_finding_ms.is_some());

        let crash_dir = fixture.layout.crash_dir("CPU");
        assert_eq!(count_artifacts(&crash_dir).unwrap(), 5);
        for (i, input) in inputs.iter().enumerate() {
            let stem = format!("crash_CPU_0_{}", i + 1);
            let bytes = fs::read(crash_dir.join(format!("{stem}.bin"))).unwrap();
            assert_eq!(bytes, input.as_bytes());
            let log = fs::read_to_string(crash_dir.join(format!("{stem}.log"))).unwrap();
            assert!(log.starts_with("Return code: 1\n"));
        }
    }

    #[test]
    fn rerun_into_same_output_keeps_every_crash() {
        let fixture = Fixture::new();
        let crash = ExecutionOutcome::Crash {
            status: CrashStatus::Code(1),
            stderr: String::new(),
        };
        let crash_dir = fixture.layout.crash_dir("CPU");

        let mut first = fixture.worker(Box::new(FixedOutcome(crash.clone())), vec![vec![0; 4]]);
        first.execute_batch(vec![CandidateInput::from(&b"FIRST"[..])]);
        drop(first);

        let registry = StatsRegistry::new();
        let stats = registry.register(WorkerId::new("CPU", 0), "CPU").unwrap();
        let mut second = Worker::new(
            Box::new(RandomBitFlip::new(ChaCha8Rng::seed_from_u64(0))),
            Box::new(FixedOutcome(crash)),
            Arc::new(SeedCorpus::from_seeds(vec![vec![0; 4]])),
            fixture.layout.findings("CPU"),
            stats,
            fixture.control.clone(),
            DEFAULT_BATCH_SIZE,
        );
        second.execute_batch(vec![CandidateInput::from(&b"SECOND"[..])]);

        assert_eq!(registry.snapshot().total_crashes, 1);
        assert_eq!(count_artifacts(&crash_dir).unwrap(), 2);
        assert_eq!(fs::read(crash_dir.join("crash_CPU_0_1.bin")).unwrap(), b"FIRST");
        assert_eq!(fs::read(crash_dir.join("crash_CPU_0_2.bin")).unwrap(), b"SECOND");
    }

    #[test]
    fn hang_is_persisted_and_counted_once() {
        let fixture = Fixture::new();
        let mut worker =
            fixture.worker(Box::new(FixedOutcome(ExecutionOutcome::Hang)), vec![vec![0; 4]]);

        let input = CandidateInput::from(&b"SLOW"[..]);
        worker.execute_batch(vec![input.clone()]);

        let snapshot = fixture.registry.snapshot();
        assert_eq!(snapshot.workers[0].iterations, 1);
        assert_eq!(snapshot.workers[0].hangs, 1);
        assert_eq!(snapshot.workers[0].crashes, 0);
        let saved = fs::read(fixture.layout.hang_dir("CPU").join("hang_CPU_0_1.bin")).unwrap();
        assert_eq!(saved, input.as_bytes());
    }

    #[test]
    fn normal_and_error_outcomes_persist_nothing_but_still_count() {
        let fixture = Fixture::new();
        let error = ExecutionOutcome::ExecutionError("spawn failed".to_string());
        let mut worker = fixture.worker(Box::new(FixedOutcome(error)), vec![vec![0; 4]]);
        worker.execute_batch(candidates(3));

        let snapshot = fixture.registry.snapshot();
        assert_eq!(snapshot.workers[0].iterations, 3);
        assert_eq!(snapshot.total_crashes + snapshot.total_hangs, 0);
        assert_eq!(count_artifacts(&fixture.layout.crash_dir("CPU")).unwrap(), 0);
        assert_eq!(count_artifacts(&fixture.layout.hang_dir("CPU")).unwrap(), 0);
    }

    #[test]
    fn batch_is_abandoned_once_stop_is_requested() {
        let fixture = Fixture::new();
        let control = fixture.control.clone();
        let executed = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&executed);
        let executor = InProcessExecutor::new(move |_data: &[u8]| {
            if seen.fetch_add(1, Ordering::SeqCst) == 1 {
                control.request_stop();
            }
        });
        let mut worker = fixture.worker(Box::new(executor), vec![vec![0; 4]]);

        assert_eq!(worker.execute_batch(candidates(10)), 2);
        assert_eq!(executed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn iterations_match_executor_invocations() {
        let fixture = Fixture::new();
        let control = fixture.control.clone();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let executor = InProcessExecutor::new(move |_data: &[u8]| {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 95 {
                control.request_stop();
            }
        });
        let worker = fixture.worker(Box::new(executor), vec![b"seed".to_vec()]);

        let exit = worker.run();
        assert_eq!(exit.iterations, 95);
        assert_eq!(calls.load(Ordering::SeqCst), 95);
        assert_eq!(fixture.registry.snapshot().total_iterations, 95);
    }

    #[test]
    fn empty_seed_pool_idles_without_executing() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let executor = InProcessExecutor::new(move |_data: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let worker = fixture.worker(Box::new(executor), vec![Vec::new()]);

        let stopper = fixture.control.clone();
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(200));
        stopper.request_stop();

        let exit = handle.join().unwrap();
        assert_eq!(exit.iterations, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn starved_worker_reports_zero_rate() {
        let fixture = Fixture::new();
        let mut worker =
            fixture.worker(Box::new(FixedOutcome(ExecutionOutcome::Normal)), Vec::new());
        worker.stats.set_execs_per_sec(500.0);

        worker.wait_for_seeds();

        assert!(worker.starved);
        assert_eq!(fixture.registry.snapshot().workers[0].execs_per_sec, 0.0);
    }

    #[test]
    fn rate_is_cleared_when_the_worker_exits() {
        let fixture = Fixture::new();
        let control = fixture.control.clone();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let executor = InProcessExecutor::new(move |_data: &[u8]| {
            if counter.fetch_add(1, Ordering::SeqCst) == 3 {
                control.request_stop();
            }
        });
        let worker = fixture.worker(Box::new(executor), vec![b"seed".to_vec()]);
        worker.stats.set_execs_per_sec(123.0);
        worker.run();

        let snapshot = fixture.registry.snapshot();
        assert_eq!(snapshot.workers[0].execs_per_sec, 0.0);
        assert_eq!(snapshot.total_execs_per_sec, 0.0);
    }

    #[test]
    fn rate_window_reports_after_one_second() {
        let mut window = RateWindow::new();
        assert_eq!(window.tick(), None);
        window.started -= RATE_WINDOW;
        let rate = window.tick().unwrap();
        assert!(rate > 0.0 && rate <= 2.0, "rate was {rate}");
        assert_eq!(window.executions, 0);
    }
}
