use crate::config::HivefuzzConfig;
use crate::corpus::{CorpusError, SeedCorpus, seed_files};
use crate::device::{DeviceDescriptor, DeviceProvider, MAX_PRIORITY, WorkerId};
use crate::executor::{CommandExecutor, CommandExecutorConfig, Executor};
use crate::findings::{OutputLayout, count_artifacts};
use crate::mutator::{
    ModelGuided, MutationModel, MutationStrategy, RandomBitFlip, RandomByteReplace, StrategyKind,
};
use crate::pool::{DevicePool, PoolError, WorkerSpec};
use crate::report::{CrashDirListing, Reporter, RunSummary};
use crate::state::{RunControl, RunState};
use crate::stats::StatsRegistry;
use crate::worker::Worker;
use log::{error, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Fatal startup problems. Reported before any worker starts.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Fuzzing target not found: {0:?}")]
    TargetMissing(PathBuf),
    #[error("Fuzzing target is not executable: {0:?}")]
    TargetNotExecutable(PathBuf),
    #[error("Seed directory not found: {0:?}")]
    SeedDirMissing(PathBuf),
    #[error("Seed directory {dir:?} contains no seed files{}", extension_hint(.extension))]
    NoSeedFiles {
        dir: PathBuf,
        extension: Option<String>,
    },
    #[error("Failed to load seeds: {0}")]
    Corpus(#[from] CorpusError),
    #[error("No devices to fuzz on")]
    NoDevices,
    #[error("Invalid device name {0:?}")]
    InvalidDeviceName(String),
    #[error("Device {device} has priority {priority}, maximum is {MAX_PRIORITY}")]
    InvalidPriority { device: String, priority: u8 },
    #[error("Device {0} is configured more than once")]
    DuplicateDevice(String),
    #[error("Configured devices request zero workers in total")]
    NoWorkers,
    #[error("Invalid setting {name}: must be greater than zero")]
    InvalidSetting { name: &'static str },
}

fn extension_hint(extension: &Option<String>) -> String {
    extension
        .as_ref()
        .map(|ext| format!(" matching *.{ext}"))
        .unwrap_or_default()
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Run cannot start from state {0}")]
    NotIdle(RunState),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Builds the target executor for one worker.
pub type ExecutorFactory = Box<dyn Fn(&WorkerSpec) -> Box<dyn Executor> + Send>;

/// Owns a whole fuzzing run, from validation to final summary.
pub struct Orchestrator {
    config: HivefuzzConfig,
    devices: Vec<DeviceDescriptor>,
    corpus: Arc<SeedCorpus>,
    layout: OutputLayout,
    control: RunControl,
    stats: Arc<StatsRegistry>,
    executor_factory: Option<ExecutorFactory>,
    model: Option<Arc<dyn MutationModel>>,
}

impl Orchestrator {
    /// Validates `config` and resolves the device list.
    ///
    /// Devices listed in the config take precedence over `provider`.
    pub fn new(
        config: HivefuzzConfig,
        provider: &dyn DeviceProvider,
    ) -> Result<Self, ConfigurationError> {
        validate_settings(&config)?;
        validate_target(&config.target.path)?;

        let extension = config.corpus.extension();
        let seed_dir = &config.corpus.seed_dir;
        if !seed_dir.is_dir() {
            return Err(ConfigurationError::SeedDirMissing(seed_dir.clone()));
        }
        if seed_files(seed_dir, extension)?.is_empty() {
            return Err(ConfigurationError::NoSeedFiles {
                dir: seed_dir.clone(),
                extension: extension.map(str::to_string),
            });
        }
        let corpus = SeedCorpus::load(seed_dir, extension)?;

        let mut devices = if config.devices.is_empty() {
            provider.available_devices()
        } else {
            config.device_descriptors()
        };
        if config.fuzzer.cpu_only {
            devices.retain(DeviceDescriptor::is_cpu);
        }
        validate_devices(&devices)?;

        Ok(Self {
            layout: OutputLayout::new(&config.output.dir),
            config,
            devices,
            corpus: Arc::new(corpus),
            control: RunControl::new(),
            stats: Arc::new(StatsRegistry::new()),
            executor_factory: None,
            model: None,
        })
    }

    /// Replaces the default external-process executor.
    pub fn with_executor_factory(mut self, factory: ExecutorFactory) -> Self {
        self.executor_factory = Some(factory);
        self
    }

    /// Makes the `model-guided` strategy available.
    pub fn with_mutation_model(mut self, model: Arc<dyn MutationModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn config(&self) -> &HivefuzzConfig {
        &self.config
    }

    /// Handle for requesting shutdown from elsewhere, e.g. a signal handler.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn stats(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.stats)
    }

    /// Runs until shutdown is requested or the duration limit passes, then
    /// joins the workers and returns the final summary.
    ///
    /// A stop requested before the run starts launches no workers and still
    /// hands an empty summary to every reporter.
    pub fn run(self, reporters: &mut [&mut dyn Reporter]) -> Result<RunSummary, OrchestratorError> {
        match self.control.start() {
            Ok(()) => {}
            Err(RunState::Stopping | RunState::Stopped) => {
                info!("Stop requested before fuzzing started");
                self.control.mark_stopped();
                return Ok(self.finish(Duration::ZERO, Vec::new(), reporters));
            }
            Err(state) => return Err(OrchestratorError::NotIdle(state)),
        }
        let started_at = Instant::now();

        info!("Detected devices:");
        for device in &self.devices {
            info!(
                "  - {} ({}): {} instances (priority {})",
                device.name, device.device_id, device.instances, device.priority
            );
        }
        info!(
            "Target {:?}, {} seeds, {} strategy, output in {:?}",
            self.config.target.path,
            self.corpus.len(),
            self.config.fuzzer.strategy,
            self.layout.root()
        );

        let mut pool = DevicePool::new(self.devices.clone(), self.layout.clone());
        match pool.start(|spec| self.build_worker(spec)) {
            Ok(started) => info!("Started {started} fuzzing workers"),
            Err(e) => {
                error!("Failed to start workers: {e}");
                pool.stop(&self.control, self.config.fuzzer.join_timeout());
                self.control.mark_stopped();
                return Err(e.into());
            }
        }

        self.reporting_loop(started_at, reporters);

        info!("Stopping fuzzing workers...");
        let joined = pool.stop(&self.control, self.config.fuzzer.join_timeout());
        self.control.mark_stopped();
        if !joined.abandoned.is_empty() {
            warn!(
                "{} workers did not stop within the join timeout",
                joined.abandoned.len()
            );
        }

        let mut abandoned_workers = joined.abandoned;
        abandoned_workers.extend(joined.panicked);
        Ok(self.finish(started_at.elapsed(), abandoned_workers, reporters))
    }

    fn finish(
        &self,
        runtime: Duration,
        abandoned_workers: Vec<WorkerId>,
        reporters: &mut [&mut dyn Reporter],
    ) -> RunSummary {
        let summary = self.summarize(runtime, abandoned_workers);
        for reporter in reporters.iter_mut() {
            if let Err(e) = reporter.finish(&summary) {
                warn!("Reporter failed to write final summary: {e:#}");
            }
        }
        summary
    }

    fn reporting_loop(&self, started_at: Instant, reporters: &mut [&mut dyn Reporter]) {
        let interval = self.config.fuzzer.report_interval();
        let limit = self.config.fuzzer.duration();
        let mut next_report = started_at + interval;

        loop {
            let now = Instant::now();
            let mut wake = next_report;
            if let Some(limit) = limit {
                let end = started_at + limit;
                if now >= end {
                    info!("Run time limit of {limit:?} reached");
                    self.control.request_stop();
                    return;
                }
                wake = wake.min(end);
            }
            if !self
                .control
                .sleep_while_running(wake.saturating_duration_since(now))
            {
                return;
            }
            if Instant::now() < next_report {
                continue;
            }
            next_report += interval;

            if let Err(e) = self.corpus.reload() {
                warn!("Failed to refresh seeds: {e}");
            }
            let snapshot = self.stats.snapshot();
            let elapsed = started_at.elapsed();
            for reporter in reporters.iter_mut() {
                if let Err(e) = reporter.report(&snapshot, elapsed) {
                    warn!("Reporter failed: {e:#}");
                }
            }
        }
    }

    fn build_worker(&self, spec: &WorkerSpec) -> Result<Worker, PoolError> {
        let stats = self.stats.register(spec.id.clone(), &spec.device.name)?;
        let executor = match &self.executor_factory {
            Some(factory) => factory(spec),
            None => Box::new(CommandExecutor::new(CommandExecutorConfig {
                program: self.config.target.path.clone(),
                args: self.config.target.args.clone(),
                timeout: self.config.target.timeout(),
                working_dir: self.config.target.working_dir.clone(),
                scratch_dir: spec.device_dir.clone(),
                scratch_prefix: spec.id.to_string(),
            })),
        };
        let rng = worker_rng(self.config.fuzzer.rng_seed, spec.ordinal);
        let strategy = build_strategy(
            self.config.fuzzer.strategy,
            self.model.as_ref(),
            rng,
            &spec.id,
        );
        Ok(Worker::new(
            strategy,
            executor,
            Arc::clone(&self.corpus),
            self.layout.findings(&spec.device.name),
            stats,
            self.control.clone(),
            self.config.fuzzer.batch_size,
        ))
    }

    fn summarize(&self, runtime: Duration, abandoned_workers: Vec<WorkerId>) -> RunSummary {
        let snapshot = self.stats.snapshot();
        let mut crash_dirs = Vec::new();
        for device in &self.devices {
            let dir = self.layout.crash_dir(&device.name);
            match count_artifacts(&dir) {
                Ok(0) => {}
                Ok(crashes) => crash_dirs.push(CrashDirListing { dir, crashes }),
                Err(e) => warn!("Failed to list crash directory {dir:?}: {e}"),
            }
        }
        RunSummary {
            runtime,
            total_iterations: snapshot.total_iterations,
            total_crashes: snapshot.total_crashes,
            total_hangs: snapshot.total_hangs,
            crash_dirs,
            abandoned_workers,
            final_snapshot: snapshot,
        }
    }
}

fn worker_rng(base_seed: Option<u64>, ordinal: usize) -> ChaCha8Rng {
    match base_seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(ordinal as u64)),
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    }
}

fn build_strategy(
    kind: StrategyKind,
    model: Option<&Arc<dyn MutationModel>>,
    rng: ChaCha8Rng,
    id: &WorkerId,
) -> Box<dyn MutationStrategy> {
    match (kind, model) {
        (StrategyKind::BitFlip, _) => Box::new(RandomBitFlip::new(rng)),
        (StrategyKind::ByteReplace, _) => Box::new(RandomByteReplace::new(rng)),
        (StrategyKind::ModelGuided, Some(model)) => {
            Box::new(ModelGuided::new(Arc::clone(model), rng))
        }
        (StrategyKind::ModelGuided, None) => {
            warn!("Worker {id}: no mutation model available, using bit-flip mutation");
            Box::new(RandomBitFlip::new(rng))
        }
    }
}

fn validate_settings(config: &HivefuzzConfig) -> Result<(), ConfigurationError> {
    let checks = [
        ("fuzzer.batch-size", config.fuzzer.batch_size as u64),
        ("fuzzer.report-interval-ms", config.fuzzer.report_interval_ms),
        ("target.timeout-ms", config.target.timeout_ms),
    ];
    for (name, value) in checks {
        if value == 0 {
            return Err(ConfigurationError::InvalidSetting { name });
        }
    }
    Ok(())
}

fn validate_target(path: &Path) -> Result<(), ConfigurationError> {
    if !path.is_file() {
        return Err(ConfigurationError::TargetMissing(path.to_path_buf()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)
            .map_err(|_| ConfigurationError::TargetMissing(path.to_path_buf()))?
            .permissions()
            .mode();
        if mode & 0o111 == 0 {
            return Err(ConfigurationError::TargetNotExecutable(path.to_path_buf()));
        }
    }
    Ok(())
}

fn validate_devices(devices: &[DeviceDescriptor]) -> Result<(), ConfigurationError> {
    if devices.is_empty() {
        return Err(ConfigurationError::NoDevices);
    }
    let mut seen = HashSet::new();
    for device in devices {
        let name = device.name.as_str();
        // The name becomes a directory under the output root.
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(ConfigurationError::InvalidDeviceName(device.name.clone()));
        }
        if device.priority > MAX_PRIORITY {
            return Err(ConfigurationError::InvalidPriority {
                device: device.name.clone(),
                priority: device.priority,
            });
        }
        if !seen.insert(name) {
            return Err(ConfigurationError::DuplicateDevice(device.name.clone()));
        }
    }
    if devices.iter().all(|d| d.instances == 0) {
        return Err(ConfigurationError::NoWorkers);
    }
    Ok(())
}
