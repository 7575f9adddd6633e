pub mod config;
pub mod corpus;
pub mod device;
pub mod executor;
pub mod findings;
pub mod input;
pub mod mutator;
pub mod orchestrator;
pub mod pool;
pub mod report;
pub mod state;
pub mod stats;
pub mod worker;

pub use config::HivefuzzConfig;
pub use corpus::{CorpusError, SeedCorpus};
pub use device::{DeviceDescriptor, DeviceProvider, HostDevices, StaticDevices, WorkerId};
pub use executor::{CommandExecutor, CrashStatus, ExecutionOutcome, Executor, InProcessExecutor};
pub use findings::{FindingStore, OutputLayout};
pub use input::CandidateInput;
pub use mutator::{
    ModelGuided, MutationError, MutationModel, MutationStrategy, RandomBitFlip, RandomByteReplace,
    StrategyKind,
};
pub use orchestrator::{ConfigurationError, Orchestrator, OrchestratorError};
pub use pool::{DevicePool, JoinReport, PoolError, WorkerSpec};
pub use report::{ConsoleReporter, Reporter, RunSummary, StatsFileReporter};
pub use state::{RunControl, RunState};
pub use stats::{StatsError, StatsHandle, StatsRegistry, StatsSnapshot, WorkerSnapshot};
pub use worker::{Worker, WorkerExit};
