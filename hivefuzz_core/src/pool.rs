use crate::device::{DeviceDescriptor, WorkerId};
use crate::findings::OutputLayout;
use crate::state::RunControl;
use crate::stats::StatsError;
use crate::worker::{Worker, WorkerExit};
use log::{error, warn};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default bound on how long shutdown waits for each worker.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(2000);
const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to create output directory for device {device}: {source}")]
    OutputDir {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to spawn worker thread {id}: {source}")]
    Spawn {
        id: WorkerId,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error("Failed to build worker {id}: {reason}")]
    Build { id: WorkerId, reason: String },
}

/// Everything needed to build one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub device: DeviceDescriptor,
    /// Position of this worker across all devices, starting at zero.
    pub ordinal: usize,
    /// `<output>/<device>`, where scratch inputs are written.
    pub device_dir: PathBuf,
}

struct RunningWorker {
    id: WorkerId,
    handle: JoinHandle<WorkerExit>,
}

/// Outcome of stopping the pool.
#[derive(Debug, Default)]
pub struct JoinReport {
    pub joined: Vec<WorkerExit>,
    /// Workers still running at the join deadline; their threads are detached.
    pub abandoned: Vec<WorkerId>,
    pub panicked: Vec<WorkerId>,
}

impl JoinReport {
    pub fn all_joined(&self) -> bool {
        self.abandoned.is_empty() && self.panicked.is_empty()
    }
}

/// Maps devices to groups of worker threads and starts and stops them together.
pub struct DevicePool {
    devices: Vec<DeviceDescriptor>,
    layout: OutputLayout,
    workers: Vec<RunningWorker>,
}

impl DevicePool {
    pub fn new(devices: Vec<DeviceDescriptor>, layout: OutputLayout) -> Self {
        Self {
            devices,
            layout,
            workers: Vec::new(),
        }
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Total workers the configured devices ask for.
    pub fn planned_workers(&self) -> usize {
        self.devices.iter().map(|d| d.instances).sum()
    }

    pub fn running_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id.clone()).collect()
    }

    /// Creates every device's output directories. Safe to call repeatedly.
    pub fn prepare(&self) -> Result<(), PoolError> {
        for device in &self.devices {
            self.layout
                .prepare(device)
                .map_err(|source| PoolError::OutputDir {
                    device: device.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Prepares directories, builds `instances` workers per device with `build`,
    /// and runs each on its own thread.
    ///
    /// On error the workers already started keep running; the caller stops the pool.
    pub fn start<F>(&mut self, mut build: F) -> Result<usize, PoolError>
    where
        F: FnMut(&WorkerSpec) -> Result<Worker, PoolError>,
    {
        self.prepare()?;
        let mut ordinal = 0;
        for device in &self.devices {
            for id in device.worker_ids() {
                let spec = WorkerSpec {
                    id: id.clone(),
                    device: device.clone(),
                    ordinal,
                    device_dir: self.layout.device_dir(&device.name),
                };
                ordinal += 1;

                let worker = build(&spec)?;
                let handle = thread::Builder::new()
                    .name(format!("fuzz-{id}"))
                    .spawn(move || worker.run())
                    .map_err(|source| PoolError::Spawn {
                        id: id.clone(),
                        source,
                    })?;
                self.workers.push(RunningWorker { id, handle });
            }
        }
        Ok(self.workers.len())
    }

    /// Signals `Stopping` and joins each worker, waiting at most `join_timeout`.
    ///
    /// Workers not finished by the deadline are abandoned, not killed; their
    /// in-flight execution is still bounded by the executor timeout.
    pub fn stop(&mut self, control: &RunControl, join_timeout: Duration) -> JoinReport {
        control.request_stop();
        let deadline = Instant::now() + join_timeout;
        let mut report = JoinReport::default();

        for worker in self.workers.drain(..) {
            while !worker.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !worker.handle.is_finished() {
                warn!(
                    "Worker {} did not stop within {join_timeout:?}, abandoning it",
                    worker.id
                );
                report.abandoned.push(worker.id);
                continue;
            }
            match worker.handle.join() {
                Ok(exit) => report.joined.push(exit),
                Err(_) => {
                    error!("Worker {} panicked", worker.id);
                    report.panicked.push(worker.id);
                }
            }
        }
        report
    }
}
