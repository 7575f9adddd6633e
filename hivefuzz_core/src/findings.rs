use crate::device::{DeviceDescriptor, WorkerId};
use crate::executor::CrashStatus;
use crate::input::CandidateInput;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const CRASHES_DIR: &str = "crashes";
pub const HANGS_DIR: &str = "hangs";
pub const QUEUE_DIR: &str = "queue";
const ARTIFACT_EXTENSION: &str = "bin";

/// The output tree: `<root>/<device>/{crashes,hangs,queue}/`.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device_dir(&self, device: &str) -> PathBuf {
        self.root.join(device)
    }

    pub fn crash_dir(&self, device: &str) -> PathBuf {
        self.device_dir(device).join(CRASHES_DIR)
    }

    pub fn hang_dir(&self, device: &str) -> PathBuf {
        self.device_dir(device).join(HANGS_DIR)
    }

    pub fn queue_dir(&self, device: &str) -> PathBuf {
        self.device_dir(device).join(QUEUE_DIR)
    }

    /// Creates the base and per-device directories.
    ///
    /// Idempotent, and safe when several threads prepare the same device at once.
    pub fn prepare(&self, device: &DeviceDescriptor) -> io::Result<()> {
        for dir in [
            self.crash_dir(&device.name),
            self.hang_dir(&device.name),
            self.queue_dir(&device.name),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn findings(&self, device: &str) -> FindingStore {
        FindingStore {
            crash_dir: self.crash_dir(device),
            hang_dir: self.hang_dir(device),
        }
    }
}

/// Paths written for one crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashArtifact {
    pub input_path: PathBuf,
    pub log_path: PathBuf,
}

/// Persists crash and hang inputs for one device.
///
/// File names combine the worker identity with a per-worker counter, so workers
/// never write the same file; files are created once and never rewritten.
#[derive(Debug, Clone)]
pub struct FindingStore {
    crash_dir: PathBuf,
    hang_dir: PathBuf,
}

impl FindingStore {
    pub fn crash_dir(&self) -> &Path {
        &self.crash_dir
    }

    pub fn hang_dir(&self) -> &Path {
        &self.hang_dir
    }

    /// Writes the crashing input and a companion `.log` with status and stderr.
    pub fn persist_crash(
        &self,
        worker: &WorkerId,
        counter: u64,
        input: &CandidateInput,
        status: &CrashStatus,
        stderr: &str,
    ) -> io::Result<CrashArtifact> {
        let input_path = self
            .crash_dir
            .join(artifact_name("crash", worker, counter));
        write_new(&input_path, input.as_bytes())?;

        let log_path = input_path.with_extension("log");
        let log = format!(
            "Return code: {status}\nWorker: {worker}\nInput MD5: {}\n{stderr}",
            input.digest()
        );
        write_new(&log_path, log.as_bytes())?;

        Ok(CrashArtifact {
            input_path,
            log_path,
        })
    }

    /// Highest artifact counter already on disk for `worker`, or zero.
    ///
    /// A worker continues numbering after it, so a run reusing an output
    /// directory never collides with an earlier run's files.
    pub fn last_counter(&self, worker: &WorkerId) -> io::Result<u64> {
        let mut last = 0;
        for (dir, kind) in [(&self.crash_dir, "crash"), (&self.hang_dir, "hang")] {
            let prefix = format!("{kind}_{worker}_");
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                let name = entry?.file_name();
                let counter = name
                    .to_str()
                    .and_then(|name| name.strip_prefix(&prefix))
                    .and_then(|rest| rest.strip_suffix(&format!(".{ARTIFACT_EXTENSION}")))
                    .and_then(|digits| digits.parse::<u64>().ok());
                if let Some(counter) = counter {
                    last = last.max(counter);
                }
            }
        }
        Ok(last)
    }

    pub fn persist_hang(
        &self,
        worker: &WorkerId,
        counter: u64,
        input: &CandidateInput,
    ) -> io::Result<PathBuf> {
        let path = self.hang_dir.join(artifact_name("hang", worker, counter));
        write_new(&path, input.as_bytes())?;
        Ok(path)
    }
}

fn artifact_name(kind: &str, worker: &WorkerId, counter: u64) -> String {
    format!("{kind}_{worker}_{counter}.{ARTIFACT_EXTENSION}")
}

fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()
}

/// Number of persisted input artifacts (`*.bin`) in `dir`. Missing dirs count as zero.
pub fn count_artifacts(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut count = 0;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == ARTIFACT_EXTENSION) {
            count += 1;
        }
    }
    Ok(count)
}
