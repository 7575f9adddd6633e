use crate::input::CandidateInput;
use log::{debug, warn};
use std::any::Any;
use std::fmt;
use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

/// Default bound on a single target execution.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long to wait for the stderr reader after the target has exited.
const STDERR_GRACE: Duration = Duration::from_millis(200);
const MIN_POLL: Duration = Duration::from_millis(1);
const MAX_POLL: Duration = Duration::from_millis(50);

/// How a crashing execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashStatus {
    /// Non-zero exit code.
    Code(i32),
    /// Killed by a signal (unix).
    Signal(i32),
    /// An in-process harness panicked.
    Panic,
}

impl fmt::Display for CrashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashStatus::Code(code) => write!(f, "{code}"),
            CrashStatus::Signal(signal) => write!(f, "signal {signal}"),
            CrashStatus::Panic => f.write_str("panic"),
        }
    }
}

/// Classified result of running one candidate against the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Normal,
    Crash { status: CrashStatus, stderr: String },
    Hang,
    /// The target could not be started or an I/O step failed.
    ExecutionError(String),
}

impl ExecutionOutcome {
    pub fn is_finding(&self) -> bool {
        matches!(self, ExecutionOutcome::Crash { .. } | ExecutionOutcome::Hang)
    }
}

/// Runs one candidate input and classifies the outcome.
///
/// Implementations never fail the caller: launch and I/O problems are reported
/// as [`ExecutionOutcome::ExecutionError`].
pub trait Executor: Send {
    fn execute_sync(&mut self, input: &CandidateInput) -> ExecutionOutcome;
}

/// Executes candidates against a closure instead of a target process.
///
/// Workers in unit tests run on this, so a scripted harness can stand in for
/// a device target. A panic in the harness becomes a `Crash` with
/// [`CrashStatus::Panic`] and the panic message in place of stderr.
pub struct InProcessExecutor<F>
where
    F: Fn(&[u8]),
{
    harness: F,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&[u8]),
{
    pub fn new(harness: F) -> Self {
        Self { harness }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&[u8]) + Send,
{
    fn execute_sync(&mut self, input: &CandidateInput) -> ExecutionOutcome {
        let harness = &self.harness;
        match catch_unwind(AssertUnwindSafe(|| harness(input.as_bytes()))) {
            Ok(()) => ExecutionOutcome::Normal,
            Err(payload) => ExecutionOutcome::Crash {
                status: CrashStatus::Panic,
                stderr: panic_message(payload.as_ref()),
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "harness panicked with a non-string payload".to_string())
}

pub struct CommandExecutorConfig {
    /// Target executable.
    pub program: PathBuf,
    /// Arguments placed before the input file path.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    /// Directory holding the per-execution scratch input files.
    pub scratch_dir: PathBuf,
    /// Filename prefix of scratch files, normally the worker identity.
    pub scratch_prefix: String,
}

/// Runs an external target with the candidate written to a scratch file whose
/// path is passed as the final argument.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    fn write_scratch(&self, input: &CandidateInput) -> std::io::Result<tempfile::NamedTempFile> {
        let mut scratch = tempfile::Builder::new()
            .prefix(&format!("input_{}_", self.config.scratch_prefix))
            .suffix(".bin")
            .tempfile_in(&self.config.scratch_dir)?;
        scratch.write_all(input.as_bytes())?;
        scratch.flush()?;
        Ok(scratch)
    }

    /// Polls the child until it exits or `timeout` passes.
    ///
    /// `Ok(None)` means the child was still running at the deadline.
    fn wait_with_timeout(
        child: &mut Child,
        timeout: Duration,
    ) -> std::io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        let mut poll = MIN_POLL;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(poll.min(deadline - now));
            poll = (poll * 2).min(MAX_POLL);
        }
    }

    fn kill_and_reap(child: &mut Child) {
        // The target leads its own process group; take down anything it forked.
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
                debug!("Failed to kill process group {}: {e}", child.id());
            }
        }
        if let Err(e) = child.kill() {
            debug!("Failed to kill target process {}: {e}", child.id());
        }
        if let Err(e) = child.wait() {
            warn!("Failed to reap target process {}: {e}", child.id());
        }
    }
}

/// Drains `stderr` on a helper thread so a chatty target cannot block on a full pipe.
fn spawn_stderr_reader(mut stderr: impl Read + Send + 'static) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

fn collect_stderr(rx: Option<Receiver<Vec<u8>>>) -> String {
    rx.and_then(|rx| rx.recv_timeout(STDERR_GRACE).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn classify_exit(status: ExitStatus, stderr: String) -> ExecutionOutcome {
    if status.success() {
        return ExecutionOutcome::Normal;
    }
    let crash_status = match status.code() {
        Some(code) => CrashStatus::Code(code),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                CrashStatus::Signal(status.signal().unwrap_or(0))
            }
            #[cfg(not(unix))]
            {
                CrashStatus::Code(-1)
            }
        }
    };
    ExecutionOutcome::Crash {
        status: crash_status,
        stderr,
    }
}

impl Executor for CommandExecutor {
    fn execute_sync(&mut self, input: &CandidateInput) -> ExecutionOutcome {
        // Removed on drop, on every return path below.
        let scratch = match self.write_scratch(input) {
            Ok(f) => f,
            Err(e) => {
                return ExecutionOutcome::ExecutionError(format!(
                    "Failed to write scratch input in {:?}: {e}",
                    self.config.scratch_dir
                ));
            }
        };

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::ExecutionError(format!(
                    "Failed to spawn target {:?}: {e}",
                    self.config.program
                ));
            }
        };
        let stderr_rx = child.stderr.take().map(spawn_stderr_reader);

        let outcome = match Self::wait_with_timeout(&mut child, self.config.timeout) {
            Ok(Some(status)) => classify_exit(status, collect_stderr(stderr_rx)),
            Ok(None) => {
                Self::kill_and_reap(&mut child);
                ExecutionOutcome::Hang
            }
            Err(e) => {
                Self::kill_and_reap(&mut child);
                ExecutionOutcome::ExecutionError(format!("Error waiting for target: {e}"))
            }
        };

        if let Err(e) = scratch.close() {
            warn!("Failed to remove scratch input: {e}");
        }
        outcome
    }
}


#[cfg(all(test, unix))]
mod command_executor_tests {
    use super::*;
    use tempfile::tempdir;

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn sh_executor(script: &str, timeout: Duration, scratch_dir: PathBuf) -> CommandExecutor {
        let target_path = get_test_target_path(script);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        CommandExecutor::new(CommandExecutorConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec![target_path.to_string_lossy().into_owned()],
            timeout,
            working_dir: None,
            scratch_dir,
            scratch_prefix: "CPU_0".to_string(),
        })
    }

    fn scratch_entries(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn cmd_exec_successful_run() {
        let scratch = tempdir().unwrap();
        let mut executor =
            sh_executor("target_ok.sh", Duration::from_secs(5), scratch.path().into());
        let outcome = executor.execute_sync(&CandidateInput::from(&b"hello"[..]));
        assert_eq!(outcome, ExecutionOutcome::Normal);
        assert_eq!(scratch_entries(scratch.path()), 0, "scratch file leaked");
    }

    #[test]
    fn cmd_exec_crash_captures_status_and_stderr() {
        let scratch = tempdir().unwrap();
        let mut executor =
            sh_executor("target_crash.sh", Duration::from_secs(5), scratch.path().into());
        match executor.execute_sync(&CandidateInput::from(vec![0u8; 4])) {
            ExecutionOutcome::Crash { status, stderr } => {
                assert_eq!(status, CrashStatus::Code(1));
                assert!(stderr.contains("target crashed"), "stderr was {stderr:?}");
            }
            other => panic!("Expected Crash, got {other:?}"),
        }
        assert_eq!(scratch_entries(scratch.path()), 0, "scratch file leaked");
    }

    #[test]
    fn cmd_exec_timeout_is_a_hang() {
        let scratch = tempdir().unwrap();
        let mut executor = sh_executor(
            "target_hang.sh",
            Duration::from_millis(200),
            scratch.path().into(),
        );
        let started = Instant::now();
        let outcome = executor.execute_sync(&CandidateInput::from(vec![1u8]));
        assert_eq!(outcome, ExecutionOutcome::Hang);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(scratch_entries(scratch.path()), 0, "scratch file leaked");
    }

    /// A reparented zombie still answers `kill(pid, 0)`, so check `/proc` first.
    fn process_alive(pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => kill(Pid::from_raw(pid), None).is_ok(),
        }
    }

    #[test]
    fn cmd_exec_hang_kills_forked_children() {
        let scratch = tempdir().unwrap();
        let mut executor = sh_executor(
            "target_hang_child.sh",
            Duration::from_millis(300),
            scratch.path().into(),
        );
        let outcome = executor.execute_sync(&CandidateInput::from(vec![1u8]));
        assert_eq!(outcome, ExecutionOutcome::Hang);

        let pid_file = std::fs::read_dir(scratch.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .find(|path| path.extension().is_some_and(|ext| ext == "pid"))
            .expect("target did not record its child pid");
        let pid: i32 = std::fs::read_to_string(pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while process_alive(pid) {
            assert!(Instant::now() < deadline, "child {pid} survived the hang");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn cmd_exec_passes_input_file_path() {
        let scratch = tempdir().unwrap();
        let mut executor = sh_executor(
            "target_file_check.sh",
            Duration::from_secs(5),
            scratch.path().into(),
        );

        let ok = executor.execute_sync(&CandidateInput::from(&b"OK_FILE"[..]));
        assert_eq!(ok, ExecutionOutcome::Normal);

        match executor.execute_sync(&CandidateInput::from(&b"CRASHFILE"[..])) {
            ExecutionOutcome::Crash { status, .. } => assert_eq!(status, CrashStatus::Code(1)),
            other => panic!("Expected Crash for CRASHFILE, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_killed_by_signal_reports_signal() {
        let scratch = tempdir().unwrap();
        let mut executor =
            sh_executor("target_killed.sh", Duration::from_secs(5), scratch.path().into());
        match executor.execute_sync(&CandidateInput::from(vec![0u8])) {
            ExecutionOutcome::Crash { status, .. } => {
                assert_eq!(status, CrashStatus::Signal(9));
            }
            other => panic!("Expected Crash, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_invalid_command_is_an_execution_error() {
        let scratch = tempdir().unwrap();
        let mut executor = CommandExecutor::new(CommandExecutorConfig {
            program: PathBuf::from("./this_command_does_not_exist_ever_12345.sh"),
            args: Vec::new(),
            timeout: Duration::from_secs(1),
            working_dir: None,
            scratch_dir: scratch.path().into(),
            scratch_prefix: "CPU_0".to_string(),
        });
        match executor.execute_sync(&CandidateInput::from(vec![0u8])) {
            ExecutionOutcome::ExecutionError(msg) => {
                assert!(msg.contains("Failed to spawn target"), "msg was {msg:?}");
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
        assert_eq!(scratch_entries(scratch.path()), 0, "scratch file leaked");
    }

    #[test]
    fn cmd_exec_missing_scratch_dir_is_an_execution_error() {
        let scratch = tempdir().unwrap();
        let mut executor = sh_executor(
            "target_ok.sh",
            Duration::from_secs(1),
            scratch.path().join("missing"),
        );
        assert!(matches!(
            executor.execute_sync(&CandidateInput::from(vec![0u8])),
            ExecutionOutcome::ExecutionError(_)
        ));
    }
}
