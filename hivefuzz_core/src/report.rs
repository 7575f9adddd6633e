use crate::device::WorkerId;
use crate::stats::StatsSnapshot;
use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STATS_FILE_NAME: &str = "fuzzer_stats.json";
const RULE_WIDTH: usize = 80;

/// Crash artifacts found in one device's crash directory at shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashDirListing {
    pub dir: PathBuf,
    pub crashes: usize,
}

/// Final result of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub runtime: Duration,
    pub total_iterations: u64,
    pub total_crashes: u64,
    pub total_hangs: u64,
    /// Only directories holding at least one crash artifact.
    pub crash_dirs: Vec<CrashDirListing>,
    pub abandoned_workers: Vec<WorkerId>,
    pub final_snapshot: StatsSnapshot,
}

impl RunSummary {
    /// Iterations per second over the whole run.
    pub fn average_speed(&self) -> f64 {
        let secs = self.runtime.as_secs_f64();
        if secs > 0.0 {
            self.total_iterations as f64 / secs
        } else {
            0.0
        }
    }
}

/// Receives periodic snapshots and the final summary.
///
/// Errors are logged by the orchestrator and never stop the run.
pub trait Reporter: Send {
    fn report(&mut self, snapshot: &StatsSnapshot, elapsed: Duration) -> anyhow::Result<()>;

    fn finish(&mut self, summary: &RunSummary) -> anyhow::Result<()>;
}

/// Human-readable live table and final summary. Display only.
pub struct ConsoleReporter<W: Write + Send = io::Stdout> {
    out: W,
}

impl ConsoleReporter<io::Stdout> {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl Default for ConsoleReporter<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn with_writer(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Reporter for ConsoleReporter<W> {
    fn report(&mut self, snapshot: &StatsSnapshot, elapsed: Duration) -> anyhow::Result<()> {
        let out = &mut self.out;
        let rule = "=".repeat(RULE_WIDTH);
        writeln!(out)?;
        writeln!(out, "{rule}")?;
        writeln!(out, "Distributed Fuzzing - Live Statistics")?;
        writeln!(out, "{rule}")?;
        writeln!(out, "Runtime: {}", format_hms(elapsed))?;
        writeln!(out)?;
        writeln!(
            out,
            "Total Iterations: {}",
            group_thousands(snapshot.total_iterations)
        )?;
        writeln!(out, "Exec Speed: {:.1} execs/sec", snapshot.total_execs_per_sec)?;
        writeln!(out, "Unique Crashes: {}", snapshot.total_crashes)?;
        writeln!(out, "Unique Hangs: {}", snapshot.total_hangs)?;
        writeln!(out)?;
        writeln!(
            out,
            "{:<20} {:<12} {:<12} {:<10} {:<10}",
            "Worker", "Iterations", "Execs/sec", "Crashes", "Hangs"
        )?;
        writeln!(out, "{}", "-".repeat(RULE_WIDTH))?;
        for worker in &snapshot.workers {
            writeln!(
                out,
                "{:<20} {:<12} {:<12.1} {:<10} {:<10}",
                worker.worker,
                group_thousands(worker.iterations),
                worker.execs_per_sec,
                worker.crashes,
                worker.hangs
            )?;
        }
        out.flush()?;
        Ok(())
    }

    fn finish(&mut self, summary: &RunSummary) -> anyhow::Result<()> {
        let out = &mut self.out;
        let rule = "=".repeat(RULE_WIDTH);
        writeln!(out)?;
        writeln!(out, "{rule}")?;
        writeln!(out, "Final Fuzzing Statistics")?;
        writeln!(out, "{rule}")?;
        writeln!(out, "Total Runtime: {:.1} seconds", summary.runtime.as_secs_f64())?;
        writeln!(
            out,
            "Total Iterations: {}",
            group_thousands(summary.total_iterations)
        )?;
        writeln!(out, "Average Speed: {:.1} execs/sec", summary.average_speed())?;
        writeln!(out, "Total Unique Crashes: {}", summary.total_crashes)?;
        writeln!(out, "Total Unique Hangs: {}", summary.total_hangs)?;
        writeln!(out)?;

        if summary.total_crashes > 0 {
            writeln!(out, "CRASHES DETECTED! Review findings in:")?;
            for listing in &summary.crash_dirs {
                writeln!(
                    out,
                    "  - {} ({} crashes)",
                    listing.dir.display(),
                    listing.crashes
                )?;
            }
        } else {
            writeln!(out, "No crashes detected")?;
        }
        if !summary.abandoned_workers.is_empty() {
            let ids: Vec<String> = summary
                .abandoned_workers
                .iter()
                .map(ToString::to_string)
                .collect();
            writeln!(out, "Workers abandoned at shutdown: {}", ids.join(", "))?;
        }
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }
}

/// Writes the latest snapshot to `<output>/fuzzer_stats.json`.
pub struct StatsFileReporter {
    path: PathBuf,
}

#[derive(Serialize)]
struct StatsFile<'a> {
    elapsed_secs: f64,
    finished: bool,
    #[serde(flatten)]
    snapshot: &'a StatsSnapshot,
}

impl StatsFileReporter {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(STATS_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, snapshot: &StatsSnapshot, elapsed: Duration, finished: bool) -> anyhow::Result<()> {
        let file = StatsFile {
            elapsed_secs: elapsed.as_secs_f64(),
            finished,
            snapshot,
        };
        let json = serde_json::to_string_pretty(&file)?;
        // Readers only ever see a complete file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl Reporter for StatsFileReporter {
    fn report(&mut self, snapshot: &StatsSnapshot, elapsed: Duration) -> anyhow::Result<()> {
        self.write(snapshot, elapsed, false)
    }

    fn finish(&mut self, summary: &RunSummary) -> anyhow::Result<()> {
        self.write(&summary.final_snapshot, summary.runtime, true)
    }
}

fn format_hms(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}
