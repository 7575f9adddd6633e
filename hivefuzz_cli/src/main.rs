use hivefuzz_core::config::HivefuzzConfig;
use hivefuzz_core::device::{DeviceProvider, HostDevices, StaticDevices};
use hivefuzz_core::mutator::StrategyKind;
use hivefuzz_core::orchestrator::Orchestrator;
use hivefuzz_core::report::{ConsoleReporter, Reporter, StatsFileReporter};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Multi-device fuzzing orchestrator", long_about = None)]
struct Cli {
    /// Target program; receives the input file path as its last argument.
    #[clap(value_parser)]
    target: Option<PathBuf>,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Seed directory.
    #[clap(short, long, value_parser)]
    input: Option<PathBuf>,
    /// Findings directory.
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,
    /// Stop after this many seconds.
    #[clap(short = 't', long = "time")]
    duration_secs: Option<u64>,
    #[clap(long)]
    cpu_only: bool,
    #[clap(long)]
    timeout_ms: Option<u64>,
    #[clap(long)]
    batch_size: Option<usize>,
    #[clap(long, value_parser = parse_strategy)]
    strategy: Option<StrategyKind>,
    /// Base seed for the per-worker random sources.
    #[clap(long)]
    seed: Option<u64>,
    /// Override the instance count of every device.
    #[clap(long)]
    instances: Option<usize>,
}

fn parse_strategy(value: &str) -> Result<StrategyKind, String> {
    match value {
        "bit-flip" => Ok(StrategyKind::BitFlip),
        "byte-replace" => Ok(StrategyKind::ByteReplace),
        "model-guided" => Ok(StrategyKind::ModelGuided),
        other => Err(format!(
            "unknown strategy '{other}', expected bit-flip, byte-replace or model-guided"
        )),
    }
}

fn load_config(cli: &Cli) -> Result<HivefuzzConfig, anyhow::Error> {
    if let Some(config_path) = &cli.config_file {
        info!("Loading configuration from specified path: {config_path:?}");
        return HivefuzzConfig::load_from_file(config_path);
    }
    let default_config_path = PathBuf::from("config.toml");
    if default_config_path.exists() {
        info!("No config file specified via CLI, loading default: {default_config_path:?}");
        return HivefuzzConfig::load_from_file(&default_config_path);
    }
    let target = cli.target.clone().context(
        "No target given: pass the target program or a config file with a [target] section",
    )?;
    info!("No config file found, using built-in defaults");
    Ok(HivefuzzConfig::for_target(target))
}

fn apply_overrides(config: &mut HivefuzzConfig, cli: &Cli) {
    if let Some(target) = &cli.target {
        config.target.path = target.clone();
    }
    if let Some(input) = &cli.input {
        config.corpus.seed_dir = input.clone();
    }
    if let Some(output) = &cli.output {
        config.output.dir = output.clone();
    }
    if let Some(secs) = cli.duration_secs {
        config.fuzzer.duration_secs = Some(secs);
    }
    if cli.cpu_only {
        config.fuzzer.cpu_only = true;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.target.timeout_ms = timeout_ms;
    }
    if let Some(batch_size) = cli.batch_size {
        config.fuzzer.batch_size = batch_size;
    }
    if let Some(strategy) = cli.strategy {
        config.fuzzer.strategy = strategy;
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.rng_seed = Some(seed);
    }
}

/// Devices from the config file, else the host; `--instances` applies to both.
fn device_provider(config: &mut HivefuzzConfig, instances: Option<usize>) -> StaticDevices {
    let mut devices = if config.devices.is_empty() {
        HostDevices.available_devices()
    } else {
        config.device_descriptors()
    };
    config.devices.clear();
    if let Some(instances) = instances {
        for device in &mut devices {
            device.instances = instances;
        }
    }
    StaticDevices(devices)
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = load_config(&cli)?;
    apply_overrides(&mut config, &cli);
    let provider = device_provider(&mut config, cli.instances);

    let output_dir = config.output.dir.clone();
    let orchestrator = Orchestrator::new(config, &provider)?;

    let control = orchestrator.control();
    ctrlc::set_handler(move || {
        if control.request_stop() {
            warn!("Termination requested, stopping workers");
        }
    })
    .context("Failed to install signal handler")?;

    let mut console = ConsoleReporter::new();
    let mut stats_file = StatsFileReporter::new(&output_dir);
    let mut reporters: [&mut dyn Reporter; 2] = [&mut console, &mut stats_file];

    let summary = orchestrator.run(&mut reporters)?;
    info!(
        "Fuzzing finished: {} iterations, {} crashes, {} hangs",
        summary.total_iterations, summary.total_crashes, summary.total_hangs
    );
    Ok(())
}
