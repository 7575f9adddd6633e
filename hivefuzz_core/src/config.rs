use crate::device::DeviceDescriptor;
use crate::mutator::StrategyKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub path: PathBuf,
    /// Arguments placed before the input file path.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    1000
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default = "default_seed_dir")]
    pub seed_dir: PathBuf,
    /// Empty means every regular file is a seed.
    #[serde(default = "default_seed_extension")]
    pub seed_extension: String,
}

impl CorpusConfig {
    pub fn extension(&self) -> Option<&str> {
        (!self.seed_extension.is_empty()).then_some(self.seed_extension.as_str())
    }
}

pub fn default_seed_dir() -> PathBuf {
    PathBuf::from("fuzz/seeds")
}

fn default_seed_extension() -> String {
    "bin".to_string()
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            seed_dir: default_seed_dir(),
            seed_extension: default_seed_extension(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("fuzz/findings_ai")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub strategy: StrategyKind,
    pub rng_seed: Option<u64>,
    #[serde(default)]
    pub cpu_only: bool,
}

pub fn default_batch_size() -> usize {
    10
}
pub fn default_report_interval_ms() -> u64 {
    2000
}
pub fn default_join_timeout_ms() -> u64 {
    2000
}

impl FuzzerSettings {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            report_interval_ms: default_report_interval_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            duration_secs: None,
            strategy: StrategyKind::default(),
            rng_seed: None,
            cpu_only: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DeviceSettings {
    pub name: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub instances: usize,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    5
}

impl From<&DeviceSettings> for DeviceDescriptor {
    fn from(settings: &DeviceSettings) -> Self {
        let device_id = settings
            .device_id
            .clone()
            .unwrap_or_else(|| settings.name.clone());
        DeviceDescriptor::new(
            settings.name.clone(),
            device_id,
            settings.instances,
            settings.priority,
        )
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HivefuzzConfig {
    pub target: TargetConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    /// Explicit device list; empty means ask the device provider.
    #[serde(default)]
    pub devices: Vec<DeviceSettings>,
}

impl HivefuzzConfig {
    /// Built-in defaults for the given target program.
    pub fn for_target(path: impl Into<PathBuf>) -> Self {
        Self {
            target: TargetConfig {
                path: path.into(),
                args: Vec::new(),
                timeout_ms: default_timeout_ms(),
                working_dir: None,
            },
            corpus: CorpusConfig::default(),
            output: OutputConfig::default(),
            fuzzer: FuzzerSettings::default(),
            devices: Vec::new(),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: HivefuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn device_descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices.iter().map(DeviceDescriptor::from).collect()
    }
}
