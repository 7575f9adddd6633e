use serde::Serialize;
use std::fmt;

/// Highest accepted scheduling priority. Priorities are advisory only.
pub const MAX_PRIORITY: u8 = 10;

/// Device id reported for the host processor.
pub const CPU_DEVICE_ID: &str = "CPU";

/// Static description of a compute device and how many workers run against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    /// Logical name; also the per-device output directory name.
    pub name: String,
    /// Identifier understood by the device runtime (e.g. `CPU`, `GPU.1`).
    pub device_id: String,
    /// Number of workers to run for this device.
    pub instances: usize,
    /// Scheduling priority in `0..=MAX_PRIORITY`.
    pub priority: u8,
}

impl DeviceDescriptor {
    pub fn new(
        name: impl Into<String>,
        device_id: impl Into<String>,
        instances: usize,
        priority: u8,
    ) -> Self {
        Self {
            name: name.into(),
            device_id: device_id.into(),
            instances,
            priority,
        }
    }

    /// The host CPU with one worker per logical core.
    pub fn host_cpu() -> Self {
        Self::new("CPU", CPU_DEVICE_ID, num_cpus::get().max(1), 5)
    }

    pub fn is_cpu(&self) -> bool {
        self.device_id == CPU_DEVICE_ID
    }

    /// Identities of every worker this descriptor asks for.
    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        (0..self.instances).map(move |instance| WorkerId::new(self.name.clone(), instance))
    }
}

/// Unique key of a running worker: `(device name, instance index)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId {
    device: String,
    instance: usize,
}

impl WorkerId {
    pub fn new(device: impl Into<String>, instance: usize) -> Self {
        Self {
            device: device.into(),
            instance,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn instance(&self) -> usize {
        self.instance
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.device, self.instance)
    }
}

/// Source of the compute devices available to the fuzzer.
///
/// Hardware probing lives behind this trait; the core only consumes the list.
pub trait DeviceProvider {
    fn available_devices(&self) -> Vec<DeviceDescriptor>;
}

/// Reports the host CPU only.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDevices;

impl DeviceProvider for HostDevices {
    fn available_devices(&self) -> Vec<DeviceDescriptor> {
        vec![DeviceDescriptor::host_cpu()]
    }
}

/// A fixed, externally supplied device list.
#[derive(Debug, Default, Clone)]
pub struct StaticDevices(pub Vec<DeviceDescriptor>);

impl DeviceProvider for StaticDevices {
    fn available_devices(&self) -> Vec<DeviceDescriptor> {
        self.0.clone()
    }
}
