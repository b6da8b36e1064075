use crate::collectors::{bytes_to_gib, Pid};
use crate::gpu::{Capabilities, DeviceInfo, GpuBackend};
use crate::state::{GpuProcessMetrics, GpuSystemMetrics};
use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::{Device, Nvml};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// `nvmlClocksThrottleReasons` bits, NVML 11/12 numbering.
pub mod throttle {
    pub const POWER: u64 = 0x8C;
    pub const TEMP: u64 = 0x60;
    pub const OTHER: u64 = 0x112;
}

pub fn init_library() -> Option<Nvml> {
    match Nvml::init() {
        Ok(nvml) => Some(nvml),
        Err(err) => {
            warn!(error = %err, "failed to initialize NVML, nvidia gpus will report zeroes");
            None
        }
    }
}

pub struct NvidiaGpu {
    info: DeviceInfo,
    nvml: Option<Arc<Nvml>>,
    system: GpuSystemMetrics,
    tracked: HashSet<Pid>,
    processes: HashMap<Pid, GpuProcessMetrics>,
    last_seen_timestamp: u64,
}

impl NvidiaGpu {
    /// `nvml` is `None` when the library session failed; the device then stays
    /// enumerated and reports defaults.
    pub fn new(info: DeviceInfo, nvml: Option<Arc<Nvml>>) -> Self {
        Self {
            info,
            nvml,
            system: GpuSystemMetrics::default(),
            tracked: HashSet::new(),
            processes: HashMap::new(),
            last_seen_timestamp: 0,
        }
    }

    fn poll_device(&mut self, device: &Device<'_>) {
        let mut m = GpuSystemMetrics::default();

        if let Ok(util) = device.utilization_rates() {
            m.load = util.gpu as i32;
        }
        if let Ok(mem) = device.memory_info() {
            m.vram_used = bytes_to_gib(mem.used);
            m.memory_total = bytes_to_gib(mem.total);
        }
        m.memory_clock = device.clock_info(Clock::Memory).unwrap_or(0) as i32;
        m.core_clock = device.clock_info(Clock::Graphics).unwrap_or(0) as i32;
        m.temperature = device.temperature(TemperatureSensor::Gpu).unwrap_or(0) as i32;
        m.power_usage = device.power_usage().unwrap_or(0) as f32 / 1000.0;
        m.power_limit = device.power_management_limit().unwrap_or(0) as f32 / 1000.0;
        m.fan_speed = device.fan_speed(0).unwrap_or(0) as i32;
        m.fan_rpm = false;
        if let Ok(reasons) = device.current_throttle_reasons() {
            apply_throttle_reasons(&mut m, reasons.bits());
        }
        self.system = m;

        if self.tracked.is_empty() {
            self.processes.clear();
            return;
        }

        let mut vram: HashMap<Pid, u64> = HashMap::new();
        match device.running_graphics_processes() {
            Ok(procs) => {
                for proc in procs {
                    if let UsedGpuMemory::Used(bytes) = proc.used_gpu_memory {
                        *vram.entry(proc.pid as Pid).or_default() += bytes;
                    }
                }
            }
            Err(err) => debug!(error = %err, "running_graphics_processes failed"),
        }

        let mut load: HashMap<Pid, u32> = HashMap::new();
        match device.process_utilization_stats(self.last_seen_timestamp) {
            Ok(samples) => {
                for sample in samples {
                    self.last_seen_timestamp = self.last_seen_timestamp.max(sample.timestamp);
                    let entry = load.entry(sample.pid as Pid).or_default();
                    *entry = (*entry).max(sample.sm_util);
                }
            }
            Err(err) => debug!(error = %err, "process_utilization_stats failed"),
        }

        self.processes = self
            .tracked
            .iter()
            .map(|pid| {
                let metrics = GpuProcessMetrics {
                    load: load.get(pid).copied().unwrap_or(0).min(100) as i32,
                    vram_used: bytes_to_gib(vram.get(pid).copied().unwrap_or(0)),
                    gtt_used: 0.0,
                };
                (*pid, metrics)
            })
            .collect();
    }
}

pub fn apply_throttle_reasons(metrics: &mut GpuSystemMetrics, bits: u64) {
    metrics.is_power_throttled = bits & throttle::POWER != 0;
    metrics.is_current_throttled = false;
    metrics.is_temp_throttled = bits & throttle::TEMP != 0;
    metrics.is_other_throttled = bits & throttle::OTHER != 0;
}

impl GpuBackend for NvidiaGpu {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn capabilities(&self) -> Capabilities {
        let available = self.nvml.is_some();
        Capabilities {
            system: available,
            process: available,
        }
    }

    fn poll(&mut self, _now: Instant) {
        let Some(nvml) = self.nvml.clone() else {
            return;
        };
        match nvml.device_by_pci_bus_id(self.info.pci_dev.as_str()) {
            Ok(device) => self.poll_device(&device),
            Err(err) => {
                debug!(pci = %self.info.pci_dev, error = %err, "nvml device lookup failed");
            }
        }
    }

    fn system_metrics(&self) -> GpuSystemMetrics {
        self.system.clone()
    }

    fn process_metrics(&self, pid: Pid) -> GpuProcessMetrics {
        self.processes.get(&pid).copied().unwrap_or_default()
    }

    fn add_pid(&mut self, pid: Pid) {
        self.tracked.insert(pid);
    }

    fn remove_pid(&mut self, pid: Pid) {
        self.tracked.remove(&pid);
        self.processes.remove(&pid);
    }
}
