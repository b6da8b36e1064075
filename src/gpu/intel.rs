use crate::collectors::fdinfo::{FdInfo, FdInfoKeys};
use crate::collectors::hwmon::{find_hwmon_dir, Hwmon, SensorSpec};
use crate::collectors::{EnergyMeter, Pid};
use crate::gpu::{Capabilities, DeviceInfo, GpuBackend};
use crate::state::{GpuProcessMetrics, GpuSystemMetrics};
use std::path::Path;
use std::time::Instant;

const HWMON_SENSORS: &[SensorSpec] = &[
    SensorSpec::exact("voltage", "in0_input"),
    SensorSpec::exact("fan_speed", "fan1_input"),
    SensorSpec::exact("temp", "temp1_input"),
    SensorSpec::exact("energy", "energy1_input"),
    SensorSpec::exact("power_limit", "power1_max"),
];

pub const FDINFO_KEYS: FdInfoKeys = FdInfoKeys {
    engine: "drm-engine-render",
    vram: "drm-total-local0",
    gtt: "drm-total-system0",
};

pub struct IntelGpu {
    info: DeviceInfo,
    hwmon: Hwmon,
    energy: EnergyMeter,
    fdinfo: FdInfo,
}

impl IntelGpu {
    pub fn new(info: DeviceInfo, drm_class: &Path, proc_root: &Path) -> Self {
        let hwmon = Hwmon::setup(find_hwmon_dir(drm_class, &info.drm_node), HWMON_SENSORS);
        let fdinfo = FdInfo::new(proc_root, info.pci_dev.clone(), FDINFO_KEYS);
        Self {
            info,
            hwmon,
            energy: EnergyMeter::default(),
            fdinfo,
        }
    }

    pub fn fan_speed(&self) -> i32 {
        self.hwmon.value("fan_speed") as i32
    }

    pub fn power_limit(&self) -> f32 {
        self.hwmon.value("power_limit") as f32 / 1_000_000.0
    }
}

impl GpuBackend for IntelGpu {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            system: self.hwmon.base_dir().is_some(),
            process: true,
        }
    }

    fn poll(&mut self, now: Instant) {
        self.hwmon.poll();
        if self.hwmon.has("energy") {
            self.energy.sample(self.hwmon.value("energy"), now);
        }
        self.fdinfo.poll_all(now);
    }

    fn system_metrics(&self) -> GpuSystemMetrics {
        GpuSystemMetrics {
            temperature: (self.hwmon.value("temp") / 1000) as i32,
            voltage: self.hwmon.value("voltage") as i32,
            power_usage: self.energy.watts(),
            power_limit: self.power_limit(),
            fan_speed: self.fan_speed(),
            fan_rpm: true,
            ..GpuSystemMetrics::default()
        }
    }

    fn process_metrics(&self, pid: Pid) -> GpuProcessMetrics {
        self.fdinfo.process_metrics(pid)
    }

    fn add_pid(&mut self, pid: Pid) {
        self.fdinfo.add_pid(pid);
    }

    fn remove_pid(&mut self, pid: Pid) {
        self.fdinfo.remove_pid(pid);
    }
}
