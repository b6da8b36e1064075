use crate::collectors::fdinfo::{FdInfo, FdInfoKeys};
use crate::collectors::hwmon::{find_hwmon_dir, Hwmon, SensorSpec};
use crate::collectors::{bytes_to_gib, Pid};
use crate::gpu::{Capabilities, DeviceInfo, GpuBackend};
use crate::state::{GpuProcessMetrics, GpuSystemMetrics};
use std::path::Path;
use std::time::Instant;
use tracing::debug;

const HWMON_SENSORS: &[SensorSpec] = &[
    SensorSpec::exact("temperature", "temp1_input"),
    SensorSpec::exact("junction_temperature", "temp2_input"),
    SensorSpec::exact("memory_temp", "temp3_input"),
    SensorSpec::exact("core_clock", "freq1_input"),
    SensorSpec::exact("memory_clock", "freq2_input"),
    SensorSpec::exact("voltage", "in0_input"),
    SensorSpec::exact("power_average", "power1_average"),
    SensorSpec::exact("power_input", "power1_input"),
    SensorSpec::exact("power_limit", "power1_cap"),
    SensorSpec::exact("fan_speed", "fan1_input"),
];

const DEVICE_SENSORS: &[SensorSpec] = &[
    SensorSpec::exact("load", "gpu_busy_percent"),
    SensorSpec::exact("vram_used", "mem_info_vram_used"),
    SensorSpec::exact("gtt_used", "mem_info_gtt_used"),
    SensorSpec::exact("vram_total", "mem_info_vram_total"),
];

pub const FDINFO_KEYS: FdInfoKeys = FdInfoKeys {
    engine: "drm-engine-gfx",
    vram: "drm-memory-vram",
    gtt: "drm-memory-gtt",
};

/// Devices with this little dedicated memory share the CPU package.
const APU_VRAM_LIMIT: u64 = 1024 * 1024 * 1024;

pub struct AmdGpu {
    info: DeviceInfo,
    hwmon: Hwmon,
    device: Hwmon,
    fdinfo: FdInfo,
    is_apu: bool,
}

impl AmdGpu {
    pub fn new(info: DeviceInfo, drm_class: &Path, proc_root: &Path) -> Self {
        let hwmon = Hwmon::setup(find_hwmon_dir(drm_class, &info.drm_node), HWMON_SENSORS);
        let mut device = Hwmon::setup(
            Some(drm_class.join(&info.drm_node).join("device")),
            DEVICE_SENSORS,
        );
        device.poll();

        let vram_total = device.value("vram_total");
        let is_apu = vram_total > 0 && vram_total <= APU_VRAM_LIMIT;
        if is_apu {
            debug!(node = %info.drm_node, vram_total, "amdgpu treated as apu");
        }

        let fdinfo = FdInfo::new(proc_root, info.pci_dev.clone(), FDINFO_KEYS);
        Self {
            info,
            hwmon,
            device,
            fdinfo,
            is_apu,
        }
    }

    fn power_watts(&self) -> f32 {
        let micro_watts = if self.hwmon.has("power_average") {
            self.hwmon.value("power_average")
        } else {
            self.hwmon.value("power_input")
        };
        micro_watts as f32 / 1_000_000.0
    }
}

impl GpuBackend for AmdGpu {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            system: true,
            process: true,
        }
    }

    fn poll(&mut self, now: Instant) {
        self.hwmon.poll();
        self.device.poll();
        self.fdinfo.poll_all(now);
    }

    fn system_metrics(&self) -> GpuSystemMetrics {
        let hw = &self.hwmon;
        let temperature = (hw.value("temperature") / 1000) as i32;
        let power_usage = self.power_watts();

        GpuSystemMetrics {
            load: self.device.value("load") as i32,
            vram_used: bytes_to_gib(self.device.value("vram_used")),
            gtt_used: bytes_to_gib(self.device.value("gtt_used")),
            memory_total: bytes_to_gib(self.device.value("vram_total")),
            memory_clock: (hw.value("memory_clock") / 1_000_000) as i32,
            memory_temp: (hw.value("memory_temp") / 1000) as i32,
            temperature,
            junction_temperature: (hw.value("junction_temperature") / 1000) as i32,
            core_clock: (hw.value("core_clock") / 1_000_000) as i32,
            voltage: hw.value("voltage") as i32,
            power_usage,
            power_limit: hw.value("power_limit") as f32 / 1_000_000.0,
            is_apu: self.is_apu,
            apu_cpu_power: if self.is_apu { power_usage } else { 0.0 },
            apu_cpu_temp: if self.is_apu { temperature } else { 0 },
            fan_speed: hw.value("fan_speed") as i32,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::tests::fake_card;
    use crate::gpu::{enumerate_devices, Vendor};
    use std::fs;

    fn write_all(dir: &Path, files: &[(&str, &str)]) {
        for (name, value) in files {
            fs::write(dir.join(name), format!("{value}\n")).unwrap();
        }
    }

    #[test]
    fn reads_discrete_card() {
        let sys = tempfile::tempdir().unwrap();
        let proc = tempfile::tempdir().unwrap();
        let device = fake_card(sys.path(), "card0", "0000:03:00.0", "0x1002", "0x744c");
        write_all(
            &device,
            &[
                ("gpu_busy_percent", "37"),
                ("mem_info_vram_used", "2147483648"),
                ("mem_info_gtt_used", "536870912"),
                ("mem_info_vram_total", "25753026560"),
            ],
        );
        let hwmon = device.join("hwmon/hwmon5");
        fs::create_dir_all(&hwmon).unwrap();
        write_all(
            &hwmon,
            &[
                ("temp1_input", "51000"),
                ("temp2_input", "63000"),
                ("temp3_input", "70000"),
                ("freq1_input", "2482000000"),
                ("freq2_input", "1249000000"),
                ("in0_input", "1050"),
                ("power1_average", "212000000"),
                ("power1_input", "1"),
                ("power1_cap", "303000000"),
                ("fan1_input", "1450"),
            ],
        );

        let drm = sys.path().join("class/drm");
        let info = enumerate_devices(&drm).remove(0);
        assert_eq!(info.vendor, Vendor::Amd);
        let mut gpu = AmdGpu::new(info, &drm, proc.path());
        gpu.poll(Instant::now());
        let m = gpu.system_metrics();

        assert_eq!(m.load, 37);
        assert_eq!(m.vram_used, 2.0);
        assert_eq!(m.gtt_used, 0.5);
        assert_eq!(m.temperature, 51);
        assert_eq!(m.junction_temperature, 63);
        assert_eq!(m.memory_temp, 70);
        assert_eq!(m.core_clock, 2482);
        assert_eq!(m.memory_clock, 1249);
        assert_eq!(m.voltage, 1050);
        assert_eq!(m.power_usage, 212.0);
        assert_eq!(m.power_limit, 303.0);
        assert_eq!(m.fan_speed, 1450);
        assert!(m.fan_rpm);
        assert!(!m.is_apu);
        assert_eq!(m.apu_cpu_power, 0.0);
    }

    #[test]
    fn small_vram_is_an_apu() {
        let sys = tempfile::tempdir().unwrap();
        let proc = tempfile::tempdir().unwrap();
        let device = fake_card(sys.path(), "card0", "0000:c5:00.0", "0x1002", "0x15bf");
        write_all(&device, &[("mem_info_vram_total", "536870912")]);
        let hwmon = device.join("hwmon/hwmon0");
        fs::create_dir_all(&hwmon).unwrap();
        write_all(&hwmon, &[("temp1_input", "66000"), ("power1_input", "25000000")]);

        let drm = sys.path().join("class/drm");
        let info = enumerate_devices(&drm).remove(0);
        let mut gpu = AmdGpu::new(info, &drm, proc.path());
        gpu.poll(Instant::now());
        let m = gpu.system_metrics();

        assert!(m.is_apu);
        assert_eq!(m.power_usage, 25.0);
        assert_eq!(m.apu_cpu_power, 25.0);
        assert_eq!(m.apu_cpu_temp, 66);
    }
}
