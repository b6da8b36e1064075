use crate::collectors::hwmon::{find_hwmon_dir_by_name, Hwmon, SensorSpec};
use crate::collectors::{read_from_start, EnergyMeter};
use crate::state::{CoreMetrics, CpuMetrics};
use std::fs::File;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

const CPU_TEMP_DRIVERS: &[&str] = &["coretemp", "k10temp", "zenpower", "cpu_thermal"];
const CPU_TEMP_SENSORS: &[SensorSpec] = &[SensorSpec::exact("temp", "temp1_input")];

const RAPL_ENERGY: &str = "class/powercap/intel-rapl:0/energy_uj";

/// Cumulative idle and total ticks of one `cpu` line in `/proc/stat`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

#[derive(Debug)]
pub struct CpuSampler {
    stat: Option<File>,
    cpuinfo: Option<File>,
    rapl: Option<File>,
    temp: Hwmon,
    energy: EnergyMeter,
    previous: Vec<CpuTimes>,
    metrics: CpuMetrics,
    cores: Vec<CoreMetrics>,
    buf: String,
}

impl CpuSampler {
    pub fn new(proc_root: &Path, sys_root: &Path) -> Self {
        let stat = open_or_warn(&proc_root.join("stat"), "cpu load will not work");
        let cpuinfo = open_or_warn(&proc_root.join("cpuinfo"), "cpu frequency will not work");
        let rapl = match File::open(sys_root.join(RAPL_ENERGY)) {
            Ok(file) => Some(file),
            Err(err) => {
                debug!(error = %err, "no RAPL energy counter, cpu power will read as zero");
                None
            }
        };

        let hwmon_class = sys_root.join("class").join("hwmon");
        let temp_dir = CPU_TEMP_DRIVERS
            .iter()
            .find_map(|name| find_hwmon_dir_by_name(&hwmon_class, name));
        let temp = Hwmon::setup(temp_dir, CPU_TEMP_SENSORS);

        let mut sampler = Self {
            stat,
            cpuinfo,
            rapl,
            temp,
            energy: EnergyMeter::default(),
            previous: Vec::new(),
            metrics: CpuMetrics::default(),
            cores: Vec::new(),
            buf: String::new(),
        };
        sampler.previous = sampler.read_times();
        sampler.cores = vec![CoreMetrics::default(); sampler.previous.len().saturating_sub(1)];
        sampler
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn poll(&mut self, now: Instant) {
        let times = self.read_times();
        for (i, current) in times.iter().enumerate() {
            let load = match self.previous.get(i) {
                Some(prev) => utilization(prev, current),
                None => 0,
            };
            if i == 0 {
                self.metrics.load = load;
            } else if let Some(core) = self.cores.get_mut(i - 1) {
                core.load = load;
            }
        }
        if !times.is_empty() {
            self.previous = times;
        }

        self.poll_frequency();

        if let Some(file) = self.rapl.as_mut() {
            if read_from_start(file, &mut self.buf).is_ok() {
                if let Ok(energy_uj) = self.buf.trim().parse::<u64>() {
                    self.metrics.power = self.energy.sample(energy_uj, now);
                }
            }
        }

        self.temp.poll();
        self.metrics.temp = (self.temp.value("temp") / 1000) as i32;
    }

    pub fn metrics(&self) -> CpuMetrics {
        self.metrics.clone()
    }

    pub fn cores(&self) -> &[CoreMetrics] {
        &self.cores
    }

    fn read_times(&mut self) -> Vec<CpuTimes> {
        let Some(file) = self.stat.as_mut() else {
            return Vec::new();
        };
        match read_from_start(file, &mut self.buf) {
            Ok(_) => parse_stat(&self.buf),
            Err(err) => {
                debug!(error = %err, "failed to read cpu stats");
                Vec::new()
            }
        }
    }

    fn poll_frequency(&mut self) {
        let Some(file) = self.cpuinfo.as_mut() else {
            return;
        };
        if read_from_start(file, &mut self.buf).is_err() {
            return;
        }
        let frequencies = parse_cpuinfo_mhz(&self.buf);
        for (core, mhz) in self.cores.iter_mut().zip(&frequencies) {
            core.frequency = *mhz;
        }
        self.metrics.frequency = frequencies.iter().copied().max().unwrap_or(0);
    }
}

fn open_or_warn(path: &Path, consequence: &str) -> Option<File> {
    match File::open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to open file, {consequence}");
            None
        }
    }
}

/// Parses every `cpu*` line of `/proc/stat`; the aggregate line comes first.
///
/// Idle is the idle field alone, iowait counts as busy. Total is the first
/// eight fields; guest and guest_nice are already folded into user and nice.
pub fn parse_stat(content: &str) -> Vec<CpuTimes> {
    content
        .lines()
        .filter(|line| line.starts_with("cpu"))
        .filter_map(|line| {
            let ticks: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .take(8)
                .map(|v| v.parse().unwrap_or(0))
                .collect();
            if ticks.len() < 4 {
                return None;
            }
            Some(CpuTimes {
                idle: ticks[3],
                total: ticks.iter().sum(),
            })
        })
        .collect()
}

pub fn utilization(prev: &CpuTimes, current: &CpuTimes) -> i32 {
    let total = current.total.saturating_sub(prev.total);
    if total == 0 {
        return 0;
    }
    let idle = current.idle.saturating_sub(prev.idle) as f64;
    (100.0 * (1.0 - idle / total as f64)).clamp(0.0, 100.0).round() as i32
}

pub fn parse_cpuinfo_mhz(content: &str) -> Vec<i32> {
    content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| key.trim() == "cpu MHz")
        .map(|(_, value)| value.trim().parse::<f32>().map(|v| v.round() as i32).unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn stat(agg: [u64; 10], core0: [u64; 10], core1: [u64; 10]) -> String {
        let line = |label: &str, t: [u64; 10]| {
            let fields: Vec<String> = t.iter().map(|v| v.to_string()).collect();
            format!("{label} {}\n", fields.join(" "))
        };
        format!(
            "{}{}{}intr 1 2 3\nctxt 99\n",
            line("cpu ", agg),
            line("cpu0", core0),
            line("cpu1", core1)
        )
    }

    #[test]
    fn guest_ticks_are_not_double_counted() {
        let times = parse_stat("cpu  10 0 10 70 10 0 0 0 500 500\n");
        assert_eq!(times, vec![CpuTimes { idle: 70, total: 100 }]);
    }

    #[test]
    fn iowait_counts_as_busy() {
        let times = parse_stat("cpu  0 0 0 0 0 0 0 0 0 0\ncpu  10 0 10 30 50 0 0 0 0 0\n");
        assert_eq!(times[1], CpuTimes { idle: 30, total: 100 });
        assert_eq!(utilization(&times[0], &times[1]), 70);
    }

    #[test]
    fn short_lines_are_skipped() {
        assert!(parse_stat("cpu  1 2\n").is_empty());
    }

    #[test]
    fn utilization_is_rounded_and_bounded() {
        let prev = CpuTimes { idle: 100, total: 200 };
        assert_eq!(utilization(&prev, &CpuTimes { idle: 125, total: 300 }), 75);
        assert_eq!(utilization(&prev, &prev), 0);
        assert_eq!(utilization(&prev, &CpuTimes { idle: 133, total: 300 }), 67);
    }

    #[test]
    fn cpuinfo_frequencies_in_order() {
        let content = "processor\t: 0\ncpu MHz\t\t: 3400.499\nprocessor\t: 1\ncpu MHz\t\t: 2199.5\nflags\t\t:\n";
        assert_eq!(parse_cpuinfo_mhz(content), vec![3400, 2200]);
    }

    #[test]
    fn samples_load_frequency_power_and_temperature() {
        let proc_root = tempfile::tempdir().unwrap();
        let sys_root = tempfile::tempdir().unwrap();

        fs::write(
            proc_root.path().join("stat"),
            stat([0; 10], [0; 10], [0; 10]),
        )
        .unwrap();
        fs::write(
            proc_root.path().join("cpuinfo"),
            "cpu MHz\t\t: 1800.0\ncpu MHz\t\t: 4200.0\n",
        )
        .unwrap();

        let rapl = sys_root.path().join("class/powercap/intel-rapl:0");
        fs::create_dir_all(&rapl).unwrap();
        fs::write(rapl.join("energy_uj"), "1000000\n").unwrap();

        let hwmon = sys_root.path().join("class/hwmon/hwmon2");
        fs::create_dir_all(&hwmon).unwrap();
        fs::write(hwmon.join("name"), "k10temp\n").unwrap();
        fs::write(hwmon.join("temp1_input"), "54250\n").unwrap();

        let mut cpu = CpuSampler::new(proc_root.path(), sys_root.path());
        assert_eq!(cpu.core_count(), 2);

        let t0 = Instant::now();
        cpu.poll(t0);
        assert_eq!(cpu.metrics().power, 0.0);

        fs::write(
            proc_root.path().join("stat"),
            stat(
                [50, 0, 50, 100, 0, 0, 0, 0, 0, 0],
                [100, 0, 0, 0, 0, 0, 0, 0, 0, 0],
                [0, 0, 0, 100, 0, 0, 0, 0, 0, 0],
            ),
        )
        .unwrap();
        fs::write(rapl.join("energy_uj"), "16000000\n").unwrap();
        cpu.poll(t0 + Duration::from_secs(1));

        let metrics = cpu.metrics();
        assert_eq!(metrics.load, 50);
        assert_eq!(metrics.frequency, 4200);
        assert_eq!(metrics.temp, 54);
        assert!((metrics.power - 15.0).abs() < 1e-3);
        assert_eq!(
            cpu.cores(),
            &[
                CoreMetrics {
                    load: 100,
                    frequency: 1800
                },
                CoreMetrics {
                    load: 0,
                    frequency: 4200
                }
            ]
        );
    }

    #[test]
    fn missing_files_read_as_zero() {
        let proc_root = tempfile::tempdir().unwrap();
        let sys_root = tempfile::tempdir().unwrap();
        let mut cpu = CpuSampler::new(proc_root.path(), sys_root.path());
        cpu.poll(Instant::now());
        assert_eq!(cpu.metrics(), CpuMetrics::default());
        assert_eq!(cpu.core_count(), 0);
    }
}
