use crate::collectors::{read_from_start, Pid};
use crate::state::GpuProcessMetrics;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub struct FdInfoKeys {
    pub engine: &'static str,
    pub vram: &'static str,
    pub gtt: &'static str,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FdInfoSample {
    pub pdev: Option<String>,
    pub client_id: Option<u64>,
    pub engine_ns: u64,
    pub vram_bytes: u64,
    pub gtt_bytes: u64,
}

#[derive(Debug, Default)]
struct ProcessAccounting {
    files: Vec<File>,
    engine_ns: Option<u64>,
    last_sample: Option<Instant>,
    load: i32,
    vram_bytes: u64,
    gtt_bytes: u64,
}

#[derive(Debug)]
pub struct FdInfo {
    proc_root: PathBuf,
    pci_dev: String,
    keys: FdInfoKeys,
    processes: HashMap<Pid, ProcessAccounting>,
    buf: String,
}

impl FdInfo {
    pub fn new(proc_root: impl Into<PathBuf>, pci_dev: impl Into<String>, keys: FdInfoKeys) -> Self {
        Self {
            proc_root: proc_root.into(),
            pci_dev: pci_dev.into(),
            keys,
            processes: HashMap::new(),
            buf: String::new(),
        }
    }

    pub fn add_pid(&mut self, pid: Pid) {
        if self.is_tracked(pid) {
            return;
        }
        let files = open_device_fds(&self.proc_root, pid, &self.pci_dev);
        debug!(pid, device = %self.pci_dev, fds = files.len(), "tracking pid in fdinfo");
        self.processes.insert(
            pid,
            ProcessAccounting {
                files,
                ..ProcessAccounting::default()
            },
        );
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        if self.processes.remove(&pid).is_some() {
            trace!(pid, device = %self.pci_dev, "fdinfo stopped tracking pid");
        }
    }

    pub fn is_tracked(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn poll_all(&mut self, now: Instant) {
        for (pid, acc) in self.processes.iter_mut() {
            if acc.files.is_empty() {
                acc.files = open_device_fds(&self.proc_root, *pid, &self.pci_dev);
            }

            let mut total = FdInfoSample::default();
            let mut broken = false;
            for file in acc.files.iter_mut() {
                if read_from_start(file, &mut self.buf).is_err() {
                    broken = true;
                    continue;
                }
                let sample = parse_fdinfo(&self.buf, &self.keys);
                total.engine_ns = total.engine_ns.saturating_add(sample.engine_ns);
                total.vram_bytes = total.vram_bytes.saturating_add(sample.vram_bytes);
                total.gtt_bytes = total.gtt_bytes.saturating_add(sample.gtt_bytes);
            }
            acc.vram_bytes = total.vram_bytes;
            acc.gtt_bytes = total.gtt_bytes;

            if broken || acc.files.is_empty() {
                // no complete counter set: the next sample is a fresh baseline
                acc.files.clear();
                acc.engine_ns = None;
                acc.last_sample = None;
                acc.load = 0;
                continue;
            }

            match (acc.engine_ns, acc.last_sample) {
                (Some(prev_ns), Some(prev_at)) => {
                    let wall_ns = now.saturating_duration_since(prev_at).as_nanos() as f64;
                    if wall_ns <= 0.0 {
                        continue;
                    }
                    let busy_ns = total.engine_ns.saturating_sub(prev_ns) as f64;
                    acc.load = load_percent(busy_ns, wall_ns);
                }
                _ => acc.load = 0,
            }
            acc.engine_ns = Some(total.engine_ns);
            acc.last_sample = Some(now);
        }
    }

    pub fn process_metrics(&self, pid: Pid) -> GpuProcessMetrics {
        self.processes
            .get(&pid)
            .map(|acc| GpuProcessMetrics {
                load: acc.load,
                vram_used: crate::collectors::bytes_to_gib(acc.vram_bytes),
                gtt_used: crate::collectors::bytes_to_gib(acc.gtt_bytes),
            })
            .unwrap_or_default()
    }
}

/// Busy time over wall time as a whole percentage in `[0, 100]`.
pub fn load_percent(busy: f64, wall: f64) -> i32 {
    if wall <= 0.0 || !busy.is_finite() {
        return 0;
    }
    (busy / wall * 100.0).clamp(0.0, 100.0).round() as i32
}

pub fn parse_fdinfo(content: &str, keys: &FdInfoKeys) -> FdInfoSample {
    let mut sample = FdInfoSample::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "drm-pdev" => sample.pdev = Some(value.to_string()),
            "drm-client-id" => sample.client_id = value.parse().ok(),
            k if k == keys.engine => sample.engine_ns = parse_quantity(value),
            k if k == keys.vram => sample.vram_bytes = parse_quantity(value),
            k if k == keys.gtt => sample.gtt_bytes = parse_quantity(value),
            _ => {}
        }
    }
    sample
}

/// Parses `"1234 KiB"`, `"5678 ns"` or a bare number. Sizes come back in bytes.
fn parse_quantity(value: &str) -> u64 {
    let mut parts = value.split_whitespace();
    let Some(number) = parts.next().and_then(|n| n.parse::<u64>().ok()) else {
        return 0;
    };
    let multiplier = match parts.next() {
        Some("KiB") => 1024,
        Some("MiB") => 1024 * 1024,
        Some("GiB") => 1024 * 1024 * 1024,
        _ => 1,
    };
    number.saturating_mul(multiplier)
}

fn open_device_fds(proc_root: &Path, pid: Pid, pci_dev: &str) -> Vec<File> {
    let dir = proc_root.join(pid.to_string()).join("fdinfo");
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(pid, error = %err, "cannot list fdinfo directory");
            return Vec::new();
        }
    };

    let keys = FdInfoKeys {
        engine: "",
        vram: "",
        gtt: "",
    };
    let mut seen_clients = HashSet::new();
    let mut files = Vec::new();
    let mut buf = String::new();

    for entry in entries.flatten() {
        let Ok(mut file) = File::open(entry.path()) else {
            continue;
        };
        if read_from_start(&mut file, &mut buf).is_err() {
            continue;
        }
        let sample = parse_fdinfo(&buf, &keys);
        if sample.pdev.as_deref() != Some(pci_dev) {
            continue;
        }
        if let Some(client_id) = sample.client_id {
            if !seen_clients.insert(client_id) {
                continue;
            }
        }
        files.push(file);
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const AMD_KEYS: FdInfoKeys = FdInfoKeys {
        engine: "drm-engine-gfx",
        vram: "drm-memory-vram",
        gtt: "drm-memory-gtt",
    };

    fn amd_fdinfo(client_id: u64, pdev: &str, gfx_ns: u64, vram_kib: u64) -> String {
        format!(
            "pos:\t0\nflags:\t02100002\nmnt_id:\t24\ndrm-driver:\tamdgpu\n\
             drm-client-id:\t{client_id}\ndrm-pdev:\t{pdev}\npasid:\t32782\n\
             drm-memory-vram:\t{vram_kib} KiB\ndrm-memory-gtt:\t2048 KiB\n\
             drm-engine-gfx:\t{gfx_ns} ns\ndrm-engine-gfx-extra:\t999 ns\n"
        )
    }

    fn write_fd(proc_root: &Path, pid: Pid, fd: u32, content: &str) {
        let dir = proc_root.join(pid.to_string()).join("fdinfo");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(fd.to_string()), content).unwrap();
    }

    #[test]
    fn parses_amdgpu_counters() {
        let sample = parse_fdinfo(&amd_fdinfo(7, "0000:03:00.0", 1_500, 4), &AMD_KEYS);
        assert_eq!(sample.pdev.as_deref(), Some("0000:03:00.0"));
        assert_eq!(sample.client_id, Some(7));
        assert_eq!(sample.engine_ns, 1_500);
        assert_eq!(sample.vram_bytes, 4 * 1024);
        assert_eq!(sample.gtt_bytes, 2048 * 1024);
    }

    #[test]
    fn load_is_clamped() {
        assert_eq!(load_percent(3.0e9, 1.0e9), 100);
        assert_eq!(load_percent(0.25e9, 1.0e9), 25);
        assert_eq!(load_percent(-5.0, 1.0e9), 0);
        assert_eq!(load_percent(5.0, 0.0), 0);
    }

    #[test]
    fn first_poll_reports_zero_then_rate() {
        let proc_root = tempfile::tempdir().unwrap();
        let pdev = "0000:03:00.0";
        write_fd(proc_root.path(), 4242, 5, &amd_fdinfo(1, pdev, 10_000_000_000, 1024));

        let mut fdinfo = FdInfo::new(proc_root.path(), pdev, AMD_KEYS);
        fdinfo.add_pid(4242);
        let t0 = Instant::now();
        fdinfo.poll_all(t0);
        assert_eq!(fdinfo.process_metrics(4242).load, 0);

        write_fd(proc_root.path(), 4242, 5, &amd_fdinfo(1, pdev, 10_500_000_000, 1024));
        fdinfo.poll_all(t0 + Duration::from_secs(1));
        let metrics = fdinfo.process_metrics(4242);
        assert_eq!(metrics.load, 50);
        assert!((metrics.vram_used - 1.0 / 1024.0).abs() < 1e-6);

        write_fd(proc_root.path(), 4242, 5, &amd_fdinfo(1, pdev, 20_000_000_000, 1024));
        fdinfo.poll_all(t0 + Duration::from_secs(2));
        assert_eq!(fdinfo.process_metrics(4242).load, 100);
    }

    #[test]
    fn descriptors_opened_after_add_pid_start_from_zero() {
        let proc_root = tempfile::tempdir().unwrap();
        let pdev = "0000:03:00.0";
        fs::create_dir_all(proc_root.path().join("77/fdinfo")).unwrap();

        let mut fdinfo = FdInfo::new(proc_root.path(), pdev, AMD_KEYS);
        fdinfo.add_pid(77);
        let t0 = Instant::now();
        fdinfo.poll_all(t0);
        assert_eq!(fdinfo.process_metrics(77).load, 0);

        write_fd(proc_root.path(), 77, 9, &amd_fdinfo(3, pdev, 60_000_000_000, 1024));
        fdinfo.poll_all(t0 + Duration::from_millis(500));
        assert_eq!(fdinfo.process_metrics(77).load, 0);

        write_fd(proc_root.path(), 77, 9, &amd_fdinfo(3, pdev, 60_250_000_000, 1024));
        fdinfo.poll_all(t0 + Duration::from_millis(1000));
        assert_eq!(fdinfo.process_metrics(77).load, 50);
    }

    #[test]
    fn shared_client_ids_and_foreign_devices_are_ignored() {
        let proc_root = tempfile::tempdir().unwrap();
        let pdev = "0000:03:00.0";
        write_fd(proc_root.path(), 10, 3, &amd_fdinfo(1, pdev, 0, 1024));
        write_fd(proc_root.path(), 10, 4, &amd_fdinfo(1, pdev, 0, 1024));
        write_fd(proc_root.path(), 10, 6, &amd_fdinfo(2, "0000:0a:00.0", 0, 4096));
        fs::write(proc_root.path().join("10/fdinfo/0"), "pos:\t0\nflags:\t02\n").unwrap();

        let mut fdinfo = FdInfo::new(proc_root.path(), pdev, AMD_KEYS);
        fdinfo.add_pid(10);
        fdinfo.poll_all(Instant::now());

        let metrics = fdinfo.process_metrics(10);
        assert!((metrics.vram_used - 1.0 / 1024.0).abs() < 1e-6);
    }

    #[test]
    fn add_pid_is_idempotent_and_unknown_pid_is_zero() {
        let proc_root = tempfile::tempdir().unwrap();
        let mut fdinfo = FdInfo::new(proc_root.path(), "0000:03:00.0", AMD_KEYS);
        fdinfo.add_pid(1);
        fdinfo.add_pid(1);
        assert!(fdinfo.is_tracked(1));
        fdinfo.remove_pid(1);
        assert!(!fdinfo.is_tracked(1));
        assert_eq!(fdinfo.process_metrics(99), GpuProcessMetrics::default());
    }
}
