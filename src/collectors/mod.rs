pub mod cpu;
pub mod fdinfo;
pub mod hwmon;
pub mod iostats;
pub mod memory;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;

pub type Pid = i32;

pub const PROC_ROOT: &str = "/proc";
pub const SYS_ROOT: &str = "/sys";

pub const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;
pub const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Largest procfs file we read; `/proc/cpuinfo` on big hosts is the upper end.
pub const MAX_PROC_READ: u64 = 1024 * 1024;

/// Rewinds an already-open file and reads up to [`MAX_PROC_READ`] bytes into `buf`.
pub fn read_from_start(file: &mut File, buf: &mut String) -> io::Result<usize> {
    read_bounded(file, buf, MAX_PROC_READ)
}

fn read_bounded(file: &mut File, buf: &mut String, limit: u64) -> io::Result<usize> {
    buf.clear();
    file.seek(SeekFrom::Start(0))?;
    file.by_ref().take(limit).read_to_string(buf)
}

pub fn process_exists(proc_root: &Path, pid: Pid) -> bool {
    proc_root.join(pid.to_string()).is_dir()
}

pub fn bytes_to_gib(bytes: u64) -> f32 {
    (bytes as f64 / BYTES_PER_GIB) as f32
}

/// Turns a monotonically increasing energy counter in microjoules into watts.
///
/// The first sample only establishes a baseline and reports 0. A counter that
/// moves backwards (wrap or driver reload) is treated the same way.
#[derive(Debug, Default)]
pub struct EnergyMeter {
    previous: Option<(u64, Instant)>,
    watts: f32,
}

impl EnergyMeter {
    pub fn sample(&mut self, energy_uj: u64, now: Instant) -> f32 {
        match self.previous {
            Some((prev_uj, prev_at)) if energy_uj >= prev_uj => {
                let secs = now.saturating_duration_since(prev_at).as_secs_f64();
                if secs <= 0.0 {
                    return self.watts;
                }
                self.watts = ((energy_uj - prev_uj) as f64 / secs / 1_000_000.0) as f32;
            }
            _ => self.watts = 0.0,
        }
        self.previous = Some((energy_uj, now));
        self.watts
    }

    pub fn watts(&self) -> f32 {
        self.watts
    }
}
