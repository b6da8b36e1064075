use crate::collectors::{read_from_start, Pid, BYTES_PER_MIB};
use crate::state::IoRates;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Default)]
struct IoAccounting {
    file: Option<File>,
    previous: Option<(IoCounters, Instant)>,
    rates: IoRates,
}

#[derive(Debug)]
pub struct IoStats {
    proc_root: PathBuf,
    processes: HashMap<Pid, IoAccounting>,
    buf: String,
}

impl IoStats {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            processes: HashMap::new(),
            buf: String::new(),
        }
    }

    pub fn add_pid(&mut self, pid: Pid) {
        if self.is_tracked(pid) {
            return;
        }
        let path = self.proc_root.join(pid.to_string()).join("io");
        let file = match File::open(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                debug!(pid, path = %path.display(), error = %err, "cannot open process io counters");
                None
            }
        };
        self.processes.insert(
            pid,
            IoAccounting {
                file,
                ..IoAccounting::default()
            },
        );
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        self.processes.remove(&pid);
    }

    pub fn is_tracked(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn poll_all(&mut self, now: Instant) {
        for acc in self.processes.values_mut() {
            let Some(file) = acc.file.as_mut() else {
                continue;
            };
            if read_from_start(file, &mut self.buf).is_err() {
                continue;
            }
            let current = parse_io(&self.buf);

            if let Some((prev, prev_at)) = acc.previous {
                let secs = now.saturating_duration_since(prev_at).as_secs_f64();
                if secs <= 0.0 {
                    continue;
                }
                acc.rates = IoRates {
                    read_mb_per_sec: mib_per_sec(current.read_bytes, prev.read_bytes, secs),
                    write_mb_per_sec: mib_per_sec(current.write_bytes, prev.write_bytes, secs),
                };
            }
            acc.previous = Some((current, now));
        }
    }

    pub fn rates(&self, pid: Pid) -> IoRates {
        self.processes
            .get(&pid)
            .map(|acc| acc.rates)
            .unwrap_or_default()
    }
}

fn mib_per_sec(current: u64, previous: u64, secs: f64) -> f32 {
    (current.saturating_sub(previous) as f64 / BYTES_PER_MIB / secs) as f32
}

pub fn parse_io(content: &str) -> IoCounters {
    let mut counters = IoCounters::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse().unwrap_or(0);
        match key {
            "read_bytes" => counters.read_bytes = value,
            "write_bytes" => counters.write_bytes = value,
            _ => {}
        }
    }
    counters
}
