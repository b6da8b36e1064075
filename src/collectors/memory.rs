use crate::collectors::{bytes_to_gib, read_from_start, Pid};
use crate::state::{MemoryMetrics, ProcessMemory};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use sysinfo::{System, SystemExt};
use tracing::debug;

const FALLBACK_PAGE_SIZE: u64 = 4096;

/// Per-process figures come from `/proc/<pid>/statm`, which also carries shared pages.
#[derive(Debug)]
pub struct MemorySampler {
    proc_root: PathBuf,
    sys: System,
    page_size: u64,
    system: MemoryMetrics,
    processes: HashMap<Pid, (Option<File>, ProcessMemory)>,
    buf: String,
}

impl MemorySampler {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys: System::new(),
            page_size: page_size(),
            system: MemoryMetrics::default(),
            processes: HashMap::new(),
            buf: String::new(),
        }
    }

    pub fn add_pid(&mut self, pid: Pid) {
        if self.processes.contains_key(&pid) {
            return;
        }
        let path = self.proc_root.join(pid.to_string()).join("statm");
        let file = File::open(&path)
            .map_err(|err| debug!(pid, error = %err, "cannot open statm"))
            .ok();
        self.processes.insert(pid, (file, ProcessMemory::default()));
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        self.processes.remove(&pid);
    }

    pub fn poll(&mut self) {
        self.sys.refresh_memory();
        self.system = memory_metrics(
            self.sys.total_memory(),
            self.sys.available_memory(),
            self.sys.used_swap(),
        );

        for (file, memory) in self.processes.values_mut() {
            let Some(file) = file.as_mut() else {
                continue;
            };
            if read_from_start(file, &mut self.buf).is_ok() {
                if let Some(parsed) = parse_statm(&self.buf, self.page_size) {
                    *memory = parsed;
                }
            }
        }
    }

    pub fn system(&self) -> MemoryMetrics {
        self.system.clone()
    }

    pub fn process(&self, pid: Pid) -> ProcessMemory {
        self.processes
            .get(&pid)
            .map(|(_, memory)| memory.clone())
            .unwrap_or_default()
    }
}

fn page_size() -> u64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Inputs in bytes; used memory is total minus available.
fn memory_metrics(total: u64, available: u64, swap_used: u64) -> MemoryMetrics {
    MemoryMetrics {
        used: bytes_to_gib(total.saturating_sub(available)),
        total: bytes_to_gib(total),
        swap_used: bytes_to_gib(swap_used),
    }
}

/// `size resident shared text lib data dt`, all in pages.
pub fn parse_statm(content: &str, page_size: u64) -> Option<ProcessMemory> {
    let pages: Vec<u64> = content
        .split_whitespace()
        .take(3)
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    let [virt, resident, shared] = pages[..] else {
        return None;
    };
    Some(ProcessMemory {
        resident: bytes_to_gib(resident * page_size),
        shared: bytes_to_gib(shared * page_size),
        virt: bytes_to_gib(virt * page_size),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn used_is_total_minus_available() {
        let memory = memory_metrics(16 * GIB, 8 * GIB, GIB);
        assert_eq!(memory.total, 16.0);
        assert_eq!(memory.used, 8.0);
        assert_eq!(memory.swap_used, 1.0);
        assert_eq!(memory_metrics(GIB, 2 * GIB, 0).used, 0.0);
    }

    #[test]
    fn statm_pages_to_gib() {
        let memory = parse_statm("524288 262144 131072 10 0 20 0\n", 4096).unwrap();
        assert_eq!(memory.virt, 2.0);
        assert_eq!(memory.resident, 1.0);
        assert_eq!(memory.shared, 0.5);
        assert!(parse_statm("12", 4096).is_none());
    }

    #[test]
    fn samples_system_and_process() {
        let proc_root = tempfile::tempdir().unwrap();
        fs::create_dir(proc_root.path().join("77")).unwrap();
        let pages = 1024 * 1024 * 1024 / page_size();
        fs::write(proc_root.path().join("77/statm"), format!("{pages} {pages} 0 0 0 0 0\n")).unwrap();

        let mut sampler = MemorySampler::new(proc_root.path());
        sampler.add_pid(77);
        sampler.add_pid(78);
        sampler.poll();

        let system = sampler.system();
        assert!(system.total > 0.0);
        assert!(system.used <= system.total);
        assert_eq!(sampler.process(77).resident, 1.0);
        assert_eq!(sampler.process(78), ProcessMemory::default());
    }
}
