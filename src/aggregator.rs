use crate::collectors::cpu::CpuSampler;
use crate::collectors::iostats::IoStats;
use crate::collectors::memory::MemorySampler;
use crate::collectors::{process_exists, Pid};
use crate::gpu::{self, Gpu};
use crate::metrics::Metrics;
use crate::state::{ProcessMetrics, SharedSnapshot, Snapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

pub struct Aggregator {
    proc_root: PathBuf,
    cpu: CpuSampler,
    gpus: Vec<Gpu>,
    io: IoStats,
    memory: MemorySampler,
    pids: BTreeSet<Pid>,
    cycles: u64,
}

impl Aggregator {
    pub fn new(proc_root: impl Into<PathBuf>, cpu: CpuSampler, gpus: Vec<Gpu>) -> Self {
        let proc_root = proc_root.into();
        Self {
            io: IoStats::new(&proc_root),
            memory: MemorySampler::new(&proc_root),
            proc_root,
            cpu,
            gpus,
            pids: BTreeSet::new(),
            cycles: 0,
        }
    }

    pub fn discover(proc_root: &Path, sys_root: &Path) -> Self {
        let cpu = CpuSampler::new(proc_root, sys_root);
        let gpus = gpu::discover(sys_root, proc_root);
        Self::new(proc_root, cpu, gpus)
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }

    pub fn core_count(&self) -> usize {
        self.cpu.core_count()
    }

    pub fn is_tracked(&self, pid: Pid) -> bool {
        self.pids.contains(&pid)
    }

    pub fn register_pid(&mut self, pid: Pid) {
        if self.is_tracked(pid) {
            return;
        }
        self.pids.insert(pid);
        debug!(pid, "registering client process");
        for gpu in self.gpus.iter_mut() {
            gpu.add_pid(pid);
        }
        self.io.add_pid(pid);
        self.memory.add_pid(pid);
    }

    fn prune_dead(&mut self) {
        let dead: Vec<Pid> = self
            .pids
            .iter()
            .copied()
            .filter(|pid| !process_exists(&self.proc_root, *pid))
            .collect();
        for pid in dead {
            debug!(pid, "client process exited, dropping its records");
            self.pids.remove(&pid);
            for gpu in self.gpus.iter_mut() {
                gpu.remove_pid(pid);
            }
            self.io.remove_pid(pid);
            self.memory.remove_pid(pid);
        }
    }

    pub fn cycle(&mut self, now: Instant) -> Snapshot {
        self.prune_dead();

        self.cpu.poll(now);
        for gpu in self.gpus.iter_mut() {
            gpu.poll(now);
        }
        self.io.poll_all(now);
        self.memory.poll();

        let gpus: Vec<_> = self.gpus.iter().map(|g| g.system_metrics()).collect();

        let mut cpu = self.cpu.metrics();
        for apu in gpus.iter().filter(|g| g.is_apu) {
            cpu.power = cpu.power.max(apu.apu_cpu_power);
            cpu.temp = cpu.temp.max(apu.apu_cpu_temp);
        }

        let processes: BTreeMap<Pid, ProcessMetrics> = self
            .pids
            .iter()
            .map(|&pid| {
                let metrics = ProcessMetrics {
                    gpus: self.gpus.iter().map(|g| g.process_metrics(pid)).collect(),
                    memory: self.memory.process(pid),
                    io: self.io.rates(pid),
                };
                (pid, metrics)
            })
            .collect();

        self.cycles += 1;
        Snapshot {
            cpu,
            cores: self.cpu.cores().to_vec(),
            gpus,
            memory: self.memory.system(),
            processes,
            cycles: self.cycles,
        }
    }
}

pub async fn run(
    mut aggregator: Aggregator,
    shared: SharedSnapshot,
    interval: Duration,
    mut new_pids: mpsc::UnboundedReceiver<Pid>,
    metrics: Option<Arc<Metrics>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("aggregator received shutdown signal");
                break;
            }
            Some(pid) = new_pids.recv() => {
                aggregator.register_pid(pid);
            }
            _ = ticker.tick() => {
                let started = Instant::now();
                let snapshot = aggregator.cycle(started);
                if let Some(metrics) = &metrics {
                    metrics.update_from_snapshot(&snapshot);
                }
                shared.store(snapshot).await;
                trace!(elapsed_us = started.elapsed().as_micros() as u64, "aggregator cycle done");
            }
        }
    }
}
