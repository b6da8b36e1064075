use crate::collectors::Pid;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CpuMetrics {
    pub load: i32,
    pub frequency: i32,
    pub temp: i32,
    pub power: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CoreMetrics {
    pub load: i32,
    pub frequency: i32,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GpuSystemMetrics {
    pub load: i32,

    pub vram_used: f32,
    pub gtt_used: f32,
    pub memory_total: f32,
    pub memory_clock: i32,
    pub memory_temp: i32,

    pub temperature: i32,
    pub junction_temperature: i32,

    pub core_clock: i32,
    pub voltage: i32,

    pub power_usage: f32,
    pub power_limit: f32,

    pub is_apu: bool,
    pub apu_cpu_power: f32,
    pub apu_cpu_temp: i32,

    pub is_power_throttled: bool,
    pub is_current_throttled: bool,
    pub is_temp_throttled: bool,
    pub is_other_throttled: bool,

    pub fan_speed: i32,
    pub fan_rpm: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GpuProcessMetrics {
    pub load: i32,
    pub vram_used: f32,
    pub gtt_used: f32,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MemoryMetrics {
    pub used: f32,
    pub total: f32,
    pub swap_used: f32,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProcessMemory {
    pub resident: f32,
    pub shared: f32,
    pub virt: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IoRates {
    pub read_mb_per_sec: f32,
    pub write_mb_per_sec: f32,
}

/// Everything known about one client process. `gpus` is indexed like
/// [`Snapshot::gpus`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ProcessMetrics {
    pub gpus: Vec<GpuProcessMetrics>,
    pub memory: ProcessMemory,
    pub io: IoRates,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub cpu: CpuMetrics,
    pub cores: Vec<CoreMetrics>,
    pub gpus: Vec<GpuSystemMetrics>,
    pub memory: MemoryMetrics,
    pub processes: BTreeMap<Pid, ProcessMetrics>,
    pub cycles: u64,
}

impl Snapshot {
    pub fn process(&self, pid: Pid) -> Option<&ProcessMetrics> {
        self.processes.get(&pid)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Snapshot>>,
}

impl SharedSnapshot {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn load(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    pub async fn store(&self, snapshot: Snapshot) {
        *self.inner.write().await = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_get_a_copy() {
        let shared = SharedSnapshot::default();
        let mut copy = shared.load().await;
        copy.cpu.load = 42;
        assert_eq!(shared.load().await.cpu.load, 0);

        shared.store(copy).await;
        assert_eq!(shared.load().await.cpu.load, 42);
    }

    #[test]
    fn gpu_fields_serialize_in_declaration_order() {
        let json = serde_json::to_string(&GpuSystemMetrics::default()).unwrap();
        let load = json.find("\"load\"").unwrap();
        let junction = json.find("\"junction_temperature\"").unwrap();
        let fan_rpm = json.find("\"fan_rpm\"").unwrap();
        assert!(load < junction && junction < fan_rpm);
    }
}
