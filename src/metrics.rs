use crate::state::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub cpu_load_percent: Gauge,
    pub cpu_frequency_mhz: Gauge,
    pub cpu_temperature_celsius: Gauge,
    pub cpu_power_watts: Gauge,
    pub cpu_core_count: Gauge,
    pub memory_used_gib: Gauge,
    pub memory_total_gib: Gauge,
    pub swap_used_gib: Gauge,
    pub gpu_count: Gauge,
    pub gpu_load_percent: GaugeVec,
    pub gpu_vram_used_gib: GaugeVec,
    pub gpu_memory_total_gib: GaugeVec,
    pub gpu_temperature_celsius: GaugeVec,
    pub gpu_power_watts: GaugeVec,
    pub gpu_core_clock_mhz: GaugeVec,
    pub gpu_throttled: GaugeVec,
    pub tracked_processes: Gauge,
    pub aggregator_cycles_total: Counter,
    pub ipc_replies_total: Counter,
    pub ipc_rejected_total: Counter,
    pub scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let cpu_load_percent = Gauge::with_opts(opts!(
            "gpustatd_cpu_load_percent",
            "Aggregate CPU load in percent"
        ))?;
        let cpu_frequency_mhz = Gauge::with_opts(opts!(
            "gpustatd_cpu_frequency_mhz",
            "Highest core frequency in MHz"
        ))?;
        let cpu_temperature_celsius = Gauge::with_opts(opts!(
            "gpustatd_cpu_temperature_celsius",
            "CPU package temperature"
        ))?;
        let cpu_power_watts =
            Gauge::with_opts(opts!("gpustatd_cpu_power_watts", "CPU package power"))?;
        let cpu_core_count =
            Gauge::with_opts(opts!("gpustatd_cpu_core_count", "Number of CPU cores"))?;
        let memory_used_gib =
            Gauge::with_opts(opts!("gpustatd_memory_used_gib", "Used system memory"))?;
        let memory_total_gib =
            Gauge::with_opts(opts!("gpustatd_memory_total_gib", "Total system memory"))?;
        let swap_used_gib = Gauge::with_opts(opts!("gpustatd_swap_used_gib", "Used swap"))?;
        let gpu_count = Gauge::with_opts(opts!("gpustatd_gpu_count", "Number of sampled GPUs"))?;
        let gpu_load_percent = GaugeVec::new(
            opts!("gpustatd_gpu_load_percent", "GPU load in percent"),
            &["gpu"],
        )?;
        let gpu_vram_used_gib = GaugeVec::new(
            opts!("gpustatd_gpu_vram_used_gib", "Used video memory"),
            &["gpu"],
        )?;
        let gpu_memory_total_gib = GaugeVec::new(
            opts!("gpustatd_gpu_memory_total_gib", "Total video memory"),
            &["gpu"],
        )?;
        let gpu_temperature_celsius = GaugeVec::new(
            opts!("gpustatd_gpu_temperature_celsius", "GPU edge temperature"),
            &["gpu"],
        )?;
        let gpu_power_watts = GaugeVec::new(
            opts!("gpustatd_gpu_power_watts", "GPU power draw"),
            &["gpu"],
        )?;
        let gpu_core_clock_mhz = GaugeVec::new(
            opts!("gpustatd_gpu_core_clock_mhz", "GPU core clock"),
            &["gpu"],
        )?;
        let gpu_throttled = GaugeVec::new(
            opts!("gpustatd_gpu_throttled", "GPU throttle state 0/1 by reason"),
            &["gpu", "reason"],
        )?;
        let tracked_processes = Gauge::with_opts(opts!(
            "gpustatd_tracked_processes",
            "Processes registered through the IPC socket"
        ))?;
        let aggregator_cycles_total = Counter::with_opts(opts!(
            "gpustatd_aggregator_cycles_total",
            "Completed sampling cycles"
        ))?;
        let ipc_replies_total = Counter::with_opts(opts!(
            "gpustatd_ipc_replies_total",
            "Wire messages sent to IPC clients"
        ))?;
        let ipc_rejected_total = Counter::with_opts(opts!(
            "gpustatd_ipc_rejected_total",
            "IPC requests dropped for missing or malformed credentials"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "gpustatd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &cpu_load_percent)?;
        register(&registry, &cpu_frequency_mhz)?;
        register(&registry, &cpu_temperature_celsius)?;
        register(&registry, &cpu_power_watts)?;
        register(&registry, &cpu_core_count)?;
        register(&registry, &memory_used_gib)?;
        register(&registry, &memory_total_gib)?;
        register(&registry, &swap_used_gib)?;
        register(&registry, &gpu_count)?;
        register(&registry, &gpu_load_percent)?;
        register(&registry, &gpu_vram_used_gib)?;
        register(&registry, &gpu_memory_total_gib)?;
        register(&registry, &gpu_temperature_celsius)?;
        register(&registry, &gpu_power_watts)?;
        register(&registry, &gpu_core_clock_mhz)?;
        register(&registry, &gpu_throttled)?;
        register(&registry, &tracked_processes)?;
        register(&registry, &aggregator_cycles_total)?;
        register(&registry, &ipc_replies_total)?;
        register(&registry, &ipc_rejected_total)?;
        register(&registry, &scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            cpu_load_percent,
            cpu_frequency_mhz,
            cpu_temperature_celsius,
            cpu_power_watts,
            cpu_core_count,
            memory_used_gib,
            memory_total_gib,
            swap_used_gib,
            gpu_count,
            gpu_load_percent,
            gpu_vram_used_gib,
            gpu_memory_total_gib,
            gpu_temperature_celsius,
            gpu_power_watts,
            gpu_core_clock_mhz,
            gpu_throttled,
            tracked_processes,
            aggregator_cycles_total,
            ipc_replies_total,
            ipc_rejected_total,
            scrape_count_total,
        }))
    }

    /// Called once per aggregator cycle.
    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        self.cpu_load_percent.set(f64::from(snapshot.cpu.load));
        self.cpu_frequency_mhz.set(f64::from(snapshot.cpu.frequency));
        self.cpu_temperature_celsius.set(f64::from(snapshot.cpu.temp));
        self.cpu_power_watts.set(f64::from(snapshot.cpu.power));
        self.cpu_core_count.set(snapshot.cores.len() as f64);
        self.memory_used_gib.set(f64::from(snapshot.memory.used));
        self.memory_total_gib.set(f64::from(snapshot.memory.total));
        self.swap_used_gib.set(f64::from(snapshot.memory.swap_used));
        self.gpu_count.set(snapshot.gpus.len() as f64);
        self.tracked_processes.set(snapshot.processes.len() as f64);

        self.gpu_load_percent.reset();
        self.gpu_vram_used_gib.reset();
        self.gpu_memory_total_gib.reset();
        self.gpu_temperature_celsius.reset();
        self.gpu_power_watts.reset();
        self.gpu_core_clock_mhz.reset();
        self.gpu_throttled.reset();

        for (index, gpu) in snapshot.gpus.iter().enumerate() {
            let label = index.to_string();
            let label = label.as_str();
            self.gpu_load_percent
                .with_label_values(&[label])
                .set(f64::from(gpu.load));
            self.gpu_vram_used_gib
                .with_label_values(&[label])
                .set(f64::from(gpu.vram_used));
            self.gpu_memory_total_gib
                .with_label_values(&[label])
                .set(f64::from(gpu.memory_total));
            self.gpu_temperature_celsius
                .with_label_values(&[label])
                .set(f64::from(gpu.temperature));
            self.gpu_power_watts
                .with_label_values(&[label])
                .set(f64::from(gpu.power_usage));
            self.gpu_core_clock_mhz
                .with_label_values(&[label])
                .set(f64::from(gpu.core_clock));

            for (reason, active) in [
                ("power", gpu.is_power_throttled),
                ("current", gpu.is_current_throttled),
                ("temp", gpu.is_temp_throttled),
                ("other", gpu.is_other_throttled),
            ] {
                self.gpu_throttled
                    .with_label_values(&[label, reason])
                    .set(if active { 1.0 } else { 0.0 });
            }
        }

        self.aggregator_cycles_total.inc();
    }

    pub fn inc_ipc_replies(&self) {
        self.ipc_replies_total.inc();
    }

    pub fn inc_ipc_rejected(&self) {
        self.ipc_rejected_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
