use crate::collectors::Pid;
use crate::gpu::MAX_GPUS;
use crate::state::{
    CoreMetrics, CpuMetrics, GpuProcessMetrics, GpuSystemMetrics, IoRates, MemoryMetrics,
    ProcessMemory, Snapshot,
};
use thiserror::Error;

pub const MAX_CORES: usize = 256;

const GPU_PROCESS_SIZE: usize = 4 + 4 + 4;
const GPU_SYSTEM_SIZE: usize = 4 * 12 + 1 + 4 + 4 + 4 + 4 + 1;
const GPU_ENTRY_SIZE: usize = 1 + GPU_PROCESS_SIZE + GPU_SYSTEM_SIZE;
const MEMORY_SIZE: usize = 6 * 4;
const CPU_SIZE: usize = 4 * 4;
const CORE_SIZE: usize = 4 + 4;

pub const WIRE_MESSAGE_SIZE: usize = 1
    + MAX_GPUS * GPU_ENTRY_SIZE
    + MEMORY_SIZE
    + CPU_SIZE
    + MAX_CORES * CORE_SIZE
    + 2
    + 4
    + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("wire message must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("wire message claims {count} entries of {what}, capacity is {max}")]
    Count {
        what: &'static str,
        count: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct WireGpu {
    pub process: GpuProcessMetrics,
    pub system: GpuSystemMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct WireMessage {
    pub gpus: Vec<WireGpu>,
    pub memory: MemoryMetrics,
    pub process_memory: ProcessMemory,
    pub cpu: CpuMetrics,
    pub cores: Vec<CoreMetrics>,
    pub io: IoRates,
}

impl WireMessage {
    /// An unknown pid gets zeroed process fields.
    pub fn for_process(snapshot: &Snapshot, pid: Pid) -> Self {
        let process = snapshot.process(pid);
        let gpus = snapshot
            .gpus
            .iter()
            .enumerate()
            .map(|(i, system)| WireGpu {
                process: process
                    .and_then(|p| p.gpus.get(i).copied())
                    .unwrap_or_default(),
                system: system.clone(),
            })
            .collect();

        Self {
            gpus,
            memory: snapshot.memory.clone(),
            process_memory: process.map(|p| p.memory.clone()).unwrap_or_default(),
            cpu: snapshot.cpu.clone(),
            cores: snapshot.cores.clone(),
            io: process.map(|p| p.io).unwrap_or_default(),
        }
    }

    /// Entries beyond `MAX_GPUS`/`MAX_CORES` are not encoded; startup refuses
    /// hosts that exceed them.
    pub fn encode(&self) -> [u8; WIRE_MESSAGE_SIZE] {
        let mut buf = [0_u8; WIRE_MESSAGE_SIZE];
        let mut w = Writer::new(&mut buf);

        let num_gpus = self.gpus.len().min(MAX_GPUS);
        w.u8(num_gpus as u8);
        for i in 0..MAX_GPUS {
            match self.gpus.get(i).filter(|_| i < num_gpus) {
                Some(gpu) => {
                    w.bool(true);
                    write_process(&mut w, &gpu.process);
                    write_system(&mut w, &gpu.system);
                }
                None => w.skip(GPU_ENTRY_SIZE),
            }
        }

        w.f32(self.memory.used);
        w.f32(self.memory.total);
        w.f32(self.memory.swap_used);
        w.f32(self.process_memory.resident);
        w.f32(self.process_memory.shared);
        w.f32(self.process_memory.virt);

        w.i32(self.cpu.load);
        w.i32(self.cpu.frequency);
        w.i32(self.cpu.temp);
        w.f32(self.cpu.power);

        let num_cores = self.cores.len().min(MAX_CORES);
        for i in 0..MAX_CORES {
            match self.cores.get(i).filter(|_| i < num_cores) {
                Some(core) => {
                    w.i32(core.load);
                    w.i32(core.frequency);
                }
                None => w.skip(CORE_SIZE),
            }
        }
        w.u16(num_cores as u16);

        w.f32(self.io.read_mb_per_sec);
        w.f32(self.io.write_mb_per_sec);

        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != WIRE_MESSAGE_SIZE {
            return Err(WireError::Length {
                expected: WIRE_MESSAGE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut r = Reader::new(bytes);

        let num_gpus = r.u8() as usize;
        if num_gpus > MAX_GPUS {
            return Err(WireError::Count {
                what: "gpus",
                count: num_gpus,
                max: MAX_GPUS,
            });
        }
        let mut gpus = Vec::with_capacity(num_gpus);
        for i in 0..MAX_GPUS {
            if i >= num_gpus {
                r.skip(GPU_ENTRY_SIZE);
                continue;
            }
            let _is_active = r.bool();
            let process = read_process(&mut r);
            let system = read_system(&mut r);
            gpus.push(WireGpu { process, system });
        }

        let memory = MemoryMetrics {
            used: r.f32(),
            total: r.f32(),
            swap_used: r.f32(),
        };
        let process_memory = ProcessMemory {
            resident: r.f32(),
            shared: r.f32(),
            virt: r.f32(),
        };
        let cpu = CpuMetrics {
            load: r.i32(),
            frequency: r.i32(),
            temp: r.i32(),
            power: r.f32(),
        };

        let cores_start = r.pos;
        r.skip(MAX_CORES * CORE_SIZE);
        let num_cores = r.u16() as usize;
        if num_cores > MAX_CORES {
            return Err(WireError::Count {
                what: "cores",
                count: num_cores,
                max: MAX_CORES,
            });
        }
        let io = IoRates {
            read_mb_per_sec: r.f32(),
            write_mb_per_sec: r.f32(),
        };

        let mut cores_reader = Reader::new(bytes);
        cores_reader.pos = cores_start;
        let cores = (0..num_cores)
            .map(|_| CoreMetrics {
                load: cores_reader.i32(),
                frequency: cores_reader.i32(),
            })
            .collect();

        Ok(Self {
            gpus,
            memory,
            process_memory,
            cpu,
            cores,
            io,
        })
    }
}

fn write_process(w: &mut Writer<'_>, p: &GpuProcessMetrics) {
    w.i32(p.load);
    w.f32(p.vram_used);
    w.f32(p.gtt_used);
}

fn write_system(w: &mut Writer<'_>, s: &GpuSystemMetrics) {
    w.i32(s.load);
    w.f32(s.vram_used);
    w.f32(s.gtt_used);
    w.f32(s.memory_total);
    w.i32(s.memory_clock);
    w.i32(s.memory_temp);
    w.i32(s.temperature);
    w.i32(s.junction_temperature);
    w.i32(s.core_clock);
    w.i32(s.voltage);
    w.f32(s.power_usage);
    w.f32(s.power_limit);
    w.bool(s.is_apu);
    w.f32(s.apu_cpu_power);
    w.i32(s.apu_cpu_temp);
    w.bool(s.is_power_throttled);
    w.bool(s.is_current_throttled);
    w.bool(s.is_temp_throttled);
    w.bool(s.is_other_throttled);
    w.i32(s.fan_speed);
    w.bool(s.fan_rpm);
}

fn read_process(r: &mut Reader<'_>) -> GpuProcessMetrics {
    GpuProcessMetrics {
        load: r.i32(),
        vram_used: r.f32(),
        gtt_used: r.f32(),
    }
}

fn read_system(r: &mut Reader<'_>) -> GpuSystemMetrics {
    GpuSystemMetrics {
        load: r.i32(),
        vram_used: r.f32(),
        gtt_used: r.f32(),
        memory_total: r.f32(),
        memory_clock: r.i32(),
        memory_temp: r.i32(),
        temperature: r.i32(),
        junction_temperature: r.i32(),
        core_clock: r.i32(),
        voltage: r.i32(),
        power_usage: r.f32(),
        power_limit: r.f32(),
        is_apu: r.bool(),
        apu_cpu_power: r.f32(),
        apu_cpu_temp: r.i32(),
        is_power_throttled: r.bool(),
        is_current_throttled: r.bool(),
        is_temp_throttled: r.bool(),
        is_other_throttled: r.bool(),
        fan_speed: r.i32(),
        fan_rpm: r.bool(),
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.put(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0_u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn bool(&mut self) -> bool {
        self.u8() != 0
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProcessMetrics;

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot {
            cpu: CpuMetrics {
                load: 23,
                frequency: 4100,
                temp: 58,
                power: 31.5,
            },
            cores: vec![
                CoreMetrics {
                    load: 40,
                    frequency: 4100
                };
                16
            ],
            gpus: vec![GpuSystemMetrics {
                load: 88,
                vram_used: 6.5,
                temperature: 71,
                fan_speed: 1800,
                fan_rpm: true,
                is_temp_throttled: true,
                ..GpuSystemMetrics::default()
            }],
            memory: MemoryMetrics {
                used: 12.0,
                total: 32.0,
                swap_used: 0.5,
            },
            ..Snapshot::default()
        };
        snapshot.processes.insert(
            900,
            ProcessMetrics {
                gpus: vec![GpuProcessMetrics {
                    load: 61,
                    vram_used: 2.25,
                    gtt_used: 0.125,
                }],
                memory: ProcessMemory {
                    resident: 1.5,
                    shared: 0.25,
                    virt: 8.0,
                },
                io: IoRates {
                    read_mb_per_sec: 3.0,
                    write_mb_per_sec: 0.5,
                },
            },
        );
        snapshot
    }

    #[test]
    fn layout_size() {
        assert_eq!(GPU_ENTRY_SIZE, 79);
        assert_eq!(WIRE_MESSAGE_SIZE, 2731);
    }

    #[test]
    fn size_does_not_depend_on_content() {
        let empty = WireMessage::default().encode();
        let full = WireMessage::for_process(&snapshot(), 900).encode();
        assert_eq!(empty.len(), full.len());
        assert_ne!(empty, full);
    }

    #[test]
    fn decodes_what_was_encoded() {
        let message = WireMessage::for_process(&snapshot(), 900);
        let decoded = WireMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.gpus[0].process.load, 61);
        assert_eq!(decoded.cores.len(), 16);
        assert_eq!(decoded.io.read_mb_per_sec, 3.0);
    }

    #[test]
    fn unknown_pid_gets_zeroed_process_fields() {
        let message = WireMessage::for_process(&snapshot(), 12345);
        assert_eq!(message.gpus.len(), 1);
        assert_eq!(message.gpus[0].process, GpuProcessMetrics::default());
        assert_eq!(message.gpus[0].system.load, 88);
        assert_eq!(message.process_memory, ProcessMemory::default());
        assert_eq!(message.io, IoRates::default());
    }

    #[test]
    fn rejects_wrong_length_and_bad_counts() {
        assert_eq!(
            WireMessage::decode(&[0; 10]),
            Err(WireError::Length {
                expected: WIRE_MESSAGE_SIZE,
                actual: 10
            })
        );
        let mut bytes = WireMessage::default().encode();
        bytes[0] = 9;
        assert!(matches!(
            WireMessage::decode(&bytes),
            Err(WireError::Count { what: "gpus", .. })
        ));
    }

    #[test]
    fn first_gpu_fields_at_fixed_offsets() {
        let bytes = WireMessage::for_process(&snapshot(), 900).encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 1);
        assert_eq!(i32::from_le_bytes(bytes[2..6].try_into().unwrap()), 61);
        assert_eq!(i32::from_le_bytes(bytes[14..18].try_into().unwrap()), 88);
        assert_eq!(bytes[1 + GPU_ENTRY_SIZE], 0);
    }
}
