pub mod amdgpu;
pub mod intel;
pub mod nvidia;

use crate::collectors::Pid;
use crate::state::{GpuProcessMetrics, GpuSystemMetrics};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const MAX_GPUS: usize = 8;

pub const VENDOR_AMD: u16 = 0x1002;
pub const VENDOR_INTEL: u16 = 0x8086;
pub const VENDOR_NVIDIA: u16 = 0x10de;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Amd,
    Intel,
    Nvidia,
}

impl Vendor {
    pub fn from_id(vendor_id: u16) -> Option<Self> {
        match vendor_id {
            VENDOR_AMD => Some(Self::Amd),
            VENDOR_INTEL => Some(Self::Intel),
            VENDOR_NVIDIA => Some(Self::Nvidia),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd => "amdgpu",
            Self::Intel => "intel",
            Self::Nvidia => "nvidia",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: Vendor,
    pub drm_node: String,
    pub pci_dev: String,
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub system: bool,
    pub process: bool,
}

pub trait GpuBackend: Send {
    fn info(&self) -> &DeviceInfo;

    fn capabilities(&self) -> Capabilities;

    fn poll(&mut self, now: Instant);

    fn system_metrics(&self) -> GpuSystemMetrics;

    fn process_metrics(&self, pid: Pid) -> GpuProcessMetrics;

    fn add_pid(&mut self, pid: Pid);

    fn remove_pid(&mut self, pid: Pid);
}

pub type Gpu = Box<dyn GpuBackend>;

pub fn enumerate_devices(drm_class: &Path) -> Vec<DeviceInfo> {
    let entries = match fs::read_dir(drm_class) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %drm_class.display(), error = %err, "cannot list drm devices");
            return Vec::new();
        }
    };

    let mut cards: Vec<(u32, String)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let index = name.strip_prefix("card")?.parse::<u32>().ok()?;
            Some((index, name))
        })
        .collect();
    cards.sort();

    cards
        .into_iter()
        .filter_map(|(_, node)| {
            let device_dir = drm_class.join(&node).join("device");
            let vendor_id = read_hex_id(&device_dir.join("vendor"))?;
            let device_id = read_hex_id(&device_dir.join("device")).unwrap_or(0);
            let Some(vendor) = Vendor::from_id(vendor_id) else {
                debug!(node = %node, vendor_id = %format!("{vendor_id:#06x}"), "skipping gpu from unknown vendor");
                return None;
            };
            let pci_dev = fs::read_link(&device_dir)
                .ok()
                .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_default();
            Some(DeviceInfo {
                vendor,
                drm_node: node,
                pci_dev,
                vendor_id,
                device_id,
            })
        })
        .collect()
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let content = fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    u16::from_str_radix(trimmed.trim_start_matches("0x"), 16).ok()
}

/// Builds a backend for every supported device. NVIDIA devices share one
/// library session; a failed session leaves them enumerated but unavailable.
pub fn discover(sys_root: &Path, proc_root: &Path) -> Vec<Gpu> {
    let drm_class: PathBuf = sys_root.join("class").join("drm");
    let devices = enumerate_devices(&drm_class);

    let nvml = if devices.iter().any(|d| d.vendor == Vendor::Nvidia) {
        nvidia::init_library().map(Arc::new)
    } else {
        None
    };

    devices
        .into_iter()
        .map(|info| {
            info!(
                vendor = info.vendor.as_str(),
                node = %info.drm_node,
                pci = %info.pci_dev,
                vendor_id = %format!("{:#06x}", info.vendor_id),
                device_id = %format!("{:#06x}", info.device_id),
                "gpu found"
            );
            let gpu: Gpu = match info.vendor {
                Vendor::Amd => Box::new(amdgpu::AmdGpu::new(info, &drm_class, proc_root)),
                Vendor::Intel => Box::new(intel::IntelGpu::new(info, &drm_class, proc_root)),
                Vendor::Nvidia => Box::new(nvidia::NvidiaGpu::new(info, nvml.clone())),
            };
            let caps = gpu.capabilities();
            if !caps.system {
                warn!(node = %gpu.info().drm_node, "no device-wide sensors, gpu fields will read 0");
            }
            debug!(
                node = %gpu.info().drm_node,
                system = caps.system,
                process = caps.process,
                "gpu backend ready"
            );
            gpu
        })
        .collect()
}
