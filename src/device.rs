//! # Compute Devices
//!
//! Where alignment models run, and the cleanup step after they are dropped.
//!
//! ## Crossing the process boundary:
//! A candle [`Device`] is a live handle and cannot be serialized, so options
//! carry a [`DevicePreference`] and each process resolves it on its own.
//! GPU detection runs once per process.

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// First usable GPU of this process, `None` when only the CPU is available.
static DETECTED_GPU: OnceLock<Option<Device>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// A GPU if one is usable, the CPU otherwise.
    #[default]
    Auto,
    Cpu,
    /// Falls back to the CPU when CUDA cannot be opened.
    Cuda,
    /// Falls back to the CPU when Metal cannot be opened.
    Metal,
}

impl DevicePreference {
    /// Open the device this preference names.
    pub fn resolve(self) -> Device {
        let device = match self {
            DevicePreference::Cpu => Some(Device::Cpu),
            DevicePreference::Auto => detected_gpu(),
            DevicePreference::Cuda => open_gpu(DevicePreference::Cuda),
            DevicePreference::Metal => open_gpu(DevicePreference::Metal),
        };

        device.unwrap_or_else(|| {
            if matches!(self, DevicePreference::Cuda | DevicePreference::Metal) {
                warn!("{} requested but unavailable, aligning on CPU", self);
            }
            Device::Cpu
        })
    }
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            other => Err(format!(
                "Unknown device '{}', expected auto, cpu, cuda or metal",
                other
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Cpu => "cpu",
            DevicePreference::Cuda => "cuda",
            DevicePreference::Metal => "metal",
        };
        f.write_str(name)
    }
}

fn open_gpu(kind: DevicePreference) -> Option<Device> {
    let opened = match kind {
        DevicePreference::Cuda => Device::new_cuda(0),
        DevicePreference::Metal => Device::new_metal(0),
        DevicePreference::Auto | DevicePreference::Cpu => return None,
    };
    match opened {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("{} device 0 not usable: {}", kind, e);
            None
        }
    }
}

fn detected_gpu() -> Option<Device> {
    DETECTED_GPU
        .get_or_init(|| {
            let gpu = open_gpu(DevicePreference::Cuda).or_else(|| open_gpu(DevicePreference::Metal));
            match &gpu {
                Some(device) => info!("Alignment models will run on {}", label(device)),
                None => info!("No GPU available, alignment models will run on CPU"),
            }
            gpu
        })
        .clone()
}

/// Short name of `device` for logs.
pub fn label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Wait for queued work on `device` to finish after a model was dropped, so
/// its buffers are actually freed before anything else is loaded.
pub fn reclaim_memory(device: &Device) {
    if device.is_cpu() {
        return;
    }
    if let Err(e) = device.synchronize() {
        warn!("Could not synchronize {} after unloading: {}", label(device), e);
    } else {
        debug!("{} synchronized after unloading", label(device));
    }
}
