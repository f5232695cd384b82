//! # Device Detection and Management
//!
//! Maps the configured device name onto a candle [`Device`]. GPU
//! detection runs once per process; an explicit GPU request on a host
//! without one falls back to the CPU with a warning.

use crate::transcription::error::LoadError;
use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached best available device to avoid repeated detection
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// CUDA GPU, CPU if not available
    Cuda,
    /// Metal GPU, CPU if not available
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" | "" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(LoadError::invalid(format!(
                "unsupported device '{}' (expected auto, cpu, cuda or metal)",
                s
            ))),
        }
    }
}

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Get the best available device based on preference
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => Self::get_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::get_cuda_device().unwrap_or_else(|| {
                warn!("CUDA requested but not available, using CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::get_metal_device().unwrap_or_else(|| {
                warn!("Metal requested but not available, using CPU");
                Device::Cpu
            }),
        }
    }

    /// Get the best available device (cached)
    pub fn get_best_device() -> Device {
        BEST_DEVICE.get_or_init(Self::detect_best_device).clone()
    }

    fn detect_best_device() -> Device {
        info!("Detecting best available compute device...");

        if let Some(cuda_device) = Self::get_cuda_device() {
            info!("Selected CUDA GPU for ML inference");
            return cuda_device;
        }

        if let Some(metal_device) = Self::get_metal_device() {
            info!("Selected Metal GPU for ML inference");
            return metal_device;
        }

        info!("Using CPU for ML inference (no GPU acceleration available)");
        Device::Cpu
    }

    fn get_cuda_device() -> Option<Device> {
        match Device::new_cuda(0) {
            Ok(device) => {
                debug!("CUDA device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("CUDA not available: {}", e);
                None
            }
        }
    }

    fn get_metal_device() -> Option<Device> {
        match Device::new_metal(0) {
            Ok(device) => {
                debug!("Metal device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("Metal not available: {}", e);
                None
            }
        }
    }

    /// Get device information for logging/debugging
    pub fn get_device_info(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "CPU",
            Device::Cuda(_) => "CUDA GPU",
            Device::Metal(_) => "Metal GPU (Apple Silicon)",
        }
    }
}

/// Resolve a configured device name, rejecting names we do not know.
pub fn resolve_device(device_str: &str) -> Result<Device, LoadError> {
    let preference: DevicePreference = device_str.parse()?;
    Ok(DeviceManager::get_device(preference))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("cuda".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
    }

    #[test]
    fn test_unknown_device_is_invalid_argument() {
        let err = resolve_device("tpu").unwrap_err();
        assert!(matches!(err, LoadError::InvalidArgument(_)));
        assert!(err.to_string().contains("'tpu'"));
    }

    #[test]
    fn test_cpu_is_always_available() {
        let device = resolve_device("cpu").unwrap();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(DeviceManager::get_device_info(&device), "CPU");
    }
}
