use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use nvml_wrapper::{cuda_driver_version_major, cuda_driver_version_minor, Nvml};
use tracing::warn;

use crate::error::{Error, Result};

static INIT: Once = Once::new();
static NVML: Mutex<Option<Nvml>> = Mutex::new(None);

pub const CUDNN_FRONTEND_PATHS: &[&str] = &[
    "/usr/local/cuda/include/cudnn_frontend.h",
    "/usr/include/cudnn_frontend.h",
    "C:\\Program Files\\NVIDIA GPU Computing Toolkit\\CUDA\\v11.0\\include\\cudnn_frontend.h",
];

pub const CUDNN_VERSION_PATHS: &[&str] = &[
    "/usr/local/cuda/include/cudnn_version.h",
    "/usr/include/cudnn_version.h",
    "/usr/include/x86_64-linux-gnu/cudnn_version.h",
];

/// Float format to train in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Bf16 => "bf16",
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Precision::Fp32 => 4,
            Precision::Fp16 | Precision::Bf16 => 2,
        }
    }

    /// bf16 on Ampere or newer, fp16 on older CUDA GPUs, fp32 without a GPU.
    pub fn recommended(devices: &[DeviceInfo]) -> Self {
        match devices.first() {
            Some(device) if device.compute_capability.0 >= 8 => Precision::Bf16,
            Some(_) => Precision::Fp16,
            None => Precision::Fp32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub total_memory: u64,
    pub free_memory: u64,
    /// (major, minor)
    pub compute_capability: (i32, i32),
}

#[derive(Debug, Clone)]
pub struct GpuReport {
    pub driver_version: String,
    /// (major, minor)
    pub cuda_version: (i32, i32),
    pub devices: Vec<DeviceInfo>,
}

fn with_nvml<T>(f: impl FnOnce(&Nvml) -> Result<T>) -> Result<T> {
    INIT.call_once(|| match Nvml::init() {
        Ok(nvml) => {
            if let Ok(mut guard) = NVML.lock() {
                *guard = Some(nvml);
            }
        }
        Err(e) => warn!(error = %e, "NVML initialization failed"),
    });
    let guard = NVML.lock().map_err(|_| Error::Config("NVML handle poisoned".to_string()))?;
    let nvml = guard.as_ref().ok_or_else(|| Error::Config("NVML is not available".to_string()))?;
    f(nvml)
}

pub fn probe_gpus() -> Result<GpuReport> {
    with_nvml(|nvml| {
        let driver_version = nvml.sys_driver_version()?;
        let cuda = nvml.sys_cuda_driver_version()?;
        let mut devices = Vec::new();
        for index in 0..nvml.device_count()? {
            let device = nvml.device_by_index(index)?;
            let memory = device.memory_info()?;
            let cc = device.cuda_compute_capability()?;
            devices.push(DeviceInfo {
                index,
                name: device.name()?,
                total_memory: memory.total,
                free_memory: memory.free,
                compute_capability: (cc.major, cc.minor),
            });
        }
        Ok(GpuReport {
            driver_version,
            cuda_version: (cuda_driver_version_major(cuda), cuda_driver_version_minor(cuda)),
            devices,
        })
    })
}

/// Free memory of one device in bytes.
pub fn free_gpu_memory(index: u32) -> Result<u64> {
    with_nvml(|nvml| Ok(nvml.device_by_index(index)?.memory_info()?.free))
}

/// First of `candidates` that exists.
pub fn find_first_existing(candidates: &[&str]) -> Option<PathBuf> {
    candidates.iter().map(PathBuf::from).find(|path| path.exists())
}

pub fn find_cudnn_frontend() -> Option<PathBuf> {
    find_first_existing(CUDNN_FRONTEND_PATHS)
}

/// `(major, minor, patch)` from the `CUDNN_*` defines of a `cudnn_version.h`.
pub fn parse_cudnn_version(header: &str) -> Option<(u32, u32, u32)> {
    let define = |name: &str| -> Option<u32> {
        header.lines().find_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some("#define"), Some(key), Some(value)) if key == name => value.parse().ok(),
                _ => None,
            }
        })
    };
    Some((define("CUDNN_MAJOR")?, define("CUDNN_MINOR")?, define("CUDNN_PATCHLEVEL")?))
}

pub fn find_cudnn_version() -> Option<(u32, u32, u32)> {
    let path = find_first_existing(CUDNN_VERSION_PATHS)?;
    read_cudnn_version(&path)
}

fn read_cudnn_version(path: &Path) -> Option<(u32, u32, u32)> {
    parse_cudnn_version(&fs::read_to_string(path).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(major: i32) -> DeviceInfo {
        DeviceInfo { index: 0, name: "test".to_string(), total_memory: 0, free_memory: 0, compute_capability: (major, 0) }
    }

    #[test]
    fn test_recommended_precision() {
        assert_eq!(Precision::recommended(&[]), Precision::Fp32);
        assert_eq!(Precision::recommended(&[device(7)]), Precision::Fp16);
        assert_eq!(Precision::recommended(&[device(8)]), Precision::Bf16);
        assert_eq!(Precision::recommended(&[device(9), device(7)]).as_str(), "bf16");
    }

    #[test]
    fn test_parse_cudnn_version() {
        let header = "#ifndef CUDNN_VERSION_H_\n#define CUDNN_MAJOR 8\n#define CUDNN_MINOR 9\n#define CUDNN_PATCHLEVEL 7\n\n#define CUDNN_VERSION (CUDNN_MAJOR * 1000 + CUDNN_MINOR * 100 + CUDNN_PATCHLEVEL)\n";
        assert_eq!(parse_cudnn_version(header), Some((8, 9, 7)));
        assert_eq!(parse_cudnn_version("#define CUDNN_MAJOR 8\n"), None);
    }

    #[test]
    fn test_find_first_existing() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("cudnn_version.h");
        fs::write(&present, "#define CUDNN_MAJOR 9\n#define CUDNN_MINOR 1\n#define CUDNN_PATCHLEVEL 0\n").unwrap();
        let missing = dir.path().join("missing.h");
        let candidates = [missing.to_str().unwrap(), present.to_str().unwrap()];
        assert_eq!(find_first_existing(&candidates), Some(present.clone()));
        assert_eq!(read_cudnn_version(&present), Some((9, 1, 0)));
    }

    #[test]
    fn test_probe_gpus() {
        // only meaningful on a machine with NVML
        match probe_gpus() {
            Ok(report) => {
                println!("GPU report: {:?}", report);
                assert!(report.devices.iter().all(|d| d.free_memory <= d.total_memory));
            }
            Err(e) => println!("NVML not available in test environment: {}", e),
        }
    }
}
