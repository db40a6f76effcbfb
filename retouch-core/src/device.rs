use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DevicePreference {
    ForceCpu,
    Accelerator(usize),
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Accelerator(0)
    }
}

pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::ForceCpu => Ok(Device::Cpu),
        DevicePreference::Accelerator(ordinal) if cuda_is_available() => {
            Ok(Device::new_cuda(ordinal)?)
        }
        DevicePreference::Accelerator(ordinal) if metal_is_available() => {
            Ok(Device::new_metal(ordinal)?)
        }
        DevicePreference::Accelerator(_) => {
            tracing::warn!("no accelerator backend available, running on CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Accelerator facts reported by the info endpoint. Probed once at startup.
#[derive(Debug, Clone)]
pub struct AcceleratorInfo {
    pub cuda_available: bool,
    pub gpu_name: Option<String>,
    pub gpu_memory_gb: Option<f64>,
}

impl AcceleratorInfo {
    pub fn probe() -> Self {
        let cuda_available = cuda_is_available();
        let (gpu_name, gpu_memory_gb) = if cuda_available {
            query_nvidia_smi().unwrap_or((None, None))
        } else {
            (None, None)
        };
        Self {
            cuda_available,
            gpu_name,
            gpu_memory_gb,
        }
    }
}

/// candle reports availability but not device name or capacity, so those come
/// from the driver tooling; missing tooling degrades to nulls, not errors.
fn query_nvidia_smi() -> Option<(Option<String>, Option<f64>)> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8(output.stdout).ok()?;
    // Single-accelerator assumption: first device only.
    parse_smi_line(stdout.lines().next()?)
}

fn parse_smi_line(line: &str) -> Option<(Option<String>, Option<f64>)> {
    let (name, memory_mib) = line.rsplit_once(',')?;
    let memory_mib: f64 = memory_mib.trim().parse().ok()?;
    Some((
        Some(name.trim().to_string()),
        Some(memory_mib / 1024.0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_line() {
        let (name, memory) = parse_smi_line("NVIDIA H100 PCIe, 81559").unwrap();
        assert_eq!(name.as_deref(), Some("NVIDIA H100 PCIe"));
        let memory = memory.unwrap();
        assert!((memory - 79.65).abs() < 0.1, "got {memory}");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_smi_line("").is_none());
        assert!(parse_smi_line("no comma here").is_none());
        assert!(parse_smi_line("name, not-a-number").is_none());
    }

    #[test]
    fn force_cpu_always_selects_cpu() {
        let device = select_device(DevicePreference::ForceCpu).unwrap();
        assert!(matches!(device, Device::Cpu));
    }
}
