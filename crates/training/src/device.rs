use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use log::{info, warn};

use crate::{config::RuntimeConfig, TrainingError};

/// Outcome of a placement decision.
///
/// The optimizer updates parameters on `primary`. Each device in `replicas`
/// hosts a copy of the model that takes a shard of every micro-batch.
#[derive(Debug, Clone)]
pub struct Placement {
    pub primary: Device,
    pub replicas: Vec<Device>,
}

impl Placement {
    pub fn cpu() -> Self {
        Self {
            primary: Device::Cpu,
            replicas: Vec::new(),
        }
    }

    /// First device is the primary; `None` when `devices` is empty.
    pub fn from_devices(devices: Vec<Device>) -> Option<Self> {
        let mut devices = devices.into_iter();
        let primary = devices.next()?;
        Some(Self {
            primary,
            replicas: devices.collect(),
        })
    }

    pub fn is_accelerated(&self) -> bool {
        !self.primary.is_cpu()
    }

    pub fn device_count(&self) -> usize {
        1 + self.replicas.len()
    }

    pub fn describe(&self) -> String {
        let kind = if self.primary.is_cuda() {
            "cuda"
        } else if self.primary.is_metal() {
            "metal"
        } else {
            "cpu"
        };
        format!("{kind} x{}", self.device_count())
    }
}

pub trait DevicePlacement {
    fn place(&self, runtime: &RuntimeConfig) -> Result<Placement, TrainingError>;
}

/// Always runs on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuPlacement;

impl DevicePlacement for CpuPlacement {
    fn place(&self, _runtime: &RuntimeConfig) -> Result<Placement, TrainingError> {
        Ok(Placement::cpu())
    }
}

/// CUDA ordinals tried when no explicit count is configured.
const MAX_VISIBLE_CUDA_DEVICES: usize = 16;

/// Uses accelerators when present and allowed, falling back to the CPU when
/// initialization fails. Every visible CUDA device is used unless
/// `runtime.accelerator_count` caps the count; the first becomes the primary
/// and the rest host replicas.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoPlacement;

impl DevicePlacement for AutoPlacement {
    fn place(&self, runtime: &RuntimeConfig) -> Result<Placement, TrainingError> {
        if runtime.no_accelerator {
            info!("accelerators disabled by configuration; using CPU");
            return Ok(Placement::cpu());
        }

        if cuda_is_available() {
            let limit = runtime.accelerator_count.unwrap_or(MAX_VISIBLE_CUDA_DEVICES);
            let mut devices = Vec::new();
            for ordinal in 0..limit {
                match Device::new_cuda(ordinal) {
                    Ok(device) => devices.push(device),
                    Err(err) => {
                        if runtime.accelerator_count.is_some() || ordinal == 0 {
                            warn!("cuda device #{ordinal} unavailable: {err}");
                        }
                        break;
                    }
                }
            }
            if let Some(placement) = Placement::from_devices(devices) {
                return Ok(placement);
            }
        } else if metal_is_available() {
            if runtime.accelerator_count.is_some_and(|count| count > 1) {
                warn!("metal exposes a single device; ignoring accelerator_count");
            }
            match Device::new_metal(0) {
                Ok(device) => {
                    return Ok(Placement {
                        primary: device,
                        replicas: Vec::new(),
                    })
                }
                Err(err) => warn!("failed to initialize metal device: {err}"),
            }
        }

        info!("no accelerator available; using CPU");
        Ok(Placement::cpu())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_accelerators_place_on_cpu() {
        let runtime = RuntimeConfig {
            no_accelerator: true,
            accelerator_count: Some(4),
            ..RuntimeConfig::default()
        };
        let placement = AutoPlacement.place(&runtime).expect("placement");
        assert!(!placement.is_accelerated());
        assert_eq!(placement.device_count(), 1);
        assert_eq!(placement.describe(), "cpu x1");
    }

    #[test]
    fn first_device_becomes_primary() {
        let placement =
            Placement::from_devices(vec![Device::Cpu, Device::Cpu, Device::Cpu]).expect("placement");
        assert_eq!(placement.replicas.len(), 2);
        assert_eq!(placement.device_count(), 3);
        assert_eq!(placement.describe(), "cpu x3");
        assert!(Placement::from_devices(Vec::new()).is_none());
    }
}
