//! Run-scoped context shared by every component of a training run.
//!
//! Device choice, seed and output locations are decided once at startup and passed
//! explicitly to the dataset, loader and driver.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::ExperimentConfig;

/// Compute device a run executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Accelerator { ordinal: usize },
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator { ordinal } => write!(f, "accelerator:{ordinal}"),
        }
    }
}

/// Outcome of resolving the requested devices against what is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub device: Device,
    /// Why the request could not be honoured, when the run fell back to CPU.
    pub fallback_reason: Option<String>,
}

/// Pick the first requested accelerator that is available, falling back to CPU.
///
/// `available` is the number of accelerators the process can see.
pub fn select_device(requested: &[usize], available: usize) -> DeviceSelection {
    match requested.first() {
        None => DeviceSelection {
            device: Device::Cpu,
            fallback_reason: None,
        },
        Some(&ordinal) if ordinal < available => DeviceSelection {
            device: Device::Accelerator { ordinal },
            fallback_reason: None,
        },
        Some(&ordinal) => DeviceSelection {
            device: Device::Cpu,
            fallback_reason: Some(format!(
                "requested accelerator {ordinal} but {available} available"
            )),
        },
    }
}

/// Number of accelerators visible to this build. Computation here is CPU-only.
pub fn available_accelerators() -> usize {
    0
}

/// Explicit run state: device, seed, determinism flags and output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub device: Device,
    pub seed: u64,
    pub deterministic: bool,
    pub workers: usize,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl RunContext {
    /// Build the context for `config`, logging a warning if the device request falls back.
    pub fn from_config(config: &ExperimentConfig) -> Self {
        let selection = select_device(&config.gpus, available_accelerators());
        if let Some(reason) = &selection.fallback_reason {
            tracing::warn!(reason = %reason, "Accelerator unavailable, falling back to CPU");
        }
        tracing::info!(
            device = %selection.device,
            seed = config.seed,
            deterministic = config.cudnn.deterministic,
            "Run context initialised"
        );
        Self {
            device: selection.device,
            seed: config.seed,
            deterministic: config.cudnn.deterministic,
            workers: config.workers,
            output_dir: config.output_dir.clone(),
            log_dir: config.log_dir.clone(),
            checkpoint_dir: config.checkpoint_dir(),
        }
    }

    /// Derive a stable seed for a named component, e.g. `"loader"` or `"model"`.
    pub fn component_seed(&self, component: &str) -> u64 {
        // FNV-1a over the component name, mixed with the run seed.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in component.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        self.seed ^ hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(seed: u64) -> RunContext {
        RunContext {
            device: Device::Cpu,
            seed,
            deterministic: true,
            workers: 0,
            output_dir: PathBuf::from("out"),
            log_dir: PathBuf::from("log"),
            checkpoint_dir: PathBuf::from("out/models"),
        }
    }

    #[test]
    fn test_no_request_is_cpu() {
        let sel = select_device(&[], 2);
        assert_eq!(sel.device, Device::Cpu);
        assert!(sel.fallback_reason.is_none());
    }

    #[test]
    fn test_available_accelerator_selected() {
        let sel = select_device(&[1, 0], 2);
        assert_eq!(sel.device, Device::Accelerator { ordinal: 1 });
    }

    #[test]
    fn test_unavailable_accelerator_falls_back() {
        let sel = select_device(&[0], 0);
        assert_eq!(sel.device, Device::Cpu);
        assert!(sel.fallback_reason.unwrap().contains("accelerator 0"));
    }

    #[test]
    fn test_component_seeds_are_stable_and_distinct() {
        let a = ctx(42);
        assert_eq!(a.component_seed("loader"), ctx(42).component_seed("loader"));
        assert_ne!(a.component_seed("loader"), a.component_seed("model"));
        assert_ne!(a.component_seed("loader"), ctx(43).component_seed("loader"));
    }
}
