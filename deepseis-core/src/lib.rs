//! # deepseis-core
//!
//! Experiment configuration, run context and persistence helpers shared by the
//! deepseis training crates.

pub mod config;
pub mod context;
pub mod error;
pub mod persistence;

pub use config::{
    ConfigLoader, DepthMode, ExperimentConfig, IGNORE_LABEL, Orientation, TestSplit,
    load_config,
};
pub use context::{Device, RunContext, select_device};
pub use error::ConfigError;
