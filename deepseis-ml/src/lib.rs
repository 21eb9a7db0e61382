//! # deepseis-ml — patch datasets, augmentation and segmentation training
//!
//! Cuts seismic slices into fixed-size patches, augments them, and trains per-pixel
//! classifiers with an observer-driven epoch loop that evaluates, logs and snapshots
//! after every epoch.

// Data
pub mod augment;
pub mod data;
pub mod error;

// Models and training
pub mod models;
pub mod training;

// Re-exports
pub use augment::{AugmentationPipeline, Transform};
pub use data::{
    BoundaryPolicy, LoaderOptions, PatchDataset, PatchLoader, PatchOptions, PatchSample,
    VolumeSample,
};
pub use error::MlError;
pub use models::{ModelRegistry, ModelSpec, SegmentationModel};
pub use training::{
    Experiment, LoopState, RunSummary, SegmentationMetrics, Trainer, TrainingObserver,
    TrainingState,
};
