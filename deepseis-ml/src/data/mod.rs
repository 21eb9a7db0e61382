//! Seismic slice loading, patch sampling and batching.

pub mod dataset;
pub mod loader;
pub mod patch;
pub mod volume;

pub use dataset::{PatchDataset, PatchImage, PatchOptions, PatchSample};
pub use loader::{Batch, BatchStream, LoaderOptions, PatchLoader};
pub use patch::{BoundaryPolicy, PatchLocation, enumerate_patches, window_offsets};
pub use volume::{LabelMask, SeismicImage, SlicePair, VolumeSample};
