//! Error types for the deepseis-ml crate.

use deepseis_core::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for dataset, augmentation and training operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data not found: {what} ({path})")]
    DataNotFound { what: String, path: PathBuf },

    #[error("Shape mismatch for {sample}: image is {image_width}x{image_height}, mask is {mask_width}x{mask_height}")]
    ShapeMismatch {
        sample: String,
        image_width: u32,
        image_height: u32,
        mask_width: u32,
        mask_height: u32,
    },

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Observer '{observer}' failed: {message}")]
    Observer { observer: String, message: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Image error for {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MlError {
    pub fn data_not_found(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::DataNotFound {
            what: what.into(),
            path: path.into(),
        }
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn observer(observer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Observer {
            observer: observer.into(),
            message: message.into(),
        }
    }
}
