//! Experiment configuration for deepseis.
//!
//! Uses `figment` for layered configuration: per-field defaults -> base config chain ->
//! experiment file -> environment -> explicit `KEY=VALUE` overrides.
//!
//! Experiment files are YAML with upper-case section keys:
//!
//! ```yaml
//! BASE: base.yaml          # optional parent config, resolved relative to this file
//! DATASET:
//!   ROOT: /data/penobscot
//!   NUM_CLASSES: 7
//! TRAIN:
//!   PATCH_SIZE: 128
//!   STRIDE: 64
//!   MEAN: -0.0001777
//!   STD: 0.14076
//! ```

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment prefix for configuration overrides (`DEEPSEIS_TRAIN__MAX_LR=0.02`).
pub const ENV_PREFIX: &str = "DEEPSEIS_";

/// Maximum depth of a `BASE` inheritance chain.
const MAX_BASE_DEPTH: usize = 16;

/// Mask value excluded from loss and metric computation.
pub const IGNORE_LABEL: u8 = 255;

/// Top-level experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Parent config named by the file. Consumed while merging the chain, so a loaded
    /// config always has `None` here and the resolved YAML stands alone.
    #[serde(default, skip_serializing)]
    pub base: Option<PathBuf>,
    /// Root directory for checkpoints.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory for summaries and JSON logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Requested accelerator ordinals. Empty means CPU.
    #[serde(default)]
    pub gpus: Vec<usize>,
    /// Background loader workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Log training progress every N iterations.
    #[serde(default = "default_print_freq")]
    pub print_freq: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub cudnn: CudnnConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    pub train: TrainConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub test: TestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct CudnnConfig {
    #[serde(default = "default_true")]
    pub benchmark: bool,
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CudnnConfig {
    fn default() -> Self {
        Self {
            benchmark: true,
            deterministic: false,
            enabled: true,
        }
    }
}

/// Slice direction used to cut 2D sections out of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Inline,
    Crossline,
}

impl Orientation {
    /// Directory under the dataset root holding slices of this orientation.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Inline => "inlines",
            Self::Crossline => "crosslines",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub num_classes: usize,
    /// Per-class loss weights; uniform when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_weights: Option<Vec<f64>>,
    #[serde(default)]
    pub orientation: Orientation,
    /// Fraction of slices held out for validation when no split file exists.
    #[serde(default = "default_val_ratio")]
    pub val_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    /// Checkpoint to initialize weights from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretrained: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            in_channels: default_in_channels(),
            pretrained: None,
        }
    }
}

/// How depth information is encoded into extra input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthMode {
    #[default]
    No,
    Patch,
    Voxel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct SizeConfig {
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct AugmentationsConfig {
    #[serde(default = "default_resize")]
    pub resize: SizeConfig,
    #[serde(default = "default_pad")]
    pub pad: SizeConfig,
}

impl Default for AugmentationsConfig {
    fn default() -> Self {
        Self {
            resize: default_resize(),
            pad: default_pad(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct TrainConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size_per_gpu: usize,
    #[serde(default)]
    pub begin_epoch: usize,
    #[serde(default = "default_end_epoch")]
    pub end_epoch: usize,
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    #[serde(default = "default_max_lr")]
    pub max_lr: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Number of cosine cycles (and snapshot checkpoints) over the run.
    #[serde(default = "default_snapshots")]
    pub snapshots: usize,
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// Include the randomized flip in the training pipeline.
    #[serde(default = "default_true")]
    pub augmentation: bool,
    pub patch_size: u32,
    pub stride: u32,
    pub mean: f64,
    pub std: f64,
    #[serde(default)]
    pub depth: DepthMode,
    #[serde(default = "default_true")]
    pub complete_patches_only: bool,
    #[serde(default = "default_flip_probability")]
    pub flip_probability: f64,
    #[serde(default)]
    pub augmentations: AugmentationsConfig,
}

impl TrainConfig {
    /// Epochs per cosine cycle (`END_EPOCH // SNAPSHOTS`), never zero.
    pub fn scheduler_step(&self) -> usize {
        (self.end_epoch / self.snapshots.max(1)).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct ValidationConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size_per_gpu: usize,
    #[serde(default = "default_true")]
    pub complete_patches_only: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            batch_size_per_gpu: default_batch_size(),
            complete_patches_only: true,
        }
    }
}

/// Held-out test split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestSplit {
    #[default]
    Both,
    Test1,
    Test2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct TestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub split: TestSplit,
    #[serde(default = "default_test_stride")]
    pub test_stride: u32,
    #[serde(default = "default_true")]
    pub inline: bool,
    #[serde(default = "default_true")]
    pub crossline: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            split: TestSplit::default(),
            test_stride: default_test_stride(),
            inline: true,
            crossline: true,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}
fn default_workers() -> usize {
    4
}
fn default_print_freq() -> u64 {
    20
}
fn default_seed() -> u64 {
    2019
}
fn default_true() -> bool {
    true
}
fn default_val_ratio() -> f64 {
    0.1
}
fn default_model_name() -> String {
    "patch_linear".to_string()
}
fn default_in_channels() -> usize {
    1
}
fn default_resize() -> SizeConfig {
    SizeConfig {
        height: 200,
        width: 200,
    }
}
fn default_pad() -> SizeConfig {
    SizeConfig {
        height: 256,
        width: 256,
    }
}
fn default_batch_size() -> usize {
    32
}
fn default_end_epoch() -> usize {
    300
}
fn default_min_lr() -> f64 {
    0.001
}
fn default_max_lr() -> f64 {
    0.01
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    0.0001
}
fn default_snapshots() -> usize {
    5
}
fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
fn default_flip_probability() -> f64 {
    0.5
}
fn default_test_stride() -> u32 {
    10
}

impl ExperimentConfig {
    /// Check semantic constraints that the schema alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dataset;
        let t = &self.train;

        if d.num_classes == 0 {
            return Err(ConfigError::invalid_value(
                "DATASET.NUM_CLASSES",
                "must be at least 1",
            ));
        }
        if d.num_classes > usize::from(IGNORE_LABEL) {
            return Err(ConfigError::invalid_value(
                "DATASET.NUM_CLASSES",
                format!("must be below the ignore label {IGNORE_LABEL}"),
            ));
        }
        if let Some(weights) = &d.class_weights {
            if weights.len() != d.num_classes {
                return Err(ConfigError::invalid_value(
                    "DATASET.CLASS_WEIGHTS",
                    format!(
                        "has {} entries but NUM_CLASSES is {}",
                        weights.len(),
                        d.num_classes
                    ),
                ));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(ConfigError::invalid_value(
                    "DATASET.CLASS_WEIGHTS",
                    "weights must be finite and non-negative",
                ));
            }
        }
        if !(0.0..1.0).contains(&d.val_ratio) {
            return Err(ConfigError::invalid_value(
                "DATASET.VAL_RATIO",
                "must be in [0, 1)",
            ));
        }
        if self.model.in_channels == 0 {
            return Err(ConfigError::invalid_value(
                "MODEL.IN_CHANNELS",
                "must be at least 1",
            ));
        }
        if t.patch_size == 0 {
            return Err(ConfigError::invalid_value(
                "TRAIN.PATCH_SIZE",
                "must be at least 1",
            ));
        }
        if t.stride == 0 {
            return Err(ConfigError::invalid_value("TRAIN.STRIDE", "must be at least 1"));
        }
        if !t.mean.is_finite() {
            return Err(ConfigError::invalid_value("TRAIN.MEAN", "must be finite"));
        }
        if !(t.std.is_finite() && t.std > 0.0) {
            return Err(ConfigError::invalid_value("TRAIN.STD", "must be positive"));
        }
        if t.end_epoch <= t.begin_epoch {
            return Err(ConfigError::invalid_value(
                "TRAIN.END_EPOCH",
                format!("must be greater than BEGIN_EPOCH ({})", t.begin_epoch),
            ));
        }
        if t.snapshots == 0 || t.snapshots > t.end_epoch {
            return Err(ConfigError::invalid_value(
                "TRAIN.SNAPSHOTS",
                format!("must be in [1, END_EPOCH={}]", t.end_epoch),
            ));
        }
        if t.min_lr < 0.0 || t.min_lr > t.max_lr {
            return Err(ConfigError::invalid_value(
                "TRAIN.MIN_LR",
                format!("must be in [0, MAX_LR={}]", t.max_lr),
            ));
        }
        if !(0.0..=1.0).contains(&t.flip_probability) {
            return Err(ConfigError::invalid_value(
                "TRAIN.FLIP_PROBABILITY",
                "must be in [0, 1]",
            ));
        }
        if t.batch_size_per_gpu == 0 {
            return Err(ConfigError::invalid_value(
                "TRAIN.BATCH_SIZE_PER_GPU",
                "must be at least 1",
            ));
        }
        if self.validation.batch_size_per_gpu == 0 {
            return Err(ConfigError::invalid_value(
                "VALIDATION.BATCH_SIZE_PER_GPU",
                "must be at least 1",
            ));
        }
        for (key, size) in [
            ("TRAIN.AUGMENTATIONS.RESIZE", t.augmentations.resize),
            ("TRAIN.AUGMENTATIONS.PAD", t.augmentations.pad),
        ] {
            if size.height == 0 || size.width == 0 {
                return Err(ConfigError::invalid_value(key, "HEIGHT and WIDTH must be positive"));
            }
        }
        if self.test.test_stride == 0 {
            return Err(ConfigError::invalid_value(
                "TEST.TEST_STRIDE",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Directory snapshot checkpoints are written to.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join(&self.train.model_dir)
    }

    /// Render the resolved configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<resolved>"),
            message: e.to_string(),
        })
    }
}

/// Builder that assembles the figment layers for an experiment file.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
    overrides: Vec<(String, serde_yaml::Value)>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overrides: Vec::new(),
            env_prefix: Some(ENV_PREFIX.to_string()),
        }
    }

    /// Skip the environment layer.
    pub fn without_env(mut self) -> Self {
        self.env_prefix = None;
        self
    }

    /// Add `KEY=VALUE` overrides with dotted keys, e.g. `TRAIN.MAX_LR=0.02`.
    ///
    /// Values are parsed as YAML scalars so numbers and booleans keep their types.
    pub fn with_overrides<S: AsRef<str>>(mut self, entries: &[S]) -> Result<Self, ConfigError> {
        for entry in entries {
            let entry = entry.as_ref();
            let (key, raw) = entry
                .split_once('=')
                .filter(|(k, _)| !k.trim().is_empty())
                .ok_or_else(|| ConfigError::MalformedOverride {
                    entry: entry.to_string(),
                })?;
            let value = serde_yaml::from_str::<serde_yaml::Value>(raw.trim())
                .unwrap_or_else(|_| serde_yaml::Value::String(raw.trim().to_string()));
            self.overrides.push((key.trim().to_string(), value));
        }
        Ok(self)
    }

    /// Resolve the base chain, merge every layer, extract and validate.
    pub fn load(&self) -> Result<ExperimentConfig, ConfigError> {
        let chain = resolve_base_chain(&self.path)?;

        let mut figment = Figment::new();
        for file in &chain {
            tracing::debug!(path = %file.display(), "Merging config layer");
            figment = figment.merge(Yaml::file(file));
        }
        if let Some(prefix) = &self.env_prefix {
            figment = figment.merge(Env::prefixed(prefix).split("__").lowercase(false));
        }
        for (key, value) in &self.overrides {
            figment = figment.merge(Serialized::default(key, value));
        }

        let mut config: ExperimentConfig = figment.extract().map_err(ConfigError::from)?;
        config.base = None;
        config.validate()?;
        Ok(config)
    }
}

/// Load and validate an experiment config with environment overrides applied.
pub fn load_config(path: &Path) -> Result<ExperimentConfig, ConfigError> {
    ConfigLoader::new(path).load()
}

/// Follow `BASE` links from `path` and return the files ordered root-most first.
fn resolve_base_chain(path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut chain: Vec<PathBuf> = Vec::new();
    let mut next = Some(path.to_path_buf());

    while let Some(current) = next.take() {
        if !current.is_file() {
            return Err(ConfigError::FileNotFound { path: current });
        }
        let canonical = current
            .canonicalize()
            .map_err(|source| ConfigError::Read {
                path: current.clone(),
                source,
            })?;
        if chain.contains(&canonical) {
            return Err(ConfigError::BaseCycle { path: canonical });
        }
        if chain.len() >= MAX_BASE_DEPTH {
            return Err(ConfigError::invalid_value(
                "BASE",
                format!("inheritance deeper than {MAX_BASE_DEPTH} files"),
            ));
        }

        let text = std::fs::read_to_string(&canonical).map_err(|source| ConfigError::Read {
            path: canonical.clone(),
            source,
        })?;
        let doc: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: canonical.clone(),
                message: e.to_string(),
            })?;

        if let Some(base) = doc.get("BASE") {
            let base = base.as_str().ok_or_else(|| ConfigError::InvalidType {
                key: "BASE".into(),
                expected: "a path string".into(),
                found: format!("{base:?}"),
            })?;
            let dir = canonical.parent().unwrap_or_else(|| Path::new("."));
            next = Some(dir.join(base));
        }
        chain.push(canonical);
    }

    chain.reverse();
    Ok(chain)
}
