//! Experiment assembly and run records.

use chrono::{DateTime, Utc};
use deepseis_core::persistence::{atomic_write, atomic_write_json};
use deepseis_core::{ExperimentConfig, RunContext};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::augment::AugmentationPipeline;
use crate::data::{LoaderOptions, PatchDataset, PatchLoader, PatchOptions};
use crate::error::MlError;
use crate::models::{ModelRegistry, ModelSpec, SegmentationModel};
use crate::training::checkpoint::{Checkpoint, CheckpointManager, SnapshotHandler};
use crate::training::driver::Trainer;
use crate::training::evaluator::{
    EvaluationLog, EvaluationReport, EvaluationTrigger, Evaluator, MetricsLogger,
};
use crate::training::observer::{EpochTimer, IterationLogger, LossGuard};
use crate::training::state::TrainingState;
use crate::training::summary::{SummaryWriter, TrainingSummary, ValidationSummary};

/// Manifest entries kept per model directory.
const MAX_MANIFEST_ENTRIES: usize = 64;

/// Run status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Persistent record of one training run, written to `<OUTPUT_DIR>/runs/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub model: String,
    pub dataset_root: PathBuf,
    pub status: RunStatus,
    pub seed: u64,
    pub device: String,
    pub epochs_completed: usize,
    pub iterations: u64,
    pub final_loss: Option<f64>,
    pub best_miou: Option<f64>,
    pub best_epoch: Option<usize>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(config: &ExperimentConfig, context: &RunContext) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: config.model.name.clone(),
            dataset_root: config.dataset.root.clone(),
            status: RunStatus::Pending,
            seed: context.seed,
            device: context.device.to_string(),
            epochs_completed: 0,
            iterations: 0,
            final_loss: None,
            best_miou: None,
            best_epoch: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub record: RunRecord,
    pub state: TrainingState,
    pub evaluations: Vec<EvaluationReport>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Open the `train` (`training = true`) or `val` split as configured.
pub fn open_split(
    config: &ExperimentConfig,
    context: &RunContext,
    training: bool,
) -> Result<PatchDataset, MlError> {
    let split = if training { "train" } else { "val" };
    let pipeline = AugmentationPipeline::from_config(&config.train, training)?;
    let options = PatchOptions::from_config(config, training);
    PatchDataset::open(
        &config.dataset.root,
        split,
        config,
        options,
        pipeline,
        context.component_seed(split),
    )
}

/// A model, its data and a configured trainer, ready to run.
pub struct Experiment {
    config: ExperimentConfig,
    context: RunContext,
    model: Box<dyn SegmentationModel>,
    train_loader: PatchLoader,
    trainer: Trainer,
    evaluations: EvaluationLog,
    checkpoints: CheckpointManager,
    record: RunRecord,
}

impl Experiment {
    /// Load both splits from `DATASET.ROOT` and assemble the run.
    pub fn prepare(
        config: ExperimentConfig,
        context: RunContext,
        registry: &ModelRegistry,
    ) -> Result<Self, MlError> {
        let train = open_split(&config, &context, true)?;
        let val = open_split(&config, &context, false)?;
        Self::with_datasets(config, context, registry, train, val)
    }

    /// Assemble the run over datasets that are already built.
    pub fn with_datasets(
        config: ExperimentConfig,
        context: RunContext,
        registry: &ModelRegistry,
        train: PatchDataset,
        val: PatchDataset,
    ) -> Result<Self, MlError> {
        for (split, dataset) in [("train", &train), ("val", &val)] {
            if dataset.is_empty() {
                return Err(MlError::data_not_found(
                    format!("patches for split '{split}'"),
                    &config.dataset.root,
                ));
            }
        }

        let spec = ModelSpec {
            num_classes: config.dataset.num_classes,
            in_channels: config.model.in_channels,
            class_weights: config.dataset.class_weights.clone(),
            seed: context.component_seed("model"),
        };
        let mut model = registry.create(&config.model.name, &spec)?;
        if let Some(path) = &config.model.pretrained {
            let state = CheckpointManager::load_state(path)?;
            model.load_state(&state)?;
            tracing::info!(path = %path.display(), "Loaded pretrained weights");
        }

        let train_loader = PatchLoader::new(
            Arc::new(train),
            LoaderOptions {
                batch_size: config.train.batch_size_per_gpu,
                shuffle: true,
                workers: context.workers,
                ..LoaderOptions::default()
            },
            context.component_seed("loader"),
        );
        let normalization = val.transform().normalization();
        let val_loader = PatchLoader::new(
            Arc::new(val),
            LoaderOptions {
                batch_size: config.validation.batch_size_per_gpu,
                workers: context.workers,
                ..LoaderOptions::default()
            },
            0,
        );

        let iterations_per_epoch = train_loader.len();
        let snapshot_duration = config.train.scheduler_step() as u64 * iterations_per_epoch as u64;
        let checkpoints = CheckpointManager::new(context.checkpoint_dir.clone(), MAX_MANIFEST_ENTRIES);
        let writer = SummaryWriter::new(&context.log_dir)?;

        let mut trigger = EvaluationTrigger::new(Evaluator::new(
            val_loader,
            config.dataset.num_classes,
        ));
        trigger.add_observer(Box::new(MetricsLogger));
        trigger.add_observer(Box::new(ValidationSummary::new(writer.clone(), normalization)));
        trigger.add_observer(Box::new(SnapshotHandler::new(
            checkpoints.clone(),
            snapshot_duration,
        )));
        let evaluations = trigger.log();

        let mut trainer = Trainer::from_config(&config, iterations_per_epoch);
        trainer.add_observer(Box::new(IterationLogger::new(config.print_freq)));
        trainer.add_observer(Box::new(EpochTimer::new()));
        trainer.add_observer(Box::new(LossGuard::default()));
        trainer.add_observer(Box::new(TrainingSummary::new(writer)));
        trainer.add_observer(Box::new(trigger));

        let record = RunRecord::new(&config, &context);
        tracing::info!(
            run = %record.id,
            model = %config.model.name,
            iterations_per_epoch,
            snapshot_duration,
            "Experiment prepared"
        );

        Ok(Self {
            config,
            context,
            model,
            train_loader,
            trainer,
            evaluations,
            checkpoints,
            record,
        })
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn model(&self) -> &dyn SegmentationModel {
        self.model.as_ref()
    }

    pub fn observer_names(&self) -> Vec<&str> {
        self.trainer.observer_names()
    }

    fn record_path(&self) -> PathBuf {
        self.context
            .output_dir
            .join("runs")
            .join(format!("{}.json", self.record.id))
    }

    fn persist_record(&self) -> Result<(), MlError> {
        atomic_write_json(&self.record_path(), &self.record)?;
        Ok(())
    }

    /// Train to completion. The run record is updated on success and on failure.
    pub async fn run(mut self) -> Result<RunSummary, MlError> {
        let yaml = self.config.to_yaml()?;
        atomic_write(&self.context.output_dir.join("config.yaml"), yaml.as_bytes())?;

        self.record.set_status(RunStatus::Running);
        self.persist_record()?;

        let outcome = self
            .trainer
            .run(self.model.as_mut(), &self.train_loader)
            .await;
        let mut state = match outcome {
            Ok(state) => state,
            Err(e) => {
                self.record.error = Some(e.to_string());
                self.record.set_status(RunStatus::Failed);
                if let Err(persist) = self.persist_record() {
                    tracing::warn!(error = %persist, "Could not persist failed run record");
                }
                return Err(e);
            }
        };

        let evaluations = self
            .evaluations
            .lock()
            .map_err(|_| MlError::training("evaluation log lock poisoned"))?
            .clone();
        for report in &evaluations {
            state
                .history
                .record_evaluation(report.epoch, report.loss, report.metrics.mean_iou);
        }

        self.record.epochs_completed = state.history.epochs_completed;
        self.record.iterations = state.iteration;
        self.record.final_loss = state.history.loss_history.last().copied();
        self.record.best_miou = state.history.best_miou;
        self.record.best_epoch = state.history.best_epoch;
        self.record.set_status(RunStatus::Completed);
        self.persist_record()?;

        Ok(RunSummary {
            checkpoints: self.checkpoints.list()?,
            record: self.record,
            state,
            evaluations,
        })
    }
}
