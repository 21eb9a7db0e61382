//! Training infrastructure: loop driver, observers, evaluation, checkpoints and summaries.

pub mod checkpoint;
pub mod driver;
pub mod evaluator;
pub mod experiment;
pub mod metrics;
pub mod observer;
pub mod schedule;
pub mod state;
pub mod summary;

pub use checkpoint::{Checkpoint, CheckpointManager, SnapshotHandler, snapshot_file_name};
pub use driver::Trainer;
pub use evaluator::{
    EvaluationLog, EvaluationObserver, EvaluationReport, EvaluationTrigger, Evaluator,
    MetricsLogger,
};
pub use experiment::{Experiment, RunRecord, RunStatus, RunSummary, open_split};
pub use metrics::{ConfusionMatrix, SegmentationMetrics, TrainingHistory};
pub use observer::{EpochTimer, Event, IterationLogger, LossGuard, TrainingObserver};
pub use schedule::{ConstantLr, CosineAnnealing, LrSchedule};
pub use state::{LoopState, TrainingState};
pub use summary::{ScalarEvent, SummaryWriter, TrainingSummary, ValidationSummary};
