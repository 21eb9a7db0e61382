//! Run-scoped loop state owned by the driver.

use serde::{Deserialize, Serialize};

use crate::error::MlError;
use crate::training::metrics::TrainingHistory;

/// Phase of the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    NotStarted,
    EpochRunning,
    IterationRunning,
    EpochCompleted,
    Finished,
}

impl LoopState {
    /// Whether the loop may move from `self` to `next`.
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (NotStarted, EpochRunning)
                | (EpochRunning, IterationRunning)
                | (IterationRunning, EpochRunning)
                | (EpochRunning, EpochCompleted)
                | (EpochCompleted, EpochRunning)
                | (EpochCompleted, Finished)
        )
    }
}

/// Mutable state of one run. Observers only ever see it by shared reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    pub phase: LoopState,
    /// Current epoch, counted from `TRAIN.BEGIN_EPOCH`.
    pub epoch: usize,
    /// Exclusive upper bound on `epoch`.
    pub max_epochs: usize,
    /// Optimizer steps taken so far in this run.
    pub iteration: u64,
    /// Optimizer steps taken so far in the current epoch.
    pub epoch_iteration: usize,
    pub iterations_per_epoch: usize,
    pub learning_rate: f64,
    /// Loss reported by the most recent optimizer step.
    pub last_loss: Option<f64>,
    pub history: TrainingHistory,
}

impl TrainingState {
    pub fn new(begin_epoch: usize, max_epochs: usize, iterations_per_epoch: usize) -> Self {
        Self {
            phase: LoopState::NotStarted,
            epoch: begin_epoch,
            max_epochs,
            iteration: 0,
            epoch_iteration: 0,
            iterations_per_epoch,
            learning_rate: 0.0,
            last_loss: None,
            history: TrainingHistory::default(),
        }
    }

    /// Move to `next`, rejecting transitions the loop never makes.
    pub fn transition(&mut self, next: LoopState) -> Result<(), MlError> {
        if !self.phase.can_transition_to(next) {
            return Err(MlError::training(format!(
                "invalid loop transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    pub fn is_last_epoch(&self) -> bool {
        self.epoch + 1 >= self.max_epochs
    }
}
