//! Lifecycle observers attached to the training loop.
//!
//! The driver calls every registered observer, in registration order, at each loop
//! transition. An `Err` from any hook aborts the run.

use async_trait::async_trait;
use std::time::Instant;

use crate::error::MlError;
use crate::models::SegmentationModel;
use crate::training::state::TrainingState;

/// What an observer sees at a hook: the loop state and the model, both read-only.
pub struct Event<'a> {
    pub state: &'a TrainingState,
    pub model: &'a dyn SegmentationModel,
}

/// Hooks fired by the training driver. All default to no-ops.
#[async_trait]
pub trait TrainingObserver: Send {
    fn name(&self) -> &str;

    async fn on_run_start(&mut self, _event: &Event<'_>) -> Result<(), MlError> {
        Ok(())
    }

    async fn on_epoch_start(&mut self, _event: &Event<'_>) -> Result<(), MlError> {
        Ok(())
    }

    async fn on_iteration_start(&mut self, _event: &Event<'_>) -> Result<(), MlError> {
        Ok(())
    }

    async fn on_iteration_complete(&mut self, _event: &Event<'_>) -> Result<(), MlError> {
        Ok(())
    }

    async fn on_epoch_complete(&mut self, _event: &Event<'_>) -> Result<(), MlError> {
        Ok(())
    }

    async fn on_run_complete(&mut self, _event: &Event<'_>) -> Result<(), MlError> {
        Ok(())
    }
}

/// Logs loss and learning rate every `frequency` iterations.
#[derive(Debug, Clone)]
pub struct IterationLogger {
    frequency: u64,
}

impl IterationLogger {
    pub fn new(frequency: u64) -> Self {
        Self {
            frequency: frequency.max(1),
        }
    }
}

#[async_trait]
impl TrainingObserver for IterationLogger {
    fn name(&self) -> &str {
        "iteration_logger"
    }

    async fn on_iteration_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
        let state = event.state;
        if state.iteration % self.frequency == 0 {
            tracing::info!(
                epoch = state.epoch,
                iteration = state.iteration,
                step = state.epoch_iteration,
                steps = state.iterations_per_epoch,
                loss = state.last_loss.unwrap_or_default(),
                lr = state.learning_rate,
                "Training"
            );
        }
        Ok(())
    }
}

/// Logs wall time per epoch and for the whole run.
#[derive(Debug, Default)]
pub struct EpochTimer {
    run_started: Option<Instant>,
    epoch_started: Option<Instant>,
}

impl EpochTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrainingObserver for EpochTimer {
    fn name(&self) -> &str {
        "epoch_timer"
    }

    async fn on_run_start(&mut self, _event: &Event<'_>) -> Result<(), MlError> {
        self.run_started = Some(Instant::now());
        Ok(())
    }

    async fn on_epoch_start(&mut self, _event: &Event<'_>) -> Result<(), MlError> {
        self.epoch_started = Some(Instant::now());
        Ok(())
    }

    async fn on_epoch_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
        if let Some(started) = self.epoch_started.take() {
            tracing::info!(
                epoch = event.state.epoch,
                secs = started.elapsed().as_secs_f64(),
                "Epoch finished"
            );
        }
        Ok(())
    }

    async fn on_run_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
        if let Some(started) = self.run_started {
            tracing::info!(
                epochs = event.state.history.epochs_completed,
                iterations = event.state.iteration,
                secs = started.elapsed().as_secs_f64(),
                "Training finished"
            );
        }
        Ok(())
    }
}

/// Aborts the run on a non-finite loss and warns on spikes above `threshold` times
/// the recent mean.
#[derive(Debug, Clone)]
pub struct LossGuard {
    pub threshold: f64,
    window: Vec<f64>,
    window_size: usize,
}

impl LossGuard {
    pub fn new(threshold: f64, window_size: usize) -> Self {
        Self {
            threshold,
            window: Vec::new(),
            window_size: window_size.max(1),
        }
    }

    /// Check one loss value; `Err` if it is NaN or infinite.
    pub fn check(&mut self, iteration: u64, loss: f64) -> Result<(), MlError> {
        if !loss.is_finite() {
            return Err(MlError::training(format!(
                "loss became {loss} at iteration {iteration}"
            )));
        }

        if self.window.len() >= 3 {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            if loss > mean * self.threshold {
                tracing::warn!(iteration, loss, mean, "Loss spike");
            }
        }

        self.window.push(loss);
        if self.window.len() > self.window_size {
            self.window.remove(0);
        }
        Ok(())
    }
}

impl Default for LossGuard {
    fn default() -> Self {
        Self::new(3.0, 50)
    }
}

#[async_trait]
impl TrainingObserver for LossGuard {
    fn name(&self) -> &str {
        "loss_guard"
    }

    async fn on_iteration_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
        match event.state.last_loss {
            Some(loss) => self.check(event.state.iteration, loss),
            None => Ok(()),
        }
    }
}
