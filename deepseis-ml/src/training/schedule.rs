//! Learning-rate schedules evaluated once per iteration.

use std::f64::consts::PI;

use deepseis_core::config::TrainConfig;

/// Maps the run's iteration counter to a learning rate.
pub trait LrSchedule: Send + Sync {
    fn lr_at(&self, iteration: u64) -> f64;

    fn describe(&self) -> String;
}

/// Cosine annealing from `start` to `end` over `cycle` iterations, restarting every cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CosineAnnealing {
    pub start: f64,
    pub end: f64,
    pub cycle: u64,
}

impl CosineAnnealing {
    pub fn new(start: f64, end: f64, cycle: u64) -> Self {
        Self {
            start,
            end,
            cycle: cycle.max(1),
        }
    }

    /// `MAX_LR` down to `MIN_LR` with a period of `(END_EPOCH / SNAPSHOTS)` epochs.
    pub fn from_config(train: &TrainConfig, iterations_per_epoch: usize) -> Self {
        let cycle = train.scheduler_step() as u64 * iterations_per_epoch as u64;
        Self::new(train.max_lr, train.min_lr, cycle)
    }

    /// Position inside the current cycle, in `[0, 1)`.
    pub fn phase(&self, iteration: u64) -> f64 {
        (iteration % self.cycle) as f64 / self.cycle as f64
    }
}

impl LrSchedule for CosineAnnealing {
    fn lr_at(&self, iteration: u64) -> f64 {
        let t = self.phase(iteration);
        self.start + (self.end - self.start) / 2.0 * (1.0 - (PI * t).cos())
    }

    fn describe(&self) -> String {
        format!(
            "cosine({} -> {}, cycle {} iterations)",
            self.start, self.end, self.cycle
        )
    }
}

/// A fixed learning rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantLr(pub f64);

impl LrSchedule for ConstantLr {
    fn lr_at(&self, _iteration: u64) -> f64 {
        self.0
    }

    fn describe(&self) -> String {
        format!("constant({})", self.0)
    }
}
