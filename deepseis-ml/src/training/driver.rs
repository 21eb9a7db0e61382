//! The epoch/iteration loop.

use std::time::Instant;

use deepseis_core::ExperimentConfig;

use crate::data::PatchLoader;
use crate::error::MlError;
use crate::models::{SegmentationModel, SgdStep};
use crate::training::observer::{Event, TrainingObserver};
use crate::training::schedule::{CosineAnnealing, LrSchedule};
use crate::training::state::{LoopState, TrainingState};

#[derive(Debug, Clone, Copy)]
enum Hook {
    RunStart,
    EpochStart,
    IterationStart,
    IterationComplete,
    EpochComplete,
    RunComplete,
}

/// Drives a model through `begin_epoch..end_epoch` over a loader.
pub struct Trainer {
    begin_epoch: usize,
    end_epoch: usize,
    momentum: f64,
    weight_decay: f64,
    schedule: Box<dyn LrSchedule>,
    observers: Vec<Box<dyn TrainingObserver>>,
}

impl Trainer {
    pub fn new(
        begin_epoch: usize,
        end_epoch: usize,
        momentum: f64,
        weight_decay: f64,
        schedule: Box<dyn LrSchedule>,
    ) -> Self {
        Self {
            begin_epoch,
            end_epoch,
            momentum,
            weight_decay,
            schedule,
            observers: Vec::new(),
        }
    }

    /// Epoch range and optimizer settings from `TRAIN`, with cosine annealing.
    pub fn from_config(config: &ExperimentConfig, iterations_per_epoch: usize) -> Self {
        let train = &config.train;
        Self::new(
            train.begin_epoch,
            train.end_epoch,
            train.momentum,
            train.weight_decay,
            Box::new(CosineAnnealing::from_config(train, iterations_per_epoch)),
        )
    }

    /// Observers run in the order they are added.
    pub fn add_observer(&mut self, observer: Box<dyn TrainingObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_names(&self) -> Vec<&str> {
        self.observers.iter().map(|o| o.name()).collect()
    }

    /// Train `model` to completion. The first error, from the loader, the model or any
    /// observer, ends the run.
    pub async fn run(
        &mut self,
        model: &mut dyn SegmentationModel,
        loader: &PatchLoader,
    ) -> Result<TrainingState, MlError> {
        let iterations_per_epoch = loader.len();
        if iterations_per_epoch == 0 {
            return Err(MlError::training("training loader yields no batches"));
        }
        if self.end_epoch <= self.begin_epoch {
            return Err(MlError::training(format!(
                "end epoch {} must be after begin epoch {}",
                self.end_epoch, self.begin_epoch
            )));
        }

        let mut state = TrainingState::new(self.begin_epoch, self.end_epoch, iterations_per_epoch);
        state.learning_rate = self.schedule.lr_at(0);
        tracing::info!(
            model = model.name(),
            epochs = self.end_epoch - self.begin_epoch,
            iterations_per_epoch,
            schedule = %self.schedule.describe(),
            observers = ?self.observer_names(),
            "Starting training"
        );

        self.dispatch(Hook::RunStart, &state, &*model).await?;

        for epoch in self.begin_epoch..self.end_epoch {
            state.epoch = epoch;
            state.epoch_iteration = 0;
            state.transition(LoopState::EpochRunning)?;
            self.dispatch(Hook::EpochStart, &state, &*model).await?;

            let started = Instant::now();
            let mut loss_sum = 0.0;
            let mut stream = loader.epoch(epoch);
            while let Some(batch) = stream.next().await {
                let batch = batch?;
                state.transition(LoopState::IterationRunning)?;
                state.learning_rate = self.schedule.lr_at(state.iteration);
                self.dispatch(Hook::IterationStart, &state, &*model).await?;

                let step = SgdStep {
                    learning_rate: state.learning_rate,
                    momentum: self.momentum,
                    weight_decay: self.weight_decay,
                };
                let loss = model.train_step(&batch, &step)?;
                state.iteration += 1;
                state.epoch_iteration += 1;
                state.last_loss = Some(loss);
                loss_sum += loss;

                self.dispatch(Hook::IterationComplete, &state, &*model).await?;
                state.transition(LoopState::EpochRunning)?;
                // Inline batches never pend, so let signal handlers run.
                tokio::task::yield_now().await;
            }

            state.transition(LoopState::EpochCompleted)?;
            let mean_loss = loss_sum / state.epoch_iteration.max(1) as f64;
            state
                .history
                .record_epoch(mean_loss, started.elapsed().as_secs_f64());
            self.dispatch(Hook::EpochComplete, &state, &*model).await?;
        }

        state.transition(LoopState::Finished)?;
        self.dispatch(Hook::RunComplete, &state, &*model).await?;
        Ok(state)
    }

    async fn dispatch(
        &mut self,
        hook: Hook,
        state: &TrainingState,
        model: &dyn SegmentationModel,
    ) -> Result<(), MlError> {
        let event = Event { state, model };
        for observer in &mut self.observers {
            let result = match hook {
                Hook::RunStart => observer.on_run_start(&event).await,
                Hook::EpochStart => observer.on_epoch_start(&event).await,
                Hook::IterationStart => observer.on_iteration_start(&event).await,
                Hook::IterationComplete => observer.on_iteration_complete(&event).await,
                Hook::EpochComplete => observer.on_epoch_complete(&event).await,
                Hook::RunComplete => observer.on_run_complete(&event).await,
            };
            if let Err(e) = result {
                tracing::error!(observer = observer.name(), ?hook, error = %e, "Observer failed");
                return Err(match e {
                    MlError::Observer { .. } => e,
                    other => MlError::observer(observer.name(), other.to_string()),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::AugmentationPipeline;
    use crate::data::{
        BoundaryPolicy, LabelMask, LoaderOptions, PatchDataset, PatchOptions, SeismicImage,
        VolumeSample,
    };
    use crate::models::{ModelRegistry, ModelSpec};
    use crate::training::schedule::ConstantLr;
    use async_trait::async_trait;
    use deepseis_core::DepthMode;
    use image::Luma;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    fn loader(batch_size: usize) -> PatchLoader {
        // left half class 0 at low amplitude, right half class 1 at high amplitude
        let image = SeismicImage::from_fn(8, 4, |x, _| Luma([if x < 4 { -1.0 } else { 1.0 }]));
        let mask = LabelMask::from_fn(8, 4, |x, _| Luma([u8::from(x >= 4)]));
        let sample = VolumeSample::new("s", image, mask).unwrap();
        let options = PatchOptions {
            patch_size: 2,
            stride: 2,
            channels: 1,
            depth: DepthMode::No,
            boundary: BoundaryPolicy::CompleteOnly,
        };
        let dataset =
            PatchDataset::from_samples(vec![sample], options, AugmentationPipeline::default(), 0)
                .unwrap();
        let opts = LoaderOptions {
            batch_size,
            ..LoaderOptions::default()
        };
        PatchLoader::new(Arc::new(dataset), opts, 0)
    }

    fn model() -> Box<dyn SegmentationModel> {
        let spec = ModelSpec {
            num_classes: 2,
            in_channels: 1,
            class_weights: None,
            seed: 0,
        };
        ModelRegistry::builtin().create("pixel_linear", &spec).unwrap()
    }

    /// Records every hook with the phase and iteration it observed.
    struct Recorder {
        name: String,
        events: Arc<Mutex<Vec<String>>>,
        fail_on_iteration: Option<u64>,
    }

    impl Recorder {
        fn push(&self, hook: &str, event: &Event<'_>) {
            self.events.lock().unwrap().push(format!(
                "{}:{hook}:{:?}:{}",
                self.name, event.state.phase, event.state.iteration
            ));
        }
    }

    #[async_trait]
    impl TrainingObserver for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_run_start(&mut self, event: &Event<'_>) -> Result<(), MlError> {
            self.push("run_start", event);
            Ok(())
        }

        async fn on_epoch_start(&mut self, event: &Event<'_>) -> Result<(), MlError> {
            self.push("epoch_start", event);
            Ok(())
        }

        async fn on_iteration_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
            self.push("iteration_complete", event);
            if self.fail_on_iteration == Some(event.state.iteration) {
                return Err(MlError::training("boom"));
            }
            Ok(())
        }

        async fn on_epoch_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
            self.push("epoch_complete", event);
            Ok(())
        }

        async fn on_run_complete(&mut self, event: &Event<'_>) -> Result<(), MlError> {
            self.push("run_complete", event);
            Ok(())
        }
    }

    fn recorder(
        name: &str,
        events: &Arc<Mutex<Vec<String>>>,
        fail_on_iteration: Option<u64>,
    ) -> Box<Recorder> {
        Box::new(Recorder {
            name: name.into(),
            events: Arc::clone(events),
            fail_on_iteration,
        })
    }

    #[tokio::test]
    async fn test_hook_order_and_phases() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut trainer = Trainer::new(0, 2, 0.9, 0.0, Box::new(ConstantLr(0.1)));
        trainer.add_observer(recorder("a", &events, None));
        trainer.add_observer(recorder("b", &events, None));

        // 8 patches in batches of 4 -> 2 iterations per epoch
        let mut model = model();
        let state = trainer.run(model.as_mut(), &loader(4)).await.unwrap();
        assert_eq!(state.phase, LoopState::Finished);
        assert_eq!(state.iteration, 4);
        assert_eq!(state.history.epochs_completed, 2);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2 * (1 + 2 * (1 + 2 + 1) + 1));
        assert_eq!(events[0], "a:run_start:NotStarted:0");
        assert_eq!(events[1], "b:run_start:NotStarted:0");
        assert_eq!(events[2], "a:epoch_start:EpochRunning:0");
        assert_eq!(events[4], "a:iteration_complete:IterationRunning:1");
        assert_eq!(events[5], "b:iteration_complete:IterationRunning:1");
        assert_eq!(events[8], "a:epoch_complete:EpochCompleted:2");
        assert_eq!(events.last().unwrap(), "b:run_complete:Finished:4");
    }

    #[tokio::test]
    async fn test_observer_error_aborts_run() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut trainer = Trainer::new(0, 3, 0.9, 0.0, Box::new(ConstantLr(0.1)));
        trainer.add_observer(recorder("first", &events, Some(3)));
        trainer.add_observer(recorder("second", &events, None));

        let mut model = model();
        let err = trainer.run(model.as_mut(), &loader(4)).await.unwrap_err();
        match err {
            MlError::Observer { observer, .. } => assert_eq!(observer, "first"),
            other => panic!("unexpected error: {other}"),
        }

        let events = events.lock().unwrap();
        assert_eq!(events.last().unwrap(), "first:iteration_complete:IterationRunning:3");
        assert!(!events.iter().any(|e| e.contains("run_complete")));
    }

    #[tokio::test]
    async fn test_learning_rate_follows_schedule() {
        struct LrLog(Arc<Mutex<Vec<f64>>>);

        #[async_trait]
        impl TrainingObserver for LrLog {
            fn name(&self) -> &str {
                "lr_log"
            }

            async fn on_iteration_start(&mut self, event: &Event<'_>) -> Result<(), MlError> {
                self.0.lock().unwrap().push(event.state.learning_rate);
                Ok(())
            }
        }

        let lrs = Arc::new(Mutex::new(Vec::new()));
        let schedule = CosineAnnealing::new(0.01, 0.001, 4);
        let expected: Vec<f64> = (0..8).map(|i| schedule.lr_at(i)).collect();
        let mut trainer = Trainer::new(0, 4, 0.9, 0.0, Box::new(schedule));
        trainer.add_observer(Box::new(LrLog(Arc::clone(&lrs))));

        let mut model = model();
        trainer.run(model.as_mut(), &loader(4)).await.unwrap();
        assert_eq!(*lrs.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_run_can_be_cancelled_between_iterations() {
        let (cancel, cancelled) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = cancel.send(());
        });

        // The loader has no workers, so the run only yields where the driver does.
        let mut trainer = Trainer::new(0, 1000, 0.9, 0.0, Box::new(ConstantLr(0.1)));
        let mut model = model();
        let data = loader(4);
        let stopped_early = tokio::select! {
            biased;
            _ = cancelled => true,
            result = trainer.run(model.as_mut(), &data) => {
                result.unwrap();
                false
            }
        };
        assert!(stopped_early);
    }

    #[tokio::test]
    async fn test_loss_decreases_on_separable_data() {
        let mut trainer = Trainer::new(0, 30, 0.9, 0.0, Box::new(ConstantLr(0.5)));
        let mut model = model();
        let state = trainer.run(model.as_mut(), &loader(8)).await.unwrap();
        let history = &state.history.loss_history;
        assert!(history.last().unwrap() < history.first().unwrap());
    }

    #[tokio::test]
    async fn test_empty_loader_is_an_error() {
        let image = SeismicImage::from_pixel(1, 1, Luma([0.0]));
        let mask = LabelMask::from_pixel(1, 1, Luma([0]));
        let sample = VolumeSample::new("tiny", image, mask).unwrap();
        let options = PatchOptions {
            patch_size: 2,
            stride: 2,
            channels: 1,
            depth: DepthMode::No,
            boundary: BoundaryPolicy::CompleteOnly,
        };
        let dataset =
            PatchDataset::from_samples(vec![sample], options, AugmentationPipeline::default(), 0)
                .unwrap();
        let loader = PatchLoader::new(Arc::new(dataset), LoaderOptions::default(), 0);

        let mut trainer = Trainer::new(0, 1, 0.9, 0.0, Box::new(ConstantLr(0.1)));
        let mut model = model();
        assert!(trainer.run(model.as_mut(), &loader).await.is_err());
    }
}
