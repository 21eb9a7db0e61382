//! Batched, prefetching access to a [`PatchDataset`].
//!
//! Each worker is a blocking task that owns a bounded channel and produces every
//! `workers`-th batch of the epoch. The consumer reads the channels round-robin, so
//! batches arrive in the same order no matter how the workers are scheduled.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::data::dataset::{PatchDataset, PatchSample};
use crate::error::MlError;

/// Batches buffered per worker before it blocks.
const DEFAULT_PREFETCH: usize = 2;

/// A group of patches processed in one optimizer step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub samples: Vec<PatchSample>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Background workers; 0 produces batches on the consuming task.
    pub workers: usize,
    /// Per-worker queue depth.
    pub prefetch: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            drop_last: false,
            workers: 0,
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

/// Produces one [`BatchStream`] per epoch.
#[derive(Debug, Clone)]
pub struct PatchLoader {
    dataset: Arc<PatchDataset>,
    options: LoaderOptions,
    seed: u64,
}

impl PatchLoader {
    pub fn new(dataset: Arc<PatchDataset>, options: LoaderOptions, seed: u64) -> Self {
        Self {
            dataset,
            options,
            seed,
        }
    }

    pub fn dataset(&self) -> &PatchDataset {
        &self.dataset
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        let bs = self.options.batch_size.max(1);
        if self.options.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index groups for `epoch`; shuffled deterministically from the seed when enabled.
    pub fn batch_indices(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        let bs = self.options.batch_size.max(1);
        order
            .chunks(bs)
            .filter(|c| !self.options.drop_last || c.len() == bs)
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Start producing the batches of `epoch`.
    ///
    /// With workers this must be called inside a tokio runtime.
    pub fn epoch(&self, epoch: usize) -> BatchStream {
        let batches = self.batch_indices(epoch);
        let total = batches.len();

        if self.options.workers == 0 {
            return BatchStream {
                inner: StreamKind::Inline {
                    dataset: Arc::clone(&self.dataset),
                    pending: batches.into(),
                    epoch,
                },
                remaining: total,
            };
        }

        let workers = self.options.workers.min(total.max(1));
        let mut receivers = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(self.options.prefetch.max(1));
            let assigned: Vec<Vec<usize>> = batches
                .iter()
                .skip(worker)
                .step_by(workers)
                .cloned()
                .collect();
            let dataset = Arc::clone(&self.dataset);
            tokio::task::spawn_blocking(move || {
                for indices in assigned {
                    let batch = build_batch(&dataset, &indices, epoch);
                    let failed = batch.is_err();
                    if tx.blocking_send(batch).is_err() || failed {
                        // consumer dropped the stream, or the error has been delivered
                        break;
                    }
                }
            });
            receivers.push(rx);
        }
        tracing::debug!(epoch, batches = total, workers, "Started loader workers");

        BatchStream {
            inner: StreamKind::Workers {
                receivers,
                next: 0,
            },
            remaining: total,
        }
    }
}

fn build_batch(dataset: &PatchDataset, indices: &[usize], epoch: usize) -> Result<Batch, MlError> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i, epoch))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Batch { samples })
}

enum StreamKind {
    Inline {
        dataset: Arc<PatchDataset>,
        pending: VecDeque<Vec<usize>>,
        epoch: usize,
    },
    Workers {
        receivers: Vec<mpsc::Receiver<Result<Batch, MlError>>>,
        next: usize,
    },
}

/// The batches of one epoch, in order.
pub struct BatchStream {
    inner: StreamKind,
    remaining: usize,
}

impl BatchStream {
    /// Batches not yet returned.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Wait for the next batch. `None` once the epoch is exhausted.
    pub async fn next(&mut self) -> Option<Result<Batch, MlError>> {
        if self.remaining == 0 {
            return None;
        }
        let item = match &mut self.inner {
            StreamKind::Inline {
                dataset,
                pending,
                epoch,
            } => {
                let indices = pending.pop_front()?;
                build_batch(dataset, &indices, *epoch)
            }
            StreamKind::Workers { receivers, next } => {
                let worker = *next % receivers.len();
                *next += 1;
                match receivers[worker].recv().await {
                    Some(batch) => batch,
                    None => Err(MlError::training(format!(
                        "loader worker {worker} exited before finishing the epoch"
                    ))),
                }
            }
        };
        self.remaining -= 1;
        if item.is_err() {
            self.remaining = 0;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::AugmentationPipeline;
    use crate::data::patch::BoundaryPolicy;
    use crate::data::{PatchOptions, VolumeSample};
    use deepseis_core::DepthMode;
    use image::{ImageBuffer, Luma};

    fn dataset(w: u32, h: u32) -> Arc<PatchDataset> {
        let image = ImageBuffer::from_fn(w, h, |x, y| Luma([(y * w + x) as f32]));
        let mask = ImageBuffer::from_pixel(w, h, Luma([1u8]));
        let sample = VolumeSample::new("s", image, mask).unwrap();
        let opts = PatchOptions {
            patch_size: 1,
            stride: 1,
            channels: 1,
            depth: DepthMode::No,
            boundary: BoundaryPolicy::CompleteOnly,
        };
        Arc::new(
            PatchDataset::from_samples(vec![sample], opts, AugmentationPipeline::default(), 3)
                .unwrap(),
        )
    }

    fn first_values(batch: &Batch) -> Vec<f32> {
        batch.samples.iter().map(|s| s.image.value(0, 0, 0)).collect()
    }

    #[test]
    fn test_len_with_and_without_drop_last() {
        let ds = dataset(5, 2); // 10 patches
        let opts = LoaderOptions {
            batch_size: 4,
            ..LoaderOptions::default()
        };
        assert_eq!(PatchLoader::new(ds.clone(), opts.clone(), 0).len(), 3);
        let dropping = LoaderOptions {
            drop_last: true,
            ..opts
        };
        let loader = PatchLoader::new(ds, dropping, 0);
        assert_eq!(loader.len(), 2);
        assert!(loader.batch_indices(0).iter().all(|b| b.len() == 4));
    }

    #[test]
    fn test_shuffle_is_seeded_per_epoch() {
        let ds = dataset(8, 8);
        let opts = LoaderOptions {
            batch_size: 64,
            shuffle: true,
            ..LoaderOptions::default()
        };
        let loader = PatchLoader::new(ds, opts, 11);
        assert_eq!(loader.batch_indices(0), loader.batch_indices(0));
        assert_ne!(loader.batch_indices(0), loader.batch_indices(1));
        let mut all = loader.batch_indices(1).concat();
        all.sort_unstable();
        assert_eq!(all, (0..64).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_preserve_order() {
        let ds = dataset(6, 5);
        let opts = LoaderOptions {
            batch_size: 4,
            workers: 3,
            prefetch: 1,
            ..LoaderOptions::default()
        };
        let loader = PatchLoader::new(ds.clone(), opts, 0);
        let inline = PatchLoader::new(
            ds,
            LoaderOptions {
                batch_size: 4,
                ..LoaderOptions::default()
            },
            0,
        );

        let mut a = loader.epoch(0);
        let mut b = inline.epoch(0);
        let mut count = 0;
        while let Some(batch) = a.next().await {
            let expected = b.next().await.unwrap().unwrap();
            assert_eq!(first_values(&batch.unwrap()), first_values(&expected));
            count += 1;
        }
        assert_eq!(count, 8);
        assert!(b.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_early_is_fine() {
        let ds = dataset(10, 10);
        let opts = LoaderOptions {
            batch_size: 1,
            workers: 2,
            prefetch: 1,
            ..LoaderOptions::default()
        };
        let loader = PatchLoader::new(ds, opts, 0);
        let mut stream = loader.epoch(0);
        assert!(stream.next().await.unwrap().is_ok());
        drop(stream);
    }
}
