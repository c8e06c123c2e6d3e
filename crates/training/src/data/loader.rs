use std::{sync::Arc, thread::JoinHandle};

use candle_core::Tensor;
use futures::{
    channel::mpsc::{self, Receiver, Sender},
    future::BoxFuture,
    SinkExt, StreamExt,
};
use log::{debug, warn};
use rand::seq::SliceRandom;

use super::{
    dataset::{DatasetMode, Sample, SegmentationDataset},
    transform::SampleTransformer,
    Result,
};
use crate::{error::to_runtime_error, seed::SeedManager, TrainingError};

/// Batches each worker may have ready ahead of the consumer.
const PREFETCH_DEPTH: usize = 2;

/// One logical batch as delivered by a loader, on the host.
#[derive(Debug, Clone)]
pub struct LogicalBatch {
    pub ids: Vec<String>,
    /// `(batch, channels, h, w)` f32.
    pub inputs: Tensor,
    /// `(batch, h, w)` u32.
    pub targets: Tensor,
}

impl LogicalBatch {
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self> {
        if samples.is_empty() {
            return Err(TrainingError::runtime("cannot build an empty batch"));
        }
        let mut ids = Vec::with_capacity(samples.len());
        let mut inputs = Vec::with_capacity(samples.len());
        let mut targets = Vec::with_capacity(samples.len());
        for sample in samples {
            ids.push(sample.id);
            inputs.push(sample.input);
            targets.push(sample.target);
        }
        let inputs = Tensor::stack(&inputs, 0).map_err(to_runtime_error)?;
        let targets = Tensor::stack(&targets, 0).map_err(to_runtime_error)?;
        Ok(Self {
            ids,
            inputs,
            targets,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    /// Resets iteration to the beginning of `epoch`.
    fn start_epoch(&mut self, epoch: usize) -> Result<()>;
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<LogicalBatch>>>;
    fn batches_per_epoch(&self) -> usize;
    fn dataset_len(&self) -> usize;
}

impl<L: DataLoader + ?Sized> DataLoader for Box<L> {
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        (**self).start_epoch(epoch)
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<LogicalBatch>>> {
        (**self).next_batch()
    }

    fn batches_per_epoch(&self) -> usize {
        (**self).batches_per_epoch()
    }

    fn dataset_len(&self) -> usize {
        (**self).dataset_len()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.inner.start_epoch(epoch)
    }

    pub fn next_batch(&mut self) -> Result<Option<LogicalBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.inner.batches_per_epoch()
    }

    pub fn dataset_len(&self) -> usize {
        self.inner.dataset_len()
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

#[derive(Clone)]
struct BatchSource {
    dataset: Arc<dyn SegmentationDataset>,
    transformer: Arc<dyn SampleTransformer>,
    mode: DatasetMode,
    seeds: SeedManager,
}

impl BatchSource {
    fn load(&self, epoch: usize, indices: &[usize]) -> Result<LogicalBatch> {
        let mut samples = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = self.dataset.get(index)?;
            let mut rng = self.seeds.sample_rng(epoch, index);
            samples.push(self.transformer.transform(sample, self.mode, &mut rng)?);
        }
        LogicalBatch::from_samples(samples)
    }
}

/// Batches a [`SegmentationDataset`], optionally shuffling per epoch and
/// prefetching on background workers.
///
/// With `num_workers > 0`, batch `i` of an epoch is produced by worker
/// `i % num_workers` and read back in the same round-robin order, so delivery
/// order matches the sampling order regardless of worker timing.
pub struct SegmentationLoader {
    source: BatchSource,
    batch_size: usize,
    shuffle: bool,
    num_workers: usize,
    epoch: usize,
    batches: Vec<Vec<usize>>,
    cursor: usize,
    receivers: Vec<Receiver<Result<LogicalBatch>>>,
    workers: Vec<JoinHandle<()>>,
}

impl SegmentationLoader {
    pub fn new(
        dataset: Arc<dyn SegmentationDataset>,
        transformer: Arc<dyn SampleTransformer>,
        mode: DatasetMode,
        seeds: SeedManager,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if dataset.is_empty() {
            return Err(TrainingError::initialization(format!(
                "{mode} dataset is empty"
            )));
        }
        Ok(Self {
            source: BatchSource {
                dataset,
                transformer,
                mode,
                seeds,
            },
            batch_size,
            shuffle: mode == DatasetMode::Train,
            num_workers,
            epoch: 0,
            batches: Vec::new(),
            cursor: 0,
            receivers: Vec::new(),
            workers: Vec::new(),
        })
    }

    pub fn dataset(&self) -> &Arc<dyn SegmentationDataset> {
        &self.source.dataset
    }

    fn plan_epoch(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.source.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.source.seeds.shuffle_rng(epoch));
        }
        order
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    fn spawn_workers(&mut self) -> Result<()> {
        let workers = self.num_workers.min(self.batches.len());
        for worker in 0..workers {
            let (sender, receiver) = mpsc::channel(PREFETCH_DEPTH);
            let assigned: Vec<Vec<usize>> = self
                .batches
                .iter()
                .skip(worker)
                .step_by(workers)
                .cloned()
                .collect();
            let source = self.source.clone();
            let epoch = self.epoch;
            let handle = std::thread::Builder::new()
                .name(format!("loader-{}-{worker}", self.source.mode))
                .spawn(move || run_worker(source, epoch, assigned, sender))
                .map_err(|err| {
                    TrainingError::initialization(format!("failed to spawn loader worker: {err}"))
                })?;
            self.receivers.push(receiver);
            self.workers.push(handle);
        }
        debug!(
            "{} loader prefetching epoch {} with {} worker(s)",
            self.source.mode, self.epoch, workers
        );
        Ok(())
    }

    fn stop_workers(&mut self) {
        // Dropping the receivers unblocks workers waiting on a full channel.
        self.receivers.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("{} loader worker panicked", self.source.mode);
            }
        }
    }
}

fn run_worker(
    source: BatchSource,
    epoch: usize,
    batches: Vec<Vec<usize>>,
    mut sender: Sender<Result<LogicalBatch>>,
) {
    for indices in batches {
        let batch = source.load(epoch, &indices);
        let failed = batch.is_err();
        if futures::executor::block_on(sender.send(batch)).is_err() || failed {
            return;
        }
    }
}

impl DataLoader for SegmentationLoader {
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.stop_workers();
        self.epoch = epoch;
        self.batches = self.plan_epoch(epoch);
        self.cursor = 0;
        if self.num_workers > 0 {
            self.spawn_workers()?;
        }
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<LogicalBatch>>> {
        Box::pin(async move {
            if self.cursor >= self.batches.len() {
                return Ok(None);
            }
            let position = self.cursor;
            self.cursor += 1;

            if self.receivers.is_empty() {
                let indices = &self.batches[position];
                return self.source.load(self.epoch, indices).map(Some);
            }

            let slot = position % self.receivers.len();
            match self.receivers[slot].next().await {
                Some(batch) => batch.map(Some),
                None => Err(TrainingError::runtime(format!(
                    "{} loader worker {slot} stopped before batch {position}",
                    self.source.mode
                ))),
            }
        })
    }

    fn batches_per_epoch(&self) -> usize {
        self.source.dataset.len().div_ceil(self.batch_size)
    }

    fn dataset_len(&self) -> usize {
        self.source.dataset.len()
    }
}

impl Drop for SegmentationLoader {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
