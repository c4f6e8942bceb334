//! Batch sources and the ordered prefetcher.

use std::collections::BTreeMap;
use std::fmt;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use ndarray::{s, Array4};

use crate::error::{Error, Result};

/// Images (NHWC) with their class labels.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Random-access source of fixed-order batches.
pub trait BatchSource: Sync {
    /// Number of batches.
    fn batch_count(&self) -> usize;

    fn image_count(&self) -> usize;

    /// Images per batch; only the last batch may be shorter.
    fn batch_size(&self) -> usize;

    /// Index of the first image of batch `index` in the whole set.
    fn batch_start(&self, index: usize) -> usize {
        index * self.batch_size()
    }

    /// Ground-truth labels of every image, in batch order.
    fn labels(&self) -> Vec<usize>;

    fn batch(&self, index: usize) -> Result<Batch>;
}

/// Preprocessing applied to each batch: receives the raw images and the
/// index of the batch's first image in the whole set.
pub type Preprocess = dyn Fn(Array4<f32>, usize) -> Result<Array4<f32>> + Send + Sync;

/// An in-memory image set sliced into batches in storage order.
pub struct InMemoryBatches {
    images: Array4<f32>,
    labels: Vec<usize>,
    batch_size: usize,
    preprocess: Option<Box<Preprocess>>,
}

impl fmt::Debug for InMemoryBatches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBatches")
            .field("shape", &self.images.dim())
            .field("batch_size", &self.batch_size)
            .field("preprocess", &self.preprocess.is_some())
            .finish()
    }
}

impl InMemoryBatches {
    pub fn new(images: Array4<f32>, labels: Vec<usize>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Value("batch size must be positive".into()));
        }
        if images.dim().0 != labels.len() {
            return Err(Error::shape("labels per image", images.dim().0, labels.len()));
        }
        Ok(Self {
            images,
            labels,
            batch_size,
            preprocess: None,
        })
    }

    pub fn with_preprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(Array4<f32>, usize) -> Result<Array4<f32>> + Send + Sync + 'static,
    {
        self.preprocess = Some(Box::new(f));
        self
    }

    pub fn images(&self) -> &Array4<f32> {
        &self.images
    }
}

impl BatchSource for InMemoryBatches {
    fn batch_count(&self) -> usize {
        self.labels.len().div_ceil(self.batch_size)
    }

    fn image_count(&self) -> usize {
        self.labels.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn labels(&self) -> Vec<usize> {
        self.labels.clone()
    }

    fn batch(&self, index: usize) -> Result<Batch> {
        let start = self.batch_start(index);
        if start >= self.labels.len() {
            return Err(Error::Value(format!(
                "batch {index} out of range ({} batches)",
                self.batch_count()
            )));
        }
        let end = (start + self.batch_size).min(self.labels.len());
        let raw = self.images.slice(s![start..end, .., .., ..]).to_owned();
        let images = match &self.preprocess {
            Some(f) => f(raw, start)?,
            None => raw,
        };
        if images.dim().0 != end - start {
            return Err(Error::shape("preprocessed batch size", end - start, images.dim().0));
        }
        Ok(Batch {
            images,
            labels: self.labels[start..end].to_vec(),
        })
    }
}

/// Produces batches on worker threads into a bounded queue and hands them
/// to the consumer in index order.
#[derive(Clone, Copy, Debug)]
pub struct Prefetcher {
    workers: usize,
    depth: usize,
}

impl Prefetcher {
    pub fn new(workers: usize, depth: usize) -> Result<Self> {
        if workers == 0 || depth == 0 {
            return Err(Error::Value(format!(
                "prefetcher needs at least one worker and queue slot (workers={workers}, depth={depth})"
            )));
        }
        Ok(Self { workers, depth })
    }

    /// Single worker, single slot.
    pub fn sequential() -> Self {
        Self { workers: 1, depth: 1 }
    }

    /// Call `consume(index, batch)` for every batch of `source`, in index
    /// order. The first error from a worker or the consumer stops the run.
    pub fn for_each<S, F>(&self, source: &S, consume: F) -> Result<()>
    where
        S: BatchSource + ?Sized,
        F: FnMut(usize, Batch) -> Result<()>,
    {
        let total = source.batch_count();
        let workers = self.workers.min(total.max(1));
        thread::scope(|scope| {
            let (tx, rx) = bounded(self.depth);
            for worker in 0..workers {
                let tx = tx.clone();
                scope.spawn(move || {
                    for index in (worker..total).step_by(workers) {
                        let batch = source.batch(index);
                        let failed = batch.is_err();
                        if tx.send((index, batch)).is_err() || failed {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            drain_in_order(rx, total, consume)
        })
    }
}

impl Default for Prefetcher {
    fn default() -> Self {
        Self {
            workers: crate::defaults::WORKERS,
            depth: crate::defaults::MAX_QUEUE_SIZE,
        }
    }
}

fn drain_in_order<F>(rx: Receiver<(usize, Result<Batch>)>, total: usize, mut consume: F) -> Result<()>
where
    F: FnMut(usize, Batch) -> Result<()>,
{
    let mut pending = BTreeMap::new();
    let mut next = 0;
    while next < total {
        let (index, batch) = rx
            .recv()
            .map_err(|_| Error::Value(format!("prefetch workers stopped before batch {next}")))?;
        pending.insert(index, batch?);
        while let Some(batch) = pending.remove(&next) {
            consume(next, batch)?;
            next += 1;
        }
    }
    Ok(())
}
