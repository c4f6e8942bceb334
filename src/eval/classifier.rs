//! The classifier seam used by evaluation.

use ndarray::{Array2, Array4, ArrayView1, Axis};

use super::batches::{BatchSource, Prefetcher};
use crate::error::{Error, Result};
use crate::model::ModelGraph;

/// Clamp applied to probabilities before taking the log in cross-entropy.
const PROB_EPSILON: f32 = 1e-7;

/// Batch-level loss and accuracy as the framework reports them.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Metrics {
    pub loss: f64,
    pub accuracy: f64,
    pub images: usize,
}

/// Index of the first maximum.
pub fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &p)| if p > max { (i, p) } else { (best, max) })
        .0
}

pub trait Classifier: Sync {
    fn class_count(&self) -> usize;

    /// Class probabilities, one row per image.
    fn predict_batch(&self, images: &Array4<f32>) -> Result<Array2<f32>>;

    /// Mean categorical cross-entropy and accuracy per batch, combined as a
    /// running mean weighted by batch size.
    fn evaluate<S>(&self, source: &S, prefetcher: &Prefetcher) -> Result<Metrics>
    where
        S: BatchSource + ?Sized,
        Self: Sized,
    {
        let classes = self.class_count();
        let mut metrics = Metrics::default();
        prefetcher.for_each(source, |index, batch| {
            let probs = self.predict_batch(&batch.images)?;
            check_rows(&probs, batch.len(), classes, index)?;
            let b = batch.len() as f64;
            let mut loss = 0.0;
            let mut correct = 0usize;
            for (row, &label) in probs.axis_iter(Axis(0)).zip(&batch.labels) {
                if label >= classes {
                    return Err(Error::Value(format!("label {label} out of range for {classes} classes")));
                }
                loss -= (row[label].clamp(PROB_EPSILON, 1.0) as f64).ln();
                correct += usize::from(argmax(row) == label);
            }
            let seen = metrics.images as f64;
            metrics.loss = (metrics.loss * seen + loss) / (seen + b);
            metrics.accuracy = (metrics.accuracy * seen + correct as f64) / (seen + b);
            metrics.images += batch.len();
            Ok(())
        })?;
        if metrics.images == 0 {
            return Err(Error::Value("cannot evaluate an empty image set".into()));
        }
        Ok(metrics)
    }

    /// Probabilities for every image, concatenated in batch order.
    fn predict_set<S>(&self, source: &S, prefetcher: &Prefetcher) -> Result<Array2<f32>>
    where
        S: BatchSource + ?Sized,
        Self: Sized,
    {
        let classes = self.class_count();
        let mut flat = Vec::with_capacity(source.image_count() * classes);
        let mut rows = 0;
        prefetcher.for_each(source, |index, batch| {
            let probs = self.predict_batch(&batch.images)?;
            check_rows(&probs, batch.len(), classes, index)?;
            flat.extend(probs.iter().copied());
            rows += batch.len();
            Ok(())
        })?;
        Array2::from_shape_vec((rows, classes), flat).map_err(|e| Error::shape("predictions", (rows, classes), e))
    }
}

fn check_rows(probs: &Array2<f32>, images: usize, classes: usize, batch: usize) -> Result<()> {
    if probs.dim() != (images, classes) {
        return Err(Error::shape(
            format!("probabilities of batch {batch}"),
            (images, classes),
            probs.dim(),
        ));
    }
    Ok(())
}

impl Classifier for ModelGraph {
    fn class_count(&self) -> usize {
        self.output_shape().len()
    }

    fn predict_batch(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        self.predict(images)
    }
}
