//! End-to-end evaluation of one trained model: generalisation sets (plain
//! and inverted) and the perturbation sweep.
//!
//! Each set is evaluated twice through the same deterministic pipeline:
//! once for the framework metric and once for raw probabilities. The two
//! accuracies, and the reference ledger when it has an entry, must agree
//! before a record is written. The first disagreement aborts the run;
//! files already written stay in place.

use std::path::{Path, PathBuf};

use ndarray::{Array2, Array4};

use super::batches::{Batch, BatchSource, InMemoryBatches, Prefetcher};
use super::classifier::{Classifier, Metrics};
use super::reconcile::{reconcile, recompute_accuracy, ReferenceLedger};
use super::records::*;
use crate::config::{ImageStats, RunConfig};
use crate::defaults::IMAGES_PER_CLASS;
use crate::error::{Error, Result};
use crate::perturb::{normalise, perturb_batch, PerturbKind, Perturbation};

/// Metrics of one evaluated set.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub framework: Metrics,
    pub recomputed: f64,
    pub probabilities: Array2<f32>,
}

/// Ground-truth labels of a generalisation set laid out the default way:
/// `IMAGES_PER_CLASS` images of class 0, then of class 1, and so on.
pub fn generalisation_labels(classes: usize) -> Vec<usize> {
    class_labels(&vec![IMAGES_PER_CLASS; classes])
}

/// Labels of a set stored class by class with `counts[c]` images of class `c`.
pub fn class_labels(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .enumerate()
        .flat_map(|(c, &n)| std::iter::repeat(c).take(n))
        .collect()
}

/// Raw `[0, 255]` batches of `inner`, optionally perturbed, then normalised
/// with the training statistics. Perturbation noise is seeded per image
/// from its position in the whole set.
pub struct Prepared<'s, S: ?Sized> {
    inner: &'s S,
    perturbation: Option<(PerturbKind, f64)>,
    stats: ImageStats,
    contrast_level: f64,
    seed: u64,
}

impl<S: BatchSource + ?Sized> BatchSource for Prepared<'_, S> {
    fn batch_count(&self) -> usize {
        self.inner.batch_count()
    }

    fn image_count(&self) -> usize {
        self.inner.image_count()
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    fn batch_start(&self, index: usize) -> usize {
        self.inner.batch_start(index)
    }

    fn labels(&self) -> Vec<usize> {
        self.inner.labels()
    }

    fn batch(&self, index: usize) -> Result<Batch> {
        let Batch { images, labels } = self.inner.batch(index)?;
        let offset = self.inner.batch_start(index) as u64;
        let mut images = match self.perturbation {
            Some((kind, level)) => perturb_batch(
                &images.view(),
                kind,
                level,
                self.contrast_level,
                self.seed.wrapping_add(offset),
            )?,
            None => images,
        };
        normalise(&mut images, self.stats);
        Ok(Batch { images, labels })
    }
}

pub struct Evaluator<'a, C: Classifier> {
    classifier: &'a C,
    config: &'a RunConfig,
    stats: ImageStats,
    results_dir: PathBuf,
    ledger: ReferenceLedger,
    prefetcher: Prefetcher,
}

impl<'a, C: Classifier> Evaluator<'a, C> {
    pub fn new(classifier: &'a C, config: &'a RunConfig, stats: ImageStats, results_dir: impl Into<PathBuf>) -> Result<Self> {
        if classifier.class_count() != config.classes.len() {
            return Err(Error::shape(
                "classifier outputs",
                config.classes.len(),
                classifier.class_count(),
            ));
        }
        Ok(Self {
            classifier,
            config,
            stats,
            results_dir: results_dir.into(),
            ledger: ReferenceLedger::default(),
            prefetcher: Prefetcher::new(config.workers, config.max_queue_size)?,
        })
    }

    pub fn with_ledger(mut self, ledger: ReferenceLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn generalise_metrics_path(&self) -> PathBuf {
        self.results_dir.join(format!("generalise_{}.csv", self.config.sim_set()))
    }

    pub fn perturb_metrics_path(&self) -> PathBuf {
        self.results_dir.join(format!("perturb_{}.csv", self.config.sim_set()))
    }

    fn predictions_dir(&self) -> PathBuf {
        self.results_dir.join("predictions")
    }

    fn weights(&self) -> String {
        self.config.weights.clone().unwrap_or_else(|| NO_WEIGHTS.to_string())
    }

    /// Wrap a raw source in this run's perturbation and normalisation.
    pub fn prepare<'s, S: BatchSource + ?Sized>(
        &self,
        source: &'s S,
        perturbation: Option<(PerturbKind, f64)>,
    ) -> Prepared<'s, S> {
        Prepared {
            inner: source,
            perturbation,
            stats: self.stats,
            contrast_level: self.config.contrast_level,
            seed: self.config.seed,
        }
    }

    fn check_labels(&self, context: &str, labels: &[usize]) -> Result<()> {
        if labels.is_empty() {
            return Err(Error::Value(format!("{context} has no images")));
        }
        let classes = self.config.classes.len();
        match labels.iter().find(|&&label| label >= classes) {
            Some(label) => Err(Error::Value(format!(
                "{context} has label {label} but the model has {classes} classes"
            ))),
            None => Ok(()),
        }
    }

    /// Framework metric over `source`, probabilities scored against
    /// `truth`, and the reconciliation of both with `reference`.
    pub fn evaluate_reconciled<S: BatchSource + ?Sized>(
        &self,
        source: &S,
        truth: &[usize],
        context: &str,
        reference: Option<f64>,
    ) -> Result<Outcome> {
        let framework = self.classifier.evaluate(source, &self.prefetcher)?;
        let probabilities = self.classifier.predict_set(source, &self.prefetcher)?;
        let recomputed = recompute_accuracy(&probabilities.view(), truth)?;
        reconcile(context, framework.accuracy, recomputed, reference, truth.len())?;
        Ok(Outcome {
            framework,
            recomputed,
            probabilities,
        })
    }

    /// Evaluate one generalisation set and append its record. Ground truth
    /// comes from the source, so classes may hold different image counts.
    pub fn generalise<S: BatchSource + ?Sized>(&self, set_type: &str, source: &S, inverted: bool) -> Result<GeneraliseRecord> {
        let labels = source.labels();
        self.check_labels(&format!("generalisation set {set_type}"), &labels)?;
        let set = if inverted {
            format!("{set_type}_inverted")
        } else {
            set_type.to_string()
        };
        let prepared = self.prepare(source, inverted.then_some((PerturbKind::Invert, 1.0)));
        let reference = self.ledger.generalisation(
            &self.config.model,
            self.config.trial,
            &self.weights(),
            set_type,
            inverted,
        );
        let context = format!("{} generalisation set {set}", self.config.model_name());
        let outcome = self.evaluate_reconciled(&prepared, &labels, &context, reference)?;

        if self.config.save_predictions {
            let tag = PredictionTag::Generalise {
                set: set.clone(),
                set_type: set_type.to_string(),
                inverted,
            };
            let name = generalise_predictions_name(&self.config.model_name(), &set, self.config.seed);
            write_predictions(
                &self.predictions_dir().join(name),
                &self.config.classes,
                &outcome.probabilities.view(),
                &labels,
                &tag,
            )?;
        }

        let record = GeneraliseRecord {
            model: self.config.model.clone(),
            convolution: self.config.convolution.label().to_string(),
            base: self.config.base.label().to_string(),
            weights: self.weights(),
            trial: self.config.trial,
            seed: self.config.seed,
            set,
            set_type: set_type.to_string(),
            inverted,
            loss: outcome.framework.loss,
            accuracy: outcome.recomputed,
        };
        MetricsWriter::new(self.generalise_metrics_path()).append(&record)?;
        tracing::info!(
            "{} {}: loss={:.4} accuracy={:.2}%",
            record.model,
            record.set,
            record.loss,
            100.0 * record.accuracy
        );
        Ok(record)
    }

    /// [`Self::generalise`] over images stored with the default layout of
    /// [`generalisation_labels`].
    pub fn generalise_images(&self, set_type: &str, images: &Array4<f32>, inverted: bool) -> Result<GeneraliseRecord> {
        let labels = generalisation_labels(self.config.classes.len());
        if images.dim().0 != labels.len() {
            return Err(Error::shape(
                format!("{set_type} images"),
                labels.len(),
                images.dim().0,
            ));
        }
        let source = InMemoryBatches::new(images.clone(), labels, self.config.batch)?;
        self.generalise(set_type, &source, inverted)
    }

    /// Every generalisation set, plain then inverted.
    pub fn generalise_all<S: BatchSource>(&self, sets: &[(String, S)]) -> Result<Vec<GeneraliseRecord>> {
        let mut records = Vec::with_capacity(sets.len() * 2);
        for inverted in [false, true] {
            for (set_type, source) in sets {
                records.push(self.generalise(set_type, source, inverted)?);
            }
        }
        Ok(records)
    }

    /// Sweep every perturbation over every severity level of the raw
    /// images in `source`.
    pub fn perturb<S: BatchSource + ?Sized>(&self, source: &S, perturbations: &[Perturbation]) -> Result<Vec<PerturbRecord>> {
        let labels = source.labels();
        self.check_labels("perturbation set", &labels)?;
        let mut records = Vec::new();
        for perturbation in perturbations {
            let kind = perturbation.kind;
            for (index, &level) in perturbation.levels.iter().enumerate() {
                let prepared = self.prepare(source, Some((kind, level)));
                let reference = self.ledger.perturbation(
                    &self.config.model,
                    self.config.trial,
                    &self.weights(),
                    kind.name(),
                    level,
                );
                let context = format!("{} {} level {level}", self.config.model_name(), kind.name());
                let outcome = self.evaluate_reconciled(&prepared, &labels, &context, reference)?;

                if self.config.save_predictions {
                    let tag = PredictionTag::Perturb {
                        noise: kind.name().to_string(),
                        level,
                        level_index: index,
                    };
                    let name = perturb_predictions_name(&self.config.model_name(), kind, index);
                    write_predictions(
                        &self.predictions_dir().join(name),
                        &self.config.classes,
                        &outcome.probabilities.view(),
                        &labels,
                        &tag,
                    )?;
                }

                let record = PerturbRecord {
                    trial: self.config.trial,
                    model: self.config.model.clone(),
                    convolution: self.config.convolution.label().to_string(),
                    base: self.config.base.label().to_string(),
                    weights: self.weights(),
                    noise: kind.name().to_string(),
                    level,
                    loss: outcome.framework.loss,
                    accuracy: outcome.recomputed,
                };
                MetricsWriter::new(self.perturb_metrics_path()).append(&record)?;
                records.push(record);
            }
            let accs: Vec<String> = records
                .iter()
                .filter(|r| r.noise == kind.name())
                .map(|r| format!("{:5.1}%", 100.0 * r.accuracy))
                .collect();
            tracing::info!("{}: {}", kind.name(), accs.join(" "));
        }
        Ok(records)
    }

    /// Re-score saved generalisation predictions, against the labels stored
    /// alongside them, and check the result with the ledger.
    pub fn audit_generalisation(&self, set_type: &str, inverted: bool) -> Result<f64> {
        let set = if inverted {
            format!("{set_type}_inverted")
        } else {
            set_type.to_string()
        };
        let path = self
            .predictions_dir()
            .join(generalise_predictions_name(&self.config.model_name(), &set, self.config.seed));
        let labels = read_labels(&path)?;
        audit(&path, &self.config.classes, &labels, |acc, n| {
            let reference = self.ledger.generalisation(
                &self.config.model,
                self.config.trial,
                &self.weights(),
                set_type,
                inverted,
            );
            reconcile(&format!("audit of {}", path.display()), acc, acc, reference, n)
        })
    }
}

fn audit(
    path: &Path,
    classes: &[String],
    labels: &[usize],
    check: impl FnOnce(f64, usize) -> Result<()>,
) -> Result<f64> {
    let probabilities = read_probabilities(path, classes)?;
    let accuracy = recompute_accuracy(&probabilities.view(), labels)?;
    check(accuracy, labels.len())?;
    Ok(accuracy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Convolution;
    use crate::model::Base;
    use tempfile::tempdir;

    /// Decodes the class from the mean pixel value (class `c` is drawn at
    /// intensity `20c + 10`).
    struct IntensityOracle {
        classes: usize,
    }

    impl Classifier for IntensityOracle {
        fn class_count(&self) -> usize {
            self.classes
        }

        fn predict_batch(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
            let n = images.dim().0;
            let mut out = Array2::from_elem((n, self.classes), 0.01);
            for (i, image) in images.outer_iter().enumerate() {
                let mean = image.mean().unwrap_or(0.0);
                let class = (((mean - 10.0) / 20.0).round().max(0.0) as usize).min(self.classes - 1);
                out[[i, class]] = 1.0 - 0.01 * (self.classes - 1) as f32;
            }
            Ok(out)
        }
    }

    fn config(classes: usize) -> RunConfig {
        RunConfig {
            classes: (0..classes).map(|c| format!("class{c}")).collect(),
            batch: 16,
            workers: 3,
            max_queue_size: 2,
            image_shape: [4, 4, 1],
            ..RunConfig::for_model(Convolution::Gabor, Base::AllCnn, false)
        }
    }

    fn drawn(labels: &[usize]) -> Array4<f32> {
        Array4::from_shape_fn((labels.len(), 4, 4, 1), |(i, ..)| 20.0 * labels[i] as f32 + 10.0)
    }

    const IDENTITY: ImageStats = ImageStats { mean: 0.0, std: 1.0 };

    #[test]
    fn test_generalisation_labels() {
        let labels = generalisation_labels(3);
        assert_eq!(labels.len(), 30);
        assert_eq!(&labels[8..12], &[0, 0, 1, 1]);
    }

    #[test]
    fn test_generalise_writes_record_and_predictions() {
        let dir = tempdir().unwrap();
        let cfg = config(10);
        let oracle = IntensityOracle { classes: 10 };
        let eval = Evaluator::new(&oracle, &cfg, IDENTITY, dir.path()).unwrap();
        let images = drawn(&generalisation_labels(10));

        let plain = eval.generalise_images("silhouettes", &images, false).unwrap();
        assert_eq!(plain.accuracy, 1.0);
        let inverted = eval.generalise_images("silhouettes", &images, true).unwrap();
        assert_eq!(inverted.set, "silhouettes_inverted");
        assert!(inverted.accuracy < 1.0);

        let written: Vec<GeneraliseRecord> = MetricsWriter::new(eval.generalise_metrics_path()).read_all().unwrap();
        assert_eq!(written, vec![plain, inverted]);
        assert_eq!(eval.audit_generalisation("silhouettes", false).unwrap(), 1.0);
    }

    #[test]
    fn test_reference_mismatch_aborts() {
        let dir = tempdir().unwrap();
        let cfg = config(10);
        let oracle = IntensityOracle { classes: 10 };
        let ledger = ReferenceLedger::new(
            vec![GeneraliseRecord {
                model: cfg.model.clone(),
                convolution: "Gabor".into(),
                base: "ALL-CNN".into(),
                weights: NO_WEIGHTS.into(),
                trial: cfg.trial,
                seed: cfg.seed,
                set: "contours".into(),
                set_type: "contours".into(),
                inverted: false,
                loss: 0.0,
                accuracy: 0.9,
            }],
            Vec::new(),
        );
        let eval = Evaluator::new(&oracle, &cfg, IDENTITY, dir.path())
            .unwrap()
            .with_ledger(ledger);
        let err = eval
            .generalise_images("contours", &drawn(&generalisation_labels(10)), false)
            .unwrap_err();
        assert!(matches!(err, Error::Reconciliation { right_label: "reference", .. }));
        assert!(!eval.generalise_metrics_path().exists());
    }

    #[test]
    fn test_perturbation_sweep() {
        let dir = tempdir().unwrap();
        let cfg = config(4);
        let oracle = IntensityOracle { classes: 4 };
        let eval = Evaluator::new(&oracle, &cfg, IDENTITY, dir.path()).unwrap();
        let labels: Vec<usize> = (0..40).map(|i| i % 4).collect();
        let images = drawn(&labels);
        let catalogue = vec![
            Perturbation::new(PerturbKind::Uniform),
            Perturbation::new(PerturbKind::Invert),
        ];
        let source = InMemoryBatches::new(images, labels, cfg.batch).unwrap();
        let records = eval.perturb(&source, &catalogue).unwrap();
        assert_eq!(records.len(), 22);
        assert_eq!(records[0].accuracy, 1.0);
        assert_eq!(records[11].accuracy, 1.0);
        assert!(records[21].accuracy < 1.0);
        let predictions = dir.path().join("predictions");
        assert!(predictions.join("Gabor_ALL-CNN_1_uniform_L11.csv").is_file());
        assert!(predictions.join("Gabor_ALL-CNN_1_invert_L01.csv").is_file());
    }

    #[test]
    fn test_class_labels_follow_counts() {
        assert_eq!(class_labels(&[2, 0, 3]), vec![0, 0, 2, 2, 2]);
        assert_eq!(generalisation_labels(2), class_labels(&[10, 10]));
    }

    #[test]
    fn test_generalise_uses_source_labels() {
        let dir = tempdir().unwrap();
        let cfg = config(3);
        let oracle = IntensityOracle { classes: 3 };
        let eval = Evaluator::new(&oracle, &cfg, IDENTITY, dir.path()).unwrap();
        let labels = class_labels(&[2, 5, 1]);
        let source = InMemoryBatches::new(drawn(&labels), labels.clone(), 3).unwrap();

        let record = eval.generalise("sketches", &source, false).unwrap();
        assert_eq!(record.accuracy, 1.0);
        assert_eq!(eval.audit_generalisation("sketches", false).unwrap(), 1.0);

        let name = generalise_predictions_name(&cfg.model_name(), "sketches", cfg.seed);
        let stored = read_labels(&dir.path().join("predictions").join(name)).unwrap();
        assert_eq!(stored, labels);

        let images = drawn(&labels);
        let err = eval.generalise_images("sketches", &images, false).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_out_of_range_label_rejected() {
        let dir = tempdir().unwrap();
        let cfg = config(3);
        let oracle = IntensityOracle { classes: 3 };
        let eval = Evaluator::new(&oracle, &cfg, IDENTITY, dir.path()).unwrap();
        let labels = vec![0, 1, 3];
        let source = InMemoryBatches::new(drawn(&labels), labels, 2).unwrap();
        assert!(matches!(eval.generalise("sketches", &source, false), Err(Error::Value(_))));
        assert!(!eval.generalise_metrics_path().exists());
    }

    #[test]
    fn test_prepared_seeds_by_image_position() {
        let dir = tempdir().unwrap();
        let cfg = config(4);
        let oracle = IntensityOracle { classes: 4 };
        let eval = Evaluator::new(&oracle, &cfg, IDENTITY, dir.path()).unwrap();
        let labels: Vec<usize> = (0..6).map(|i| i % 4).collect();
        let images = drawn(&labels);
        let whole = InMemoryBatches::new(images.clone(), labels.clone(), 6).unwrap();
        let split = InMemoryBatches::new(images, labels, 4).unwrap();
        let noise = Some((PerturbKind::Uniform, 0.5));

        let all = eval.prepare(&whole, noise).batch(0).unwrap();
        let tail = eval.prepare(&split, noise).batch(1).unwrap();
        assert_eq!(tail.images, all.images.slice(ndarray::s![4.., .., .., ..]));
        assert_eq!(tail.labels, vec![0, 1]);
    }

    #[test]
    fn test_class_count_mismatch() {
        let cfg = config(10);
        let oracle = IntensityOracle { classes: 3 };
        assert!(Evaluator::new(&oracle, &cfg, IDENTITY, "/tmp/unused").is_err());
    }
}
