//! Evaluation of trained classifiers.
//!
//! Batches are produced in a fixed order (optionally on worker threads),
//! scored by a [`Classifier`], and every accuracy that reaches a record is
//! first reconciled against an independent recomputation from the raw
//! probabilities and, when available, against a reference ledger.

pub mod auc;
pub mod batches;
pub mod classifier;
pub mod reconcile;
pub mod records;
pub mod runner;

pub use auc::{perturbation_aucs, trapezoid};
pub use batches::{Batch, BatchSource, InMemoryBatches, Prefetcher};
pub use classifier::{argmax, Classifier, Metrics};
pub use reconcile::{reconcile, recompute_accuracy, tolerance, ReferenceLedger};
pub use records::{read_labels, GeneraliseRecord, MetricsWriter, PerturbRecord, PredictionTag, NO_WEIGHTS};
pub use runner::{class_labels, generalisation_labels, Evaluator, Outcome, Prepared};
