//! Cross-checks between independently derived accuracy figures.
//!
//! Accuracy over `n` images moves in steps of `1/n`, so two honest
//! computations over the same predictions can only differ by rounding. Any
//! gap wider than half a step means the images, labels or predictions were
//! not the same (an ordering bug or a nondeterminism regression) and the
//! run is aborted.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::{ArrayView2, Axis};

use super::classifier::argmax;
use super::records::{GeneraliseRecord, PerturbRecord, NO_WEIGHTS};
use crate::error::{Error, Result};

/// Floating-point slack added on top of the quantisation rule.
const FLOAT_SLACK: f64 = 1e-6;

/// Largest admissible difference between two accuracies over `n` images.
pub fn tolerance(n: usize) -> f64 {
    1.0 / (2.0 * n.max(1) as f64) + FLOAT_SLACK
}

/// Accuracy of arg-max predictions against ground truth.
pub fn recompute_accuracy(probabilities: &ArrayView2<f32>, labels: &[usize]) -> Result<f64> {
    let rows = probabilities.dim().0;
    if rows != labels.len() {
        return Err(Error::shape("predictions per label", labels.len(), rows));
    }
    if rows == 0 {
        return Err(Error::Value("cannot score an empty prediction set".into()));
    }
    let correct = probabilities
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(row, label)| argmax(row.view()) == **label)
        .count();
    Ok(correct as f64 / rows as f64)
}

fn check(
    context: &str,
    left: (&'static str, f64),
    right: (&'static str, f64),
    tolerance: f64,
) -> Result<()> {
    if (left.1 - right.1).abs() > tolerance {
        return Err(Error::Reconciliation {
            context: context.to_string(),
            left_label: left.0,
            left: left.1,
            right_label: right.0,
            right: right.1,
            tolerance,
        });
    }
    Ok(())
}

/// Check the framework metric against the recomputed accuracy and, when a
/// reference is recorded, the recomputed accuracy against it.
pub fn reconcile(
    context: &str,
    framework: f64,
    recomputed: f64,
    reference: Option<f64>,
    n: usize,
) -> Result<()> {
    let tol = tolerance(n);
    check(context, ("recomputed", recomputed), ("framework", framework), tol)?;
    if let Some(reference) = reference {
        check(context, ("recomputed", recomputed), ("reference", reference), tol)?;
    }
    tracing::debug!(context, recomputed, framework, ?reference, n, "accuracies agree");
    Ok(())
}

/// Previously recorded accuracies, read-only.
#[derive(Clone, Debug, Default)]
pub struct ReferenceLedger {
    generalise: Vec<GeneraliseRecord>,
    perturb: Vec<PerturbRecord>,
}

fn read_records<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.is_file() {
        return Err(Error::NotFound(format!("reference records {}", path.display())));
    }
    let mut reader = csv::Reader::from_reader(BufReader::new(File::open(path)?));
    let records = reader.deserialize().collect::<std::result::Result<Vec<T>, _>>()?;
    Ok(records)
}

fn same_weights(recorded: &str, weights: &str) -> bool {
    let norm = |w: &str| if w.is_empty() { NO_WEIGHTS.to_string() } else { w.to_string() };
    norm(recorded) == norm(weights)
}

impl ReferenceLedger {
    pub fn new(generalise: Vec<GeneraliseRecord>, perturb: Vec<PerturbRecord>) -> Self {
        Self { generalise, perturb }
    }

    /// Load either or both record files.
    pub fn load(generalise: Option<&Path>, perturb: Option<&Path>) -> Result<Self> {
        Ok(Self {
            generalise: generalise.map(read_records).transpose()?.unwrap_or_default(),
            perturb: perturb.map(read_records).transpose()?.unwrap_or_default(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.generalise.is_empty() && self.perturb.is_empty()
    }

    pub fn generalisation(
        &self,
        model: &str,
        trial: usize,
        weights: &str,
        set_type: &str,
        inverted: bool,
    ) -> Option<f64> {
        self.generalise
            .iter()
            .find(|r| {
                r.model == model
                    && r.trial == trial
                    && same_weights(&r.weights, weights)
                    && r.set_type == set_type
                    && r.inverted == inverted
            })
            .map(|r| r.accuracy)
    }

    pub fn perturbation(&self, model: &str, trial: usize, weights: &str, noise: &str, level: f64) -> Option<f64> {
        self.perturb
            .iter()
            .find(|r| {
                r.model == model
                    && r.trial == trial
                    && same_weights(&r.weights, weights)
                    && r.noise == noise
                    && (r.level - level).abs() <= 1e-8 + 1e-5 * level.abs()
            })
            .map(|r| r.accuracy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_tolerance_scales_with_count() {
        assert!((tolerance(100) - 0.005).abs() < 2e-6);
        assert!(tolerance(10_000) < tolerance(100));
    }

    #[test]
    fn test_recompute() {
        let p = array![[0.7f32, 0.3], [0.4, 0.6], [0.9, 0.1]];
        assert_eq!(recompute_accuracy(&p.view(), &[0, 1, 1]).unwrap(), 2.0 / 3.0);
        assert!(matches!(
            recompute_accuracy(&p.view(), &[0, 1]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_reconcile() {
        reconcile("ok", 0.5, 0.504, Some(0.5), 100).unwrap();
        let err = reconcile("off by one image", 0.50, 0.51, None, 100).unwrap_err();
        match err {
            Error::Reconciliation { left_label, right_label, .. } => {
                assert_eq!(left_label, "recomputed");
                assert_eq!(right_label, "framework");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(reconcile("reference", 0.5, 0.5, Some(0.6), 100).is_err());
    }

    #[test]
    fn test_ledger_lookup() {
        let ledger = ReferenceLedger::new(
            vec![GeneraliseRecord {
                model: "Gabor_ALL-CNN".into(),
                convolution: "Gabor".into(),
                base: "ALL-CNN".into(),
                weights: String::new(),
                trial: 2,
                seed: 0,
                set: "silhouettes_inverted".into(),
                set_type: "silhouettes".into(),
                inverted: true,
                loss: 1.0,
                accuracy: 0.42,
            }],
            vec![PerturbRecord {
                trial: 1,
                model: "Gabor_ALL-CNN".into(),
                convolution: "Gabor".into(),
                base: "ALL-CNN".into(),
                weights: "None".into(),
                noise: "Low Pass".into(),
                level: 1.5848931924611136,
                loss: 0.9,
                accuracy: 0.61,
            }],
        );
        assert_eq!(ledger.generalisation("Gabor_ALL-CNN", 2, "None", "silhouettes", true), Some(0.42));
        assert_eq!(ledger.generalisation("Gabor_ALL-CNN", 2, "None", "silhouettes", false), None);
        assert_eq!(ledger.perturbation("Gabor_ALL-CNN", 1, "None", "Low Pass", 1.584893192), Some(0.61));
        assert_eq!(ledger.perturbation("Gabor_ALL-CNN", 1, "None", "Low Pass", 2.0), None);
    }
}
