//! Area under the accuracy-vs-severity curve.

use std::collections::BTreeMap;

use super::records::PerturbRecord;
use crate::error::{Error, Result};
use crate::perturb::PerturbKind;

/// Trapezoid-rule area under `y(x)`. Points must be ordered along `x` in
/// either direction; the absolute area is returned.
pub fn trapezoid(x: &[f64], y: &[f64]) -> Result<f64> {
    if x.len() != y.len() {
        return Err(Error::shape("curve points", x.len(), y.len()));
    }
    if x.len() < 2 {
        return Err(Error::Value(format!("at least two points are needed, got {}", x.len())));
    }
    let rising = x.windows(2).all(|w| w[1] >= w[0]);
    let falling = x.windows(2).all(|w| w[1] <= w[0]);
    if !(rising || falling) {
        return Err(Error::Value("x is neither increasing nor decreasing".into()));
    }
    let area: f64 = x
        .windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[0] + ys[1]) / 2.0)
        .sum();
    Ok(area.abs())
}

/// Per-level mean accuracy across trials, sorted by level. Levels that
/// repeat within a schedule collapse into one point.
pub fn mean_curve<'a>(records: impl IntoIterator<Item = &'a PerturbRecord>) -> (Vec<f64>, Vec<f64>) {
    let mut sums: Vec<(f64, f64, usize)> = Vec::new();
    for r in records {
        match sums.iter_mut().find(|(level, ..)| (level - r.level).abs() <= 1e-12) {
            Some(entry) => {
                entry.1 += r.accuracy;
                entry.2 += 1;
            }
            None => sums.push((r.level, r.accuracy, 1)),
        }
    }
    sums.sort_by(|a, b| a.0.total_cmp(&b.0));
    sums.into_iter()
        .map(|(level, total, count)| (level, total / count as f64))
        .unzip()
}

/// AUC for every (perturbation, model) pair, averaging over trials before
/// integrating. Perturbations follow catalogue order; pairs with fewer
/// than two distinct levels are skipped.
pub fn perturbation_aucs(records: &[PerturbRecord]) -> Result<Vec<(String, String, f64)>> {
    let mut models: Vec<&str> = Vec::new();
    for r in records {
        if !models.contains(&r.model.as_str()) {
            models.push(&r.model);
        }
    }
    let mut grouped: BTreeMap<(&str, &str), Vec<&PerturbRecord>> = BTreeMap::new();
    for r in records {
        grouped.entry((r.noise.as_str(), r.model.as_str())).or_default().push(r);
    }

    let mut scores = Vec::new();
    for kind in PerturbKind::ALL {
        for &model in &models {
            let Some(group) = grouped.get(&(kind.name(), model)) else {
                continue;
            };
            let (x, y) = mean_curve(group.iter().copied());
            if x.len() < 2 {
                tracing::debug!(noise = kind.name(), model, "skipping AUC with {} level(s)", x.len());
                continue;
            }
            let area = trapezoid(&x, &y)?;
            tracing::info!("{:16} | {:14}: AUC = {:6.3}", kind.name(), model, area);
            scores.push((kind.name().to_string(), model.to_string(), area));
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rec(model: &str, noise: &str, trial: usize, level: f64, accuracy: f64) -> PerturbRecord {
        PerturbRecord {
            trial,
            model: model.into(),
            convolution: "Gabor".into(),
            base: "ALL-CNN".into(),
            weights: "None".into(),
            noise: noise.into(),
            level,
            loss: 0.0,
            accuracy,
        }
    }

    #[test]
    fn test_trapezoid() {
        assert_abs_diff_eq!(trapezoid(&[0.0, 0.5, 1.0], &[1.0, 1.0, 0.0]).unwrap(), 0.75);
        assert_abs_diff_eq!(trapezoid(&[1.0, 0.5, 0.0], &[0.0, 1.0, 1.0]).unwrap(), 0.75);
        assert!(trapezoid(&[0.0, 1.0, 0.5], &[1.0, 1.0, 1.0]).is_err());
        assert!(trapezoid(&[0.0], &[1.0]).is_err());
    }

    #[test]
    fn test_average_before_integration() {
        let records = vec![
            rec("A", "Uniform", 1, 0.0, 1.0),
            rec("A", "Uniform", 1, 1.0, 0.0),
            rec("A", "Uniform", 2, 0.0, 0.5),
            rec("A", "Uniform", 2, 1.0, 0.5),
            rec("B", "Invert", 1, 0.0, 0.9),
            rec("B", "Invert", 1, 0.0, 0.9),
            rec("B", "Invert", 1, 1.0, 0.1),
            rec("A", "Contrast", 1, 1.0, 0.8),
        ];
        let scores = perturbation_aucs(&records).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].0, "Uniform");
        assert_abs_diff_eq!(scores[0].2, 0.5);
        assert_eq!(scores[1].0, "Invert");
        assert_abs_diff_eq!(scores[1].2, 0.5);
    }
}
