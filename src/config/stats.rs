//! Training-set pixel statistics for feature-wise normalisation.

use std::collections::HashMap;

use ndarray::{ArrayBase, Data, Dimension};
use serde::{Deserialize, Serialize};

use super::Interpolation;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageStats {
    pub mean: f64,
    pub std: f64,
}

impl ImageStats {
    /// Population mean and standard deviation over every pixel.
    pub fn from_images<S, D>(images: &ArrayBase<S, D>) -> Result<Self>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let n = images.len();
        if n == 0 {
            return Err(Error::Value("cannot compute statistics of an empty image set".into()));
        }
        let mean = images.iter().map(|&x| x as f64).sum::<f64>() / n as f64;
        let var = images.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n as f64;
        let std = var.sqrt();
        if !(std > 0.0) {
            return Err(Error::Value(format!("image set has no variance (mean {mean})")));
        }
        Ok(Self { mean, std })
    }
}

/// Cached statistics keyed by `(data set, interpolation)`.
#[derive(Clone, Debug, Default)]
pub struct ImageStatsCache {
    entries: HashMap<(String, Interpolation), ImageStats>,
}

impl ImageStatsCache {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Grayscale CIFAR-10 upscaled to 224x224.
    pub fn with_known() -> Self {
        let mut cache = Self::empty();
        cache.insert(
            "cifar10",
            Interpolation::Nearest,
            ImageStats {
                mean: 122.61930353949222,
                std: 60.99213660091195,
            },
        );
        cache.insert(
            "cifar10",
            Interpolation::Lanczos,
            ImageStats {
                mean: 122.61385345458984,
                std: 60.87860107421875,
            },
        );
        cache
    }

    pub fn insert(&mut self, data_set: &str, interpolation: Interpolation, stats: ImageStats) {
        self.entries
            .insert((data_set.to_ascii_lowercase(), interpolation), stats);
    }

    pub fn get(&self, data_set: &str, interpolation: Interpolation) -> Option<ImageStats> {
        self.entries
            .get(&(data_set.to_ascii_lowercase(), interpolation))
            .copied()
    }

    /// Cached statistics, or statistics recomputed from `train` on a miss.
    /// The recomputed value is cached for later lookups.
    pub fn resolve<S, D>(
        &mut self,
        data_set: &str,
        interpolation: Interpolation,
        train: &ArrayBase<S, D>,
    ) -> Result<ImageStats>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        if let Some(stats) = self.get(data_set, interpolation) {
            return Ok(stats);
        }
        tracing::warn!(
            "uncached interpolation method {} for {}; recomputing training statistics",
            interpolation.name(),
            data_set
        );
        let stats = ImageStats::from_images(train)?;
        tracing::info!("training statistics: mean={} std={}", stats.mean, stats.std);
        self.insert(data_set, interpolation, stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array4};

    #[test]
    fn test_cache_hit() {
        let mut cache = ImageStatsCache::with_known();
        let unused = Array4::<f32>::zeros((1, 1, 1, 1));
        let stats = cache.resolve("CIFAR10", Interpolation::Lanczos, &unused).unwrap();
        assert_eq!(stats.mean, 122.61385345458984);
    }

    #[test]
    fn test_cache_miss_recomputes() {
        let mut cache = ImageStatsCache::with_known();
        let train = array![[0.0f32, 2.0], [4.0, 6.0]];
        let stats = cache.resolve("cifar10", Interpolation::Cubic, &train).unwrap();
        assert_abs_diff_eq!(stats.mean, 3.0);
        assert_abs_diff_eq!(stats.std, 5.0f64.sqrt(), epsilon = 1e-12);
        assert_eq!(cache.get("cifar10", Interpolation::Cubic), Some(stats));
    }

    #[test]
    fn test_constant_images_rejected() {
        let flat = Array4::<f32>::from_elem((2, 2, 2, 1), 7.0);
        assert!(matches!(ImageStats::from_images(&flat), Err(Error::Value(_))));
    }
}
