//! Perturbation engine: ten named image distortions, each with an
//! 11-level severity schedule, applied to NHWC batches in `[0, 255]`.
//!
//! Stochastic distortions draw from a [`StdRng`] seeded per image
//! (`seed + image index`), so a batch perturbed twice with the same seed is
//! identical regardless of thread scheduling.

pub mod schedule;
pub mod transforms;

use std::fmt;
use std::str::FromStr;

use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ImageStats;
use crate::defaults::{LUMINANCE_WEIGHTS, N_LEVELS};
use crate::error::{Error, Result};
use schedule::{linspace, logspace, spread};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PerturbKind {
    Uniform,
    #[serde(rename = "Salt and Pepper")]
    SaltAndPepper,
    #[serde(rename = "High Pass")]
    HighPass,
    #[serde(rename = "Low Pass")]
    LowPass,
    Contrast,
    #[serde(rename = "Phase Scrambling")]
    PhaseScrambling,
    Darken,
    Brighten,
    Rotation,
    Invert,
}

impl PerturbKind {
    /// Catalogue order.
    pub const ALL: [PerturbKind; 10] = [
        PerturbKind::Uniform,
        PerturbKind::SaltAndPepper,
        PerturbKind::HighPass,
        PerturbKind::LowPass,
        PerturbKind::Contrast,
        PerturbKind::PhaseScrambling,
        PerturbKind::Darken,
        PerturbKind::Brighten,
        PerturbKind::Rotation,
        PerturbKind::Invert,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PerturbKind::Uniform => "Uniform",
            PerturbKind::SaltAndPepper => "Salt and Pepper",
            PerturbKind::HighPass => "High Pass",
            PerturbKind::LowPass => "Low Pass",
            PerturbKind::Contrast => "Contrast",
            PerturbKind::PhaseScrambling => "Phase Scrambling",
            PerturbKind::Darken => "Darken",
            PerturbKind::Brighten => "Brighten",
            PerturbKind::Rotation => "Rotation",
            PerturbKind::Invert => "Invert",
        }
    }

    /// File-name form of the name, e.g. `salt_and_pepper`.
    pub fn slug(self) -> String {
        self.name().to_ascii_lowercase().replace(' ', "_")
    }

    pub fn is_stochastic(self) -> bool {
        matches!(
            self,
            PerturbKind::Uniform | PerturbKind::SaltAndPepper | PerturbKind::PhaseScrambling
        )
    }

    /// The 11-point severity schedule, mildest first.
    pub fn levels(self) -> Vec<f64> {
        let n = N_LEVELS;
        match self {
            PerturbKind::Uniform | PerturbKind::SaltAndPepper | PerturbKind::Brighten => linspace(0.0, 1.0, n),
            PerturbKind::HighPass => logspace(2.0, 0.0, n),
            PerturbKind::LowPass => logspace(0.0, 2.0, n),
            PerturbKind::Contrast => logspace(0.0, -2.0, n),
            PerturbKind::PhaseScrambling => linspace(0.0, 180.0, n),
            PerturbKind::Darken => linspace(0.0, -1.0, n),
            PerturbKind::Rotation => spread(&[0.0, 90.0, 180.0, 270.0], n),
            PerturbKind::Invert => spread(&[0.0, 1.0], n),
        }
    }

    /// Apply at one severity. `contrast_level` scales contrast first for the
    /// additive-noise distortions (1 leaves the image untouched).
    pub fn apply(
        self,
        image: &ArrayView3<f32>,
        level: f64,
        contrast_level: f64,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>> {
        let reduced;
        let noisy_input = if matches!(self, PerturbKind::Uniform | PerturbKind::SaltAndPepper) && contrast_level != 1.0 {
            reduced = transforms::adjust_contrast(image, contrast_level);
            reduced.view()
        } else {
            image.view()
        };
        Ok(match self {
            PerturbKind::Uniform => transforms::uniform_noise(&noisy_input, level, rng),
            PerturbKind::SaltAndPepper => transforms::salt_and_pepper(&noisy_input, level, rng),
            PerturbKind::HighPass => transforms::high_pass(image, level)?,
            PerturbKind::LowPass => transforms::low_pass(image, level)?,
            PerturbKind::Contrast => transforms::adjust_contrast(image, level),
            PerturbKind::PhaseScrambling => transforms::phase_scramble(image, level, rng),
            PerturbKind::Darken | PerturbKind::Brighten => transforms::adjust_brightness(image, level),
            PerturbKind::Rotation => transforms::rotate(image, level)?,
            PerturbKind::Invert => transforms::invert(image, level),
        })
    }
}

impl fmt::Display for PerturbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PerturbKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        Self::ALL
            .into_iter()
            .find(|k| k.name().to_ascii_lowercase() == key)
            .ok_or_else(|| Error::Config(format!("unknown perturbation: {s:?}")))
    }
}

/// A named distortion with its severity schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Perturbation {
    pub kind: PerturbKind,
    pub levels: Vec<f64>,
}

impl Perturbation {
    pub fn new(kind: PerturbKind) -> Self {
        Self {
            kind,
            levels: kind.levels(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// The full catalogue in reporting order.
pub fn perturbations() -> Vec<Perturbation> {
    PerturbKind::ALL.into_iter().map(Perturbation::new).collect()
}

/// Perturb every image of an NHWC batch in parallel. Image `i` draws from
/// `StdRng::seed_from_u64(seed + i)`.
pub fn perturb_batch(
    images: &ArrayView4<f32>,
    kind: PerturbKind,
    level: f64,
    contrast_level: f64,
    seed: u64,
) -> Result<Array4<f32>> {
    let views: Vec<ArrayView3<f32>> = images.axis_iter(Axis(0)).collect();
    let perturbed: Vec<Array3<f32>> = views
        .par_iter()
        .enumerate()
        .map(|(i, image)| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            kind.apply(image, level, contrast_level, &mut rng)
        })
        .collect::<Result<_>>()?;
    if perturbed.is_empty() {
        return Ok(images.to_owned());
    }
    let views: Vec<_> = perturbed.iter().map(|a| a.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| Error::shape("perturbed batch", images.dim(), e))
}

/// Convert RGB batches to one luminance channel (ITU-R 601-2 weights).
/// Single-channel input is returned unchanged.
pub fn to_grayscale(images: &ArrayView4<f32>) -> Result<Array4<f32>> {
    match images.dim().3 {
        1 => Ok(images.to_owned()),
        3 => {
            let (n, h, w, _) = images.dim();
            Ok(Array4::from_shape_fn((n, h, w, 1), |(i, y, x, _)| {
                LUMINANCE_WEIGHTS
                    .iter()
                    .enumerate()
                    .map(|(ch, wgt)| wgt * images[[i, y, x, ch]])
                    .sum::<f32>()
            }))
        }
        c => Err(Error::shape("grayscale conversion channels", "1 or 3", c)),
    }
}

/// Feature-wise normalisation `(x − mean) / std`, applied after any
/// perturbation.
pub fn normalise(images: &mut Array4<f32>, stats: ImageStats) {
    let mean = stats.mean as f32;
    let std = stats.std as f32;
    images.par_mapv_inplace(|x| (x - mean) / std);
}
