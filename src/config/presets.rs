//! Reference filter parameter sets and model tags for each convolution type.

use std::f64::consts::PI;

use super::Convolution;
use crate::filters::{DogParams, FilterParams, FilterSpec, GaborParams, LowPassParams};
use crate::kernels::KernelSize;
use crate::model::Base;

const GABOR_BANDWIDTHS: [f64; 3] = [1.0, 1.8, 2.6];
const DOG_GAMMAS: [f64; 4] = [1.6, 1.8, 2.0, 2.2];

fn gabor(ksize: usize, sigma: f64) -> FilterParams {
    FilterParams::Gabor(GaborParams {
        ksize: KernelSize::square(ksize),
        sigmas: vec![sigma],
        bs: GABOR_BANDWIDTHS.to_vec(),
        gammas: vec![0.5],
        thetas: (0..4).map(|i| i as f64 * (PI / 4.0)).collect(),
        psis: vec![PI / 2.0, 3.0 * PI / 2.0],
    })
}

fn dog(ksize: usize, sigmas: &[f64]) -> FilterParams {
    FilterParams::Dog(DogParams {
        ksize: KernelSize::square(ksize),
        sigmas: sigmas.to_vec(),
        gammas: DOG_GAMMAS.to_vec(),
    })
}

/// Filter parameters used for `convolution`; `None` for `Original`.
///
/// Combined presets list the DoG branch before the Gabor branch.
pub fn filter_spec(convolution: Convolution) -> Option<FilterSpec> {
    let branches = match convolution {
        Convolution::Original => return None,
        Convolution::Gabor => vec![gabor(63, 8.0)],
        Convolution::Dog => vec![dog(63, &[1.0, 2.0, 4.0, 8.0])],
        Convolution::LowPass => vec![FilterParams::LowPass(LowPassParams {
            ksize: KernelSize::square(63),
            sigmas: vec![1.0, 2.0, 4.0, 8.0],
        })],
        Convolution::CombinedFull => vec![dog(63, &[1.0, 2.0, 4.0, 8.0]), gabor(63, 8.0)],
        Convolution::CombinedSmall => vec![dog(15, &[1.0, 2.0, 4.0]), gabor(31, 4.0)],
        Convolution::CombinedMedium => vec![dog(15, &[1.0, 2.0, 4.0, 8.0]), gabor(31, 8.0)],
        Convolution::CombinedTrim => vec![dog(31, &[1.0, 2.0, 4.0, 8.0]), gabor(31, 8.0)],
    };
    Some(FilterSpec { branches })
}

/// Model tag recorded in run metadata and result tables.
pub fn model_tag(convolution: Convolution, base: Base, pretrained: bool) -> String {
    match convolution {
        Convolution::Original if pretrained => format!("Original_{base}_ImageNet"),
        Convolution::Original => format!("Original_{base}"),
        Convolution::CombinedTrim => format!("Combined_{base}"),
        c if c.is_combined() => format!("DoG+Gabor_{base}"),
        c => format!("{c}_{base}"),
    }
}
