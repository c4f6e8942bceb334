//! Gabor filter bank: every combination of scale, orientation, bandwidth,
//! aspect ratio and phase.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{require_all_positive, require_kernel_size, require_non_empty};
use super::{FilterBank, FilterFamily, FilterParams};
use crate::error::Result;
use crate::kernels::{gabor_kernel, wavelength_from, KernelSize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaborParams {
    pub ksize: KernelSize,
    /// Envelope scales σ.
    pub sigmas: Vec<f64>,
    /// Octave bandwidths; wavelength follows from `(σ, b)`.
    pub bs: Vec<f64>,
    /// Spatial aspect ratios γ.
    pub gammas: Vec<f64>,
    /// Orientations θ in radians.
    pub thetas: Vec<f64>,
    /// Phase offsets ψ in radians.
    pub psis: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct GaborBank {
    params: GaborParams,
}

impl GaborBank {
    pub fn new(params: GaborParams) -> Result<Self> {
        let family = FilterFamily::Gabor;
        require_kernel_size(family, params.ksize)?;
        require_all_positive(family, "sigmas", &params.sigmas)?;
        require_all_positive(family, "bs", &params.bs)?;
        require_all_positive(family, "gammas", &params.gammas)?;
        require_non_empty(family, "thetas", &params.thetas)?;
        require_non_empty(family, "psis", &params.psis)?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &GaborParams {
        &self.params
    }
}

impl FilterBank for GaborBank {
    fn family(&self) -> FilterFamily {
        FilterFamily::Gabor
    }

    fn kernel_size(&self) -> KernelSize {
        self.params.ksize
    }

    fn kernel_count(&self) -> usize {
        let p = &self.params;
        p.sigmas.len() * p.bs.len() * p.gammas.len() * p.thetas.len() * p.psis.len()
    }

    /// Order: σ, then θ, then b, then γ, then ψ (innermost).
    fn masks(&self) -> Result<Vec<Array2<f64>>> {
        let p = &self.params;
        let mut masks = Vec::with_capacity(self.kernel_count());
        for &sigma in &p.sigmas {
            for &theta in &p.thetas {
                for &b in &p.bs {
                    let lambda = wavelength_from(sigma, b)?;
                    for &gamma in &p.gammas {
                        for &psi in &p.psis {
                            masks.push(gabor_kernel(p.ksize, sigma, theta, lambda, gamma, psi)?);
                        }
                    }
                }
            }
        }
        Ok(masks)
    }

    fn describe(&self) -> FilterParams {
        FilterParams::Gabor(self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::filters::Precision;
    use std::f64::consts::PI;

    fn reference_params() -> GaborParams {
        GaborParams {
            ksize: KernelSize::square(63),
            sigmas: vec![8.0],
            bs: vec![1.0, 1.8, 2.6],
            gammas: vec![0.5],
            thetas: vec![0.0, PI / 4.0, PI / 2.0, 3.0 * PI / 4.0],
            psis: vec![PI / 2.0, 3.0 * PI / 2.0],
        }
    }

    #[test]
    fn test_reference_bank_has_24_kernels() {
        let bank = GaborBank::new(reference_params()).unwrap();
        assert_eq!(bank.kernel_count(), 24);
        let t = bank.produce(Some([63, 63, 1, 24]), Precision::F32).unwrap();
        assert_eq!(t.shape(), [63, 63, 1, 24]);
    }

    #[test]
    fn test_wrong_output_channels_rejected() {
        let bank = GaborBank::new(reference_params()).unwrap();
        let err = bank.produce(Some([63, 63, 1, 23]), Precision::F32).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        let err = bank.produce(Some([31, 31, 1, 24]), Precision::F32).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_tiles_across_input_channels() {
        let bank = GaborBank::new(reference_params()).unwrap();
        let t = match bank.produce(Some([63, 63, 3, 24]), Precision::F64).unwrap() {
            crate::filters::KernelTensor::F64(a) => a,
            other => panic!("unexpected precision {:?}", other.precision()),
        };
        for k in [0, 7, 23] {
            for i in [0, 31, 50] {
                for j in [3, 31, 62] {
                    assert_eq!(t[[i, j, 0, k]], t[[i, j, 1, k]]);
                    assert_eq!(t[[i, j, 0, k]], t[[i, j, 2, k]]);
                }
            }
        }
    }

    #[test]
    fn test_mask_order_psi_innermost() {
        let bank = GaborBank::new(reference_params()).unwrap();
        let masks = bank.masks().unwrap();
        // Kernels 0 and 1 share σ, θ, b, γ and differ by π in phase.
        for (a, b) in masks[0].iter().zip(masks[1].iter()) {
            assert!((a + b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_describe_rebuilds_identical_tensor() {
        let bank = GaborBank::new(reference_params()).unwrap();
        let json = serde_json::to_string(&bank.describe()).unwrap();
        let params: FilterParams = serde_json::from_str(&json).unwrap();
        let rebuilt = params.build().unwrap();
        assert_eq!(
            bank.produce(None, Precision::F32).unwrap(),
            rebuilt.produce(None, Precision::F32).unwrap()
        );
    }

    #[test]
    fn test_empty_list_rejected() {
        let mut params = reference_params();
        params.thetas.clear();
        assert!(matches!(GaborBank::new(params), Err(Error::Value(_))));
    }
}
