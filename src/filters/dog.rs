//! Difference-of-Gaussians bank: an on/off centre-surround pair for every
//! (σ, γ) combination.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{require_all_positive, require_kernel_size, FilterBank, FilterFamily, FilterParams};
use crate::error::{Error, Result};
use crate::kernels::{difference_of_gaussians, KernelSize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DogParams {
    pub ksize: KernelSize,
    /// Centre scales.
    pub sigmas: Vec<f64>,
    /// Surround-to-centre ratios, each strictly greater than 1.
    pub gammas: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct DogBank {
    params: DogParams,
}

impl DogBank {
    pub fn new(params: DogParams) -> Result<Self> {
        let family = FilterFamily::Dog;
        require_kernel_size(family, params.ksize)?;
        require_all_positive(family, "sigmas", &params.sigmas)?;
        require_all_positive(family, "gammas", &params.gammas)?;
        if let Some(g) = params.gammas.iter().find(|g| **g <= 1.0) {
            return Err(Error::Domain(format!(
                "DoG surround ratio must be greater than 1, got {g}"
            )));
        }
        Ok(Self { params })
    }
}

impl FilterBank for DogBank {
    fn family(&self) -> FilterFamily {
        FilterFamily::Dog
    }

    fn kernel_size(&self) -> KernelSize {
        self.params.ksize
    }

    fn kernel_count(&self) -> usize {
        self.params.sigmas.len() * self.params.gammas.len() * 2
    }

    fn masks(&self) -> Result<Vec<Array2<f64>>> {
        let p = &self.params;
        let mut masks = Vec::with_capacity(self.kernel_count());
        for &sigma in &p.sigmas {
            for &gamma in &p.gammas {
                let (on, off) = difference_of_gaussians(p.ksize, sigma, sigma * gamma)?;
                masks.push(on);
                masks.push(off);
            }
        }
        Ok(masks)
    }

    fn describe(&self) -> FilterParams {
        FilterParams::Dog(self.params.clone())
    }
}
