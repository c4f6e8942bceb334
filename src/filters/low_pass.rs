//! Isotropic Gaussian low-pass bank, one kernel per scale.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{require_all_positive, require_kernel_size, FilterBank, FilterFamily, FilterParams};
use crate::error::Result;
use crate::kernels::{gaussian_2d, KernelSize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LowPassParams {
    pub ksize: KernelSize,
    pub sigmas: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct LowPassBank {
    params: LowPassParams,
}

impl LowPassBank {
    pub fn new(params: LowPassParams) -> Result<Self> {
        require_kernel_size(FilterFamily::LowPass, params.ksize)?;
        require_all_positive(FilterFamily::LowPass, "sigmas", &params.sigmas)?;
        Ok(Self { params })
    }
}

impl FilterBank for LowPassBank {
    fn family(&self) -> FilterFamily {
        FilterFamily::LowPass
    }

    fn kernel_size(&self) -> KernelSize {
        self.params.ksize
    }

    fn kernel_count(&self) -> usize {
        self.params.sigmas.len()
    }

    fn masks(&self) -> Result<Vec<Array2<f64>>> {
        self.params
            .sigmas
            .iter()
            .map(|&sigma| gaussian_2d(self.params.ksize, sigma))
            .collect()
    }

    fn describe(&self) -> FilterParams {
        FilterParams::LowPass(self.params.clone())
    }
}
