//! Gabor receptive fields.

use std::f64::consts::PI;

use ndarray::Array2;

use super::KernelSize;
use crate::error::{Error, Result};

/// Synthesise a real Gabor mask.
///
/// `g(x, y) = exp(-(x'² + γ²y'²) / 2σ²) · cos(2π·x'/λ + ψ)` with
/// `x' = x cosθ + y sinθ`, `y' = −x sinθ + y cosθ`.
///
/// Coordinates are centred on the grid. The mask is stored point-reflected:
/// entry `[i, j]` holds the value at `(x, y) = (cx − j, cy − i)`, which is
/// the layout convolution libraries expect for this kernel family.
pub fn gabor_kernel(
    size: KernelSize,
    scale: f64,
    orientation: f64,
    wavelength: f64,
    aspect_ratio: f64,
    phase: f64,
) -> Result<Array2<f64>> {
    if size.is_empty() {
        return Err(Error::Value(format!("kernel size must be non-zero, got {size}")));
    }
    for (name, v) in [("scale", scale), ("wavelength", wavelength), ("aspect ratio", aspect_ratio)] {
        if !(v.is_finite() && v > 0.0) {
            return Err(Error::Domain(format!("Gabor {name} must be positive, got {v}")));
        }
    }

    let sigma_x = scale;
    let sigma_y = scale / aspect_ratio;
    let ex = -0.5 / (sigma_x * sigma_x);
    let ey = -0.5 / (sigma_y * sigma_y);
    let k = 2.0 * PI / wavelength;
    let (sin_t, cos_t) = orientation.sin_cos();
    let (cy, cx) = size.centre();

    Ok(Array2::from_shape_fn((size.rows, size.cols), |(i, j)| {
        let x = cx - j as f64;
        let y = cy - i as f64;
        let xr = x * cos_t + y * sin_t;
        let yr = -x * sin_t + y * cos_t;
        (ex * xr * xr + ey * yr * yr).exp() * (k * xr + phase).cos()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_centre_value_is_cos_phase() {
        let g = gabor_kernel(KernelSize::square(9), 2.0, 0.3, 4.0, 0.5, 0.25).unwrap();
        assert!((g[[4, 4]] - 0.25f64.cos()).abs() < 1e-12);
    }

    #[test]
    fn test_odd_phase_is_antisymmetric() {
        let g = gabor_kernel(KernelSize::square(15), 3.0, 0.0, 6.0, 0.5, FRAC_PI_2).unwrap();
        for i in 0..15 {
            for j in 0..15 {
                assert!((g[[i, j]] + g[[14 - i, 14 - j]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_even_phase_is_symmetric() {
        let g = gabor_kernel(KernelSize::new(11, 13), 3.0, 1.1, 6.0, 0.7, 0.0).unwrap();
        for i in 0..11 {
            for j in 0..13 {
                assert!((g[[i, j]] - g[[10 - i, 12 - j]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_orientation_zero_varies_along_columns() {
        // θ = 0: the carrier runs along x, so each column is constant in phase
        // and only the envelope changes down a column.
        let g = gabor_kernel(KernelSize::square(21), 4.0, 0.0, 8.0, 1.0, 0.0).unwrap();
        // x = cx - j; a half wavelength away from centre the carrier is -1
        assert!(g[[10, 14]] < 0.0);
        assert!(g[[10, 10]] > 0.0);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let size = KernelSize::square(5);
        assert!(matches!(gabor_kernel(size, 0.0, 0.0, 4.0, 0.5, 0.0), Err(Error::Domain(_))));
        assert!(matches!(gabor_kernel(size, 2.0, 0.0, -4.0, 0.5, 0.0), Err(Error::Domain(_))));
        assert!(matches!(
            gabor_kernel(KernelSize::square(0), 2.0, 0.0, 4.0, 0.5, 0.0),
            Err(Error::Value(_))
        ));
    }
}
