//! Gaussian and difference-of-Gaussians masks.

use ndarray::{Array1, Array2, Axis};

use super::KernelSize;
use crate::error::{Error, Result};

/// Unit-sum sampled Gaussian of length `n`, centred at `(n-1)/2`.
pub fn gaussian_1d(n: usize, sigma: f64) -> Result<Array1<f64>> {
    if n == 0 {
        return Err(Error::Value("Gaussian length must be non-zero".into()));
    }
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(Error::Domain(format!("Gaussian sigma must be positive, got {sigma}")));
    }
    let centre = (n as f64 - 1.0) * 0.5;
    let scale = -0.5 / (sigma * sigma);
    let mut g = Array1::from_shape_fn(n, |i| {
        let d = i as f64 - centre;
        (scale * d * d).exp()
    });
    let total = g.sum();
    g /= total;
    Ok(g)
}

/// Separable 2-D Gaussian: outer product of two unit-sum 1-D kernels,
/// renormalised to unit sum.
pub fn gaussian_2d(size: KernelSize, sigma: f64) -> Result<Array2<f64>> {
    let col = gaussian_1d(size.rows, sigma)?.insert_axis(Axis(1));
    let row = gaussian_1d(size.cols, sigma)?.insert_axis(Axis(0));
    let mut g = col.dot(&row);
    let total = g.sum();
    g /= total;
    Ok(g)
}

/// Centre-surround pair `(on, off)`.
///
/// `on = G(σc) − G(σs)` and `off = −on`. Requires `sigma_surround >
/// sigma_center`.
pub fn difference_of_gaussians(
    size: KernelSize,
    sigma_center: f64,
    sigma_surround: f64,
) -> Result<(Array2<f64>, Array2<f64>)> {
    if !(sigma_surround > sigma_center) {
        return Err(Error::Domain(format!(
            "surround sigma ({sigma_surround}) must exceed centre sigma ({sigma_center})"
        )));
    }
    let centre = gaussian_2d(size, sigma_center)?;
    let surround = gaussian_2d(size, sigma_surround)?;
    let on = &centre - &surround;
    let off = &surround - &centre;
    Ok((on, off))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_gaussian_peak_at_centre() {
        let g = gaussian_1d(7, 1.5).unwrap();
        let (argmax, _) = g
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        assert_eq!(argmax, 3);
        assert!((g[0] - g[6]).abs() < 1e-15);
    }

    #[test]
    fn test_gaussian_2d_rectangular() {
        let g = gaussian_2d(KernelSize::new(5, 9), 2.0).unwrap();
        assert_eq!(g.dim(), (5, 9));
        assert!((g.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_dog_on_off_antisymmetric_and_zero_sum() {
        let (on, off) = difference_of_gaussians(KernelSize::square(63), 2.0, 3.6).unwrap();
        for (a, b) in on.iter().zip(off.iter()) {
            assert_eq!(*a, -*b);
        }
        assert!(on.sum().abs() < 1e-6);
        // Excitatory centre
        assert!(on[[31, 31]] > 0.0);
    }

    #[test]
    fn test_dog_requires_larger_surround() {
        let size = KernelSize::square(15);
        assert!(matches!(difference_of_gaussians(size, 2.0, 2.0), Err(Error::Domain(_))));
        assert!(matches!(difference_of_gaussians(size, 2.0, 1.0), Err(Error::Domain(_))));
    }

    #[test]
    fn test_sigma_must_be_positive() {
        assert!(matches!(gaussian_1d(5, 0.0), Err(Error::Domain(_))));
        assert!(matches!(gaussian_1d(5, f64::NAN), Err(Error::Domain(_))));
    }

    proptest! {
        #[test]
        fn prop_gaussian_sums_to_one(n in 1usize..96, sigma in 0.1f64..40.0) {
            let g = gaussian_1d(n, sigma).unwrap();
            prop_assert!((g.sum() - 1.0).abs() < 1e-6);
            let g2 = gaussian_2d(KernelSize::new(n, n.max(3)), sigma).unwrap();
            prop_assert!((g2.sum() - 1.0).abs() < 1e-6);
        }

        #[test]
        fn prop_dog_off_is_negated_on(sigma in 0.5f64..8.0, gamma in 1.05f64..3.0) {
            let (on, off) = difference_of_gaussians(KernelSize::square(31), sigma, sigma * gamma).unwrap();
            prop_assert!(on.iter().zip(off.iter()).all(|(a, b)| *a == -*b));
        }
    }
}
