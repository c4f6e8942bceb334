//! Gabor wavelength / scale / octave-bandwidth conversions.
//!
//! With `r = π·σ/λ` and `c = sqrt(ln 2 / 2)` the half-magnitude bandwidth in
//! octaves is `b = log2((r + c) / (r − c))`. Solving for σ or λ with
//! `p = 2^b` gives the two inverses below.

use std::f64::consts::{LN_2, PI};

use crate::error::{Error, Result};

fn c() -> f64 {
    (LN_2 / 2.0).sqrt()
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::Domain(format!("{name} must be positive and finite, got {value}")))
    }
}

/// Octave bandwidth of a Gabor with the given wavelength and scale.
///
/// Fails when `π·scale/wavelength <= sqrt(ln 2 / 2)`: the envelope is too
/// narrow for the carrier and the bandwidth is undefined.
pub fn bandwidth_from(wavelength: f64, scale: f64) -> Result<f64> {
    require_positive("wavelength", wavelength)?;
    require_positive("scale", scale)?;
    let r = PI * scale / wavelength;
    let c = c();
    if r <= c {
        return Err(Error::Domain(format!(
            "bandwidth undefined for wavelength {wavelength} and scale {scale} (π·σ/λ = {r:.6} <= {c:.6})"
        )));
    }
    Ok(((r + c) / (r - c)).log2())
}

/// Envelope scale σ for a wavelength and octave bandwidth.
pub fn scale_from(wavelength: f64, bandwidth: f64) -> Result<f64> {
    require_positive("wavelength", wavelength)?;
    require_positive("bandwidth", bandwidth)?;
    let p = bandwidth.exp2();
    Ok(wavelength * c() / PI * (p + 1.0) / (p - 1.0))
}

/// Carrier wavelength λ for an envelope scale and octave bandwidth.
pub fn wavelength_from(scale: f64, bandwidth: f64) -> Result<f64> {
    require_positive("scale", scale)?;
    require_positive("bandwidth", bandwidth)?;
    let p = bandwidth.exp2();
    Ok(scale * PI / c() * (p - 1.0) / (p + 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_one_octave_reference_value() {
        // One octave: σ/λ ≈ 0.56.
        let sigma = scale_from(1.0, 1.0).unwrap();
        assert!((sigma - 0.5622).abs() < 1e-3);
    }

    #[test]
    fn test_bandwidth_domain_error() {
        // r = π·0.1/1 ≈ 0.314 < c ≈ 0.589
        let err = bandwidth_from(1.0, 0.1).unwrap_err();
        assert!(matches!(err, Error::Domain(_)));
    }

    #[test]
    fn test_non_positive_inputs_rejected() {
        assert!(matches!(scale_from(-1.0, 1.0), Err(Error::Domain(_))));
        assert!(matches!(wavelength_from(8.0, 0.0), Err(Error::Domain(_))));
        assert!(matches!(bandwidth_from(0.0, 8.0), Err(Error::Domain(_))));
    }

    #[test]
    fn test_wavelength_grows_with_bandwidth() {
        let l1 = wavelength_from(8.0, 1.0).unwrap();
        let l2 = wavelength_from(8.0, 1.8).unwrap();
        let l3 = wavelength_from(8.0, 2.6).unwrap();
        assert!(l1 < l2 && l2 < l3);
    }

    proptest! {
        #[test]
        fn prop_bandwidth_round_trip(sigma in 0.5f64..32.0, b in 0.2f64..4.0) {
            let lambda = wavelength_from(sigma, b).unwrap();
            let back = bandwidth_from(lambda, sigma).unwrap();
            prop_assert!((back - b).abs() < 1e-9);
        }

        #[test]
        fn prop_scale_inverts_wavelength(sigma in 0.5f64..32.0, b in 0.2f64..4.0) {
            let lambda = wavelength_from(sigma, b).unwrap();
            let back = scale_from(lambda, b).unwrap();
            prop_assert!((back - sigma).abs() < 1e-9 * sigma.max(1.0));
        }
    }
}
