//! Severity schedules.

/// `n` evenly spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + i as f64 * step })
                .collect()
        }
    }
}

/// `n` values from `10^start` to `10^stop`, evenly spaced in the exponent.
pub fn logspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    linspace(start, stop, n)
        .into_iter()
        .map(|e| 10f64.powf(e))
        .collect()
}

/// Stretch a discrete set to `n` levels by contiguous repetition: level `i`
/// takes `values[floor(i * k / n)]`.
pub fn spread(values: &[f64], n: usize) -> Vec<f64> {
    let k = values.len();
    if k == 0 {
        return Vec::new();
    }
    (0..n).map(|i| values[i * k / n]).collect()
}

/// Whether `levels` never decreases in absolute magnitude, in either
/// direction along the schedule.
pub fn is_monotonic_in_magnitude(levels: &[f64]) -> bool {
    let rising = levels.windows(2).all(|w| w[1].abs() >= w[0].abs());
    let falling = levels.windows(2).all(|w| w[1].abs() <= w[0].abs());
    rising || falling
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(0.0, 180.0, 11);
        assert_eq!(v.len(), 11);
        assert_eq!(v[0], 0.0);
        assert_eq!(v[10], 180.0);
        assert_abs_diff_eq!(v[5], 90.0, epsilon = 1e-12);
    }

    #[test]
    fn test_logspace() {
        let v = logspace(0.0, -2.0, 11);
        assert_eq!(v[0], 1.0);
        assert_abs_diff_eq!(v[10], 0.01, epsilon = 1e-15);
        assert!(is_monotonic_in_magnitude(&v));
    }

    #[test]
    fn test_spread_blocks() {
        let rot = spread(&[0.0, 90.0, 180.0, 270.0], 11);
        assert_eq!(
            rot,
            vec![0.0, 0.0, 0.0, 90.0, 90.0, 90.0, 180.0, 180.0, 180.0, 270.0, 270.0]
        );
        let inv = spread(&[0.0, 1.0], 11);
        assert_eq!(inv.iter().filter(|&&x| x == 0.0).count(), 6);
        assert!(is_monotonic_in_magnitude(&inv));
    }
}
