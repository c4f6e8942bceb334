//! Single-image distortions on `(height, width, channels)` pixel arrays in
//! `[0, 255]`. Every output is clipped back into that range.

use ndarray::{s, Array3, ArrayView3};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::{Error, Result};
use crate::kernels::gaussian_1d;

pub const PIXEL_MAX: f32 = 255.0;

fn clip(mut image: Array3<f32>) -> Array3<f32> {
    image.mapv_inplace(|v| v.clamp(0.0, PIXEL_MAX));
    image
}

/// Scale contrast about mid-grey: `(1 − c)/2 + c·x` in unit range.
pub fn adjust_contrast(image: &ArrayView3<f32>, level: f64) -> Array3<f32> {
    let c = level as f32;
    clip(image.mapv(|x| ((1.0 - c) / 2.0 + c * x / PIXEL_MAX) * PIXEL_MAX))
}

/// Additive `U(−width, width)` noise in unit range. Zero width returns the
/// image unchanged.
pub fn uniform_noise(image: &ArrayView3<f32>, width: f64, rng: &mut StdRng) -> Array3<f32> {
    if !(width > 0.0) {
        return clip(image.to_owned());
    }
    let dist = Uniform::new_inclusive(-width as f32, width as f32);
    clip(image.mapv(|x| (x / PIXEL_MAX + dist.sample(rng)).clamp(0.0, 1.0) * PIXEL_MAX))
}

/// Set a proportion of pixel locations (all channels together) to black or
/// white with equal odds.
pub fn salt_and_pepper(image: &ArrayView3<f32>, proportion: f64, rng: &mut StdRng) -> Array3<f32> {
    let mut out = image.to_owned();
    if !(proportion > 0.0) {
        return clip(out);
    }
    let (h, w, _) = out.dim();
    for y in 0..h {
        for x in 0..w {
            if rng.gen::<f64>() < proportion {
                let value = if rng.gen_bool(0.5) { PIXEL_MAX } else { 0.0 };
                out.slice_mut(s![y, x, ..]).fill(value);
            }
        }
    }
    clip(out)
}

fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - 1 - m }) as usize
}

/// Separable Gaussian blur with a `4σ` radius and mirrored borders.
pub fn gaussian_blur(image: &ArrayView3<f32>, sigma: f64) -> Result<Array3<f32>> {
    if !(sigma > 0.0) {
        return Ok(image.to_owned());
    }
    let (h, w, c) = image.dim();
    let radius = (4.0 * sigma + 0.5) as usize;
    let kernel = gaussian_1d(2 * radius + 1, sigma)?;
    let r = radius as isize;

    let mut rows = Array3::<f64>::zeros((h, w, c));
    for ((y, x, ch), v) in rows.indexed_iter_mut() {
        *v = kernel
            .iter()
            .enumerate()
            .map(|(k, &g)| g * image[[y, reflect(x as isize + k as isize - r, w), ch]] as f64)
            .sum();
    }
    let mut out = Array3::<f32>::zeros((h, w, c));
    for ((y, x, ch), v) in out.indexed_iter_mut() {
        *v = kernel
            .iter()
            .enumerate()
            .map(|(k, &g)| g * rows[[reflect(y as isize + k as isize - r, h), x, ch]])
            .sum::<f64>() as f32;
    }
    Ok(out)
}

pub fn low_pass(image: &ArrayView3<f32>, sigma: f64) -> Result<Array3<f32>> {
    Ok(clip(gaussian_blur(image, sigma)?))
}

/// `x − blur_σ(x) + mean(x)`.
pub fn high_pass(image: &ArrayView3<f32>, sigma: f64) -> Result<Array3<f32>> {
    let mean = image.mean().unwrap_or(0.0);
    let blurred = gaussian_blur(image, sigma)?;
    Ok(clip(&image.view() - &blurred + mean))
}

fn transpose(buf: &[Complex<f64>], rows: usize, cols: usize) -> Vec<Complex<f64>> {
    let mut t = vec![Complex::new(0.0, 0.0); rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            t[j * rows + i] = buf[i * cols + j];
        }
    }
    t
}

/// In-place unnormalised 2-D FFT over a row-major `h x w` buffer.
fn fft2(planner: &mut FftPlanner<f64>, buf: &mut [Complex<f64>], h: usize, w: usize, inverse: bool) {
    let (row_fft, col_fft) = if inverse {
        (planner.plan_fft_inverse(w), planner.plan_fft_inverse(h))
    } else {
        (planner.plan_fft_forward(w), planner.plan_fft_forward(h))
    };
    row_fft.process(buf);
    let mut cols = transpose(buf, h, w);
    col_fft.process(&mut cols);
    buf.copy_from_slice(&transpose(&cols, w, h));
}

/// Add `U(−width°, width°)` to every Fourier phase and keep the real part
/// of the inverse transform. All channels share the phase offsets.
pub fn phase_scramble(image: &ArrayView3<f32>, width: f64, rng: &mut StdRng) -> Array3<f32> {
    if !(width > 0.0) {
        return clip(image.to_owned());
    }
    let (h, w, c) = image.dim();
    let half = width.to_radians();
    let dist = Uniform::new_inclusive(-half, half);
    let offsets: Vec<f64> = (0..h * w).map(|_| dist.sample(rng)).collect();

    let mut planner = FftPlanner::<f64>::new();
    let scale = (h * w) as f64;
    let mut out = Array3::<f32>::zeros((h, w, c));
    for ch in 0..c {
        let mut buf: Vec<Complex<f64>> = image
            .slice(s![.., .., ch])
            .iter()
            .map(|&v| Complex::new(v as f64, 0.0))
            .collect();
        fft2(&mut planner, &mut buf, h, w, false);
        for (z, &d) in buf.iter_mut().zip(&offsets) {
            let (magnitude, phase) = z.to_polar();
            *z = Complex::from_polar(magnitude, phase + d);
        }
        fft2(&mut planner, &mut buf, h, w, true);
        for (i, z) in buf.iter().enumerate() {
            out[[i / w, i % w, ch]] = (z.re / scale) as f32;
        }
    }
    clip(out)
}

/// Shift every pixel by `delta` in unit range.
pub fn adjust_brightness(image: &ArrayView3<f32>, delta: f64) -> Array3<f32> {
    let shift = delta as f32 * PIXEL_MAX;
    clip(image.mapv(|x| x + shift))
}

/// Counter-clockwise rotation by the nearest multiple of 90°. Quarter turns
/// of non-square images are rejected since they change the image shape.
pub fn rotate(image: &ArrayView3<f32>, degrees: f64) -> Result<Array3<f32>> {
    let (h, w, c) = image.dim();
    let quarter_turns = ((degrees / 90.0).round() as i64).rem_euclid(4);
    if quarter_turns % 2 == 1 && h != w {
        return Err(Error::shape("quarter-turn rotation", "square image", (h, w)));
    }
    let out = match quarter_turns {
        0 => image.to_owned(),
        1 => Array3::from_shape_fn((w, h, c), |(i, j, ch)| image[[j, w - 1 - i, ch]]),
        2 => Array3::from_shape_fn((h, w, c), |(i, j, ch)| image[[h - 1 - i, w - 1 - j, ch]]),
        _ => Array3::from_shape_fn((w, h, c), |(i, j, ch)| image[[h - 1 - j, i, ch]]),
    };
    Ok(clip(out))
}

/// Luminance inversion `255 − x`, applied when `level >= 0.5`.
pub fn invert(image: &ArrayView3<f32>, level: f64) -> Array3<f32> {
    if level >= 0.5 {
        clip(image.mapv(|x| PIXEL_MAX - x))
    } else {
        clip(image.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use rand::SeedableRng;

    fn ramp(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 1), |(i, j, _)| ((i * w + j) * 7 % 256) as f32)
    }

    #[test]
    fn test_uniform_zero_width_is_identity() {
        let img = ramp(8, 8);
        let out = uniform_noise(&img.view(), 0.0, &mut StdRng::seed_from_u64(1));
        assert_eq!(out, img);
    }

    #[test]
    fn test_uniform_is_seeded() {
        let img = ramp(8, 8);
        let a = uniform_noise(&img.view(), 0.3, &mut StdRng::seed_from_u64(9));
        let b = uniform_noise(&img.view(), 0.3, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
        assert_ne!(a, img);
        assert!(a.iter().all(|&v| (0.0..=255.0).contains(&v)));
    }

    #[test]
    fn test_salt_and_pepper_full_proportion() {
        let img = Array3::from_elem((6, 6, 3), 128.0f32);
        let out = salt_and_pepper(&img.view(), 1.0, &mut StdRng::seed_from_u64(3));
        assert!(out.iter().all(|&v| v == 0.0 || v == 255.0));
        for y in 0..6usize {
            for x in 0..6usize {
                let px = out.slice(s![y, x, ..]);
                assert!(px.iter().all(|&v| v == px[0]));
            }
        }
    }

    #[test]
    fn test_blur_preserves_constant_image() {
        let img = Array3::from_elem((9, 7, 1), 100.0f32);
        let out = low_pass(&img.view(), 3.0).unwrap();
        for &v in out.iter() {
            assert_abs_diff_eq!(v, 100.0, epsilon = 1e-3);
        }
        let hp = high_pass(&img.view(), 3.0).unwrap();
        for &v in hp.iter() {
            assert_abs_diff_eq!(v, 100.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(9, 4), 1);
    }

    #[test]
    fn test_phase_scramble_zero_width_round_trip() {
        let img = ramp(6, 10);
        let out = phase_scramble(&img.view(), 0.0, &mut StdRng::seed_from_u64(0));
        assert_eq!(out, img);
        let scrambled = phase_scramble(&img.view(), 180.0, &mut StdRng::seed_from_u64(0));
        assert_eq!(scrambled.dim(), img.dim());
        assert_ne!(scrambled, img);
    }

    #[test]
    fn test_fft_round_trip() {
        let mut planner = FftPlanner::<f64>::new();
        let original: Vec<Complex<f64>> = (0..12).map(|i| Complex::new(i as f64, 0.0)).collect();
        let mut buf = original.clone();
        fft2(&mut planner, &mut buf, 3, 4, false);
        fft2(&mut planner, &mut buf, 3, 4, true);
        for (a, b) in buf.iter().zip(&original) {
            assert_abs_diff_eq!(a.re / 12.0, b.re, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_contrast_and_brightness() {
        let img = ramp(4, 4);
        let grey = adjust_contrast(&img.view(), 0.0);
        assert!(grey.iter().all(|&v| (v - 127.5).abs() < 1e-3));
        let dark = adjust_brightness(&img.view(), -1.0);
        assert!(dark.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_rotation() {
        let img = ramp(3, 3);
        let quarter = rotate(&img.view(), 90.0).unwrap();
        // Top-left after a counter-clockwise turn is the old top-right.
        assert_eq!(quarter[[0, 0, 0]], img[[0, 2, 0]]);
        let full = rotate(&rotate(&quarter.view(), 180.0).unwrap().view(), 90.0).unwrap();
        assert_eq!(full, img);
        assert!(rotate(&ramp(3, 4).view(), 270.0).is_err());
        assert!(rotate(&ramp(3, 4).view(), 180.0).is_ok());
    }

    #[test]
    fn test_invert_threshold() {
        let img = ramp(2, 2);
        assert_eq!(invert(&img.view(), 0.0), img);
        assert_eq!(invert(&img.view(), 1.0)[[0, 0, 0]], 255.0);
    }
}
