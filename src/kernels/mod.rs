//! Single-channel kernel synthesis.
//!
//! Pure functions producing 2-D masks:
//! - **Gabor**: oriented band-pass receptive fields (simple cells)
//! - **Gaussian**: isotropic low-pass blur
//! - **DoG**: centre-surround on/off pairs (retinal ganglion cells)
//!
//! plus the closed-form conversions between Gabor wavelength, scale and
//! octave bandwidth.

pub mod bandwidth;
pub mod gabor;
pub mod gaussian;

pub use bandwidth::{bandwidth_from, scale_from, wavelength_from};
pub use gabor::gabor_kernel;
pub use gaussian::{difference_of_gaussians, gaussian_1d, gaussian_2d};

use serde::{Deserialize, Serialize};

/// Spatial extent of a kernel as `(rows, cols)`.
///
/// Serialises as a `[rows, cols]` pair; a bare integer is accepted on input
/// and read as a square size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "KernelSizeRepr", into = "[usize; 2]")]
pub struct KernelSize {
    pub rows: usize,
    pub cols: usize,
}

impl KernelSize {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn square(n: usize) -> Self {
        Self { rows: n, cols: n }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Centre coordinate of the grid, `((rows-1)/2, (cols-1)/2)`.
    pub(crate) fn centre(&self) -> (f64, f64) {
        (
            (self.rows as f64 - 1.0) * 0.5,
            (self.cols as f64 - 1.0) * 0.5,
        )
    }
}

impl std::fmt::Display for KernelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KernelSizeRepr {
    Square(usize),
    Pair([usize; 2]),
}

impl From<KernelSizeRepr> for KernelSize {
    fn from(repr: KernelSizeRepr) -> Self {
        match repr {
            KernelSizeRepr::Square(n) => KernelSize::square(n),
            KernelSizeRepr::Pair([rows, cols]) => KernelSize::new(rows, cols),
        }
    }
}

impl From<KernelSize> for [usize; 2] {
    fn from(size: KernelSize) -> Self {
        [size.rows, size.cols]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_size_accepts_integer_and_pair() {
        let sq: KernelSize = serde_json::from_str("63").unwrap();
        assert_eq!(sq, KernelSize::square(63));
        let pair: KernelSize = serde_json::from_str("[15, 31]").unwrap();
        assert_eq!(pair, KernelSize::new(15, 31));
        assert_eq!(serde_json::to_string(&sq).unwrap(), "[63,63]");
    }

    #[test]
    fn test_centre() {
        assert_eq!(KernelSize::square(5).centre(), (2.0, 2.0));
        assert_eq!(KernelSize::new(4, 6).centre(), (1.5, 2.5));
    }
}
