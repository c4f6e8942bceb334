//! Filter-bank initializers.
//!
//! A filter bank turns a parameter set into a fixed, non-trainable kernel
//! tensor of shape `(rows, cols, in_channels, kernel_count)`. Each family
//! (Gabor, DoG, low-pass) knows its own kernel count and canonical mask
//! order; the shared [`FilterBank::produce`] validates requested shapes,
//! tiles masks across input channels and casts to the requested precision.
//!
//! Banks describe themselves as [`FilterParams`], which the
//! [`registry::InitializerRegistry`] turns back into an identical bank.

pub mod combined;
pub mod dog;
pub mod gabor;
pub mod low_pass;
pub mod registry;

pub use combined::CombinedBank;
pub use dog::{DogBank, DogParams};
pub use gabor::{GaborBank, GaborParams};
pub use low_pass::{LowPassBank, LowPassParams};
pub use registry::{InitializerConfig, InitializerRegistry};

use std::fmt;
use std::str::FromStr;

use half::f16;
use ndarray::{s, Array2, Array4};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kernels::KernelSize;

// ──────────────────────────────────────────────────────────────
// Precision and tensors
// ──────────────────────────────────────────────────────────────

/// Element precision of a produced kernel tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "float16")]
    F16,
    #[default]
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl Precision {
    pub fn bits(self) -> u32 {
        match self {
            Precision::F16 => 16,
            Precision::F32 => 32,
            Precision::F64 => 64,
        }
    }
}

impl TryFrom<u32> for Precision {
    type Error = Error;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            16 => Ok(Precision::F16),
            32 => Ok(Precision::F32),
            64 => Ok(Precision::F64),
            other => Err(Error::Value(format!(
                "unsupported precision: {other} bits (expected 16, 32 or 64)"
            ))),
        }
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "16" | "f16" | "float16" | "half" => Ok(Precision::F16),
            "32" | "f32" | "float32" | "single" => Ok(Precision::F32),
            "64" | "f64" | "float64" | "double" => Ok(Precision::F64),
            other => Err(Error::Value(format!("unsupported precision: {other:?}"))),
        }
    }
}

/// An immutable kernel tensor `(rows, cols, in_channels, out_channels)`.
#[derive(Clone, Debug, PartialEq)]
pub enum KernelTensor {
    F16(Array4<f16>),
    F32(Array4<f32>),
    F64(Array4<f64>),
}

impl KernelTensor {
    fn from_f64(data: Array4<f64>, precision: Precision) -> Self {
        match precision {
            Precision::F16 => KernelTensor::F16(data.mapv(f16::from_f64)),
            Precision::F32 => KernelTensor::F32(data.mapv(|v| v as f32)),
            Precision::F64 => KernelTensor::F64(data),
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            KernelTensor::F16(_) => Precision::F16,
            KernelTensor::F32(_) => Precision::F32,
            KernelTensor::F64(_) => Precision::F64,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        let dim = match self {
            KernelTensor::F16(a) => a.dim(),
            KernelTensor::F32(a) => a.dim(),
            KernelTensor::F64(a) => a.dim(),
        };
        [dim.0, dim.1, dim.2, dim.3]
    }

    /// Compute-precision copy used by the convolution executor.
    pub fn to_f32(&self) -> Array4<f32> {
        match self {
            KernelTensor::F16(a) => a.mapv(f32::from),
            KernelTensor::F32(a) => a.clone(),
            KernelTensor::F64(a) => a.mapv(|v| v as f32),
        }
    }
}

// ──────────────────────────────────────────────────────────────
// Families and parameters
// ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterFamily {
    Gabor,
    Dog,
    LowPass,
}

impl FilterFamily {
    /// Canonical tag used in configs, layer names and model names.
    pub fn tag(self) -> &'static str {
        match self {
            FilterFamily::Gabor => "Gabor",
            FilterFamily::Dog => "DoG",
            FilterFamily::LowPass => "Low-pass",
        }
    }
}

impl fmt::Display for FilterFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for FilterFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "gabor" => Ok(FilterFamily::Gabor),
            "dog" => Ok(FilterFamily::Dog),
            "low-pass" | "lowpass" => Ok(FilterFamily::LowPass),
            _ => Err(Error::Config(format!("unknown filter family: {s:?}"))),
        }
    }
}

/// Parameters of one filter family, tagged by family name when serialised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FilterParams {
    Gabor(GaborParams),
    #[serde(rename = "DoG")]
    Dog(DogParams),
    #[serde(rename = "Low-pass")]
    LowPass(LowPassParams),
}

impl FilterParams {
    pub fn family(&self) -> FilterFamily {
        match self {
            FilterParams::Gabor(_) => FilterFamily::Gabor,
            FilterParams::Dog(_) => FilterFamily::Dog,
            FilterParams::LowPass(_) => FilterFamily::LowPass,
        }
    }

    pub fn kernel_size(&self) -> KernelSize {
        match self {
            FilterParams::Gabor(p) => p.ksize,
            FilterParams::Dog(p) => p.ksize,
            FilterParams::LowPass(p) => p.ksize,
        }
    }

    /// Validate and build the bank these parameters describe.
    pub fn build(&self) -> Result<Box<dyn FilterBank>> {
        Ok(match self {
            FilterParams::Gabor(p) => Box::new(GaborBank::new(p.clone())?),
            FilterParams::Dog(p) => Box::new(DogBank::new(p.clone())?),
            FilterParams::LowPass(p) => Box::new(LowPassBank::new(p.clone())?),
        })
    }
}

/// An ordered list of filter families forming one substituted layer.
///
/// A single entry is a plain filter layer; several entries run as parallel
/// branches concatenated on the channel axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSpec {
    pub branches: Vec<FilterParams>,
}

impl FilterSpec {
    pub fn single(params: FilterParams) -> Self {
        Self { branches: vec![params] }
    }

    pub fn is_combined(&self) -> bool {
        self.branches.len() > 1
    }

    /// `Gabor`, `DoG`, `Low-pass`, or branch tags joined with `+`.
    pub fn tag(&self) -> String {
        self.branches
            .iter()
            .map(|p| p.family().tag())
            .collect::<Vec<_>>()
            .join("+")
    }
}

// ──────────────────────────────────────────────────────────────
// Shared capability
// ──────────────────────────────────────────────────────────────

/// A parametrised family of fixed convolution kernels.
pub trait FilterBank: fmt::Debug + Send + Sync {
    fn family(&self) -> FilterFamily;

    fn kernel_size(&self) -> KernelSize;

    /// Number of output channels the bank produces.
    fn kernel_count(&self) -> usize;

    /// Single-channel masks in canonical order, `kernel_count()` of them.
    fn masks(&self) -> Result<Vec<Array2<f64>>>;

    /// Parameters sufficient to rebuild an identical bank.
    fn describe(&self) -> FilterParams;

    /// Produce the kernel tensor.
    ///
    /// Without a requested shape the tensor is `(rows, cols, 1, count)`.
    /// A requested shape must match the kernel size and kernel count; the
    /// masks are then tiled across its input-channel dimension.
    fn produce(&self, requested: Option<[usize; 4]>, precision: Precision) -> Result<KernelTensor> {
        let ksize = self.kernel_size();
        let count = self.kernel_count();
        let in_channels = match requested {
            None => 1,
            Some(shape) => {
                let expected = [ksize.rows, ksize.cols, shape[2], count];
                if shape != expected {
                    return Err(Error::shape(
                        format!("{} kernel tensor", self.family()),
                        expected,
                        shape,
                    ));
                }
                shape[2]
            }
        };
        if in_channels == 0 {
            return Err(Error::Value("kernel tensor needs at least one input channel".into()));
        }

        let masks = self.masks()?;
        if masks.len() != count {
            return Err(Error::shape(format!("{} mask count", self.family()), count, masks.len()));
        }

        let mut data = Array4::<f64>::zeros((ksize.rows, ksize.cols, in_channels, count));
        for (k, mask) in masks.iter().enumerate() {
            for c in 0..in_channels {
                data.slice_mut(s![.., .., c, k]).assign(mask);
            }
        }
        tracing::debug!(
            family = %self.family(),
            ksize = %ksize,
            in_channels,
            kernels = count,
            bits = precision.bits(),
            "produced kernel tensor"
        );
        Ok(KernelTensor::from_f64(data, precision))
    }
}

pub(crate) fn require_non_empty(family: FilterFamily, name: &str, values: &[f64]) -> Result<()> {
    if values.is_empty() {
        return Err(Error::Value(format!("{family} parameter list `{name}` is empty")));
    }
    Ok(())
}

pub(crate) fn require_all_positive(family: FilterFamily, name: &str, values: &[f64]) -> Result<()> {
    require_non_empty(family, name, values)?;
    if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
        return Err(Error::Domain(format!("{family} `{name}` must be positive, got {bad}")));
    }
    Ok(())
}

pub(crate) fn require_kernel_size(family: FilterFamily, ksize: KernelSize) -> Result<()> {
    if ksize.is_empty() {
        return Err(Error::Value(format!("{family} kernel size must be non-zero, got {ksize}")));
    }
    Ok(())
}
