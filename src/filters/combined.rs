//! Multi-family banks applied as parallel branches.
//!
//! Branches may use different kernel sizes, so a combined bank never
//! produces a single tensor. It yields one tensor per branch and the
//! consuming layer concatenates branch outputs along the channel axis in
//! branch order.

use super::{FilterBank, FilterSpec, KernelTensor, Precision};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct CombinedBank {
    branches: Vec<Box<dyn FilterBank>>,
}

impl CombinedBank {
    pub fn new(branches: Vec<Box<dyn FilterBank>>) -> Result<Self> {
        if branches.is_empty() {
            return Err(Error::Value("a filter layer needs at least one bank".into()));
        }
        Ok(Self { branches })
    }

    pub fn from_spec(spec: &FilterSpec) -> Result<Self> {
        let branches = spec
            .branches
            .iter()
            .map(|p| p.build())
            .collect::<Result<Vec<_>>>()?;
        Self::new(branches)
    }

    pub fn branches(&self) -> &[Box<dyn FilterBank>] {
        &self.branches
    }

    /// Total output channels across branches.
    pub fn kernel_count(&self) -> usize {
        self.branches.iter().map(|b| b.kernel_count()).sum()
    }

    /// One tensor per branch, each tiled across `in_channels`.
    pub fn produce_branches(&self, in_channels: usize, precision: Precision) -> Result<Vec<KernelTensor>> {
        self.branches
            .iter()
            .map(|b| {
                let k = b.kernel_size();
                b.produce(Some([k.rows, k.cols, in_channels, b.kernel_count()]), precision)
            })
            .collect()
    }

    pub fn describe(&self) -> FilterSpec {
        FilterSpec {
            branches: self.branches.iter().map(|b| b.describe()).collect(),
        }
    }
}
