//! # bionet
//!
//! Fixed, biologically inspired filter banks for convolutional networks,
//! and the robustness evaluation that goes with them.
//!
//! ## Components
//!
//! 1. **Kernels**: Gabor, Gaussian and Difference-of-Gaussians masks
//! 2. **Filter banks**: shape-checked kernel tensors at a chosen precision
//! 3. **Model surgery**: splice a bank into a base CNN in place of its first
//!    convolution, or in front of it
//! 4. **Perturbations**: ten image distortions at eleven severity levels
//! 5. **Evaluation**: ordered batch prefetching, framework metrics,
//!    accuracy reconciliation, result records and AUC summaries
//!
//! ## Bases
//!
//! ALL-CNN, VGG-16, VGG-19 and ResNet-50, built as explicit layer graphs
//! with an NHWC forward pass on the CPU.

pub mod config;
pub mod error;
pub mod eval;
pub mod filters;
pub mod kernels;
pub mod model;
pub mod perturb;

pub use error::{Error, Result};

/// Run-wide constants.
pub mod defaults {
    /// Severity levels per perturbation.
    pub const N_LEVELS: usize = 11;

    /// ITU-R 601-2 luma weights for R, G and B.
    pub const LUMINANCE_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

    /// Training data set.
    pub const DATA_SET: &str = "CIFAR10";

    /// Class names of the default data set, in label order.
    pub const CIFAR10_CLASSES: [&str; 10] = [
        "airplane",
        "automobile",
        "bird",
        "cat",
        "deer",
        "dog",
        "frog",
        "horse",
        "ship",
        "truck",
    ];

    /// Training epochs per run.
    pub const EPOCHS: usize = 20;

    /// Optimiser step size.
    pub const LEARNING_RATE: f64 = 1e-4;

    /// Learning-rate decay per update.
    pub const DECAY: f64 = 1e-6;

    /// Images per training and evaluation batch.
    pub const BATCH: usize = 64;

    /// Seed for weight initialisation and perturbation noise.
    pub const SEED: u64 = 420420420;

    /// `[height, width, channels]` seen by the network.
    pub const IMAGE_SHAPE: [usize; 3] = [224, 224, 1];

    /// Contrast applied before additive noise (1 leaves images untouched).
    pub const CONTRAST_LEVEL: f64 = 1.0;

    /// Prefetch worker threads.
    pub const WORKERS: usize = 4;

    /// Prefetch queue depth in batches.
    pub const MAX_QUEUE_SIZE: usize = 10;

    /// Images of each class in a generalisation set.
    pub const IMAGES_PER_CLASS: usize = 10;

    /// Generalisation image sets, each evaluated plain and inverted.
    pub const GENERALISATION_SETS: [&str; 3] = ["line_drawings", "silhouettes", "contours"];
}
