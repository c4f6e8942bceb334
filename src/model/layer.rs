//! Layer descriptors: type-tagged configuration plus optional weights.

use ndarray::{Array1, Array2, Array4};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filters::{InitializerConfig, Precision};

/// Per-image activation shape (batch axis excluded).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorShape {
    /// `(height, width, channels)`
    Spatial(usize, usize, usize),
    Flat(usize),
}

impl TensorShape {
    pub fn channels(&self) -> usize {
        match *self {
            TensorShape::Spatial(_, _, c) => c,
            TensorShape::Flat(n) => n,
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            TensorShape::Spatial(h, w, c) => h * w * c,
            TensorShape::Flat(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn spatial(&self, what: &str) -> Result<(usize, usize, usize)> {
        match *self {
            TensorShape::Spatial(h, w, c) => Ok((h, w, c)),
            flat => Err(Error::shape(what, "spatial (h, w, c) input", flat)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    Same,
    Valid,
}

impl Padding {
    /// Output length and leading pad along one axis, Keras conventions.
    pub fn output_len(self, input: usize, kernel: usize, stride: usize) -> Result<(usize, usize)> {
        if stride == 0 || kernel == 0 {
            return Err(Error::Value("kernel and stride must be non-zero".into()));
        }
        match self {
            Padding::Same => {
                let out = input.div_ceil(stride);
                let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
                Ok((out, total / 2))
            }
            Padding::Valid => {
                if input < kernel {
                    return Err(Error::shape("valid window", format!(">= {kernel}"), input));
                }
                Ok(((input - kernel) / stride + 1, 0))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Softmax,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conv2dConfig {
    pub filters: usize,
    pub kernel_size: [usize; 2],
    pub strides: [usize; 2],
    pub padding: Padding,
    pub activation: Activation,
    pub use_bias: bool,
    pub trainable: bool,
}

impl Conv2dConfig {
    pub fn new(filters: usize, kernel: usize) -> Self {
        Self {
            filters,
            kernel_size: [kernel, kernel],
            strides: [1, 1],
            padding: Padding::Same,
            activation: Activation::Relu,
            use_bias: true,
            trainable: true,
        }
    }

    pub fn stride(mut self, s: usize) -> Self {
        self.strides = [s, s];
        self
    }

    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}

/// A non-trainable convolution whose kernels come from filter banks.
///
/// Each branch is convolved with `same` padding and unit stride; branch
/// outputs are concatenated on the channel axis in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedConvConfig {
    pub initializers: Vec<InitializerConfig>,
    pub precision: Precision,
    pub activation: Activation,
    pub use_bias: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_size: [usize; 2],
    pub strides: [usize; 2],
    pub padding: Padding,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub units: usize,
    pub activation: Activation,
    pub use_bias: bool,
}

/// ResNet bottleneck: 1x1 → 3x3 → 1x1 with an identity or projected
/// shortcut, summed and rectified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BottleneckConfig {
    pub filters: [usize; 3],
    pub stride: usize,
    pub project: bool,
    pub epsilon: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    Input { shape: [usize; 3] },
    Conv2d(Conv2dConfig),
    FixedConv(FixedConvConfig),
    MaxPool2d(PoolConfig),
    GlobalAvgPool2d,
    Flatten,
    Dense(DenseConfig),
    Dropout { rate: f32 },
    GaussianNoise { stddev: f32 },
    BatchNorm { epsilon: f32 },
    Activation(Activation),
    Bottleneck(BottleneckConfig),
}

impl LayerKind {
    /// Class tag used in saved architectures.
    pub fn tag(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "InputLayer",
            LayerKind::Conv2d(_) => "Conv2D",
            LayerKind::FixedConv(_) => "FixedConv2D",
            LayerKind::MaxPool2d(_) => "MaxPooling2D",
            LayerKind::GlobalAvgPool2d => "GlobalAveragePooling2D",
            LayerKind::Flatten => "Flatten",
            LayerKind::Dense(_) => "Dense",
            LayerKind::Dropout { .. } => "Dropout",
            LayerKind::GaussianNoise { .. } => "GaussianNoise",
            LayerKind::BatchNorm { .. } => "BatchNormalization",
            LayerKind::Activation(_) => "Activation",
            LayerKind::Bottleneck(_) => "Bottleneck",
        }
    }

    pub fn is_convolution(&self) -> bool {
        matches!(self, LayerKind::Conv2d(_) | LayerKind::FixedConv(_))
    }

    /// Whether the layer carries weights (learned or fixed).
    pub fn has_weights(&self) -> bool {
        matches!(
            self,
            LayerKind::Conv2d(_)
                | LayerKind::FixedConv(_)
                | LayerKind::Dense(_)
                | LayerKind::BatchNorm { .. }
                | LayerKind::Bottleneck(_)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvWeights {
    /// `(kh, kw, in, out)`
    pub kernel: Array4<f32>,
    pub bias: Option<Array1<f32>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormWeights {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub mean: Array1<f32>,
    pub variance: Array1<f32>,
}

impl BatchNormWeights {
    pub fn identity(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            mean: Array1::zeros(channels),
            variance: Array1::ones(channels),
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BottleneckWeights {
    pub conv1: ConvWeights,
    pub bn1: BatchNormWeights,
    pub conv2: ConvWeights,
    pub bn2: BatchNormWeights,
    pub conv3: ConvWeights,
    pub bn3: BatchNormWeights,
    pub shortcut: Option<(ConvWeights, BatchNormWeights)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerWeights {
    Conv(ConvWeights),
    /// One kernel per filter-bank branch, shared bias over the concatenation.
    FixedConv {
        branches: Vec<Array4<f32>>,
        bias: Option<Array1<f32>>,
    },
    Dense {
        /// `(in, out)`
        kernel: Array2<f32>,
        bias: Option<Array1<f32>>,
    },
    BatchNorm(BatchNormWeights),
    Bottleneck(Box<BottleneckWeights>),
}

impl LayerWeights {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LayerWeights::Conv(_) => "conv",
            LayerWeights::FixedConv { .. } => "fixed conv",
            LayerWeights::Dense { .. } => "dense",
            LayerWeights::BatchNorm(_) => "batch norm",
            LayerWeights::Bottleneck(_) => "bottleneck",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub weights: Option<LayerWeights>,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            weights: None,
        }
    }

    pub fn input(name: impl Into<String>, shape: [usize; 3]) -> Self {
        Self::new(name, LayerKind::Input { shape })
    }

    pub fn conv(name: impl Into<String>, config: Conv2dConfig) -> Self {
        Self::new(name, LayerKind::Conv2d(config))
    }

    pub fn dense(name: impl Into<String>, units: usize, activation: Activation) -> Self {
        Self::new(
            name,
            LayerKind::Dense(DenseConfig {
                units,
                activation,
                use_bias: true,
            }),
        )
    }

    pub fn max_pool(name: impl Into<String>, size: usize, stride: usize, padding: Padding) -> Self {
        Self::new(
            name,
            LayerKind::MaxPool2d(PoolConfig {
                pool_size: [size, size],
                strides: [stride, stride],
                padding,
            }),
        )
    }

    pub fn with_weights(mut self, weights: LayerWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }
}
