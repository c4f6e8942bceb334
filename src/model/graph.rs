//! Immutable layer graphs and the builder that wires them.
//!
//! A graph is a single chain: input at index 0, output at the last index.
//! Building a graph runs shape inference over every layer and checks stored
//! weights against the inferred input shape, so any graph that exists is
//! internally consistent.

use ndarray::{Array1, Array2, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};

use super::layer::*;
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ModelGraph {
    name: String,
    layers: Vec<Layer>,
    /// Output shape of each layer.
    shapes: Vec<TensorShape>,
}

impl ModelGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn shapes(&self) -> &[TensorShape] {
        &self.shapes
    }

    pub fn input_shape(&self) -> TensorShape {
        self.shapes[0]
    }

    pub fn output_shape(&self) -> TensorShape {
        self.shapes[self.shapes.len() - 1]
    }

    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    pub fn into_layers(self) -> (String, Vec<Layer>) {
        (self.name, self.layers)
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether every weighted layer has its weights.
    pub fn is_initialised(&self) -> bool {
        self.layers
            .iter()
            .all(|l| !l.kind.has_weights() || l.weights.is_some())
    }

    /// Fill missing learned weights: Glorot-uniform kernels, zero biases,
    /// identity batch normalisation. Existing weights are left untouched.
    pub fn with_initialised_weights(mut self, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 1..self.layers.len() {
            if self.layers[i].weights.is_some() || !self.layers[i].kind.has_weights() {
                continue;
            }
            let input = self.shapes[i - 1];
            let weights = initial_weights(&self.layers[i], input, &mut rng)?;
            tracing::debug!(layer = %self.layers[i].name, "initialised {} weights", weights.kind_name());
            self.layers[i].weights = Some(weights);
        }
        Ok(self)
    }

    /// One line per layer: index, name, tag, output shape.
    pub fn summary(&self) -> String {
        let mut out = format!("Model: {}\n", self.name);
        for (i, (layer, shape)) in self.layers.iter().zip(&self.shapes).enumerate() {
            out.push_str(&format!("{i:>3}  {:<28} {:<24} {:?}\n", layer.name, layer.tag(), shape));
        }
        out
    }
}

/// Wires layers into a [`ModelGraph`], inferring shapes as it goes.
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    layers: Vec<Layer>,
    shapes: Vec<TensorShape>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>, input: Layer) -> Result<Self> {
        let shape = match &input.kind {
            LayerKind::Input { shape } => TensorShape::Spatial(shape[0], shape[1], shape[2]),
            other => {
                return Err(Error::Value(format!(
                    "graph must start with an input layer, got {}",
                    other.tag()
                )))
            }
        };
        if shape.is_empty() {
            return Err(Error::Value(format!("input shape must be non-empty, got {shape:?}")));
        }
        Ok(Self {
            name: name.into(),
            layers: vec![input],
            shapes: vec![shape],
        })
    }

    /// Rebuild from an ordered layer list (input first).
    pub fn from_layers(name: impl Into<String>, layers: Vec<Layer>) -> Result<ModelGraph> {
        let mut iter = layers.into_iter();
        let input = iter
            .next()
            .ok_or_else(|| Error::Value("cannot build a graph with no layers".into()))?;
        let mut builder = Self::new(name, input)?;
        for layer in iter {
            builder.push(layer)?;
        }
        Ok(builder.finish())
    }

    pub fn current_shape(&self) -> TensorShape {
        self.shapes[self.shapes.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn push(&mut self, layer: Layer) -> Result<&mut Self> {
        let shape = infer_shape(&layer, self.current_shape())?;
        self.layers.push(layer);
        self.shapes.push(shape);
        Ok(self)
    }

    /// Chaining form of [`push`](Self::push).
    pub fn add(mut self, layer: Layer) -> Result<Self> {
        self.push(layer)?;
        Ok(self)
    }

    pub fn finish(self) -> ModelGraph {
        ModelGraph {
            name: self.name,
            layers: self.layers,
            shapes: self.shapes,
        }
    }
}

fn conv_output(
    what: &str,
    (h, w): (usize, usize),
    kernel: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
) -> Result<(usize, usize)> {
    let (oh, _) = padding
        .output_len(h, kernel[0], strides[0])
        .map_err(|e| relabel(e, what))?;
    let (ow, _) = padding
        .output_len(w, kernel[1], strides[1])
        .map_err(|e| relabel(e, what))?;
    Ok((oh, ow))
}

fn relabel(err: Error, what: &str) -> Error {
    match err {
        Error::ShapeMismatch { expected, actual, .. } => Error::ShapeMismatch {
            what: what.to_string(),
            expected,
            actual,
        },
        other => other,
    }
}

fn check_conv_weights(name: &str, w: &ConvWeights, expected: [usize; 4], use_bias: bool) -> Result<()> {
    let d = w.kernel.dim();
    let actual = [d.0, d.1, d.2, d.3];
    if actual != expected {
        return Err(Error::shape(format!("{name} kernel"), expected, actual));
    }
    match (&w.bias, use_bias) {
        (Some(b), true) if b.len() == expected[3] => Ok(()),
        (None, false) => Ok(()),
        (bias, _) => Err(Error::shape(
            format!("{name} bias"),
            if use_bias { Some(expected[3]) } else { None },
            bias.as_ref().map(|b| b.len()),
        )),
    }
}

fn check_batch_norm(name: &str, w: &BatchNormWeights, channels: usize) -> Result<()> {
    let lens = [w.gamma.len(), w.beta.len(), w.mean.len(), w.variance.len()];
    if lens.iter().any(|&n| n != channels) {
        return Err(Error::shape(format!("{name} batch-norm parameters"), [channels; 4], lens));
    }
    Ok(())
}

fn weights_mismatch(layer: &Layer) -> Error {
    Error::Value(format!(
        "layer {} ({}) carries {} weights",
        layer.name,
        layer.tag(),
        layer.weights.as_ref().map_or("no", |w| w.kind_name())
    ))
}

/// Output shape of `layer` given its input, validating stored weights.
pub(crate) fn infer_shape(layer: &Layer, input: TensorShape) -> Result<TensorShape> {
    let name = layer.name.as_str();
    match &layer.kind {
        LayerKind::Input { .. } => Err(Error::Value(format!(
            "input layer {name} may only appear at index 0"
        ))),
        LayerKind::Conv2d(cfg) => {
            let (h, w, c) = input.spatial(name)?;
            let (oh, ow) = conv_output(name, (h, w), cfg.kernel_size, cfg.strides, cfg.padding)?;
            match &layer.weights {
                None => {}
                Some(LayerWeights::Conv(cw)) => check_conv_weights(
                    name,
                    cw,
                    [cfg.kernel_size[0], cfg.kernel_size[1], c, cfg.filters],
                    cfg.use_bias,
                )?,
                Some(_) => return Err(weights_mismatch(layer)),
            }
            Ok(TensorShape::Spatial(oh, ow, cfg.filters))
        }
        LayerKind::FixedConv(cfg) => {
            let (h, w, c) = input.spatial(name)?;
            let Some(LayerWeights::FixedConv { branches, bias }) = &layer.weights else {
                return Err(weights_mismatch(layer));
            };
            if branches.len() != cfg.initializers.len() {
                return Err(Error::shape(
                    format!("{name} branches"),
                    cfg.initializers.len(),
                    branches.len(),
                ));
            }
            let mut out_channels = 0;
            for k in branches {
                let d = k.dim();
                if d.2 != c {
                    return Err(Error::shape(format!("{name} input channels"), c, d.2));
                }
                out_channels += d.3;
            }
            if let Some(b) = bias {
                if b.len() != out_channels {
                    return Err(Error::shape(format!("{name} bias"), out_channels, b.len()));
                }
            }
            Ok(TensorShape::Spatial(h, w, out_channels))
        }
        LayerKind::MaxPool2d(cfg) => {
            let (h, w, c) = input.spatial(name)?;
            let (oh, ow) = conv_output(name, (h, w), cfg.pool_size, cfg.strides, cfg.padding)?;
            Ok(TensorShape::Spatial(oh, ow, c))
        }
        LayerKind::GlobalAvgPool2d => {
            let (_, _, c) = input.spatial(name)?;
            Ok(TensorShape::Flat(c))
        }
        LayerKind::Flatten => Ok(TensorShape::Flat(input.len())),
        LayerKind::Dense(cfg) => {
            let n_in = match input {
                TensorShape::Flat(n) => n,
                spatial => return Err(Error::shape(name, "flat input", spatial)),
            };
            match &layer.weights {
                None => {}
                Some(LayerWeights::Dense { kernel, bias }) => {
                    if kernel.dim() != (n_in, cfg.units) {
                        return Err(Error::shape(format!("{name} kernel"), (n_in, cfg.units), kernel.dim()));
                    }
                    let bias_len = bias.as_ref().map(|b| b.len());
                    let expected = cfg.use_bias.then_some(cfg.units);
                    if bias_len != expected {
                        return Err(Error::shape(format!("{name} bias"), expected, bias_len));
                    }
                }
                Some(_) => return Err(weights_mismatch(layer)),
            }
            Ok(TensorShape::Flat(cfg.units))
        }
        LayerKind::Dropout { rate } => {
            if !(0.0..1.0).contains(rate) {
                return Err(Error::Value(format!("{name}: dropout rate must be in [0, 1), got {rate}")));
            }
            Ok(input)
        }
        LayerKind::GaussianNoise { stddev } => {
            if !(*stddev >= 0.0) {
                return Err(Error::Value(format!("{name}: noise stddev must be non-negative")));
            }
            Ok(input)
        }
        LayerKind::Activation(_) => Ok(input),
        LayerKind::BatchNorm { .. } => {
            match &layer.weights {
                None => {}
                Some(LayerWeights::BatchNorm(bn)) => check_batch_norm(name, bn, input.channels())?,
                Some(_) => return Err(weights_mismatch(layer)),
            }
            Ok(input)
        }
        LayerKind::Bottleneck(cfg) => {
            let (h, w, c) = input.spatial(name)?;
            if !cfg.project && (cfg.stride != 1 || c != cfg.filters[2]) {
                return Err(Error::shape(
                    format!("{name} identity shortcut"),
                    (1, cfg.filters[2]),
                    (cfg.stride, c),
                ));
            }
            let (oh, ow) = conv_output(name, (h, w), [1, 1], [cfg.stride; 2], Padding::Valid)?;
            let [f1, f2, f3] = cfg.filters;
            match &layer.weights {
                None => {}
                Some(LayerWeights::Bottleneck(bw)) => {
                    check_conv_weights(name, &bw.conv1, [1, 1, c, f1], true)?;
                    check_batch_norm(name, &bw.bn1, f1)?;
                    check_conv_weights(name, &bw.conv2, [3, 3, f1, f2], true)?;
                    check_batch_norm(name, &bw.bn2, f2)?;
                    check_conv_weights(name, &bw.conv3, [1, 1, f2, f3], true)?;
                    check_batch_norm(name, &bw.bn3, f3)?;
                    match (&bw.shortcut, cfg.project) {
                        (Some((sc, sbn)), true) => {
                            check_conv_weights(name, sc, [1, 1, c, f3], true)?;
                            check_batch_norm(name, sbn, f3)?;
                        }
                        (None, false) => {}
                        _ => return Err(Error::shape(format!("{name} shortcut"), cfg.project, !cfg.project)),
                    }
                }
                Some(_) => return Err(weights_mismatch(layer)),
            }
            Ok(TensorShape::Spatial(oh, ow, f3))
        }
    }
}

// ──────────────────────────────────────────────────────────────
// Initialisation
// ──────────────────────────────────────────────────────────────

fn glorot_conv(kernel: [usize; 4], use_bias: bool, rng: &mut StdRng) -> ConvWeights {
    let receptive = kernel[0] * kernel[1];
    let fan_in = receptive * kernel[2];
    let fan_out = receptive * kernel[3];
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit);
    let k = Array4::from_shape_fn((kernel[0], kernel[1], kernel[2], kernel[3]), |_| dist.sample(rng));
    ConvWeights {
        kernel: k,
        bias: use_bias.then(|| Array1::zeros(kernel[3])),
    }
}

fn initial_weights(layer: &Layer, input: TensorShape, rng: &mut StdRng) -> Result<LayerWeights> {
    Ok(match &layer.kind {
        LayerKind::Conv2d(cfg) => {
            let (_, _, c) = input.spatial(&layer.name)?;
            let shape = [cfg.kernel_size[0], cfg.kernel_size[1], c, cfg.filters];
            LayerWeights::Conv(glorot_conv(shape, cfg.use_bias, rng))
        }
        LayerKind::Dense(cfg) => {
            let n_in = input.len();
            let limit = (6.0 / (n_in + cfg.units) as f32).sqrt();
            let dist = Uniform::new_inclusive(-limit, limit);
            LayerWeights::Dense {
                kernel: Array2::from_shape_fn((n_in, cfg.units), |_| dist.sample(rng)),
                bias: cfg.use_bias.then(|| Array1::zeros(cfg.units)),
            }
        }
        LayerKind::BatchNorm { .. } => LayerWeights::BatchNorm(BatchNormWeights::identity(input.channels())),
        LayerKind::Bottleneck(cfg) => {
            let (_, _, c) = input.spatial(&layer.name)?;
            let [f1, f2, f3] = cfg.filters;
            LayerWeights::Bottleneck(Box::new(BottleneckWeights {
                conv1: glorot_conv([1, 1, c, f1], true, rng),
                bn1: BatchNormWeights::identity(f1),
                conv2: glorot_conv([3, 3, f1, f2], true, rng),
                bn2: BatchNormWeights::identity(f2),
                conv3: glorot_conv([1, 1, f2, f3], true, rng),
                bn3: BatchNormWeights::identity(f3),
                shortcut: cfg
                    .project
                    .then(|| (glorot_conv([1, 1, c, f3], true, rng), BatchNormWeights::identity(f3))),
            }))
        }
        LayerKind::FixedConv(_) => {
            return Err(Error::Value(format!(
                "fixed convolution {} must be built from its filter banks",
                layer.name
            )))
        }
        _ => return Err(weights_mismatch(layer)),
    })
}
