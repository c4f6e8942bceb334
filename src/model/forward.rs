//! CPU forward pass over NHWC `f32` batches.
//!
//! Inference mode makes `GaussianNoise` and `Dropout` identities; training
//! mode activates both from a seeded generator. Convolution and pooling are
//! data-parallel over the batch axis.

use ndarray::parallel::prelude::*;
use ndarray::{concatenate, s, Array, Array1, Array2, Array4, ArrayView4, Axis, Dimension};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::graph::ModelGraph;
use super::layer::*;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Infer,
    Train,
}

enum Activations {
    Spatial(Array4<f32>),
    Flat(Array2<f32>),
}

impl ModelGraph {
    /// Class probabilities for a batch, inference mode.
    pub fn predict(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        self.forward(images, Mode::Infer, 0)
    }

    pub fn forward(&self, images: &Array4<f32>, mode: Mode, seed: u64) -> Result<Array2<f32>> {
        let (_, h, w, c) = images.dim();
        if TensorShape::Spatial(h, w, c) != self.input_shape() {
            return Err(Error::shape(
                format!("{} input batch", self.name()),
                self.input_shape(),
                TensorShape::Spatial(h, w, c),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Activations::Spatial(images.to_owned());
        for layer in &self.layers()[1..] {
            x = apply(layer, x, mode, &mut rng)?;
        }
        match x {
            Activations::Flat(out) => Ok(out),
            Activations::Spatial(out) => Err(Error::shape(
                format!("{} output", self.name()),
                "flat (batch, classes)",
                out.dim(),
            )),
        }
    }
}

fn missing_weights(layer: &Layer) -> Error {
    Error::Value(format!(
        "layer {} has no weights; initialise the graph before running it",
        layer.name
    ))
}

fn apply(layer: &Layer, x: Activations, mode: Mode, rng: &mut StdRng) -> Result<Activations> {
    use Activations::*;
    let name = layer.name.as_str();
    Ok(match (&layer.kind, x) {
        (LayerKind::Conv2d(cfg), Spatial(a)) => {
            let Some(LayerWeights::Conv(w)) = &layer.weights else {
                return Err(missing_weights(layer));
            };
            let mut y = conv2d(&a, &w.kernel, w.bias.as_ref(), cfg.strides, cfg.padding)?;
            activate(&mut y, cfg.activation);
            Spatial(y)
        }
        (LayerKind::FixedConv(cfg), Spatial(a)) => {
            let Some(LayerWeights::FixedConv { branches, bias }) = &layer.weights else {
                return Err(missing_weights(layer));
            };
            let outputs = branches
                .iter()
                .map(|k| conv2d(&a, k, None, [1, 1], Padding::Same))
                .collect::<Result<Vec<_>>>()?;
            let views: Vec<ArrayView4<f32>> = outputs.iter().map(|o| o.view()).collect();
            let mut y = concatenate(Axis(3), &views)
                .map_err(|e| Error::Value(format!("{name}: cannot concatenate branches: {e}")))?;
            if let Some(b) = bias {
                for mut lane in y.lanes_mut(Axis(3)) {
                    lane += b;
                }
            }
            activate(&mut y, cfg.activation);
            Spatial(y)
        }
        (LayerKind::MaxPool2d(cfg), Spatial(a)) => Spatial(max_pool(&a, cfg)?),
        (LayerKind::GlobalAvgPool2d, Spatial(a)) => {
            let (_, h, w, _) = a.dim();
            let summed = a.sum_axis(Axis(1)).sum_axis(Axis(1));
            Flat(summed / (h * w) as f32)
        }
        (LayerKind::Flatten, Spatial(a)) => {
            let (n, h, w, c) = a.dim();
            let flat = a
                .as_standard_layout()
                .into_owned()
                .into_shape((n, h * w * c))
                .map_err(|e| Error::Value(format!("{name}: {e}")))?;
            Flat(flat)
        }
        (LayerKind::Flatten, Flat(a)) => Flat(a),
        (LayerKind::Dense(cfg), Flat(a)) => {
            let Some(LayerWeights::Dense { kernel, bias }) = &layer.weights else {
                return Err(missing_weights(layer));
            };
            let mut y = a.dot(kernel);
            if let Some(b) = bias {
                y += b;
            }
            activate(&mut y, cfg.activation);
            Flat(y)
        }
        (LayerKind::Dropout { rate }, x) => match mode {
            Mode::Infer => x,
            Mode::Train => map_values(x, |a| dropout(a, *rate, rng)),
        },
        (LayerKind::GaussianNoise { stddev }, x) => match mode {
            Mode::Infer => x,
            Mode::Train => {
                let normal = Normal::new(0.0f32, *stddev)
                    .map_err(|e| Error::Value(format!("{name}: {e}")))?;
                map_values(x, |a| a.mapv_inplace_with(|v| v + normal.sample(rng)))
            }
        },
        (LayerKind::BatchNorm { epsilon }, x) => {
            let Some(LayerWeights::BatchNorm(bn)) = &layer.weights else {
                return Err(missing_weights(layer));
            };
            map_values(x, |a| batch_norm(a, bn, *epsilon))
        }
        (LayerKind::Activation(act), x) => map_values(x, |a| activate(a, *act)),
        (LayerKind::Bottleneck(cfg), Spatial(a)) => {
            let Some(LayerWeights::Bottleneck(w)) = &layer.weights else {
                return Err(missing_weights(layer));
            };
            Spatial(bottleneck(a, cfg, w)?)
        }
        (kind, Flat(a)) => {
            return Err(Error::shape(name, format!("spatial input for {}", kind.tag()), a.dim()))
        }
        (kind, Spatial(_)) => {
            return Err(Error::Value(format!("{name}: unsupported {} placement", kind.tag())))
        }
    })
}

/// Apply an in-place operation to whichever activation rank is present.
fn map_values(x: Activations, mut f: impl FnMut(&mut dyn ValuesMut)) -> Activations {
    match x {
        Activations::Spatial(mut a) => {
            f(&mut a);
            Activations::Spatial(a)
        }
        Activations::Flat(mut a) => {
            f(&mut a);
            Activations::Flat(a)
        }
    }
}

/// Element-wise and last-axis operations shared by rank-2 and rank-4 arrays.
trait ValuesMut {
    fn mapv_inplace(&mut self, f: &mut dyn FnMut(f32) -> f32);
    fn for_each_lane(&mut self, f: &mut dyn FnMut(ndarray::ArrayViewMut1<f32>));
}

impl<D: Dimension> ValuesMut for Array<f32, D> {
    fn mapv_inplace(&mut self, f: &mut dyn FnMut(f32) -> f32) {
        ndarray::ArrayBase::mapv_inplace(self, f)
    }

    fn for_each_lane(&mut self, f: &mut dyn FnMut(ndarray::ArrayViewMut1<f32>)) {
        let last = Axis(self.ndim() - 1);
        for lane in self.lanes_mut(last) {
            f(lane);
        }
    }
}

impl dyn ValuesMut + '_ {
    fn mapv_inplace_with(&mut self, mut f: impl FnMut(f32) -> f32) {
        self.mapv_inplace(&mut f)
    }
}

fn activate(a: &mut dyn ValuesMut, act: Activation) {
    match act {
        Activation::Linear => {}
        Activation::Relu => a.mapv_inplace_with(|v| v.max(0.0)),
        Activation::Softmax => a.for_each_lane(&mut |mut lane| {
            let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            lane.mapv_inplace(|v| (v - max).exp());
            let total = lane.sum();
            lane /= total;
        }),
    }
}

fn dropout(a: &mut dyn ValuesMut, rate: f32, rng: &mut StdRng) {
    if rate <= 0.0 {
        return;
    }
    let keep = 1.0 - rate;
    a.mapv_inplace_with(|v| if rng.gen::<f32>() < keep { v / keep } else { 0.0 });
}

fn batch_norm(a: &mut dyn ValuesMut, w: &BatchNormWeights, epsilon: f32) {
    let scale: Array1<f32> = &w.gamma / &w.variance.mapv(|v| (v + epsilon).sqrt());
    let shift: Array1<f32> = &w.beta - &(&w.mean * &scale);
    a.for_each_lane(&mut |mut lane| {
        lane *= &scale;
        lane += &shift;
    });
}

/// NHWC convolution with Keras padding conventions.
pub(crate) fn conv2d(
    x: &Array4<f32>,
    kernel: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    strides: [usize; 2],
    padding: Padding,
) -> Result<Array4<f32>> {
    let (n, h, w, c) = x.dim();
    let (kh, kw, kc, oc) = kernel.dim();
    if kc != c {
        return Err(Error::shape("convolution input channels", kc, c));
    }
    let (oh, pad_top) = padding.output_len(h, kh, strides[0])?;
    let (ow, pad_left) = padding.output_len(w, kw, strides[1])?;

    let mut out = Array4::<f32>::zeros((n, oh, ow, oc));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(x.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut o, img)| {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = o.slice_mut(s![oy, ox, ..]);
                    for ky in 0..kh {
                        let iy = (oy * strides[0] + ky) as isize - pad_top as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * strides[1] + kx) as isize - pad_left as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            for ci in 0..c {
                                let v = img[[iy as usize, ix as usize, ci]];
                                if v != 0.0 {
                                    acc.scaled_add(v, &kernel.slice(s![ky, kx, ci, ..]));
                                }
                            }
                        }
                    }
                    if let Some(b) = bias {
                        acc += b;
                    }
                }
            }
        });
    Ok(out)
}

fn max_pool(x: &Array4<f32>, cfg: &PoolConfig) -> Result<Array4<f32>> {
    let (n, h, w, c) = x.dim();
    let [ph, pw] = cfg.pool_size;
    let (oh, pad_top) = cfg.padding.output_len(h, ph, cfg.strides[0])?;
    let (ow, pad_left) = cfg.padding.output_len(w, pw, cfg.strides[1])?;

    let mut out = Array4::<f32>::from_elem((n, oh, ow, c), f32::NEG_INFINITY);
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(x.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut o, img)| {
            for oy in 0..oh {
                for ox in 0..ow {
                    for ky in 0..ph {
                        let iy = (oy * cfg.strides[0] + ky) as isize - pad_top as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..pw {
                            let ix = (ox * cfg.strides[1] + kx) as isize - pad_left as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            for ci in 0..c {
                                let v = img[[iy as usize, ix as usize, ci]];
                                let cell = &mut o[[oy, ox, ci]];
                                if v > *cell {
                                    *cell = v;
                                }
                            }
                        }
                    }
                }
            }
        });
    Ok(out)
}

fn bottleneck(x: Array4<f32>, cfg: &BottleneckConfig, w: &BottleneckWeights) -> Result<Array4<f32>> {
    let stride = [cfg.stride; 2];
    let eps = cfg.epsilon;

    let mut y = conv2d(&x, &w.conv1.kernel, w.conv1.bias.as_ref(), stride, Padding::Valid)?;
    batch_norm(&mut y, &w.bn1, eps);
    activate(&mut y, Activation::Relu);

    let mut y = conv2d(&y, &w.conv2.kernel, w.conv2.bias.as_ref(), [1, 1], Padding::Same)?;
    batch_norm(&mut y, &w.bn2, eps);
    activate(&mut y, Activation::Relu);

    let mut y = conv2d(&y, &w.conv3.kernel, w.conv3.bias.as_ref(), [1, 1], Padding::Valid)?;
    batch_norm(&mut y, &w.bn3, eps);

    let shortcut = match &w.shortcut {
        Some((sc, sbn)) => {
            let mut s = conv2d(&x, &sc.kernel, sc.bias.as_ref(), stride, Padding::Valid)?;
            batch_norm(&mut s, sbn, eps);
            s
        }
        None => x,
    };
    y += &shortcut;
    activate(&mut y, Activation::Relu);
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::graph::GraphBuilder;

    #[test]
    fn test_conv_same_identity_kernel() {
        let x = Array4::from_shape_fn((2, 5, 5, 1), |(n, i, j, _)| (n * 25 + i * 5 + j) as f32);
        let mut k = Array4::zeros((3, 3, 1, 1));
        k[[1, 1, 0, 0]] = 1.0;
        let y = conv2d(&x, &k, None, [1, 1], Padding::Same).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn test_conv_valid_box_filter() {
        let x = Array4::from_elem((1, 4, 4, 2), 1.0f32);
        let k = Array4::from_elem((3, 3, 2, 3), 1.0f32);
        let b = Array1::from(vec![0.0, 1.0, 2.0]);
        let y = conv2d(&x, &k, Some(&b), [1, 1], Padding::Valid).unwrap();
        assert_eq!(y.dim(), (1, 2, 2, 3));
        assert_eq!(y[[0, 0, 0, 0]], 18.0);
        assert_eq!(y[[0, 1, 1, 2]], 20.0);
    }

    #[test]
    fn test_max_pool() {
        let x = Array4::from_shape_fn((1, 4, 4, 1), |(_, i, j, _)| (i * 4 + j) as f32);
        let cfg = PoolConfig {
            pool_size: [2, 2],
            strides: [2, 2],
            padding: Padding::Valid,
        };
        let y = max_pool(&x, &cfg).unwrap();
        assert_eq!(y.into_raw_vec(), vec![5.0, 7.0, 13.0, 15.0]);
    }

    fn noisy_graph() -> ModelGraph {
        GraphBuilder::new("noisy", Layer::input("input_1", [4, 4, 1]))
            .unwrap()
            .add(Layer::new("noise", LayerKind::GaussianNoise { stddev: 1.0 }))
            .unwrap()
            .add(Layer::new("gap", LayerKind::GlobalAvgPool2d))
            .unwrap()
            .add(Layer::dense("predictions", 2, Activation::Softmax))
            .unwrap()
            .finish()
            .with_initialised_weights(3)
            .unwrap()
    }

    #[test]
    fn test_noise_only_in_training() {
        let g = noisy_graph();
        let x = Array4::from_elem((3, 4, 4, 1), 0.5f32);
        let a = g.predict(&x).unwrap();
        let b = g.predict(&x).unwrap();
        assert_eq!(a, b);
        let t1 = g.forward(&x, Mode::Train, 1).unwrap();
        assert_ne!(a, t1);
        assert_eq!(t1, g.forward(&x, Mode::Train, 1).unwrap());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let g = noisy_graph();
        let x = Array4::from_shape_fn((3, 4, 4, 1), |(n, i, _, _)| (n + i) as f32);
        let p = g.predict(&x).unwrap();
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_wrong_input_shape() {
        let g = noisy_graph();
        let x = Array4::zeros((1, 5, 5, 1));
        assert!(matches!(g.predict(&x), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_uninitialised_graph_errors() {
        let g = GraphBuilder::new("raw", Layer::input("input_1", [2, 2, 1]))
            .unwrap()
            .add(Layer::new("flatten", LayerKind::Flatten))
            .unwrap()
            .add(Layer::dense("fc", 2, Activation::Linear))
            .unwrap()
            .finish();
        assert!(matches!(g.predict(&Array4::zeros((1, 2, 2, 1))), Err(Error::Value(_))));
    }
}
