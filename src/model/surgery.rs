//! Graph surgery: new graphs with a replaced input, first convolution or
//! classification head.
//!
//! Every operation rebuilds the chain layer by layer through a
//! [`GraphBuilder`], so each untouched layer is re-wired to its new
//! upstream shape. Untouched layers keep their configuration, name and
//! weights. The exception is a layer whose stored weights no longer fit the
//! new upstream shape (e.g. the convolution after a substituted layer with a
//! different channel count): its weights are cleared for re-initialisation
//! and a warning is logged. The source graph is never modified.

use ndarray::Array1;

use super::graph::{infer_shape, GraphBuilder, ModelGraph};
use super::layer::*;
use crate::config::ColourMode;
use crate::error::{Error, Result};
use crate::filters::{CombinedBank, FilterSpec, InitializerConfig, InitializerRegistry, KernelTensor, Precision};

/// Options for [`substitute_layer`].
#[derive(Clone, Debug)]
pub struct SubstituteOptions {
    /// Colour mode of the rebuilt input layer.
    pub colour: ColourMode,
    /// Optional `(height, width)` override for the input.
    pub input_size: Option<(usize, usize)>,
    /// `true`: fixed filter-bank layer (ReLU, zero bias, non-trainable).
    /// `false`: trainable linear convolution seeded with the bank tensor.
    pub use_initializer: bool,
    /// Standard deviation of training-time noise added after the filters;
    /// zero disables the noise layer.
    pub noise_std: f32,
    pub precision: Precision,
    /// Name prefix for the new model; defaults to the filter spec's tag.
    pub label: Option<String>,
}

impl Default for SubstituteOptions {
    fn default() -> Self {
        Self {
            colour: ColourMode::Rgb,
            input_size: None,
            use_initializer: true,
            noise_std: 0.0,
            precision: Precision::F32,
            label: None,
        }
    }
}

/// Index of the first (or last) convolution, matched by layer type or by
/// `conv` in the layer name. The input layer is never a match.
pub fn find_conv_layer(graph: &ModelGraph, first: bool) -> Result<usize> {
    let mut matches = graph
        .layers()
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, l)| l.kind.is_convolution() || l.name.to_ascii_lowercase().contains("conv"));
    let found = if first { matches.next() } else { matches.last() };
    let (index, layer) =
        found.ok_or_else(|| Error::NotFound(format!("no convolutional layer in {}", graph.name())))?;
    tracing::debug!(
        "found {} convolutional layer {index}: {}",
        if first { "first" } else { "last" },
        layer.name
    );
    Ok(index)
}

fn rebuilt_input(graph: &ModelGraph, colour: ColourMode, size: Option<(usize, usize)>) -> Result<Layer> {
    let input = &graph.layers()[0];
    let LayerKind::Input { shape } = input.kind else {
        return Err(Error::Value(format!("{} does not start with an input layer", graph.name())));
    };
    let channels = colour.channels()?;
    let (h, w) = size.unwrap_or((shape[0], shape[1]));
    let new_shape = [h, w, channels];
    if new_shape != shape {
        tracing::info!("replacing input: {:?} --> {:?}", shape, new_shape);
    }
    Ok(Layer::input(input.name.clone(), new_shape))
}

/// Fixed-convolution weights regenerated from the layer's initializers.
pub(crate) fn fixed_conv_weights(
    cfg: &FixedConvConfig,
    in_channels: usize,
    registry: &InitializerRegistry,
) -> Result<LayerWeights> {
    let mut branches = Vec::with_capacity(cfg.initializers.len());
    let mut count = 0;
    for init in &cfg.initializers {
        let bank = registry.resolve(init)?;
        let k = bank.kernel_size();
        let tensor = bank.produce(
            Some([k.rows, k.cols, in_channels, bank.kernel_count()]),
            cfg.precision,
        )?;
        count += bank.kernel_count();
        branches.push(tensor.to_f32());
    }
    Ok(LayerWeights::FixedConv {
        branches,
        bias: cfg.use_bias.then(|| Array1::zeros(count)),
    })
}

/// Push a copied layer, adapting weights that no longer fit upstream.
fn push_rewired(builder: &mut GraphBuilder, mut layer: Layer) -> Result<()> {
    if layer.weights.is_some() {
        if let Err(Error::ShapeMismatch { .. }) = infer_shape(&layer, builder.current_shape()) {
            match &layer.kind {
                LayerKind::FixedConv(cfg) => {
                    let (_, _, c) = builder.current_shape().spatial(&layer.name)?;
                    layer.weights = Some(fixed_conv_weights(cfg, c, &InitializerRegistry::standard())?);
                    tracing::info!(layer = %layer.name, "regenerated fixed kernels for {c} input channels");
                }
                _ => {
                    tracing::warn!(
                        layer = %layer.name,
                        "stored weights do not fit the rewired input {:?}; cleared for re-initialisation",
                        builder.current_shape()
                    );
                    layer.weights = None;
                }
            }
        }
    }
    builder.push(layer)?;
    Ok(())
}

fn unique_name(graph: &ModelGraph, stem: &str) -> String {
    if graph.layer_index(stem).is_none() {
        return stem.to_string();
    }
    (1..)
        .map(|i| format!("{stem}_{i}"))
        .find(|n| graph.layer_index(n).is_none())
        .unwrap_or_else(|| stem.to_string())
}

/// Rebuild `graph` with a new input layer.
///
/// `Rgba` is recognised but not supported and fails with a value error.
pub fn replace_input(graph: &ModelGraph, colour: ColourMode, size: Option<(usize, usize)>) -> Result<ModelGraph> {
    let mut b = GraphBuilder::new(graph.name(), rebuilt_input(graph, colour, size)?)?;
    for layer in &graph.layers()[1..] {
        push_rewired(&mut b, layer.clone())?;
    }
    Ok(b.finish())
}

fn filter_layer(bank: &CombinedBank, label: &str, in_channels: usize, options: &SubstituteOptions) -> Result<Layer> {
    let name = format!("{}_conv", label.to_lowercase());
    let tensors = bank.produce_branches(in_channels, options.precision)?;
    if options.use_initializer {
        let initializers = bank
            .describe()
            .branches
            .iter()
            .map(InitializerConfig::from_params)
            .collect::<Result<Vec<_>>>()?;
        let config = FixedConvConfig {
            initializers,
            precision: options.precision,
            activation: Activation::Relu,
            use_bias: true,
        };
        let weights = LayerWeights::FixedConv {
            branches: tensors.iter().map(KernelTensor::to_f32).collect(),
            bias: Some(Array1::zeros(bank.kernel_count())),
        };
        Ok(Layer::new(name, LayerKind::FixedConv(config)).with_weights(weights))
    } else {
        let [tensor] = tensors.as_slice() else {
            return Err(Error::Value(format!(
                "direct convolution takes a single filter family, got {label}"
            )));
        };
        let [kh, kw, _, count] = tensor.shape();
        let config = Conv2dConfig {
            filters: count,
            kernel_size: [kh, kw],
            strides: [1, 1],
            padding: Padding::Same,
            activation: Activation::Linear,
            use_bias: false,
            trainable: true,
        };
        let weights = LayerWeights::Conv(ConvWeights {
            kernel: tensor.to_f32(),
            bias: None,
        });
        Ok(Layer::conv(name, config).with_weights(weights))
    }
}

/// Replace layer `index` (or the first convolution when `None`) with a fixed
/// filter-bank layer, rebuilding the input in the same pass.
///
/// The new model is named `{label}_{model}` or `{label}_noise_{model}` when
/// training-time noise is inserted after the filters.
pub fn substitute_layer(
    graph: &ModelGraph,
    index: Option<usize>,
    spec: &FilterSpec,
    options: &SubstituteOptions,
) -> Result<ModelGraph> {
    let index = match index {
        Some(i) => i,
        None => find_conv_layer(graph, true)?,
    };
    if index == 0 || index >= graph.len() {
        return Err(Error::Value(format!(
            "replacement index must satisfy 0 < k < {}, got {index}",
            graph.len()
        )));
    }
    if !(options.noise_std >= 0.0) {
        return Err(Error::Value(format!("noise std must be non-negative, got {}", options.noise_std)));
    }
    let bank = CombinedBank::from_spec(spec)?;
    let label = options.label.clone().unwrap_or_else(|| spec.tag());

    let mut b = GraphBuilder::new(graph.name(), rebuilt_input(graph, options.colour, options.input_size)?)?;
    for (i, layer) in graph.layers().iter().enumerate().skip(1) {
        if i != index {
            push_rewired(&mut b, layer.clone())?;
            continue;
        }
        let (_, _, in_channels) = b.current_shape().spatial(&layer.name)?;
        let replacement = filter_layer(&bank, &label, in_channels, options)?;
        tracing::info!(
            "replacing layer {i}: '{}' --> '{}' ({} kernels)",
            layer.name,
            replacement.name,
            bank.kernel_count()
        );
        b.push(replacement)?;
        if options.noise_std > 0.0 {
            let noise = Layer::new(
                unique_name(graph, "gaussian_noise"),
                LayerKind::GaussianNoise { stddev: options.noise_std },
            );
            b.push(noise)?;
        }
    }

    let name = if options.noise_std > 0.0 {
        format!("{label}_noise_{}", graph.name())
    } else {
        format!("{label}_{}", graph.name())
    };
    Ok(b.finish().renamed(name))
}

/// Insert a training-time `GaussianNoise(std)` layer after layer `after`
/// (default: the first convolution). The model is renamed `noisy_{model}`.
pub fn insert_noise_layer(graph: &ModelGraph, after: Option<usize>, std: f32) -> Result<ModelGraph> {
    if !(std > 0.0) {
        return Err(Error::Value(format!("noise std must be positive, got {std}")));
    }
    let after = match after {
        Some(i) => i,
        None => find_conv_layer(graph, true)?,
    };
    if after == 0 || after >= graph.len() {
        return Err(Error::Value(format!(
            "noise position must satisfy 0 < k < {}, got {after}",
            graph.len()
        )));
    }
    tracing::info!("inserting Gaussian noise (std={std}) after layer {after}");
    let mut b = GraphBuilder::new(graph.name(), graph.layers()[0].clone())?;
    for (i, layer) in graph.layers().iter().enumerate().skip(1) {
        b.push(layer.clone())?;
        if i == after {
            b.push(Layer::new(
                unique_name(graph, "gaussian_noise"),
                LayerKind::GaussianNoise { stddev: std },
            ))?;
        }
    }
    Ok(b.finish().renamed(format!("noisy_{}", graph.name())))
}

/// Give the classification layer `classes` units with fresh weights.
///
/// The classification layer is the last dense or convolutional layer;
/// parameter-free layers after it (pooling, softmax) are carried over.
/// Returns the graph unchanged when the output already has `classes` units.
pub fn substitute_output(graph: ModelGraph, classes: usize) -> Result<ModelGraph> {
    if classes == 0 {
        return Err(Error::Value("a classifier needs at least one class".into()));
    }
    if graph.output_shape().channels() == classes {
        tracing::info!("{} already has {classes} output classes", graph.name());
        return Ok(graph);
    }
    let head = graph
        .layers()
        .iter()
        .rposition(|l| matches!(l.kind, LayerKind::Dense(_) | LayerKind::Conv2d(_)))
        .ok_or_else(|| Error::NotFound(format!("no classification layer in {}", graph.name())))?;

    let name = format!("{}_{classes}class", graph.name());
    let (_, layers) = graph.into_layers();
    let mut iter = layers.into_iter();
    let input = iter
        .next()
        .ok_or_else(|| Error::Value("cannot rebuild an empty graph".into()))?;
    let mut b = GraphBuilder::new(name, input)?;
    for (i, mut layer) in iter.enumerate().map(|(i, l)| (i + 1, l)) {
        if i == head {
            match &mut layer.kind {
                LayerKind::Dense(cfg) => cfg.units = classes,
                LayerKind::Conv2d(cfg) => cfg.filters = classes,
                _ => unreachable!("head is dense or convolutional"),
            }
            layer.weights = None;
            tracing::info!("classification layer '{}' now has {classes} units", layer.name);
            b.push(layer)?;
        } else {
            push_rewired(&mut b, layer)?;
        }
    }
    Ok(b.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{DogParams, FilterParams, GaborParams, LowPassParams};
    use crate::kernels::KernelSize;
    use crate::model::bases::Base;
    use ndarray::Array4;

    fn small_net() -> ModelGraph {
        GraphBuilder::new("small", Layer::input("input_1", [12, 12, 3]))
            .unwrap()
            .add(Layer::conv("conv1", Conv2dConfig::new(8, 3)))
            .unwrap()
            .add(Layer::conv("conv2", Conv2dConfig::new(8, 3).stride(2)))
            .unwrap()
            .add(Layer::max_pool("pool", 2, 2, Padding::Valid))
            .unwrap()
            .add(Layer::new("flatten", LayerKind::Flatten))
            .unwrap()
            .add(Layer::dense("fc1", 16, Activation::Relu))
            .unwrap()
            .add(Layer::dense("predictions", 10, Activation::Softmax))
            .unwrap()
            .finish()
            .with_initialised_weights(11)
            .unwrap()
    }

    fn gabor_spec() -> FilterSpec {
        FilterSpec::single(FilterParams::Gabor(GaborParams {
            ksize: KernelSize::square(5),
            sigmas: vec![1.5],
            bs: vec![1.0, 1.8],
            gammas: vec![0.5],
            thetas: vec![0.0, std::f64::consts::FRAC_PI_2],
            psis: vec![0.0],
        }))
    }

    fn combined_spec() -> FilterSpec {
        FilterSpec {
            branches: vec![
                FilterParams::Dog(DogParams {
                    ksize: KernelSize::square(3),
                    sigmas: vec![0.5],
                    gammas: vec![1.6],
                }),
                FilterParams::Gabor(GaborParams {
                    ksize: KernelSize::square(5),
                    sigmas: vec![1.5],
                    bs: vec![1.0],
                    gammas: vec![0.5],
                    thetas: vec![0.0],
                    psis: vec![0.0, 1.0],
                }),
            ],
        }
    }

    #[test]
    fn test_substitution_preserves_length_and_downstream() {
        let g = small_net();
        let out = substitute_layer(&g, Some(1), &gabor_spec(), &SubstituteOptions::default()).unwrap();
        assert_eq!(out.len(), g.len());
        assert_eq!(out.name(), "Gabor_small");
        assert_eq!(out.layer(1).unwrap().name, "gabor_conv");
        assert_eq!(out.shapes()[1], TensorShape::Spatial(12, 12, 4));
        // conv2 sees 4 channels instead of 8: config kept, weights cleared
        assert_eq!(out.layer(2).unwrap().kind, g.layer(2).unwrap().kind);
        assert!(out.layer(2).unwrap().weights.is_none());
        // everything past conv2 is untouched
        for i in 3..g.len() {
            assert_eq!(out.layer(i), g.layer(i));
        }
        // original graph is untouched
        assert_eq!(g.layer(1).unwrap().name, "conv1");
    }

    #[test]
    fn test_substituted_graph_runs() {
        let g = substitute_layer(&small_net(), None, &combined_spec(), &SubstituteOptions::default())
            .unwrap()
            .with_initialised_weights(5)
            .unwrap();
        assert_eq!(g.name(), "DoG+Gabor_small");
        assert_eq!(g.shapes()[1], TensorShape::Spatial(12, 12, 4));
        let p = g.predict(&Array4::from_elem((2, 12, 12, 3), 0.25)).unwrap();
        assert_eq!(p.dim(), (2, 10));
    }

    #[test]
    fn test_noise_and_grayscale() {
        let options = SubstituteOptions {
            colour: ColourMode::Grayscale,
            input_size: Some((16, 16)),
            noise_std: 0.1,
            ..Default::default()
        };
        let g = small_net();
        let out = substitute_layer(&g, None, &gabor_spec(), &options).unwrap();
        assert_eq!(out.len(), g.len() + 1);
        assert_eq!(out.name(), "Gabor_noise_small");
        assert_eq!(out.input_shape(), TensorShape::Spatial(16, 16, 1));
        assert!(matches!(out.layer(2).unwrap().kind, LayerKind::GaussianNoise { .. }));
        let Some(LayerWeights::FixedConv { branches, .. }) = &out.layer(1).unwrap().weights else {
            panic!("expected fixed conv weights");
        };
        assert_eq!(branches[0].dim(), (5, 5, 1, 4));
    }

    #[test]
    fn test_invalid_index_and_colour() {
        let g = small_net();
        let options = SubstituteOptions::default();
        assert!(matches!(substitute_layer(&g, Some(0), &gabor_spec(), &options), Err(Error::Value(_))));
        assert!(matches!(substitute_layer(&g, Some(7), &gabor_spec(), &options), Err(Error::Value(_))));
        let rgba = SubstituteOptions {
            colour: ColourMode::Rgba,
            ..Default::default()
        };
        assert!(matches!(substitute_layer(&g, None, &gabor_spec(), &rgba), Err(Error::Value(_))));
    }

    #[test]
    fn test_direct_convolution_path() {
        let options = SubstituteOptions {
            use_initializer: false,
            ..Default::default()
        };
        let g = small_net();
        let out = substitute_layer(&g, Some(1), &gabor_spec(), &options).unwrap();
        let LayerKind::Conv2d(cfg) = &out.layer(1).unwrap().kind else {
            panic!("expected plain convolution");
        };
        assert_eq!(cfg.filters, 4);
        assert!(!cfg.use_bias);
        assert!(cfg.trainable, "direct convolution starts from the bank but keeps learning");
        let err = substitute_layer(&g, Some(1), &combined_spec(), &options).unwrap_err();
        assert!(matches!(err, Error::Value(_)));
    }

    #[test]
    fn test_find_conv_layer() {
        let g = small_net();
        assert_eq!(find_conv_layer(&g, true).unwrap(), 1);
        assert_eq!(find_conv_layer(&g, false).unwrap(), 2);
        let no_conv = GraphBuilder::new("mlp", Layer::input("input_1", [2, 2, 1]))
            .unwrap()
            .add(Layer::new("flatten", LayerKind::Flatten))
            .unwrap()
            .finish();
        assert!(matches!(find_conv_layer(&no_conv, true), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_substitute_output() {
        let g = small_net();
        let same = substitute_output(g.clone(), 10).unwrap();
        assert_eq!(same, g);

        let out = substitute_output(g.clone(), 16).unwrap();
        assert_eq!(out.name(), "small_16class");
        assert_eq!(out.output_shape(), TensorShape::Flat(16));
        assert!(out.layer(6).unwrap().weights.is_none());
        for i in 0..6 {
            assert_eq!(out.layer(i), g.layer(i));
        }
    }

    #[test]
    fn test_substitute_output_all_cnn_head() {
        let g = Base::AllCnn.build([32, 32, 3], 10).unwrap();
        let out = substitute_output(g, 16).unwrap();
        assert_eq!(out.output_shape(), TensorShape::Flat(16));
        assert_eq!(out.name(), "allcnn_16class");
    }

    #[test]
    fn test_insert_noise_layer() {
        let g = small_net();
        let out = insert_noise_layer(&g, None, 0.5).unwrap();
        assert_eq!(out.len(), g.len() + 1);
        assert_eq!(out.name(), "noisy_small");
        assert_eq!(out.layer(2).unwrap().name, "gaussian_noise");
        assert!(matches!(insert_noise_layer(&g, None, 0.0), Err(Error::Value(_))));
    }

    #[test]
    fn test_replace_input_regenerates_fixed_kernels() {
        let spec = FilterSpec::single(FilterParams::LowPass(LowPassParams {
            ksize: KernelSize::square(3),
            sigmas: vec![1.0, 2.0],
        }));
        let g = substitute_layer(&small_net(), Some(1), &spec, &SubstituteOptions::default()).unwrap();
        let gray = replace_input(&g, ColourMode::Grayscale, None).unwrap();
        let Some(LayerWeights::FixedConv { branches, .. }) = &gray.layer(1).unwrap().weights else {
            panic!("expected fixed conv weights");
        };
        assert_eq!(branches[0].dim(), (3, 3, 1, 2));
        assert_eq!(gray.layer(1).unwrap().kind, g.layer(1).unwrap().kind);
    }
}
