//! Model artifacts on disk.
//!
//! A trained model is two files in its output directory:
//! - `{epochs:03}_epochs.json`: the architecture, one
//!   `{class_name, name, config}` descriptor per layer
//! - `{epochs:03}_epochs_weights.bin`: learned weights (bincode), keyed by
//!   layer name
//!
//! Fixed filter-bank layers store only their initializer configs; their
//! kernels are regenerated on load through the [`InitializerRegistry`].
//! Layer descriptors are decoded through an explicit [`LayerRegistry`] and
//! unknown class names are configuration errors.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::graph::{GraphBuilder, ModelGraph};
use super::layer::*;
use super::surgery::fixed_conv_weights;
use crate::error::{Error, Result};
use crate::filters::InitializerRegistry;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub class_name: String,
    pub name: String,
    pub config: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub name: String,
    pub layers: Vec<LayerDescriptor>,
}

#[derive(Serialize, Deserialize)]
struct NamedWeights {
    name: String,
    weights: LayerWeights,
}

#[derive(Deserialize)]
struct InputConfig {
    shape: [usize; 3],
}

#[derive(Deserialize)]
struct RateConfig {
    rate: f32,
}

#[derive(Deserialize)]
struct NoiseConfig {
    stddev: f32,
}

#[derive(Deserialize)]
struct EpsilonConfig {
    epsilon: f32,
}

#[derive(Deserialize)]
struct ActivationConfig {
    activation: Activation,
}

pub fn describe_layer(layer: &Layer) -> Result<LayerDescriptor> {
    let config = match &layer.kind {
        LayerKind::Input { shape } => json!({ "shape": shape }),
        LayerKind::Conv2d(cfg) => serde_json::to_value(cfg)?,
        LayerKind::FixedConv(cfg) => serde_json::to_value(cfg)?,
        LayerKind::MaxPool2d(cfg) => serde_json::to_value(cfg)?,
        LayerKind::GlobalAvgPool2d | LayerKind::Flatten => json!({}),
        LayerKind::Dense(cfg) => serde_json::to_value(cfg)?,
        LayerKind::Dropout { rate } => json!({ "rate": rate }),
        LayerKind::GaussianNoise { stddev } => json!({ "stddev": stddev }),
        LayerKind::BatchNorm { epsilon } => json!({ "epsilon": epsilon }),
        LayerKind::Activation(act) => json!({ "activation": act }),
        LayerKind::Bottleneck(cfg) => serde_json::to_value(cfg)?,
    };
    Ok(LayerDescriptor {
        class_name: layer.tag().to_string(),
        name: layer.name.clone(),
        config,
    })
}

pub fn describe_graph(graph: &ModelGraph) -> Result<Architecture> {
    Ok(Architecture {
        name: graph.name().to_string(),
        layers: graph.layers().iter().map(describe_layer).collect::<Result<_>>()?,
    })
}

pub type LayerDecoder = fn(Value) -> Result<LayerKind>;

/// Class-name → decoder table for saved architectures.
pub struct LayerRegistry {
    decoders: BTreeMap<String, LayerDecoder>,
}

impl LayerRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut reg = Self::empty();
        reg.register("InputLayer", |v| {
            let c: InputConfig = serde_json::from_value(v)?;
            Ok(LayerKind::Input { shape: c.shape })
        });
        reg.register("Conv2D", |v| Ok(LayerKind::Conv2d(serde_json::from_value(v)?)));
        reg.register("FixedConv2D", |v| Ok(LayerKind::FixedConv(serde_json::from_value(v)?)));
        reg.register("MaxPooling2D", |v| Ok(LayerKind::MaxPool2d(serde_json::from_value(v)?)));
        reg.register("GlobalAveragePooling2D", |_| Ok(LayerKind::GlobalAvgPool2d));
        reg.register("Flatten", |_| Ok(LayerKind::Flatten));
        reg.register("Dense", |v| Ok(LayerKind::Dense(serde_json::from_value(v)?)));
        reg.register("Dropout", |v| {
            let c: RateConfig = serde_json::from_value(v)?;
            Ok(LayerKind::Dropout { rate: c.rate })
        });
        reg.register("GaussianNoise", |v| {
            let c: NoiseConfig = serde_json::from_value(v)?;
            Ok(LayerKind::GaussianNoise { stddev: c.stddev })
        });
        reg.register("BatchNormalization", |v| {
            let c: EpsilonConfig = serde_json::from_value(v)?;
            Ok(LayerKind::BatchNorm { epsilon: c.epsilon })
        });
        reg.register("Activation", |v| {
            let c: ActivationConfig = serde_json::from_value(v)?;
            Ok(LayerKind::Activation(c.activation))
        });
        reg.register("Bottleneck", |v| Ok(LayerKind::Bottleneck(serde_json::from_value(v)?)));
        reg
    }

    pub fn register(&mut self, class_name: &str, decoder: LayerDecoder) {
        self.decoders.insert(class_name.to_string(), decoder);
    }

    pub fn decode(&self, descriptor: &LayerDescriptor) -> Result<Layer> {
        let decoder = self.decoders.get(&descriptor.class_name).ok_or_else(|| {
            Error::Config(format!(
                "unknown layer class {:?} for layer {}",
                descriptor.class_name, descriptor.name
            ))
        })?;
        Ok(Layer::new(descriptor.name.clone(), decoder(descriptor.config.clone())?))
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

pub fn architecture_path(dir: &Path, epochs: usize) -> PathBuf {
    dir.join(format!("{epochs:03}_epochs.json"))
}

pub fn weights_path(dir: &Path, epochs: usize) -> PathBuf {
    dir.join(format!("{epochs:03}_epochs_weights.bin"))
}

/// Write architecture and weights; returns both paths.
pub fn save_model(graph: &ModelGraph, dir: &Path, epochs: usize) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)?;
    let arch_path = architecture_path(dir, epochs);
    let weights_file = weights_path(dir, epochs);

    let arch = describe_graph(graph)?;
    serde_json::to_writer_pretty(BufWriter::new(File::create(&arch_path)?), &arch)?;

    let weights: Vec<NamedWeights> = graph
        .layers()
        .iter()
        .filter(|l| !matches!(l.kind, LayerKind::FixedConv(_)))
        .filter_map(|l| {
            l.weights.as_ref().map(|w| NamedWeights {
                name: l.name.clone(),
                weights: w.clone(),
            })
        })
        .collect();
    bincode::serialize_into(BufWriter::new(File::create(&weights_file)?), &weights)?;

    tracing::info!(
        "saved {} ({} weighted layers) to {}",
        graph.name(),
        weights.len(),
        dir.display()
    );
    Ok((arch_path, weights_file))
}

/// Rebuild a saved graph, regenerating fixed kernels and attaching weights.
pub fn load_model(
    dir: &Path,
    epochs: usize,
    layers: &LayerRegistry,
    initializers: &InitializerRegistry,
) -> Result<ModelGraph> {
    let arch_path = architecture_path(dir, epochs);
    if !arch_path.is_file() {
        return Err(Error::NotFound(format!("architecture {}", arch_path.display())));
    }
    let arch: Architecture = serde_json::from_reader(BufReader::new(File::open(&arch_path)?))?;

    let weights_file = weights_path(dir, epochs);
    let mut stored: HashMap<String, LayerWeights> = if weights_file.is_file() {
        let named: Vec<NamedWeights> = bincode::deserialize_from(BufReader::new(File::open(&weights_file)?))?;
        named.into_iter().map(|n| (n.name, n.weights)).collect()
    } else {
        tracing::warn!("no weights file at {}; loading architecture only", weights_file.display());
        HashMap::new()
    };

    let mut descriptors = arch.layers.iter();
    let input = descriptors
        .next()
        .ok_or_else(|| Error::Config(format!("{} has no layers", arch_path.display())))?;
    let mut builder = GraphBuilder::new(arch.name.clone(), layers.decode(input)?)?;
    for descriptor in descriptors {
        let mut layer = layers.decode(descriptor)?;
        layer.weights = match &layer.kind {
            LayerKind::FixedConv(cfg) => {
                let (_, _, c) = builder.current_shape().spatial(&layer.name)?;
                Some(fixed_conv_weights(cfg, c, initializers)?)
            }
            _ => stored.remove(&layer.name),
        };
        builder.push(layer)?;
    }
    if !stored.is_empty() {
        let mut names: Vec<_> = stored.keys().cloned().collect();
        names.sort();
        tracing::warn!("ignoring weights for unknown layers: {}", names.join(", "));
    }
    let graph = builder.finish();
    tracing::info!("loaded {} ({} layers) from {}", graph.name(), graph.len(), dir.display());
    Ok(graph)
}
