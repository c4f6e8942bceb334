//! Base architectures that receive filter-bank surgery.
//!
//! - **ALL-CNN**: all-convolutional CIFAR network (strided convs, no pooling)
//! - **VGG-16 / VGG-19**: stacked 3x3 blocks with max pooling and a dense head
//! - **ResNet-50**: bottleneck residual stages [3, 4, 6, 3]
//!
//! Layer names follow the conventional names of each architecture so that
//! the first-convolution search and saved artifacts are recognisable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::graph::{GraphBuilder, ModelGraph};
use super::layer::*;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Base {
    #[serde(rename = "ALL-CNN")]
    AllCnn,
    #[serde(rename = "VGG-16")]
    Vgg16,
    #[serde(rename = "VGG-19")]
    Vgg19,
    #[serde(rename = "ResNet")]
    ResNet,
}

impl Base {
    pub fn label(self) -> &'static str {
        match self {
            Base::AllCnn => "ALL-CNN",
            Base::Vgg16 => "VGG-16",
            Base::Vgg19 => "VGG-19",
            Base::ResNet => "ResNet",
        }
    }

    /// Name given to a freshly built graph.
    pub fn model_name(self) -> &'static str {
        match self {
            Base::AllCnn => "allcnn",
            Base::Vgg16 => "vgg16",
            Base::Vgg19 => "vgg19",
            Base::ResNet => "resnet50",
        }
    }

    pub fn build(self, input: [usize; 3], classes: usize) -> Result<ModelGraph> {
        if classes == 0 {
            return Err(Error::Value("a classifier needs at least one class".into()));
        }
        let graph = match self {
            Base::AllCnn => all_cnn(input, classes)?,
            Base::Vgg16 => vgg(self, &[2, 2, 3, 3, 3], input, classes)?,
            Base::Vgg19 => vgg(self, &[2, 2, 4, 4, 4], input, classes)?,
            Base::ResNet => resnet50(input, classes)?,
        };
        tracing::info!(
            base = self.label(),
            layers = graph.len(),
            classes,
            "built base graph {}",
            graph.name()
        );
        Ok(graph)
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Base {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "allcnn" => Ok(Base::AllCnn),
            "vgg16" => Ok(Base::Vgg16),
            "vgg19" => Ok(Base::Vgg19),
            "resnet" | "resnet50" => Ok(Base::ResNet),
            _ => Err(Error::Config(format!("unknown base architecture: {s:?}"))),
        }
    }
}

fn all_cnn(input: [usize; 3], classes: usize) -> Result<ModelGraph> {
    let conv = |filters, kernel, stride| Conv2dConfig::new(filters, kernel).stride(stride);
    GraphBuilder::new(Base::AllCnn.model_name(), Layer::input("input_1", input))?
        .add(Layer::conv("conv1", conv(96, 3, 1)))?
        .add(Layer::conv("conv2", conv(96, 3, 1)))?
        .add(Layer::conv("conv3", conv(96, 3, 2)))?
        .add(Layer::new("dropout_1", LayerKind::Dropout { rate: 0.5 }))?
        .add(Layer::conv("conv4", conv(192, 3, 1)))?
        .add(Layer::conv("conv5", conv(192, 3, 1)))?
        .add(Layer::conv("conv6", conv(192, 3, 2)))?
        .add(Layer::new("dropout_2", LayerKind::Dropout { rate: 0.5 }))?
        .add(Layer::conv("conv7", conv(192, 3, 1).padding(Padding::Valid)))?
        .add(Layer::conv("conv8", conv(192, 1, 1).padding(Padding::Valid)))?
        .add(Layer::conv("conv9", conv(classes, 1, 1).padding(Padding::Valid)))?
        .add(Layer::new("global_average_pooling2d", LayerKind::GlobalAvgPool2d))?
        .add(Layer::new("softmax", LayerKind::Activation(Activation::Softmax)))
        .map(GraphBuilder::finish)
}

fn vgg(base: Base, blocks: &[usize], input: [usize; 3], classes: usize) -> Result<ModelGraph> {
    const WIDTHS: [usize; 5] = [64, 128, 256, 512, 512];
    let mut b = GraphBuilder::new(base.model_name(), Layer::input("input_1", input))?;
    for (block, (&convs, &width)) in blocks.iter().zip(WIDTHS.iter()).enumerate() {
        for i in 1..=convs {
            b.push(Layer::conv(
                format!("block{}_conv{}", block + 1, i),
                Conv2dConfig::new(width, 3),
            ))?;
        }
        b.push(Layer::max_pool(format!("block{}_pool", block + 1), 2, 2, Padding::Valid))?;
    }
    b.push(Layer::new("flatten", LayerKind::Flatten))?;
    b.push(Layer::dense("fc1", 4096, Activation::Relu))?;
    b.push(Layer::dense("fc2", 4096, Activation::Relu))?;
    b.push(Layer::dense("predictions", classes, Activation::Softmax))?;
    Ok(b.finish())
}

fn resnet50(input: [usize; 3], classes: usize) -> Result<ModelGraph> {
    const STAGES: [(usize, [usize; 3]); 4] = [
        (3, [64, 64, 256]),
        (4, [128, 128, 512]),
        (6, [256, 256, 1024]),
        (3, [512, 512, 2048]),
    ];
    const EPSILON: f32 = 1.001e-5;

    let mut b = GraphBuilder::new(Base::ResNet.model_name(), Layer::input("input_1", input))?;
    b.push(Layer::conv(
        "conv1_conv",
        Conv2dConfig::new(64, 7).stride(2).activation(Activation::Linear),
    ))?;
    b.push(Layer::new("conv1_bn", LayerKind::BatchNorm { epsilon: EPSILON }))?;
    b.push(Layer::new("conv1_relu", LayerKind::Activation(Activation::Relu)))?;
    b.push(Layer::max_pool("pool1_pool", 3, 2, Padding::Same))?;
    for (stage, (blocks, filters)) in STAGES.iter().enumerate() {
        for block in 0..*blocks {
            let first = block == 0;
            let stride = if first && stage > 0 { 2 } else { 1 };
            b.push(Layer::new(
                format!("conv{}_block{}", stage + 2, block + 1),
                LayerKind::Bottleneck(BottleneckConfig {
                    filters: *filters,
                    stride,
                    project: first,
                    epsilon: EPSILON,
                }),
            ))?;
        }
    }
    b.push(Layer::new("avg_pool", LayerKind::GlobalAvgPool2d))?;
    b.push(Layer::dense("predictions", classes, Activation::Softmax))?;
    Ok(b.finish())
}
