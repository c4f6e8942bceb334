//! Sequential CNN graphs: layer definitions, base architectures, inference,
//! surgery and on-disk artifacts.

pub mod bases;
pub mod forward;
pub mod graph;
pub mod layer;
pub mod persist;
pub mod surgery;

pub use bases::Base;
pub use forward::Mode;
pub use graph::{GraphBuilder, ModelGraph};
pub use layer::{Activation, Layer, LayerKind, LayerWeights, Padding, TensorShape};
pub use persist::{load_model, save_model, LayerRegistry};
pub use surgery::{
    find_conv_layer, insert_noise_layer, replace_input, substitute_layer, substitute_output, SubstituteOptions,
};
