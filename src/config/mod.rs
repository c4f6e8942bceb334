//! Run metadata and the named options it is built from.
//!
//! A [`RunConfig`] is the single explicit configuration object passed to
//! model construction and evaluation. It is persisted as JSON next to the
//! trained model (`simulation.json`) and under the results directory
//! (`parameters/{sim_set}.json`).

pub mod presets;
pub mod stats;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ndarray::{ArrayBase, Data, Dimension};
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::filters::{FilterSpec, Precision};
use crate::model::{substitute_layer, Base, ModelGraph, SubstituteOptions};
use crate::perturb::perturbations;

pub use stats::{ImageStats, ImageStatsCache};

fn normalised(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "")
}

/// Input colour handling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColourMode {
    Rgb,
    Rgba,
    #[default]
    Grayscale,
}

impl ColourMode {
    /// Input channel count; RGBA is recognised but has no input pipeline.
    pub fn channels(self) -> Result<usize> {
        match self {
            ColourMode::Rgb => Ok(3),
            ColourMode::Grayscale => Ok(1),
            ColourMode::Rgba => Err(Error::Value("RGBA input is not supported".into())),
        }
    }
}

impl FromStr for ColourMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalised(s).as_str() {
            "rgb" => Ok(ColourMode::Rgb),
            "rgba" => Ok(ColourMode::Rgba),
            "grayscale" | "greyscale" | "gray" | "grey" => Ok(ColourMode::Grayscale),
            _ => Err(Error::Config(format!("unknown colour mode: {s:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Optimizer {
    #[serde(rename = "SGD")]
    Sgd,
    #[serde(rename = "RMSprop")]
    RmsProp,
    Adagrad,
    Adadelta,
    Adam,
    Adamax,
    Nadam,
}

impl Optimizer {
    pub fn name(self) -> &'static str {
        match self {
            Optimizer::Sgd => "SGD",
            Optimizer::RmsProp => "RMSprop",
            Optimizer::Adagrad => "Adagrad",
            Optimizer::Adadelta => "Adadelta",
            Optimizer::Adam => "Adam",
            Optimizer::Adamax => "Adamax",
            Optimizer::Nadam => "Nadam",
        }
    }
}

impl FromStr for Optimizer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalised(s).as_str() {
            "sgd" => Ok(Optimizer::Sgd),
            "rmsprop" => Ok(Optimizer::RmsProp),
            "adagrad" => Ok(Optimizer::Adagrad),
            "adadelta" => Ok(Optimizer::Adadelta),
            "adam" => Ok(Optimizer::Adam),
            "adamax" => Ok(Optimizer::Adamax),
            "nadam" => Ok(Optimizer::Nadam),
            _ => Err(Error::Config(format!("unknown optimizer: {s:?}"))),
        }
    }
}

/// What replaces the first convolution of the base network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Convolution {
    Original,
    Gabor,
    #[serde(rename = "DoG")]
    Dog,
    #[serde(rename = "Low-pass")]
    LowPass,
    #[serde(rename = "Combined-full")]
    CombinedFull,
    #[serde(rename = "Combined-small")]
    CombinedSmall,
    #[serde(rename = "Combined-medium")]
    CombinedMedium,
    #[serde(rename = "Combined-trim")]
    CombinedTrim,
}

impl Convolution {
    pub const ALL: [Convolution; 8] = [
        Convolution::Original,
        Convolution::Gabor,
        Convolution::Dog,
        Convolution::LowPass,
        Convolution::CombinedFull,
        Convolution::CombinedSmall,
        Convolution::CombinedMedium,
        Convolution::CombinedTrim,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Convolution::Original => "Original",
            Convolution::Gabor => "Gabor",
            Convolution::Dog => "DoG",
            Convolution::LowPass => "Low-pass",
            Convolution::CombinedFull => "Combined-full",
            Convolution::CombinedSmall => "Combined-small",
            Convolution::CombinedMedium => "Combined-medium",
            Convolution::CombinedTrim => "Combined-trim",
        }
    }

    pub fn is_combined(self) -> bool {
        matches!(
            self,
            Convolution::CombinedFull
                | Convolution::CombinedSmall
                | Convolution::CombinedMedium
                | Convolution::CombinedTrim
        )
    }
}

impl fmt::Display for Convolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Convolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = normalised(s);
        Self::ALL
            .into_iter()
            .find(|c| normalised(c.label()) == key)
            .ok_or_else(|| Error::Config(format!("unknown convolution type: {s:?}")))
    }
}

/// Resampling used when upscaling training images; selects the cached
/// image statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Nearest,
    Linear,
    Cubic,
    Area,
    Lanczos,
}

impl Interpolation {
    pub fn name(self) -> &'static str {
        match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Linear => "linear",
            Interpolation::Cubic => "cubic",
            Interpolation::Area => "area",
            Interpolation::Lanczos => "lanczos",
        }
    }

    /// Numeric code used on the command line (0 = nearest ... 4 = lanczos).
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl FromStr for Interpolation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalised(s).as_str() {
            "0" | "nearest" => Ok(Interpolation::Nearest),
            "1" | "linear" | "bilinear" => Ok(Interpolation::Linear),
            "2" | "cubic" | "bicubic" => Ok(Interpolation::Cubic),
            "3" | "area" => Ok(Interpolation::Area),
            "4" | "lanczos" | "lanczos4" => Ok(Interpolation::Lanczos),
            _ => Err(Error::Config(format!("unknown interpolation: {s:?}"))),
        }
    }
}

/// Metadata of one training/evaluation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Training data set name, e.g. `CIFAR10`.
    pub data_set: String,

    /// Class names in label order.
    pub classes: Vec<String>,

    pub epochs: usize,

    pub optimizer: Optimizer,

    /// Learning rate.
    pub lr: f64,

    /// Learning-rate decay.
    pub decay: f64,

    /// Batch size for training and evaluation.
    pub batch: usize,

    pub seed: u64,

    /// Trial index; starts at 1.
    pub trial: usize,

    /// Model tag, e.g. `Gabor_ALL-CNN`.
    pub model: String,

    pub convolution: Convolution,

    pub base: Base,

    /// Pretrained weight source (`imagenet`) or `None` for random init.
    pub weights: Option<String>,

    /// Perturbation schedules used in the run, by name.
    #[serde(default)]
    pub noise: BTreeMap<String, Vec<f64>>,

    /// Training-set pixel statistics used for normalisation.
    pub image_mean: f64,

    pub image_std: f64,

    /// `[height, width, channels]`.
    pub image_shape: [usize; 3],

    /// Filter parameters when `convolution` is not `Original`.
    pub filter_params: Option<FilterSpec>,

    pub colour: ColourMode,

    /// Fixed filter-bank layer rather than a plain convolution seeded with
    /// the bank tensor.
    pub use_initializer: bool,

    /// Standard deviation of the noise layer after the filters.
    pub internal_noise: Option<f32>,

    /// Output sub-directory for models and results.
    pub label: String,

    pub interpolation: Interpolation,

    /// Proportion of the original contrast kept before additive noise.
    pub contrast_level: f64,

    pub save_predictions: bool,

    /// Batch prefetch worker threads.
    pub workers: usize,

    /// Bounded depth of the prefetch queue.
    pub max_queue_size: usize,

    #[serde(default)]
    pub precision: Precision,
}

fn noise_schedules() -> BTreeMap<String, Vec<f64>> {
    perturbations()
        .into_iter()
        .map(|p| (p.name().to_string(), p.levels))
        .collect()
}

impl Default for RunConfig {
    fn default() -> Self {
        let interpolation = Interpolation::Lanczos;
        let stats = ImageStatsCache::with_known()
            .get(defaults::DATA_SET, interpolation)
            .unwrap_or(ImageStats { mean: 0.0, std: 1.0 });
        Self {
            data_set: defaults::DATA_SET.to_string(),
            classes: defaults::CIFAR10_CLASSES.iter().map(|c| c.to_string()).collect(),
            epochs: defaults::EPOCHS,
            optimizer: Optimizer::RmsProp,
            lr: defaults::LEARNING_RATE,
            decay: defaults::DECAY,
            batch: defaults::BATCH,
            seed: defaults::SEED,
            trial: 1,
            model: presets::model_tag(Convolution::Original, Base::AllCnn, false),
            convolution: Convolution::Original,
            base: Base::AllCnn,
            weights: None,
            noise: noise_schedules(),
            image_mean: stats.mean,
            image_std: stats.std,
            image_shape: defaults::IMAGE_SHAPE,
            filter_params: None,
            colour: ColourMode::Grayscale,
            use_initializer: true,
            internal_noise: None,
            label: String::new(),
            interpolation,
            contrast_level: defaults::CONTRAST_LEVEL,
            save_predictions: true,
            workers: defaults::WORKERS,
            max_queue_size: defaults::MAX_QUEUE_SIZE,
            precision: Precision::F32,
        }
    }
}

impl RunConfig {
    /// Configuration for a base/convolution pair with the preset filters
    /// and model tag filled in.
    pub fn for_model(convolution: Convolution, base: Base, pretrained: bool) -> Self {
        Self {
            model: presets::model_tag(convolution, base, pretrained),
            convolution,
            base,
            weights: pretrained.then(|| "imagenet".to_string()),
            filter_params: presets::filter_spec(convolution),
            ..Self::default()
        }
    }

    /// Normalisation statistics recorded for the run.
    pub fn image_stats(&self) -> ImageStats {
        ImageStats {
            mean: self.image_mean,
            std: self.image_std,
        }
    }

    /// Look up the statistics of this run's data set and interpolation,
    /// recomputing them from `train` on a cache miss, and record them.
    pub fn resolve_image_stats<S, D>(&mut self, cache: &mut ImageStatsCache, train: &ArrayBase<S, D>) -> Result<ImageStats>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let stats = cache.resolve(&self.data_set, self.interpolation, train)?;
        self.image_mean = stats.mean;
        self.image_std = stats.std;
        Ok(stats)
    }

    pub fn model_name(&self) -> String {
        format!("{}_{}", self.model, self.trial)
    }

    pub fn sim_set(&self) -> String {
        format!("{}_s{}", self.model_name(), self.seed)
    }

    pub fn model_dir(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(&self.label).join(self.model_name())
    }

    pub fn validate(&self) -> Result<()> {
        if self.trial == 0 {
            return Err(Error::Value("trial numbers start at 1".into()));
        }
        if self.classes.is_empty() {
            return Err(Error::Value("at least one class is required".into()));
        }
        if self.batch == 0 || self.workers == 0 || self.max_queue_size == 0 {
            return Err(Error::Value(format!(
                "batch ({}), workers ({}) and max_queue_size ({}) must be positive",
                self.batch, self.workers, self.max_queue_size
            )));
        }
        if !(self.image_std > 0.0) {
            return Err(Error::Value(format!("image_std must be positive, got {}", self.image_std)));
        }
        if self.image_shape.contains(&0) {
            return Err(Error::Value(format!("empty image shape {:?}", self.image_shape)));
        }
        if self.image_shape[2] != self.colour.channels()? {
            return Err(Error::shape(
                "image_shape channels",
                self.colour.channels()?,
                self.image_shape[2],
            ));
        }
        if self.convolution != Convolution::Original && self.filter_spec().is_none() {
            return Err(Error::Config(format!(
                "{} convolution requires filter parameters",
                self.convolution
            )));
        }
        Ok(())
    }

    /// Explicit filter parameters, falling back to the preset.
    pub fn filter_spec(&self) -> Option<FilterSpec> {
        self.filter_params
            .clone()
            .or_else(|| presets::filter_spec(self.convolution))
    }

    pub fn substitute_options(&self) -> SubstituteOptions {
        SubstituteOptions {
            colour: self.colour,
            input_size: Some((self.image_shape[0], self.image_shape[1])),
            use_initializer: self.use_initializer,
            noise_std: self.internal_noise.unwrap_or(0.0),
            precision: self.precision,
            label: None,
        }
    }

    /// Base graph with the configured filters substituted, renamed to the
    /// run's model name. Learned weights are left uninitialised.
    pub fn build_model(&self) -> Result<ModelGraph> {
        self.validate()?;
        let base = self.base.build(self.image_shape, self.classes.len())?;
        let graph = match (self.convolution, self.filter_spec()) {
            (Convolution::Original, _) | (_, None) => base,
            (_, Some(spec)) => substitute_layer(&base, None, &spec, &self.substitute_options())?,
        };
        Ok(graph.renamed(self.model_name()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotFound(format!("run configuration {}", path.display())));
        }
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    /// Write `simulation.json` into the model directory and
    /// `parameters/{sim_set}.json` into the results directory.
    pub fn save_run(&self, models_dir: &Path, results_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let sim = self.model_dir(models_dir).join("simulation.json");
        let params = results_dir
            .join("parameters")
            .join(format!("{}.json", self.sim_set()));
        self.save(&sim)?;
        self.save(&params)?;
        tracing::info!("saved run metadata for {} to {}", self.sim_set(), params.display());
        Ok((sim, params))
    }

    /// Metadata previously saved next to a trained model.
    pub fn load_for_model(models_dir: &Path, label: &str, model_name: &str) -> Result<Self> {
        Self::load(&models_dir.join(label).join(model_name).join("simulation.json"))
    }
}
