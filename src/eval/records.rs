//! Result records, the append-only metrics file and per-image prediction
//! files.

use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::classifier::argmax;
use crate::error::{Error, Result};
use crate::perturb::PerturbKind;

/// `Weights` value recorded for randomly initialised models.
pub const NO_WEIGHTS: &str = "None";

/// Booleans are written `True`/`False` and read in either case.
mod title_bool {
    use super::*;

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(if *value { "True" } else { "False" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
        let raw = String::deserialize(d)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(serde::de::Error::custom(format!("invalid boolean {other:?}"))),
        }
    }
}

/// One generalisation-set evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneraliseRecord {
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Convolution")]
    pub convolution: String,
    #[serde(rename = "Base")]
    pub base: String,
    #[serde(rename = "Weights", default)]
    pub weights: String,
    #[serde(rename = "Trial")]
    pub trial: usize,
    #[serde(rename = "Seed")]
    pub seed: u64,
    /// Full set name, e.g. `contours_inverted`.
    #[serde(rename = "Set")]
    pub set: String,
    /// Set without the inversion suffix.
    #[serde(rename = "Type")]
    pub set_type: String,
    #[serde(rename = "Inverted", with = "title_bool")]
    pub inverted: bool,
    #[serde(rename = "Loss")]
    pub loss: f64,
    #[serde(rename = "Accuracy")]
    pub accuracy: f64,
}

/// One (perturbation, severity level) evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerturbRecord {
    #[serde(rename = "Trial")]
    pub trial: usize,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Convolution")]
    pub convolution: String,
    #[serde(rename = "Base")]
    pub base: String,
    #[serde(rename = "Weights", default)]
    pub weights: String,
    #[serde(rename = "Noise")]
    pub noise: String,
    #[serde(rename = "Level")]
    pub level: f64,
    #[serde(rename = "Loss")]
    pub loss: f64,
    #[serde(rename = "Accuracy")]
    pub accuracy: f64,
}

/// Append-only CSV of records. The header is written only when the file
/// is created; existing rows are never rewritten.
#[derive(Clone, Debug)]
pub struct MetricsWriter {
    path: PathBuf,
}

impl MetricsWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<R: Serialize>(&self, record: &R) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let fresh = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(fresh).from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_all<R: serde::de::DeserializeOwned>(&self) -> Result<Vec<R>> {
        let mut reader = csv::Reader::from_reader(BufReader::new(File::open(&self.path)?));
        Ok(reader.deserialize().collect::<std::result::Result<Vec<R>, _>>()?)
    }
}

/// Set-identifying columns appended to every prediction row.
#[derive(Clone, Debug, PartialEq)]
pub enum PredictionTag {
    Generalise { set: String, set_type: String, inverted: bool },
    Perturb { noise: String, level: f64, level_index: usize },
}

impl PredictionTag {
    fn headers(&self) -> &'static [&'static str] {
        match self {
            PredictionTag::Generalise { .. } => &["Set", "Type", "Inverted"],
            PredictionTag::Perturb { .. } => &["Noise", "Level", "Level-Index"],
        }
    }

    fn values(&self) -> Vec<String> {
        match self {
            PredictionTag::Generalise { set, set_type, inverted } => vec![
                set.clone(),
                set_type.clone(),
                if *inverted { "True" } else { "False" }.to_string(),
            ],
            PredictionTag::Perturb { noise, level, level_index } => {
                vec![noise.clone(), level.to_string(), level_index.to_string()]
            }
        }
    }
}

pub fn generalise_predictions_name(model_name: &str, set: &str, seed: u64) -> String {
    format!("{model_name}_generalise_{set}_s{seed}.csv")
}

pub fn perturb_predictions_name(model_name: &str, kind: PerturbKind, level_index: usize) -> String {
    format!("{model_name}_{}_L{:02}.csv", kind.slug(), level_index + 1)
}

/// Write one row per image: class probabilities, `Predicted`, `Class`,
/// `Correct`, `Image`, then the tag columns.
pub fn write_predictions(
    path: &Path,
    classes: &[String],
    probabilities: &ArrayView2<f32>,
    labels: &[usize],
    tag: &PredictionTag,
) -> Result<()> {
    let (rows, cols) = probabilities.dim();
    if cols != classes.len() {
        return Err(Error::shape("probability columns", classes.len(), cols));
    }
    if rows != labels.len() {
        return Err(Error::shape("prediction rows", labels.len(), rows));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    let mut header: Vec<&str> = classes.iter().map(String::as_str).collect();
    header.extend(["Predicted", "Class", "Correct", "Image"]);
    header.extend(tag.headers());
    writer.write_record(&header)?;

    let tail = tag.values();
    for (image, (row, &label)) in probabilities.axis_iter(Axis(0)).zip(labels).enumerate() {
        let predicted = argmax(row);
        let mut record: Vec<String> = row.iter().map(|p| p.to_string()).collect();
        record.push(predicted.to_string());
        record.push(label.to_string());
        record.push(if predicted == label { "True" } else { "False" }.to_string());
        record.push(image.to_string());
        record.extend(tail.iter().cloned());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    tracing::info!("predictions written to {}", path.display());
    Ok(())
}

/// Class-probability columns of a predictions file, by class name.
pub fn read_probabilities(path: &Path, classes: &[String]) -> Result<Array2<f32>> {
    if !path.is_file() {
        return Err(Error::NotFound(format!("predictions {}", path.display())));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let columns = classes
        .iter()
        .map(|c| {
            headers
                .iter()
                .position(|h| h == c)
                .ok_or_else(|| Error::Value(format!("{} has no column {c:?}", path.display())))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut flat = Vec::new();
    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        for &col in &columns {
            let cell = record.get(col).unwrap_or_default();
            let p = cell
                .parse::<f32>()
                .map_err(|e| Error::Value(format!("bad probability {cell:?} in {}: {e}", path.display())))?;
            flat.push(p);
        }
        rows += 1;
    }
    Array2::from_shape_vec((rows, classes.len()), flat)
        .map_err(|e| Error::shape("predictions file", (rows, classes.len()), e))
}

/// The `Class` column of a predictions file: the labels it was scored with.
pub fn read_labels(path: &Path) -> Result<Vec<usize>> {
    if !path.is_file() {
        return Err(Error::NotFound(format!("predictions {}", path.display())));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let column = reader
        .headers()?
        .iter()
        .position(|h| h == "Class")
        .ok_or_else(|| Error::Value(format!("{} has no Class column", path.display())))?;
    reader
        .records()
        .map(|record| {
            let record = record?;
            let cell = record.get(column).unwrap_or_default();
            cell.parse::<usize>()
                .map_err(|e| Error::Value(format!("bad label {cell:?} in {}: {e}", path.display())))
        })
        .collect()
}
