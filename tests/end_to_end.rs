//! End-to-end scenarios across kernels, surgery, persistence, perturbation
//! and evaluation.

use approx::assert_abs_diff_eq;
use ndarray::{Array2, Array4};
use tempfile::tempdir;

use bionet::config::{presets, Convolution, ImageStats, ImageStatsCache, RunConfig};
use bionet::eval::{
    generalisation_labels, perturbation_aucs, Classifier, Evaluator, InMemoryBatches, MetricsWriter, PerturbRecord,
};
use bionet::filters::{CombinedBank, DogParams, FilterBank, FilterParams, FilterSpec, GaborParams, InitializerRegistry, Precision};
use bionet::kernels::KernelSize;
use bionet::model::layer::Conv2dConfig;
use bionet::model::{
    load_model, save_model, substitute_layer, Activation, Base, GraphBuilder, Layer, LayerKind, LayerRegistry,
    ModelGraph, Padding, SubstituteOptions,
};
use bionet::perturb::{perturb_batch, PerturbKind, Perturbation};
use bionet::Error;

fn tiny_net(classes: usize) -> ModelGraph {
    GraphBuilder::new("tiny", Layer::input("input_1", [8, 8, 1]))
        .unwrap()
        .add(Layer::conv("conv1", Conv2dConfig::new(4, 3)))
        .unwrap()
        .add(Layer::max_pool("pool", 2, 2, Padding::Valid))
        .unwrap()
        .add(Layer::new("flatten", LayerKind::Flatten))
        .unwrap()
        .add(Layer::dense("predictions", classes, Activation::Softmax))
        .unwrap()
        .finish()
}

fn small_spec() -> FilterSpec {
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
                thetas: vec![0.0, std::f64::consts::FRAC_PI_2],
                psis: vec![0.0],
            }),
        ],
    }
}

fn grayscale_options() -> SubstituteOptions {
    SubstituteOptions {
        colour: bionet::config::ColourMode::Grayscale,
        ..SubstituteOptions::default()
    }
}

/// Deterministic stand-in for a data set: `n` 8x8 grayscale images in [0, 255].
fn images(n: usize) -> Array4<f32> {
    Array4::from_shape_fn((n, 8, 8, 1), |(i, y, x, _)| ((i * 37 + y * 11 + x * 5) % 256) as f32)
}

fn run_config() -> RunConfig {
    RunConfig {
        image_shape: [8, 8, 1],
        batch: 16,
        workers: 2,
        max_queue_size: 3,
        filter_params: Some(small_spec()),
        ..RunConfig::for_model(Convolution::CombinedSmall, Base::AllCnn, false)
    }
}

#[test]
fn test_gabor_preset_bank() {
    let spec = presets::filter_spec(Convolution::Gabor).unwrap();
    let bank = CombinedBank::from_spec(&spec).unwrap();
    assert_eq!(bank.kernel_count(), 24);
    let gabor = &bank.branches()[0];
    let tensor = gabor.produce(Some([63, 63, 1, 24]), Precision::F32).unwrap();
    assert_eq!(tensor.shape(), [63, 63, 1, 24]);
    let err = gabor.produce(Some([63, 63, 1, 23]), Precision::F32).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn test_substitute_save_and_reload() {
    let base = tiny_net(10).with_initialised_weights(3).unwrap();
    let model = substitute_layer(&base, None, &small_spec(), &grayscale_options())
        .unwrap()
        .with_initialised_weights(4)
        .unwrap();
    assert_eq!(model.len(), base.len());
    assert_eq!(model.name(), "DoG+Gabor_tiny");

    let dir = tempdir().unwrap();
    save_model(&model, dir.path(), 7).unwrap();
    let loaded = load_model(dir.path(), 7, &LayerRegistry::standard(), &InitializerRegistry::standard()).unwrap();
    let x = images(4);
    let before = model.predict(&x).unwrap();
    let after = loaded.predict(&x).unwrap();
    for (a, b) in before.iter().zip(after.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
}

#[test]
fn test_generalisation_set_reconciles() {
    let dir = tempdir().unwrap();
    let cfg = run_config();
    let model = substitute_layer(&tiny_net(10), None, &small_spec(), &grayscale_options())
        .unwrap()
        .with_initialised_weights(cfg.seed)
        .unwrap();
    let set = images(100);
    let stats = ImageStats::from_images(&set).unwrap();
    let eval = Evaluator::new(&model, &cfg, stats, dir.path()).unwrap();

    let labels = generalisation_labels(10);
    let raw = InMemoryBatches::new(set, labels.clone(), cfg.batch).unwrap();
    let outcome = eval
        .evaluate_reconciled(&eval.prepare(&raw, None), &labels, "line drawings", None)
        .unwrap();
    assert!((outcome.framework.accuracy - outcome.recomputed).abs() < 0.01);
    assert_eq!(outcome.probabilities.dim(), (100, 10));

    let records = eval.generalise_all(&[("line_drawings".to_string(), raw)]).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].set, "line_drawings_inverted");
    assert_eq!(records[0].accuracy, outcome.recomputed);
}

/// Reads the class off the mean intensity (class `c` at `20c + 10`).
struct Oracle;

impl Classifier for Oracle {
    fn class_count(&self) -> usize {
        10
    }

    fn predict_batch(&self, images: &Array4<f32>) -> bionet::Result<Array2<f32>> {
        let mut out = Array2::zeros((images.dim().0, 10));
        for (i, image) in images.outer_iter().enumerate() {
            let mean = image.mean().unwrap_or(0.0);
            let class = (((mean - 10.0) / 20.0).round().max(0.0) as usize).min(9);
            out[[i, class]] = 1.0;
        }
        Ok(out)
    }
}

#[test]
fn test_shuffled_labels_fail_reconciliation() {
    let dir = tempdir().unwrap();
    let cfg = run_config();
    let truth = generalisation_labels(10);
    let set = Array4::from_shape_fn((100, 8, 8, 1), |(i, ..)| 20.0 * truth[i] as f32 + 10.0);
    let eval = Evaluator::new(&Oracle, &cfg, ImageStats { mean: 0.0, std: 1.0 }, dir.path()).unwrap();

    let mut shuffled = truth.clone();
    shuffled.rotate_left(5);
    let source = InMemoryBatches::new(set, shuffled, cfg.batch).unwrap();
    let err = eval
        .evaluate_reconciled(&eval.prepare(&source, None), &truth, "shuffled", None)
        .unwrap_err();
    match err {
        Error::Reconciliation { left, right, .. } => {
            assert_eq!(left, 1.0);
            assert_abs_diff_eq!(right, 0.5, epsilon = 1e-9);
        }
        other => panic!("expected a reconciliation failure, got {other:?}"),
    }
}

#[test]
fn test_uniform_noise_at_zero_is_identity() {
    let x = images(3);
    let y = perturb_batch(&x.view(), PerturbKind::Uniform, 0.0, 1.0, 9).unwrap();
    assert_eq!(x, y);
}

#[test]
fn test_perturbation_sweep_and_auc() {
    let dir = tempdir().unwrap();
    let mut cfg = RunConfig {
        save_predictions: false,
        data_set: "synthetic".into(),
        ..run_config()
    };
    let model = substitute_layer(&tiny_net(10), None, &small_spec(), &grayscale_options())
        .unwrap()
        .with_initialised_weights(21)
        .unwrap();
    let set = images(40);
    let labels: Vec<usize> = (0..40).map(|i| i % 10).collect();
    let mut cache = ImageStatsCache::with_known();
    let stats = cfg.resolve_image_stats(&mut cache, &set).unwrap();
    assert_eq!(stats, ImageStats::from_images(&set).unwrap());
    assert_eq!(cfg.image_stats(), stats);
    let eval = Evaluator::new(&model, &cfg, stats, dir.path()).unwrap();

    let catalogue = [
        Perturbation::new(PerturbKind::Uniform),
        Perturbation::new(PerturbKind::Contrast),
    ];
    let source = InMemoryBatches::new(set, labels, cfg.batch).unwrap();
    let records = eval.perturb(&source, &catalogue).unwrap();
    assert_eq!(records.len(), 22);
    assert!(!dir.path().join("predictions").exists());

    let written: Vec<PerturbRecord> = MetricsWriter::new(eval.perturb_metrics_path()).read_all().unwrap();
    assert_eq!(written, records);

    let scores = perturbation_aucs(&written).unwrap();
    assert_eq!(scores.len(), 2);
    assert_eq!(scores[0].0, "Uniform");
    assert!(scores[0].2 <= 1.0 + 1e-12);
    assert_eq!(scores[1].0, "Contrast");
    assert!(scores[1].2 <= 0.99 + 1e-12);
}
