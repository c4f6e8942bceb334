//! bionet command-line entry point.
//!
//! Thin wrappers over the library: build and save a filter-bank model,
//! print perturbation schedules, inspect saved models and summarise
//! perturbation records as AUC scores.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bionet::config::{Convolution, RunConfig};
use bionet::eval::{perturbation_aucs, MetricsWriter, PerturbRecord};
use bionet::filters::InitializerRegistry;
use bionet::model::{load_model, save_model, Base, LayerRegistry};
use bionet::perturb::{perturbations, PerturbKind};

#[derive(Parser, Debug)]
#[command(name = "bionet", about = "Fixed biological filter banks for CNN robustness studies", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[arg(short, long, default_value = "Gabor")]
    convolution: Convolution,

    #[arg(short, long, default_value = "ALL-CNN")]
    base: Base,

    /// Mark the model as starting from ImageNet weights.
    #[arg(long, default_value_t = false)]
    pretrained: bool,

    /// Run metadata to start from instead of the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 1)]
    trial: usize,

    #[arg(short, long)]
    seed: Option<u64>,

    /// Sub-directory grouping related runs.
    #[arg(short, long, default_value = "")]
    label: String,

    #[arg(long, default_value = "./models")]
    models_dir: PathBuf,

    #[arg(long, default_value = "./results")]
    results_dir: PathBuf,

    /// Print the layer table.
    #[arg(long, default_value_t = false)]
    summary: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a base network with a filter bank spliced in and save it with
    /// its run metadata.
    Build(BuildArgs),

    /// Print the severity levels of one or every perturbation.
    Schedule {
        #[arg(short, long)]
        noise: Option<PerturbKind>,
    },

    /// Load a saved model and print its layers.
    Inspect {
        /// Directory holding `{epochs:03}_epochs.json`.
        dir: PathBuf,

        #[arg(short, long, default_value_t = 0)]
        epochs: usize,
    },

    /// Area under the accuracy curve for each perturbation and model.
    Auc {
        /// Perturbation record files.
        #[arg(required = true)]
        records: Vec<PathBuf>,

        /// Write the scores as CSV.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn build(args: BuildArgs) -> anyhow::Result<()> {
    let mut run = match &args.config {
        Some(path) => RunConfig::load(path).with_context(|| format!("reading {}", path.display()))?,
        None => RunConfig::for_model(args.convolution, args.base, args.pretrained),
    };
    run.trial = args.trial;
    run.label = args.label;
    if let Some(seed) = args.seed {
        run.seed = seed;
    }

    let graph = run
        .build_model()
        .with_context(|| format!("building {}", run.model_name()))?
        .with_initialised_weights(run.seed)?;
    if args.summary {
        println!("{}", graph.summary());
    }
    let dir = run.model_dir(&args.models_dir);
    save_model(&graph, &dir, 0).with_context(|| format!("saving to {}", dir.display()))?;
    run.save_run(&args.models_dir, &args.results_dir)?;
    tracing::info!("{} ready in {}", run.model_name(), dir.display());
    Ok(())
}

fn schedule(noise: Option<PerturbKind>) {
    for p in perturbations() {
        if noise.is_some_and(|k| k != p.kind) {
            continue;
        }
        let levels: Vec<String> = p.levels.iter().map(|l| format!("{l:.4}")).collect();
        println!("{:<16} [{}]", p.name(), levels.join(", "));
    }
}

fn inspect(dir: PathBuf, epochs: usize) -> anyhow::Result<()> {
    let graph = load_model(&dir, epochs, &LayerRegistry::standard(), &InitializerRegistry::standard())
        .with_context(|| format!("loading model from {}", dir.display()))?;
    println!("{}", graph.summary());
    if !graph.is_initialised() {
        tracing::warn!("{} is missing learned weights", graph.name());
    }
    Ok(())
}

fn auc(files: Vec<PathBuf>, output: Option<PathBuf>) -> anyhow::Result<()> {
    let mut records: Vec<PerturbRecord> = Vec::new();
    for path in &files {
        let mut batch = MetricsWriter::new(path)
            .read_all()
            .with_context(|| format!("reading records from {}", path.display()))?;
        records.append(&mut batch);
    }
    if records.is_empty() {
        bail!("no perturbation records in {} file(s)", files.len());
    }
    let scores = perturbation_aucs(&records)?;
    for (noise, model, area) in &scores {
        println!("{noise:<16} {model:<24} {area:.4}");
    }
    if let Some(path) = output {
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["Noise", "Model", "AUC"])?;
        for (noise, model, area) in &scores {
            writer.write_record([noise.as_str(), model.as_str(), area.to_string().as_str()])?;
        }
        writer.flush()?;
        tracing::info!("AUC scores written to {}", path.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    tracing::debug!("bionet v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Build(args) => build(args),
        Command::Schedule { noise } => {
            schedule(noise);
            Ok(())
        }
        Command::Inspect { dir, epochs } => inspect(dir, epochs),
        Command::Auc { records, output } => auc(records, output),
    }
}
