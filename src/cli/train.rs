use std::path::{Path, PathBuf};

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use clap::Args;
use tracing::warn;

use vqinflect::checkpoint::{load_pretrained_encoder, RunDir, RunMetadata};
use vqinflect::training::fit;
use vqinflect::{ComputeContext, Corpus, CorpusPaths, ReinflectionConfig, Result, TrainingConfig};

use super::{fail, Assembly, Hardware};

#[derive(Args)]
pub struct TrainArgs {
    /// Labeled training TSV (source, features, target)
    pub train: PathBuf,
    /// Labeled validation TSV
    pub valid: PathBuf,
    /// Labeled test TSV used by the shared task
    pub test: PathBuf,
    /// One word per line
    #[arg(long)]
    pub unlabeled: Option<PathBuf>,
    /// Output directory for checkpoints, configs and reports
    #[arg(long, default_value = "runs/vqinflect")]
    pub run_dir: PathBuf,
    #[arg(long, default_value = "300")]
    pub epochs: usize,
    #[arg(long, default_value = "128")]
    pub batch_size: usize,
    #[arg(long, default_value = "0")]
    pub seed: u64,
    /// Final KL weight
    #[arg(long, default_value = "0.1")]
    pub kl_max: f64,
    /// Number of codebooks
    #[arg(long, default_value = "11")]
    pub codebooks: usize,
    /// Entries per codebook
    #[arg(long, default_value = "6")]
    pub codes: usize,
    #[arg(long, value_enum, default_value = "sum-and-concat")]
    pub assembly: Assembly,
    /// Groups for sum-and-concat assembly
    #[arg(long, default_value = "11")]
    pub groups: usize,
    /// Encoder checkpoint (.mpk) whose embedding and recurrent weights seed the model
    #[arg(long)]
    pub pretrained_encoder: Option<PathBuf>,
    /// JSON `[[f32]]` matrix to initialize the codebooks from
    #[arg(long)]
    pub pretrained_codebooks: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "gpu")]
    pub device: Hardware,
}

pub fn cmd_train(args: TrainArgs) {
    let result = match args.device {
        Hardware::Gpu => train::<Autodiff<Wgpu>>(&args, WgpuDevice::default()),
        Hardware::Cpu => train::<Autodiff<NdArray>>(&args, NdArrayDevice::default()),
    };
    if let Err(e) = result {
        fail("training failed", e);
    }
}

fn read_matrix<B: Backend>(path: &Path, device: &B::Device) -> Result<Tensor<B, 2>> {
    let rows: Vec<Vec<f32>> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let cols = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
        return Err(vqinflect::ModelError::shape("codebook matrix row", cols, bad.len()));
    }
    let data: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_data(TensorData::new(data, [rows.len(), cols]), device))
}

fn train<B: AutodiffBackend>(args: &TrainArgs, device: B::Device) -> Result<()> {
    let training = TrainingConfig::new()
        .with_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_seed(args.seed)
        .with_kl_max(args.kl_max);

    let corpus = Corpus::load(
        &CorpusPaths {
            train: &args.train,
            unlabeled: args.unlabeled.as_deref(),
            valid: &args.valid,
            test: &args.test,
        },
        training.batch_size,
        training.max_valid,
    )?;

    // Supervised layers index their codebook by tag id.
    let tag_sizes = corpus.tag_vocabs.sizes();
    let widest_tag = tag_sizes.iter().take(args.codebooks).copied().max().unwrap_or(0);
    let num_codes = args.codes.max(widest_tag);
    if num_codes > args.codes {
        warn!(requested = args.codes, num_codes, "codebooks enlarged to fit tag values");
    }
    let config = ReinflectionConfig::new(corpus.surf_vocab.size(), tag_sizes)
        .with_num_codebooks(args.codebooks)
        .with_num_codes(num_codes)
        .with_assembly(args.assembly.mode(args.groups));

    let mut ctx = ComputeContext::<B>::new(device, training.seed);
    let mut model = config.init::<B>(&ctx.device)?;
    if let Some(path) = &args.pretrained_encoder {
        let encoder = load_pretrained_encoder::<B>(&config.pretrained_encoder(), path, &ctx.device)?;
        model = model.with_pretrained_encoder(encoder)?;
        eprintln!("Loaded pretrained encoder from {}", path.display());
    }
    if let Some(path) = &args.pretrained_codebooks {
        let matrix = read_matrix::<B>(path, &ctx.device)?;
        model.vq = model.vq.init_codebooks_from(matrix)?;
        eprintln!("Loaded pretrained codebooks from {}", path.display());
    }

    let run = RunDir::new(&args.run_dir);
    run.save_metadata(&RunMetadata {
        model: config.clone(),
        training: training.clone(),
        surf_vocab: corpus.surf_vocab.clone(),
        tag_vocabs: corpus.tag_vocabs.clone(),
    })?;

    eprintln!(
        "Training {} codebooks x {} codes for {} epochs into {}",
        config.num_codebooks,
        config.num_codes,
        training.epochs,
        run.path().display()
    );
    let start = std::time::Instant::now();
    let (_model, summary) = fit(model, &corpus, &training, &mut ctx, &run)?;

    eprintln!();
    eprintln!(
        "Done: {} epochs, {} updates ({:.1}s)",
        summary.epochs,
        summary.updates,
        start.elapsed().as_secs_f64()
    );
    eprintln!(
        "  best valid loss {:.4}, last train loss {:.4}, acc {:.3}",
        summary.best_valid_loss,
        summary.last_train.mean_loss(),
        summary.last_train.accuracy()
    );
    if let Some(loss) = summary.test_loss {
        eprintln!("  test loss {:.4}", loss);
    }
    if let Some(report) = summary.shared_task {
        eprintln!(
            "  shared task: {}/{} ({:.3}) -> {}",
            report.correct,
            report.total,
            report.accuracy(),
            report.false_path.display()
        );
    }
    Ok(())
}
