use std::path::PathBuf;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{NdArray, Wgpu};
use burn::prelude::*;
use clap::{Args, ValueEnum};

use vqinflect::checkpoint::{load_checkpoint, CheckpointTag, RunDir};
use vqinflect::data::corpus::parse_labeled;
use vqinflect::inference::reinflect::{reinflect_lines, shared_task};
use vqinflect::{DecodePolicy, ModelError, Result};

use super::{fail, Hardware};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Decode with the gold target's codes and score exact matches
    SharedTask,
    /// Decode with codes chosen by the target tags
    Tags,
}

#[derive(Args)]
pub struct ReinflectArgs {
    /// Run directory written by `train`
    pub run_dir: PathBuf,
    /// Labeled TSV (source, features, target)
    pub input: PathBuf,
    #[arg(long, value_enum, default_value = "shared-task")]
    pub mode: Mode,
    /// Beam width (greedy when omitted)
    #[arg(long)]
    pub beam: Option<usize>,
    /// Load this epoch's checkpoint instead of the best one
    #[arg(long)]
    pub epoch: Option<usize>,
    /// Report directory (default: the run directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: Hardware,
}

pub fn cmd_reinflect(args: ReinflectArgs) {
    let result = match args.device {
        Hardware::Gpu => reinflect::<Wgpu>(&args, WgpuDevice::default()),
        Hardware::Cpu => reinflect::<NdArray>(&args, NdArrayDevice::default()),
    };
    if let Err(e) = result {
        fail("reinflection failed", e);
    }
}

fn reinflect<B: Backend>(args: &ReinflectArgs, device: B::Device) -> Result<()> {
    let run = RunDir::new(&args.run_dir);
    let meta = run.load_metadata()?;
    let tag = args.epoch.map_or(CheckpointTag::Best, CheckpointTag::Epoch);
    let model = load_checkpoint(meta.model.init::<B>(&device)?, run.path(), tag, &device)?
        .ok_or_else(|| {
            ModelError::Checkpoint(format!("no {} checkpoint in {}", tag.stem(), run.path().display()))
        })?;

    let lines = parse_labeled(
        &std::fs::read_to_string(&args.input)?,
        &args.input.display().to_string(),
    )?;
    let policy = match args.beam {
        Some(k) => DecodePolicy::Beam { k, max_steps: 100 },
        None => DecodePolicy::default(),
    };

    match args.mode {
        Mode::SharedTask => {
            let out_dir = args.output.clone().unwrap_or_else(|| run.path().to_path_buf());
            let report = shared_task(&model, &meta.surf_vocab, &lines, &out_dir, &tag.stem(), &policy, &device)?;
            eprintln!(
                "Shared task: {}/{} correct ({:.3})",
                report.correct,
                report.total,
                report.accuracy()
            );
            eprintln!("  {}", report.true_path.display());
            eprintln!("  {}", report.false_path.display());
        }
        Mode::Tags => {
            let results = reinflect_lines(&model, &meta.surf_vocab, &meta.tag_vocabs, &lines, &policy, &device)?;
            let mut correct = 0;
            for (line, result) in lines.iter().zip(&results) {
                if result.form == line.target {
                    correct += 1;
                }
                println!("{}\t{}\t{}", line.source, line.features, result.form);
            }
            eprintln!("{}/{} match the gold form", correct, lines.len());
        }
    }
    Ok(())
}
