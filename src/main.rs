use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::reinflect::{cmd_reinflect, ReinflectArgs};
use cli::train::{cmd_train, TrainArgs};

#[derive(Parser)]
#[command(
    name = "vqinflect",
    version,
    about = "Morphological reinflection with discrete suffix codes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model and write checkpoints into a run directory
    Train(TrainArgs),
    /// Reinflect words with a trained run
    Reinflect(ReinflectArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vqinflect=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Reinflect(args) => cmd_reinflect(args),
    }
}
