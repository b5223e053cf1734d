pub mod reinflect;
pub mod train;

use std::fmt::Display;
use std::process;

use clap::ValueEnum;

use vqinflect::model::AssemblyMode;

/// Print an error and exit with status 1.
pub fn fail(context: &str, err: impl Display) -> ! {
    eprintln!("error: {}: {}", context, err);
    process::exit(1);
}

/// Compute backend for a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Hardware {
    /// GPU through wgpu
    Gpu,
    /// CPU through ndarray
    Cpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Assembly {
    Concat,
    Sum,
    SumAndConcat,
}

impl Assembly {
    pub fn mode(self, groups: usize) -> AssemblyMode {
        match self {
            Assembly::Concat => AssemblyMode::Concat,
            Assembly::Sum => AssemblyMode::Sum,
            Assembly::SumAndConcat => AssemblyMode::SumAndConcat { groups },
        }
    }
}
