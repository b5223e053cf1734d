//! Model components: vocabulary, encoder, quantizer stack, code assembler,
//! attention decoder and the composite model that ties them together.

pub mod assembler;
pub mod composite;
pub mod decoder;
pub mod encoder;
pub mod quantizer;
pub mod vocab;

pub use composite::{ForwardOutput, Pass, ReinflectionConfig, ReinflectionModel};
pub use quantizer::AssemblyMode;
pub use vocab::Vocab;
