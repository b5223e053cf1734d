//! Checkpoints and run directories.
//!
//! Weights use burn's NamedMpk record format at full precision. A run
//! directory also holds the JSON configs and vocabularies needed to rebuild
//! the model for inference.

use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::Module;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use tracing::info;

use crate::data::tags::TagVocabs;
use crate::error::{ModelError, Result};
use crate::model::composite::ReinflectionConfig;
use crate::model::encoder::{EncoderConfig, SequenceEncoder};
use crate::model::vocab::Vocab;
use crate::training::config::TrainingConfig;

/// Which checkpoint of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    /// Lowest validation loss so far.
    Best,
    /// Snapshot taken at the end of an epoch.
    Epoch(usize),
    /// Weights after the last epoch.
    Last,
}

impl CheckpointTag {
    pub fn stem(&self) -> String {
        match self {
            Self::Best => "best".into(),
            Self::Epoch(n) => format!("epoch_{}", n),
            Self::Last => "last".into(),
        }
    }
}

/// Save a model into `dir` as `{tag}.mpk`.
pub fn save_checkpoint<B: Backend, M: Module<B>>(
    model: &M,
    dir: &Path,
    tag: CheckpointTag,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(tag.stem());
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path.clone(), &recorder)
        .map_err(|e| ModelError::Checkpoint(format!("save {}: {}", path.display(), e)))?;

    // burn appends .mpk extension
    let full_path = path.with_extension("mpk");
    info!(path = %full_path.display(), "saved checkpoint");
    Ok(full_path)
}

/// Load `{tag}.mpk` from `dir` into `model`. `None` if the file is missing.
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    model: M,
    dir: &Path,
    tag: CheckpointTag,
    device: &B::Device,
) -> Result<Option<M>> {
    let path = dir.join(tag.stem());
    let full_path = path.with_extension("mpk");
    if !full_path.exists() {
        return Ok(None);
    }
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let loaded = model
        .load_file(path, &recorder, device)
        .map_err(|e| ModelError::Checkpoint(format!("load {}: {}", full_path.display(), e)))?;
    Ok(Some(loaded))
}

/// Load a standalone encoder checkpoint (e.g. from an autoencoder run).
pub fn load_pretrained_encoder<B: Backend>(
    config: &EncoderConfig,
    path: &Path,
    device: &B::Device,
) -> Result<SequenceEncoder<B>> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    config
        .init::<B>(device)
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| ModelError::Checkpoint(format!("load encoder {}: {}", path.display(), e)))
}

// ─── Run Directory ────────────────────────────────────────────────

const MODEL_CONFIG_FILE: &str = "config.json";
const TRAINING_CONFIG_FILE: &str = "training.json";
const SURF_VOCAB_FILE: &str = "surf_vocab.json";
const TAG_VOCABS_FILE: &str = "tag_vocabs.json";

/// Everything besides weights that inference needs.
pub struct RunMetadata {
    pub model: ReinflectionConfig,
    pub training: TrainingConfig,
    pub surf_vocab: Vocab,
    pub tag_vocabs: TagVocabs,
}

/// Output directory of one training run.
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn save_metadata(&self, meta: &RunMetadata) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        meta.model.save(self.root.join(MODEL_CONFIG_FILE))?;
        meta.training.save(self.root.join(TRAINING_CONFIG_FILE))?;
        meta.surf_vocab.save(&self.root.join(SURF_VOCAB_FILE))?;
        meta.tag_vocabs.save(&self.root.join(TAG_VOCABS_FILE))?;
        Ok(())
    }

    pub fn load_metadata(&self) -> Result<RunMetadata> {
        let config_err = |e: burn::config::ConfigError| ModelError::Config(e.to_string());
        Ok(RunMetadata {
            model: ReinflectionConfig::load(self.root.join(MODEL_CONFIG_FILE)).map_err(config_err)?,
            training: TrainingConfig::load(self.root.join(TRAINING_CONFIG_FILE)).map_err(config_err)?,
            surf_vocab: Vocab::load(&self.root.join(SURF_VOCAB_FILE))?,
            tag_vocabs: TagVocabs::load(&self.root.join(TAG_VOCABS_FILE))?,
        })
    }

    pub fn save<B: Backend, M: Module<B>>(&self, model: &M, tag: CheckpointTag) -> Result<PathBuf> {
        save_checkpoint(model, &self.root, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tags::NUM_TAG_KINDS;
    use crate::model::composite::ReinflectionModel;
    use crate::model::quantizer::AssemblyMode;
    use burn::backend::NdArray;

    type B = NdArray;

    fn config() -> ReinflectionConfig {
        ReinflectionConfig::new(6, vec![2; NUM_TAG_KINDS])
            .with_d_embed(3)
            .with_enc_hidden(4)
            .with_dec_hidden(3)
            .with_d_latent(2)
            .with_num_codebooks(2)
            .with_num_codes(3)
            .with_assembly(AssemblyMode::Concat)
    }

    fn codebook(model: &ReinflectionModel<B>) -> Vec<f32> {
        model.vq.layers[0].codebook.val().into_data().iter::<f32>().collect()
    }

    #[test]
    fn checkpoint_tag_stems() {
        assert_eq!(CheckpointTag::Best.stem(), "best");
        assert_eq!(CheckpointTag::Epoch(5).stem(), "epoch_5");
        assert_eq!(CheckpointTag::Last.stem(), "last");
    }

    #[test]
    fn save_then_load_restores_weights() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let model = config().init::<B>(&device).unwrap();
        let path = save_checkpoint(&model, dir.path(), CheckpointTag::Best).unwrap();
        assert!(path.exists());

        let fresh = config().init::<B>(&device).unwrap();
        let loaded = load_checkpoint(fresh, dir.path(), CheckpointTag::Best, &device)
            .unwrap()
            .unwrap();
        assert_eq!(codebook(&loaded), codebook(&model));
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let model = config().init::<B>(&device).unwrap();
        assert!(load_checkpoint(model, dir.path(), CheckpointTag::Last, &device)
            .unwrap()
            .is_none());
    }

    #[test]
    fn pretrained_encoder_loads_from_file() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let enc_config = config().pretrained_encoder();
        let encoder = enc_config.init::<B>(&device);
        let path = save_checkpoint(&encoder, dir.path(), CheckpointTag::Last).unwrap();
        let loaded = load_pretrained_encoder::<B>(&enc_config, &path, &device).unwrap();
        let a: Vec<f32> = loaded.embed.weight.val().into_data().iter::<f32>().collect();
        let b: Vec<f32> = encoder.embed.weight.val().into_data().iter::<f32>().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn run_metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path());
        let mut tag_vocabs = TagVocabs::new();
        tag_vocabs.parse_and_insert("pos=V,tense=PST").unwrap();
        run.save_metadata(&RunMetadata {
            model: config(),
            training: TrainingConfig::new().with_epochs(3),
            surf_vocab: Vocab::from_words(["abc"]),
            tag_vocabs: tag_vocabs.clone(),
        })
        .unwrap();

        let meta = run.load_metadata().unwrap();
        assert_eq!(meta.model.num_codes, 3);
        assert_eq!(meta.training.epochs, 3);
        assert_eq!(meta.surf_vocab.size(), 6);
        assert_eq!(meta.tag_vocabs, tag_vocabs);
    }
}
