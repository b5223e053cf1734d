//! Early-supervision training loop.
//!
//! Every update pairs one unlabeled batch with one labeled-target batch and
//! steps on the sum of their objectives. Labeled batches cycle, reshuffled
//! each time they run out.

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

use super::config::TrainingConfig;
use super::ledger::CodeTupleLedger;
use super::loss::{objective, scalar, LossStats, Objective, Reduction};
use super::schedule::KlSchedule;
use crate::checkpoint::{CheckpointTag, RunDir};
use crate::context::ComputeContext;
use crate::data::batch::{Batch, BatchSource, Partition, Side};
use crate::data::corpus::Corpus;
use crate::error::{ensure_finite, ModelError, Result};
use crate::inference::reinflect::{shared_task, SharedTaskReport};
use crate::model::composite::{Pass, ReinflectionModel};
use crate::model::vocab::Vocab;

/// AdamW with gradient-norm clipping.
pub fn create_optimizer<B: AutodiffBackend>(
    config: &TrainingConfig,
) -> impl Optimizer<ReinflectionModel<B>, B> {
    AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.grad_clip)))
        .init()
}

/// Counters that persist across epochs.
#[derive(Debug, Clone)]
pub struct TrainState {
    /// Optimizer updates so far.
    pub updates: u64,
    pub schedule: KlSchedule,
}

impl TrainState {
    pub fn new(schedule: KlSchedule) -> Self {
        Self {
            updates: 0,
            schedule,
        }
    }

    pub fn kl_weight(&self) -> f64 {
        self.schedule.weight(self.updates)
    }
}

/// Metrics and code usage of one pass over a partition.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub stats: LossStats,
    pub ledger: CodeTupleLedger,
}

/// Endless reshuffling walk over batch indices.
struct Cycle {
    order: Vec<usize>,
    cursor: usize,
}

impl Cycle {
    fn new<B: Backend>(len: usize, ctx: &mut ComputeContext<B>) -> Self {
        let mut order: Vec<usize> = (0..len).collect();
        ctx.shuffle(&mut order);
        Self { order, cursor: 0 }
    }

    fn next<B: Backend>(&mut self, ctx: &mut ComputeContext<B>) -> Option<usize> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor == self.order.len() {
            ctx.shuffle(&mut self.order);
            self.cursor = 0;
        }
        self.cursor += 1;
        Some(self.order[self.cursor - 1])
    }
}

/// Autoencode one side of the batch and score it. Tags are only passed for
/// labeled batches.
#[allow(clippy::too_many_arguments)]
fn batch_objective<B: Backend>(
    model: &ReinflectionModel<B>,
    ctx: &mut ComputeContext<B>,
    batch: &Batch,
    side: Side,
    labeled: bool,
    pass: Pass,
    kl_weight: f64,
    reduction: Reduction,
) -> Result<(Objective<B>, Vec<Vec<usize>>)> {
    let words = batch.side_tensor::<B>(side, &ctx.device)?;
    let tags = labeled.then_some(batch.tags.as_slice());
    let out = model.forward(ctx, words.clone(), tags, pass)?;
    let obj = objective(&out, words, tags, kl_weight, reduction)?;
    Ok((obj, out.codes.code_tuples()))
}

fn forms(vocab: &Vocab, batch: &Batch, side: Side) -> Vec<String> {
    batch.words(side).iter().map(|ids| vocab.decode(ids)).collect()
}

/// One epoch of early supervision.
///
/// Without unlabeled data, every labeled-target batch gets one update of
/// its own.
pub fn train_epoch<B: AutodiffBackend>(
    mut model: ReinflectionModel<B>,
    source: &impl BatchSource,
    optimizer: &mut impl Optimizer<ReinflectionModel<B>, B>,
    ctx: &mut ComputeContext<B>,
    state: &mut TrainState,
    config: &TrainingConfig,
    vocab: &Vocab,
) -> Result<(ReinflectionModel<B>, EpochReport)> {
    let unlabeled = source.batches(Partition::Unlabeled);
    let labeled = source.batches(Partition::LabeledTarget);
    if labeled.is_empty() && unlabeled.is_empty() {
        return Err(ModelError::DegenerateBatch("no training batches".into()));
    }

    let mut unlabeled_order: Vec<usize> = (0..unlabeled.len()).collect();
    ctx.shuffle(&mut unlabeled_order);
    let mut labeled_cycle = Cycle::new(labeled.len(), ctx);
    let steps = if unlabeled.is_empty() {
        labeled.len()
    } else {
        unlabeled.len()
    };

    let mut stats = LossStats::default();
    let mut ledger = CodeTupleLedger::new(model.vq.num_layers());

    for step in 0..steps {
        let kl_weight = state.kl_weight();
        let mut loss: Option<Tensor<B, 1>> = None;

        if let Some(&i) = unlabeled_order.get(step) {
            let batch = &unlabeled[i];
            let (obj, tuples) = batch_objective(
                &model,
                ctx,
                batch,
                Side::Target,
                false,
                Pass::Train,
                kl_weight,
                config.reduction,
            )?;
            stats.merge(&obj.stats);
            ledger.record_batch(&tuples, &forms(vocab, batch, Side::Target));
            loss = Some(obj.loss);
        }

        if let Some(i) = labeled_cycle.next(ctx) {
            let batch = &labeled[i];
            let (obj, tuples) = batch_objective(
                &model,
                ctx,
                batch,
                Side::Target,
                true,
                Pass::Train,
                kl_weight,
                config.reduction,
            )?;
            stats.merge(&obj.stats);
            ledger.record_batch(&tuples, &forms(vocab, batch, Side::Target));
            loss = Some(match loss {
                Some(l) => l + obj.loss,
                None => obj.loss,
            });
        }

        let Some(loss) = loss else { continue };
        ensure_finite("training loss", scalar(loss.clone()) as f32)?;

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optimizer.step(config.lr, model, grads);
        state.updates += 1;
    }

    debug!(updates = state.updates, words = stats.words, "epoch done");
    Ok((model, EpochReport { stats, ledger }))
}

/// Score one side of each batch in eval mode: root latent at its mean,
/// decoder fed its own predictions, no tags. A non-finite batch loss fails
/// the whole pass.
pub fn evaluate<B: Backend>(
    model: &ReinflectionModel<B>,
    batches: &[Batch],
    side: Side,
    ctx: &mut ComputeContext<B>,
    kl_weight: f64,
    reduction: Reduction,
    vocab: &Vocab,
) -> Result<EpochReport> {
    let mut stats = LossStats::default();
    let mut ledger = CodeTupleLedger::new(model.vq.num_layers());
    for batch in batches {
        let (obj, tuples) = batch_objective(model, ctx, batch, side, false, Pass::Eval, kl_weight, reduction)?;
        ensure_finite("evaluation loss", obj.stats.loss as f32)?;
        stats.merge(&obj.stats);
        ledger.record_batch(&tuples, &forms(vocab, batch, side));
    }
    Ok(EpochReport { stats, ledger })
}

/// Outcome of [`fit`].
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub epochs: usize,
    pub updates: u64,
    pub best_valid_loss: f64,
    pub last_train: LossStats,
    /// Mean loss over the test partition after the last epoch.
    pub test_loss: Option<f64>,
    /// Most recent shared-task run, if any was due.
    pub shared_task: Option<SharedTaskReport>,
}

/// Train for `config.epochs` epochs, writing checkpoints, code dumps and
/// shared-task reports into `run`.
pub fn fit<B: AutodiffBackend>(
    mut model: ReinflectionModel<B>,
    corpus: &Corpus,
    config: &TrainingConfig,
    ctx: &mut ComputeContext<B>,
    run: &RunDir,
) -> Result<(ReinflectionModel<B>, FitSummary)> {
    let mut optimizer = create_optimizer::<B>(config);
    let mut state = TrainState::new(config.kl_schedule());
    let num_codes = model.vq.num_codes();
    let vocab = &corpus.surf_vocab;

    let mut best_valid_loss = f64::INFINITY;
    let mut last_train = LossStats::default();
    let mut last_shared_task = None;

    for epoch in 1..=config.epochs {
        let (trained, train) = train_epoch(model, corpus, &mut optimizer, ctx, &mut state, config, vocab)?;
        model = trained;

        let eval_model = model.valid();
        let mut eval_ctx = ctx.fork::<B::InnerBackend>();
        let kl_weight = state.kl_weight();
        let valid = evaluate(
            &eval_model,
            corpus.batches(Partition::Validation),
            Side::Target,
            &mut eval_ctx,
            kl_weight,
            config.reduction,
            vocab,
        )?;

        info!(
            epoch,
            updates = state.updates,
            kl_weight,
            train_loss = train.stats.mean_loss(),
            train_recon = train.stats.mean_recon(),
            train_kl = train.stats.mean_kl(),
            train_vq = train.stats.mean_vq(),
            train_acc = train.stats.accuracy(),
            valid_loss = valid.stats.mean_loss(),
            valid_acc = valid.stats.accuracy(),
            usage = train.ledger.usage_ratio(num_codes),
            novel = valid.ledger.novel_count(&train.ledger),
            "epoch"
        );
        debug!(epoch, codebook_usage = ?train.ledger.codebook_usage(), "codes in use");

        if valid.stats.mean_loss() < best_valid_loss {
            best_valid_loss = valid.stats.mean_loss();
            run.save(&model, CheckpointTag::Best)?;
        }

        if TrainingConfig::due(epoch, config.dump_every) {
            train
                .ledger
                .write_dump(&run.path().join(CheckpointTag::Epoch(epoch).stem()))?;
            let sources = evaluate(
                &eval_model,
                corpus.batches(Partition::LabeledSource),
                Side::Source,
                &mut eval_ctx,
                kl_weight,
                config.reduction,
                vocab,
            )?;
            info!(
                epoch,
                source_loss = sources.stats.mean_loss(),
                source_acc = sources.stats.accuracy(),
                "source reconstruction"
            );
        }

        if TrainingConfig::due(epoch, config.shared_task_every) {
            if !corpus.test_lines.is_empty() {
                let prefix = CheckpointTag::Epoch(epoch).stem();
                last_shared_task = Some(shared_task(
                    &eval_model,
                    vocab,
                    &corpus.test_lines,
                    run.path(),
                    &prefix,
                    &config.decode,
                    &ctx.device,
                )?);
            }
            run.save(&model, CheckpointTag::Epoch(epoch))?;
        }

        last_train = train.stats;
    }

    run.save(&model, CheckpointTag::Last)?;

    let test_batches = corpus.batches(Partition::Test);
    let test_loss = if test_batches.is_empty() {
        None
    } else {
        let mut eval_ctx = ctx.fork::<B::InnerBackend>();
        let test = evaluate(
            &model.valid(),
            test_batches,
            Side::Target,
            &mut eval_ctx,
            state.kl_weight(),
            config.reduction,
            vocab,
        )?;
        info!(test_loss = test.stats.mean_loss(), test_acc = test.stats.accuracy(), "test");
        Some(test.stats.mean_loss())
    };

    Ok((
        model,
        FitSummary {
            epochs: config.epochs,
            updates: state.updates,
            best_valid_loss,
            last_train,
            test_loss,
            shared_task: last_shared_task,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::corpus::LabeledLine;
    use crate::model::composite::ReinflectionConfig;
    use crate::model::quantizer::AssemblyMode;
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray>;

    fn line(source: &str, features: &str, target: &str) -> LabeledLine {
        LabeledLine {
            source: source.into(),
            features: features.into(),
            target: target.into(),
        }
    }

    fn corpus(unlabeled: &[&str]) -> Corpus {
        let train = vec![
            line("gel", "pos=V,tense=PST", "geldi"),
            line("al", "pos=V,tense=PRS", "alır"),
            line("git", "pos=V,tense=PST", "gitti"),
        ];
        let valid = vec![line("gel", "pos=V,tense=PRS", "gelir")];
        let test = vec![line("al", "pos=V,tense=PST", "aldı")];
        let unlabeled = unlabeled.iter().map(|w| w.to_string()).collect();
        Corpus::from_lines(train, unlabeled, valid, test, 2).unwrap()
    }

    fn model(corpus: &Corpus, device: &<B as Backend>::Device) -> ReinflectionModel<B> {
        ReinflectionConfig::new(corpus.surf_vocab.size(), corpus.tag_vocabs.sizes())
            .with_d_embed(4)
            .with_enc_hidden(6)
            .with_dec_hidden(5)
            .with_d_latent(2)
            .with_num_codebooks(2)
            .with_num_codes(6)
            .with_assembly(AssemblyMode::Concat)
            .init::<B>(device)
            .unwrap()
    }

    #[test]
    fn cycle_revisits_every_index() {
        let mut ctx = ComputeContext::<NdArray>::new(Default::default(), 3);
        let mut cycle = Cycle::new(3, &mut ctx);
        let mut seen: Vec<usize> = (0..6).filter_map(|_| cycle.next(&mut ctx)).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 0, 1, 1, 2, 2]);
        assert!(Cycle::new(0, &mut ctx).next(&mut ctx).is_none());
    }

    #[test]
    fn one_update_per_unlabeled_batch() {
        let device = Default::default();
        let corpus = corpus(&["gelir", "geldi", "alır", "gitti", "aldı"]);
        let mut ctx = ComputeContext::<B>::new(device, 0);
        let model = model(&corpus, &ctx.device);
        let config = TrainingConfig::new().with_kl_warmup(0);
        let mut optimizer = create_optimizer::<B>(&config);
        let mut state = TrainState::new(config.kl_schedule());

        let (_model, report) = train_epoch(
            model,
            &corpus,
            &mut optimizer,
            &mut ctx,
            &mut state,
            &config,
            &corpus.surf_vocab,
        )
        .unwrap();
        assert_eq!(state.updates, 3);
        // 5 unlabeled words plus 3 labeled batches of up to 2 words.
        assert!(report.stats.words >= 5 + 3);
        assert!(report.stats.mean_loss().is_finite());
        assert!(report.ledger.unique_count() >= 1);
    }

    #[test]
    fn labeled_only_epoch_steps_per_labeled_batch() {
        let device = Default::default();
        let corpus = corpus(&[]);
        let mut ctx = ComputeContext::<B>::new(device, 0);
        let model = model(&corpus, &ctx.device);
        let config = TrainingConfig::new();
        let mut optimizer = create_optimizer::<B>(&config);
        let mut state = TrainState::new(config.kl_schedule());
        train_epoch(
            model,
            &corpus,
            &mut optimizer,
            &mut ctx,
            &mut state,
            &config,
            &corpus.surf_vocab,
        )
        .unwrap();
        assert_eq!(state.updates, 2);
    }

    fn poison_codebooks(mut model: ReinflectionModel<B>, device: &<B as Backend>::Device) -> ReinflectionModel<B> {
        let rows = model.vq.num_codes();
        let cols = model.vq.num_layers() * model.vq.d_code();
        model.vq = model
            .vq
            .init_codebooks_from(Tensor::full([rows, cols], f32::NAN, device))
            .unwrap();
        model
    }

    #[test]
    fn nan_training_loss_stops_before_update() {
        let device = Default::default();
        let corpus = corpus(&["gelir", "geldi"]);
        let mut ctx = ComputeContext::<B>::new(device, 0);
        let model = poison_codebooks(model(&corpus, &ctx.device), &ctx.device);
        let config = TrainingConfig::new();
        let mut optimizer = create_optimizer::<B>(&config);
        let mut state = TrainState::new(config.kl_schedule());

        let result = train_epoch(
            model,
            &corpus,
            &mut optimizer,
            &mut ctx,
            &mut state,
            &config,
            &corpus.surf_vocab,
        );
        assert!(matches!(
            result,
            Err(ModelError::NonFiniteLoss { what: "training loss", .. })
        ));
        assert_eq!(state.updates, 0);
    }

    #[test]
    fn nan_validation_loss_is_reported() {
        let corpus = corpus(&[]);
        let mut ctx = ComputeContext::<NdArray>::new(Default::default(), 0);
        let device = Default::default();
        let model = poison_codebooks(model(&corpus, &device), &device).valid();

        let result = evaluate(
            &model,
            corpus.batches(Partition::Validation),
            Side::Target,
            &mut ctx,
            0.0,
            Reduction::Sum,
            &corpus.surf_vocab,
        );
        assert!(matches!(
            result,
            Err(ModelError::NonFiniteLoss { what: "evaluation loss", .. })
        ));
    }

    #[test]
    fn source_side_reconstructs_lemmas() {
        let corpus = corpus(&[]);
        let mut ctx = ComputeContext::<NdArray>::new(Default::default(), 0);
        let device = Default::default();
        let model = model(&corpus, &device).valid();
        let report = evaluate(
            &model,
            corpus.batches(Partition::LabeledSource),
            Side::Source,
            &mut ctx,
            0.0,
            Reduction::Sum,
            &corpus.surf_vocab,
        )
        .unwrap();
        assert_eq!(report.stats.words, 3);
        let dump: std::collections::BTreeMap<String, Vec<String>> =
            serde_json::from_str(&report.ledger.render_json().unwrap()).unwrap();
        let mut forms: Vec<String> = dump.into_values().flatten().collect();
        forms.sort();
        assert_eq!(forms, vec!["al", "gel", "git"]);
    }

    #[test]
    fn fit_writes_run_artifacts() {
        let device = Default::default();
        let corpus = corpus(&["gelir", "aldı"]);
        let mut ctx = ComputeContext::<B>::new(device, 0);
        let model = model(&corpus, &ctx.device);
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path());
        let config = TrainingConfig::new()
            .with_epochs(2)
            .with_shared_task_every(2)
            .with_dump_every(1)
            .with_decode(crate::inference::DecodePolicy::Greedy { max_len: 8 });

        let (_model, summary) = fit(model, &corpus, &config, &mut ctx, &run).unwrap();
        assert_eq!(summary.epochs, 2);
        assert_eq!(summary.updates, 2);
        assert!(summary.best_valid_loss.is_finite());
        assert!(summary.test_loss.is_some_and(f64::is_finite));
        assert_eq!(summary.shared_task.as_ref().map(|r| r.total), Some(1));

        assert!(dir.path().join("best.mpk").exists());
        assert!(dir.path().join("last.mpk").exists());
        assert!(dir.path().join("epoch_2.mpk").exists());
        assert!(dir.path().join("epoch_1").join("suffix_codes.json").exists());
        assert!(dir.path().join("epoch_2_TRUE.txt").exists());
    }
}
