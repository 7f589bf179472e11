//! The training orchestrator: epoch loop, evaluation passes and checkpoint
//! bookkeeping around one [`TrainingSession`].

mod strategy;

pub use strategy::{LossValue, Segmentation};

use std::path::{Path, PathBuf};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{fingerprint_config, CheckpointManager, Restore, Restored, Snapshot},
    config::Precision,
    data::{read_manifest, BatchSource, ManifestLoader, ShardSampler},
    decoder::{Decoder, GreedyCtcDecoder},
    distributed::{DistributedContext, ReplicatedModel},
    logging::{Logger, LoggingSettings, TEST_TAG, VALIDATE_TAG},
    loss::{CtcLoss, Reduction},
    metrics::{EpochSummary, ErrorRate, EvaluationSummary, MovingAverage},
    model::{canonical_parameters, AcousticModel, FrameClassifier, SegmentClassifier},
    optimizer::{GradientScaler, LossScaleConfig, OptimizerConfig, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Training,
    Validating,
    Testing,
}

/// Mutable state of one training run, owned by the [`Trainer`].
pub struct TrainingSession {
    pub(crate) epoch: usize,
    pub(crate) rank: Option<usize>,
    pub(crate) world_size: usize,
    pub(crate) model: Box<dyn AcousticModel>,
    pub(crate) optimizer: TrainerOptimizer,
    pub(crate) scheduler: Option<Box<dyn LRScheduler>>,
    pub(crate) scaler: GradientScaler,
    pub(crate) precision: Precision,
    pub(crate) loss: CtcLoss,
    pub(crate) max_norm: f64,
    pub(crate) distributed: bool,
}

impl TrainingSession {
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn rank(&self) -> Option<usize> {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn model(&self) -> &dyn AcousticModel {
        self.model.as_ref()
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> Option<&dyn LRScheduler> {
        self.scheduler.as_deref()
    }
}

/// Decoded words of one utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub id: String,
    pub words: Vec<String>,
}

pub struct Trainer {
    session: TrainingSession,
    strategy: Segmentation,
    primary: bool,
    checkpoints: CheckpointManager,
    intra_epoch_checkpoints: bool,
    logger: Logger,
    decoder: Option<Box<dyn Decoder>>,
    phase: Phase,
    global_step: usize,
}

impl Trainer {
    /// Builds the reference model for the configured strategy on the best
    /// available device, plus the greedy decoder when one is configured.
    pub fn from_config(
        config: &TrainingConfig,
        context: DistributedContext,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.use_accelerator, context.local_rank());
        if let Err(err) = device.set_seed(config.runtime.seed) {
            debug!("device RNG not seeded: {err}");
        }

        let dtype = model_dtype(config.runtime.precision);
        let strategy = Segmentation::from(config.runtime.strategy);
        let model: Box<dyn AcousticModel> = match strategy {
            Segmentation::NonSplit => Box::new(FrameClassifier::new(
                config.model.feature_dim,
                config.model.hidden_size,
                config.model.num_labels,
                dtype,
                &device,
            )?),
            Segmentation::Split => Box::new(SegmentClassifier::new(
                config.data.segment_frames,
                config.model.feature_dim,
                config.model.hidden_size,
                config.model.num_labels,
                dtype,
                &device,
            )?),
        };

        let decoder = match config.decoder.as_ref() {
            Some(decoder_config) => {
                let decoder = GreedyCtcDecoder::from_config(decoder_config)?;
                if decoder.num_labels() != config.model.num_labels {
                    return Err(TrainingError::initialization(format!(
                        "decoder has {} labels, model predicts {}",
                        decoder.num_labels(),
                        config.model.num_labels
                    )));
                }
                Some(Box::new(decoder) as Box<dyn Decoder>)
            }
            None => None,
        };

        Self::new(config, model, context, decoder)
    }

    /// Creates the session around `model`. A `continue_from` checkpoint is
    /// restored before the model is wrapped for data-parallel training.
    pub fn new(
        config: &TrainingConfig,
        model: Box<dyn AcousticModel>,
        mut context: DistributedContext,
        decoder: Option<Box<dyn Decoder>>,
    ) -> Result<Self, TrainingError> {
        let precision = config.runtime.precision;
        let device = model.device().clone();
        if precision == Precision::Fp16 && device.is_cpu() {
            return Err(TrainingError::initialization(
                "fp16 training requires an accelerator",
            ));
        }

        let mut optimizer = TrainerOptimizer::new(
            canonical_parameters(model.as_ref()),
            OptimizerConfig::from(&config.optimizer),
        )?;
        let mut scheduler =
            SchedulerConfig::from_training_config(&config.optimizer, &config.scheduler)
                .map(SchedulerConfig::build)
                .transpose()?;
        if let Some(scheduler) = scheduler.as_ref() {
            optimizer.set_learning_rate(scheduler.learning_rate());
        }
        let mut scaler = if config.runtime.dynamic_loss_scale {
            GradientScaler::dynamic(
                LossScaleConfig {
                    initial_scale: config.runtime.static_loss_scale,
                    ..LossScaleConfig::default()
                },
                precision,
            )
        } else {
            GradientScaler::fixed(precision, config.runtime.static_loss_scale)
        };

        let primary = context.is_primary();
        let checkpoints = CheckpointManager::new(
            &config.runtime.log_dir,
            config.runtime.model_prefix.clone(),
            device.clone(),
        )
        .with_config_fingerprint(fingerprint_config(config)?);

        let mut epoch = 0;
        if let Some(path) = config.runtime.continue_from.as_ref() {
            let restored = checkpoints.load(
                path,
                Restore {
                    model: model.as_ref(),
                    optimizer: &mut optimizer,
                    scheduler: scheduler.as_mut(),
                    scaler: &mut scaler,
                },
            )?;
            info!(path = %path.display(), epoch = restored.epoch, "continuing from checkpoint");
            epoch = restored.epoch;
        }

        let model: Box<dyn AcousticModel> = match context.take_group() {
            Some(group) => Box::new(ReplicatedModel::new(model, group)?),
            None => model,
        };

        let logger = if primary && config.runtime.logging.tensorboard {
            Logger::new(LoggingSettings::from_config(
                Some(config.runtime.log_dir.join("tensorboard")),
                config.runtime.logging.flush_every,
            ))?
        } else {
            Logger::disabled()
        };

        info!(
            rank = ?context.rank(),
            world_size = context.world_size(),
            strategy = ?config.runtime.strategy,
            precision = ?precision,
            device = ?device,
            "trainer ready"
        );

        Ok(Self {
            session: TrainingSession {
                epoch,
                rank: context.rank(),
                world_size: context.world_size(),
                model,
                optimizer,
                scheduler,
                scaler,
                precision,
                loss: CtcLoss::new(Reduction::MeanFrames),
                max_norm: config.optimizer.max_norm,
                distributed: context.is_distributed(),
            },
            strategy: Segmentation::from(config.runtime.strategy),
            primary,
            checkpoints,
            intra_epoch_checkpoints: config.runtime.checkpoint,
            logger,
            decoder,
            phase: Phase::Ready,
            global_step: 0,
        })
    }

    pub fn epoch(&self) -> usize {
        self.session.epoch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn strategy(&self) -> Segmentation {
        self.strategy
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn session(&self) -> &TrainingSession {
        &self.session
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn learning_rate(&self) -> f64 {
        self.session.optimizer.learning_rate()
    }

    /// One pass over `source`. The epoch counter advances by exactly one when
    /// the pass completes, whatever the batch losses were.
    pub fn train_epoch(
        &mut self,
        source: &mut dyn BatchSource,
    ) -> Result<EpochSummary, TrainingError> {
        self.enter(Phase::Training)?;
        let result = self.run_training(source);
        self.phase = Phase::Ready;
        result
    }

    /// Label error rate in percent, `None` when the references are empty.
    pub fn validate(
        &mut self,
        source: &mut dyn BatchSource,
    ) -> Result<Option<EvaluationSummary>, TrainingError> {
        self.enter(Phase::Validating)?;
        let result = self.run_evaluation(source, Phase::Validating);
        self.phase = Phase::Ready;
        result
    }

    /// Word error rate in percent, `None` when the references are empty.
    pub fn test(
        &mut self,
        source: &mut dyn BatchSource,
    ) -> Result<Option<EvaluationSummary>, TrainingError> {
        if self.decoder.is_none() {
            return Err(TrainingError::runtime("testing requires a decoder"));
        }
        self.enter(Phase::Testing)?;
        let result = self.run_evaluation(source, Phase::Testing);
        self.phase = Phase::Ready;
        result
    }

    /// Decodes every utterance of `source` into words.
    pub fn transcribe(
        &mut self,
        source: &mut dyn BatchSource,
    ) -> Result<Vec<Transcript>, TrainingError> {
        self.enter(Phase::Testing)?;
        let result = self.run_transcription(source);
        self.phase = Phase::Ready;
        result
    }

    /// Writes a checkpoint of the current session. Only the primary process
    /// writes; other ranks return without touching the filesystem.
    pub fn save(&self, path: &Path, extra: serde_json::Value) -> Result<(), TrainingError> {
        if !self.primary {
            return Ok(());
        }
        self.checkpoints.save(
            path,
            Snapshot {
                epoch: self.session.epoch,
                model: self.session.model.as_ref(),
                optimizer: &self.session.optimizer,
                scheduler: self.session.scheduler.as_deref(),
                scaler: &self.session.scaler,
                extra,
            },
        )
    }

    pub fn load(&mut self, path: &Path) -> Result<Restored, TrainingError> {
        if self.phase != Phase::Ready {
            return Err(TrainingError::runtime(format!(
                "cannot load a checkpoint while {:?}",
                self.phase
            )));
        }
        let session = &mut self.session;
        let restored = self.checkpoints.load(
            path,
            Restore {
                model: session.model.as_ref(),
                optimizer: &mut session.optimizer,
                scheduler: session.scheduler.as_mut(),
                scaler: &mut session.scaler,
            },
        )?;
        session.epoch = restored.epoch;
        Ok(restored)
    }

    fn enter(&mut self, phase: Phase) -> Result<(), TrainingError> {
        if self.phase != Phase::Ready {
            return Err(TrainingError::runtime(format!(
                "cannot start {phase:?} while {:?}",
                self.phase
            )));
        }
        self.phase = phase;
        Ok(())
    }

    fn run_training(
        &mut self,
        source: &mut dyn BatchSource,
    ) -> Result<EpochSummary, TrainingError> {
        self.session.model.set_training(true);
        if let Some(scheduler) = self.session.scheduler.as_mut() {
            let lr = scheduler.step();
            self.session.optimizer.set_learning_rate(lr);
        }
        let lr = self.session.optimizer.learning_rate();
        let epoch = self.session.epoch;
        source.set_epoch(epoch);

        let num_batches = source.num_batches();
        let interval = num_batches.div_ceil(10).max(1);
        let mut meter = MovingAverage::for_epoch(num_batches);
        let progress = self.progress_bar(num_batches);
        info!(epoch, num_batches, lr, "training epoch");

        let mut batches = 0usize;
        let mut degraded = 0usize;
        let mut total = 0.0f64;
        while let Some(batch) = source.next_batch()? {
            let step = self.strategy.unit_train(&mut self.session, &batch)?;
            if step.degraded {
                degraded += 1;
            }
            total += step.value;
            let running = meter.add(step.value);
            self.global_step += 1;
            progress.set_message(format!("training (loss: {running:.4})"));
            progress.inc(1);

            if batches > 0 && batches % interval == 0 {
                if self.primary {
                    self.logger.log_training_loss(self.global_step, running, lr);
                }
                if self.intra_epoch_checkpoints {
                    info!(epoch, batch = batches, loss = running, "running loss");
                    let path = self.checkpoints.intra_epoch_path(epoch, batches);
                    self.save(&path, serde_json::json!({ "batch": batches }))?;
                }
            }
            batches += 1;
        }
        progress.finish_and_clear();

        self.session.epoch += 1;
        let summary = EpochSummary {
            epoch: self.session.epoch,
            average_loss: if batches == 0 {
                0.0
            } else {
                total / batches as f64
            },
            batches,
            degraded_batches: degraded,
        };
        info!(
            epoch = summary.epoch,
            loss = summary.average_loss,
            batches,
            degraded,
            "epoch finished"
        );

        if self.primary {
            self.logger.log_epoch(&summary);
            self.logger.flush();
            let path = self.checkpoints.epoch_path(summary.epoch);
            self.save(&path, serde_json::json!({}))?;
            let removed = self.checkpoints.remove_intra_epoch(summary.epoch - 1)?;
            if removed > 0 {
                debug!(removed, epoch = summary.epoch - 1, "removed intra-epoch checkpoints");
            }
        }
        Ok(summary)
    }

    fn run_evaluation(
        &mut self,
        source: &mut dyn BatchSource,
        phase: Phase,
    ) -> Result<Option<EvaluationSummary>, TrainingError> {
        self.session.model.set_training(false);
        source.set_epoch(self.session.epoch);
        let (label, tag) = match phase {
            Phase::Testing => ("testing", TEST_TAG),
            _ => ("validating", VALIDATE_TAG),
        };
        let metric = if phase == Phase::Testing { "WER" } else { "LER" };
        let progress = self.progress_bar(source.num_batches());

        let mut rate = ErrorRate::default();
        while let Some(batch) = source.next_batch()? {
            let counts = match (phase, self.decoder.as_deref()) {
                (Phase::Testing, Some(decoder)) => {
                    self.strategy.unit_test(&self.session, decoder, &batch)?
                }
                _ => self.strategy.unit_validate(&self.session, &batch)?,
            };
            rate.update(counts.errors, counts.reference_tokens);
            if let Some(percent) = rate.percent() {
                progress.set_message(format!("{label} ({metric}: {percent:.2} %)"));
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        let Some(percent) = rate.percent() else {
            warn!(epoch = self.session.epoch, "no reference tokens; {metric} is undefined");
            return Ok(None);
        };
        let summary = EvaluationSummary {
            epoch: self.session.epoch,
            rate,
            percent,
        };
        info!(
            epoch = summary.epoch,
            errors = rate.errors,
            references = rate.reference_tokens,
            "{metric} {percent:.2} %"
        );
        if self.primary {
            self.logger.log_evaluation(tag, &summary);
            self.logger.flush();
        }
        Ok(Some(summary))
    }

    fn run_transcription(
        &mut self,
        source: &mut dyn BatchSource,
    ) -> Result<Vec<Transcript>, TrainingError> {
        let Some(decoder) = self.decoder.as_deref() else {
            return Err(TrainingError::runtime("transcription requires a decoder"));
        };
        self.session.model.set_training(false);
        source.set_epoch(self.session.epoch);

        let mut transcripts = Vec::new();
        while let Some(batch) = source.next_batch()? {
            let hypotheses = self.strategy.decode(&self.session, decoder, &batch)?;
            for (id, words) in batch.identifiers.iter().zip(hypotheses) {
                transcripts.push(Transcript {
                    id: id.clone(),
                    words: words
                        .into_iter()
                        .map(|index| decoder.word(index).unwrap_or("<unk>").to_string())
                        .collect(),
                });
            }
        }
        Ok(transcripts)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.primary {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{bar:40.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}")
        {
            bar.set_style(style);
        }
        bar
    }

    /// Path of the checkpoint written at the end of `epoch`.
    pub fn epoch_checkpoint(&self, epoch: usize) -> PathBuf {
        self.checkpoints.epoch_path(epoch)
    }

    /// Batches from `manifest`, collated for this trainer's strategy and
    /// sharded for this process.
    pub fn manifest_loader(
        &self,
        config: &TrainingConfig,
        manifest: &Path,
        shuffle: bool,
    ) -> Result<ManifestLoader, TrainingError> {
        let utterances = read_manifest(manifest)?;
        info!(manifest = %manifest.display(), utterances = utterances.len(), "loaded manifest");
        let sampler = ShardSampler::new(
            utterances.len(),
            self.session.rank.unwrap_or(0),
            self.session.world_size,
            shuffle,
            config.runtime.seed,
        );
        ManifestLoader::new(
            utterances,
            config.data.batch_size,
            self.strategy.collation(&config.data),
            sampler,
            self.session.model.device().clone(),
        )
    }
}

fn model_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Fp32 => DType::F32,
        Precision::Fp16 => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}

/// Metal, then CUDA at the process's local rank, then the CPU.
pub fn select_device(use_accelerator: bool, local_rank: usize) -> Device {
    if !use_accelerator {
        return Device::Cpu;
    }
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("using Metal GPU #0");
                return device;
            }
            Err(err) => warn!("failed to initialize metal device, falling back: {err}"),
        }
    }
    if cuda_is_available() {
        match Device::new_cuda(local_rank) {
            Ok(device) => {
                info!("using CUDA GPU #{local_rank}");
                return device;
            }
            Err(err) => warn!("cuda reported available but initialization failed: {err}"),
        }
    }
    info!("no GPU backend available; using CPU");
    Device::Cpu
}
