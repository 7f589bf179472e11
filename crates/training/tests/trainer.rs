use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use asr_training::{
    data::{self, BatchSource},
    model::FrameClassifier,
    AcousticModel, Batch, DistributedContext, Phase, Trainer, TrainingConfig, TrainingError,
    VecBatchSource,
};
use candle_core::{DType, Device, Tensor};
use tempfile::tempdir;

const FEATURES: usize = 3;
const WINDOW: usize = 3;

fn write_config(dir: &Path, strategy: &str, runtime: &str, tail: &str) -> Result<TrainingConfig> {
    let path = dir.join("config.toml");
    fs::write(
        &path,
        format!(
            r#"
[model]
feature_dim = {FEATURES}
hidden_size = 8
num_labels = 4

[data]
train_manifest = "train.jsonl"
batch_size = 2
segment_frames = {WINDOW}

[optimizer]
algorithm = "sgdr"
learning_rate = 0.01

[scheduler]
t_max = 2

[runtime]
strategy = "{strategy}"
use_accelerator = false
num_epochs = 2
log_dir = "logs"
{runtime}

[runtime.distributed]
enabled = false

[runtime.logging]
tensorboard = false
log_file = false
{tail}
"#
        ),
    )?;
    Ok(TrainingConfig::load(&path)?)
}

fn write_decoder_files(dir: &Path) -> Result<String> {
    fs::write(dir.join("labels.txt"), "_\n|\na\nb\n")?;
    fs::write(dir.join("lexicon.txt"), "a\nb\nab\n")?;
    Ok("[decoder]\nlabels = \"labels.txt\"\nlexicon = \"lexicon.txt\"\n".to_string())
}

/// Whole-utterance batch: inputs are `[batch, max_len, features]`.
fn frame_batch(lengths: &[usize], labels: &[Vec<u32>], texts: Option<Vec<&str>>) -> Result<Batch> {
    let time = lengths.iter().copied().max().unwrap_or(1).max(1);
    let inputs = Tensor::randn(0f32, 1.0, (lengths.len(), time, FEATURES), &Device::Cpu)?;
    batch(inputs, lengths, labels, texts)
}

/// Windowed batch: one `[window, features]` segment per input frame.
fn segment_batch(lengths: &[usize], labels: &[Vec<u32>]) -> Result<Batch> {
    let segments: usize = lengths.iter().sum();
    let inputs = Tensor::randn(0f32, 1.0, (segments, WINDOW, FEATURES), &Device::Cpu)?;
    batch(inputs, lengths, labels, None)
}

fn batch(
    inputs: Tensor,
    lengths: &[usize],
    labels: &[Vec<u32>],
    texts: Option<Vec<&str>>,
) -> Result<Batch> {
    Ok(Batch::new(
        inputs,
        labels.concat(),
        lengths.to_vec(),
        labels.iter().map(Vec::len).collect(),
        (0..lengths.len()).map(|i| format!("utt{i}")).collect(),
        texts.map(|texts| texts.into_iter().map(str::to_string).collect()),
    )?)
}

fn weights(model: &dyn AcousticModel) -> Result<Vec<Vec<f32>>> {
    model
        .named_parameters()
        .into_iter()
        .map(|(_, var)| Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?))
        .collect()
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|entry| entry.path()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

#[test]
fn non_split_training_writes_epoch_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "non_split", "", "")?;
    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;
    let mut source = VecBatchSource::new(vec![
        frame_batch(&[4, 3], &[vec![2, 3], vec![2]], None)?,
        frame_batch(&[5, 5], &[vec![3, 2, 3], vec![2, 2]], None)?,
    ]);

    let first = trainer.train_epoch(&mut source)?;
    assert_eq!(first.epoch, 1);
    assert_eq!(first.batches, 2);
    assert_eq!(first.degraded_batches, 0);
    assert!(first.average_loss.is_finite() && first.average_loss > 0.0);

    let summary = trainer
        .validate(&mut source)?
        .expect("references are not empty");
    assert!(summary.percent >= 0.0);
    assert_eq!(trainer.phase(), Phase::Ready);

    trainer.train_epoch(&mut source)?;
    assert_eq!(trainer.epoch(), 2);
    assert_eq!(
        files_in(&config.runtime.log_dir),
        vec![trainer.epoch_checkpoint(1), trainer.epoch_checkpoint(2)]
    );
    Ok(())
}

#[test]
fn split_training_regroups_windows() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "split", "", "")?;
    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;
    let mut source = VecBatchSource::new(vec![
        segment_batch(&[3, 2], &[vec![2], vec![3]])?,
        segment_batch(&[4, 1], &[vec![2, 3], vec![1]])?,
    ]);

    let summary = trainer.train_epoch(&mut source)?;
    assert_eq!(summary.epoch, 1);
    assert_eq!(summary.degraded_batches, 0);
    assert!(trainer.validate(&mut source)?.is_some());
    Ok(())
}

#[test]
fn epoch_advances_when_every_loss_is_infinite() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "non_split", "", "")?;
    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;
    let before = weights(trainer.session().model())?;

    // A repeated label needs a blank between its copies: three frames, not two.
    let mut source = VecBatchSource::new(vec![frame_batch(&[2], &[vec![2, 2]], None)?]);
    let summary = trainer.train_epoch(&mut source)?;

    assert_eq!(trainer.epoch(), 1);
    assert_eq!(summary.degraded_batches, 1);
    assert_eq!(summary.average_loss, 0.0);
    assert_eq!(weights(trainer.session().model())?, before);
    Ok(())
}

#[test]
fn continuing_restores_the_session() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "non_split", "", "")?;
    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;
    let mut source = VecBatchSource::new(vec![frame_batch(&[4, 4], &[vec![2], vec![3, 2]], None)?]);
    trainer.train_epoch(&mut source)?;
    let checkpoint = trainer.epoch_checkpoint(1);

    let mut resumed_config = config.clone();
    resumed_config.runtime.continue_from = Some(checkpoint.clone());
    let resumed = Trainer::from_config(&resumed_config, DistributedContext::single_process())?;
    assert_eq!(resumed.epoch(), 1);
    assert_eq!(resumed.learning_rate(), trainer.learning_rate());
    assert_eq!(
        weights(resumed.session().model())?,
        weights(trainer.session().model())?
    );

    let mut fresh = Trainer::from_config(&config, DistributedContext::single_process())?;
    let restored = fresh.load(&checkpoint)?;
    assert_eq!(restored.epoch, 1);
    assert_eq!(fresh.epoch(), 1);
    Ok(())
}

#[test]
fn missing_checkpoint_fails_initialization() -> Result<()> {
    let dir = tempdir()?;
    let missing = dir.path().join("absent.safetensors");
    let mut config = write_config(dir.path(), "non_split", "", "")?;
    config.runtime.continue_from = Some(missing.clone());

    match Trainer::from_config(&config, DistributedContext::single_process()) {
        Err(TrainingError::CheckpointNotFound(path)) => assert_eq!(path, missing),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("trainer started without its checkpoint"),
    }
    Ok(())
}

#[test]
fn only_the_primary_rank_writes() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "non_split", "checkpoint = true", "")?;

    // Twelve batches: a checkpoint after batches 2, 4, 6, 8 and 10.
    let mut seen = Vec::new();
    for rank in 0..2 {
        let mut rank_config = config.clone();
        rank_config.runtime.log_dir = dir.path().join(format!("rank{rank}"));
        let mut trainer = Trainer::from_config(&rank_config, DistributedContext::simulated(rank, 2))?;
        assert_eq!(trainer.is_primary(), rank == 0);

        let batches = (0..12)
            .map(|_| frame_batch(&[3], &[vec![2]], None))
            .collect::<Result<Vec<_>>>()?;
        let mut source = ObservingSource {
            inner: VecBatchSource::new(batches),
            log_dir: rank_config.runtime.log_dir.clone(),
            seen: Vec::new(),
        };
        trainer.train_epoch(&mut source)?;
        trainer.validate(&mut source)?;
        assert_eq!(trainer.epoch(), 1);

        let files = files_in(&rank_config.runtime.log_dir);
        seen.push((source.seen, files, trainer.epoch_checkpoint(1)));
    }

    let (primary_seen, primary_files, primary_epoch_file) = &seen[0];
    assert_eq!(
        primary_seen[..13],
        [0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5]
    );
    // Validation runs after retention removed them.
    assert!(primary_seen[13..].iter().all(|&count| count == 0));
    assert_eq!(primary_files, &vec![primary_epoch_file.clone()]);

    let (secondary_seen, secondary_files, _) = &seen[1];
    assert!(secondary_seen.iter().all(|&count| count == 0));
    assert!(secondary_files.is_empty());
    Ok(())
}

/// Counts intra-epoch checkpoints on disk each time a batch is requested.
struct ObservingSource {
    inner: VecBatchSource,
    log_dir: PathBuf,
    seen: Vec<usize>,
}

impl BatchSource for ObservingSource {
    fn num_batches(&self) -> usize {
        self.inner.num_batches()
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.inner.set_epoch(epoch)
    }

    fn next_batch(&mut self) -> data::Result<Option<Batch>> {
        let intra = files_in(&self.log_dir)
            .iter()
            .filter(|path| path.to_string_lossy().contains("_ckpt_"))
            .count();
        self.seen.push(intra);
        self.inner.next_batch()
    }
}

#[test]
fn intra_epoch_checkpoints_are_retired_after_the_epoch() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "non_split", "checkpoint = true", "")?;
    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;

    let batches = (0..11)
        .map(|_| frame_batch(&[3, 2], &[vec![2], vec![3]], None))
        .collect::<Result<Vec<_>>>()?;
    let mut source = ObservingSource {
        inner: VecBatchSource::new(batches),
        log_dir: config.runtime.log_dir.clone(),
        seen: Vec::new(),
    };
    trainer.train_epoch(&mut source)?;

    // Eleven batches: a checkpoint after batches 2, 4, 6, 8 and 10.
    assert_eq!(source.seen, vec![0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5]);
    assert_eq!(
        files_in(&config.runtime.log_dir),
        vec![trainer.epoch_checkpoint(1)]
    );
    Ok(())
}

#[test]
fn test_pass_scores_words_and_transcribes() -> Result<()> {
    let dir = tempdir()?;
    let decoder = write_decoder_files(dir.path())?;
    let config = write_config(dir.path(), "non_split", "", &decoder)?;
    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;

    let mut source = VecBatchSource::new(vec![frame_batch(
        &[6, 4],
        &[vec![2, 1, 3], vec![2, 3]],
        Some(vec!["a b", "ab"]),
    )?]);
    let summary = trainer.test(&mut source)?.expect("transcripts have words");
    assert_eq!(summary.rate.reference_tokens, 3);

    let transcripts = trainer.transcribe(&mut source)?;
    let ids: Vec<&str> = transcripts.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["utt0", "utt1"]);
    assert_eq!(trainer.phase(), Phase::Ready);
    Ok(())
}

#[test]
fn test_pass_requires_a_decoder() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "non_split", "", "")?;
    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;
    let mut source = VecBatchSource::new(vec![frame_batch(&[3], &[vec![2]], Some(vec!["a"]))?]);
    assert!(trainer.test(&mut source).is_err());
    assert_eq!(trainer.phase(), Phase::Ready);
    Ok(())
}

#[test]
fn empty_references_leave_the_rate_undefined() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "non_split", "", "")?;
    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;
    let mut source = VecBatchSource::new(vec![frame_batch(&[3, 2], &[vec![], vec![]], None)?]);
    assert!(trainer.validate(&mut source)?.is_none());
    Ok(())
}

#[test]
fn half_precision_needs_an_accelerator() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "non_split", "precision = \"fp16\"", "")?;
    let model = FrameClassifier::new(FEATURES, 8, 4, DType::F32, &Device::Cpu)?;
    let result = Trainer::new(
        &config,
        Box::new(model),
        DistributedContext::single_process(),
        None,
    );
    assert!(matches!(result, Err(TrainingError::Initialization(_))));
    Ok(())
}

#[test]
fn manifest_loader_feeds_the_trainer() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), "split", "", "")?;
    let trainer = Trainer::from_config(&config, DistributedContext::single_process())?;

    let features: HashMap<String, Tensor> = HashMap::from([(
        data::FEATURES_TENSOR.to_string(),
        Tensor::ones((5, FEATURES), DType::F32, &Device::Cpu)?,
    )]);
    candle_core::safetensors::save(&features, dir.path().join("u0.safetensors"))?;
    fs::write(
        dir.path().join("train.jsonl"),
        "{\"id\": \"u0\", \"features\": \"u0.safetensors\", \"labels\": [2, 3]}\n",
    )?;

    let mut loader = trainer.manifest_loader(&config, &config.data.train_manifest, false)?;
    loader.set_epoch(0);
    let batch = loader.next_batch()?.expect("one utterance");
    // Five frames yield three full windows.
    assert_eq!(batch.input_lengths, vec![3]);
    assert_eq!(batch.inputs.dims(), &[3, WINDOW, FEATURES]);
    Ok(())
}
