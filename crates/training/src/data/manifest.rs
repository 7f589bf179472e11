use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{safetensors, DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;

use super::{Batch, BatchSource, Result};
use crate::{align, TrainingError};

/// Name of the `[frames, features]` tensor inside each feature file.
pub const FEATURES_TENSOR: &str = "features";

/// One line of a JSON-lines manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Utterance {
    pub id: String,
    pub features: PathBuf,
    pub labels: Vec<u32>,
    #[serde(default)]
    pub text: Option<String>,
}

pub fn read_manifest(path: &Path) -> Result<Vec<Utterance>> {
    let contents = fs::read_to_string(path).map_err(|err| {
        TrainingError::initialization(format!("failed to read manifest {}: {err}", path.display()))
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut utterances = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut utterance: Utterance = serde_json::from_str(line).map_err(|err| {
            TrainingError::initialization(format!(
                "{}:{}: invalid manifest entry: {err}",
                path.display(),
                line_no + 1
            ))
        })?;
        if utterance.features.is_relative() {
            utterance.features = base.join(&utterance.features);
        }
        utterances.push(utterance);
    }
    Ok(utterances)
}

/// How utterance features become model inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collation {
    /// `[batch, max_frames, features]`, zero padded; input length is the
    /// frame count.
    Frames,
    /// Every utterance cut into overlapping windows, all windows of the batch
    /// stacked as `[segments, window, features]`; input length is the window
    /// count. Utterances shorter than one window get no segments.
    Segments { window: usize, stride: usize },
}

impl Collation {
    pub fn segment_count(self, frames: usize) -> usize {
        match self {
            Collation::Frames => frames,
            Collation::Segments { window, stride } => {
                if frames < window {
                    0
                } else {
                    (frames - window) / stride + 1
                }
            }
        }
    }
}

/// Partitions a dataset across processes. Each epoch the full index list is
/// shuffled with `seed + epoch`, padded by wrapping around until it divides
/// evenly, and rank `r` takes every `world_size`-th index starting at `r`, so
/// every process runs the same number of batches.
#[derive(Debug, Clone)]
pub struct ShardSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
}

impl ShardSampler {
    pub fn new(len: usize, rank: usize, world_size: usize, shuffle: bool, seed: u64) -> Self {
        let world_size = world_size.max(1);
        Self {
            len,
            rank: rank.min(world_size - 1),
            world_size,
            shuffle,
            seed,
        }
    }

    pub fn per_rank(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        let total = self.per_rank() * self.world_size;
        let padding: Vec<usize> = order.iter().copied().cycle().take(total - self.len).collect();
        order.extend(padding);
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

pub struct ManifestLoader {
    utterances: Vec<Utterance>,
    batch_size: usize,
    collation: Collation,
    sampler: ShardSampler,
    device: Device,
    order: Vec<usize>,
    cursor: usize,
}

impl ManifestLoader {
    pub fn new(
        utterances: Vec<Utterance>,
        batch_size: usize,
        collation: Collation,
        sampler: ShardSampler,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if let Collation::Segments { window, stride } = collation {
            if window == 0 || stride == 0 {
                return Err(TrainingError::initialization(
                    "segment window and stride must be greater than zero",
                ));
            }
        }
        let order = sampler.indices(0);
        Ok(Self {
            utterances,
            batch_size,
            collation,
            sampler,
            device,
            order,
            cursor: 0,
        })
    }

    fn load_features(&self, utterance: &Utterance) -> Result<Tensor> {
        let mut tensors = safetensors::load(&utterance.features, &Device::Cpu).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to load features {}: {err}",
                utterance.features.display()
            ))
        })?;
        let features = tensors.remove(FEATURES_TENSOR).ok_or_else(|| {
            TrainingError::runtime(format!(
                "{} has no '{FEATURES_TENSOR}' tensor",
                utterance.features.display()
            ))
        })?;
        if features.rank() != 2 {
            return Err(TrainingError::runtime(format!(
                "{} features must be [frames, features], got {:?}",
                utterance.features.display(),
                features.dims()
            )));
        }
        Ok(features.to_dtype(DType::F32)?)
    }

    fn collate(&self, members: &[&Utterance]) -> Result<Batch> {
        let features = members
            .iter()
            .map(|utterance| self.load_features(utterance))
            .collect::<Result<Vec<_>>>()?;
        let frames: Vec<usize> = features.iter().map(|f| f.dim(0)).collect::<candle_core::Result<_>>()?;
        let input_lengths: Vec<usize> = frames
            .iter()
            .map(|&count| self.collation.segment_count(count))
            .collect();

        let inputs = match self.collation {
            Collation::Frames => {
                let max_frames = frames.iter().copied().max().unwrap_or(0).max(1);
                align::pad_to(&features, max_frames)?
            }
            Collation::Segments { window, stride } => {
                let feature_dim = features.first().map(|f| f.dim(1)).transpose()?.unwrap_or(0);
                let mut windows = Vec::new();
                for (utterance, &count) in features.iter().zip(&input_lengths) {
                    for segment in 0..count {
                        windows.push(utterance.narrow(0, segment * stride, window)?);
                    }
                }
                if windows.is_empty() {
                    Tensor::zeros((0, window, feature_dim), DType::F32, &Device::Cpu)?
                } else {
                    Tensor::stack(&windows, 0)?
                }
            }
        };

        let targets: Vec<u32> = members
            .iter()
            .flat_map(|utterance| utterance.labels.iter().copied())
            .collect();
        let target_lengths = members.iter().map(|u| u.labels.len()).collect();
        let identifiers = members.iter().map(|u| u.id.clone()).collect();
        let texts = members
            .iter()
            .map(|u| u.text.clone())
            .collect::<Option<Vec<String>>>();

        Batch::new(
            inputs.to_device(&self.device)?,
            targets,
            input_lengths,
            target_lengths,
            identifiers,
            texts,
        )
    }
}

impl BatchSource for ManifestLoader {
    fn num_batches(&self) -> usize {
        self.sampler.per_rank().div_ceil(self.batch_size)
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.order = self.sampler.indices(epoch);
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let members: Vec<&Utterance> = self.order[self.cursor..end]
            .iter()
            .map(|&index| &self.utterances[index])
            .collect();
        let batch = self.collate(&members)?;
        self.cursor = end;
        Ok(Some(batch))
    }
}
