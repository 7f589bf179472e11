//! Single-file training checkpoints.
//!
//! A checkpoint is one safetensors file holding the model weights under
//! `model.<param>`, optimizer buffers under `optimizer.<param>.<buffer>` and
//! everything else as JSON strings in the file metadata. Files are written to
//! a hidden sibling and renamed into place, so the canonical path never holds
//! a partial checkpoint.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor};
use hex::encode as hex_encode;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    config::{
        ModelConfig, OptimizerConfig as OptimizerSettings, Precision,
        SchedulerConfig as SchedulerSettings, StrategyKind,
    },
    model::{canonical_parameters, AcousticModel},
    optimizer::{
        Algorithm, GradientScaler, GradientScalerState, OptimizerState, ParameterState,
        TrainerOptimizer,
    },
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_FORMAT: &str = "asr-training";
pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_EXTENSION: &str = "safetensors";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

const KEY_FORMAT: &str = "format";
const KEY_VERSION: &str = "version";
const KEY_EPOCH: &str = "epoch";
const KEY_OPTIMIZER: &str = "optimizer";
const KEY_SCHEDULER: &str = "lr_scheduler";
const KEY_SCALER: &str = "loss_scaler";
const KEY_EXTRA: &str = "extra";
const KEY_CONFIG: &str = "config_sha256";

/// Everything a checkpoint captures, borrowed from the live session.
pub struct Snapshot<'a> {
    pub epoch: usize,
    pub model: &'a dyn AcousticModel,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: Option<&'a dyn LRScheduler>,
    pub scaler: &'a GradientScaler,
    pub extra: serde_json::Value,
}

/// Live session state a checkpoint is restored into.
pub struct Restore<'a> {
    pub model: &'a dyn AcousticModel,
    pub optimizer: &'a mut TrainerOptimizer,
    pub scheduler: Option<&'a mut Box<dyn LRScheduler>>,
    pub scaler: &'a mut GradientScaler,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub epoch: usize,
    pub extra: serde_json::Value,
    pub config_sha256: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OptimizerHeader {
    algorithm: Algorithm,
    step: usize,
    learning_rate: f64,
    parameters: Vec<ParameterHeader>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ParameterHeader {
    name: String,
    shape: Vec<usize>,
    second_moment: bool,
    master: bool,
}

pub struct CheckpointManager {
    log_dir: PathBuf,
    prefix: String,
    device: Device,
    config_sha256: Option<String>,
}

impl CheckpointManager {
    pub fn new(log_dir: impl Into<PathBuf>, prefix: impl Into<String>, device: Device) -> Self {
        Self {
            log_dir: log_dir.into(),
            prefix: prefix.into(),
            device,
            config_sha256: None,
        }
    }

    /// Stamps saved files with the configuration they were trained under.
    pub fn with_config_fingerprint(mut self, fingerprint: String) -> Self {
        self.config_sha256 = Some(fingerprint);
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// `<log_dir>/<prefix>_epoch_<NNN>.safetensors`
    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.log_dir.join(format!(
            "{}_epoch_{epoch:03}.{CHECKPOINT_EXTENSION}",
            self.prefix
        ))
    }

    /// `<log_dir>/<prefix>_epoch_<NNN>_ckpt_<NNNNNNN>.safetensors`
    pub fn intra_epoch_path(&self, epoch: usize, batch: usize) -> PathBuf {
        self.log_dir.join(format!(
            "{}_epoch_{epoch:03}_ckpt_{batch:07}.{CHECKPOINT_EXTENSION}",
            self.prefix
        ))
    }

    pub fn save(&self, path: &Path, snapshot: Snapshot<'_>) -> Result<(), TrainingError> {
        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        for (name, var) in canonical_parameters(snapshot.model) {
            tensors.push((format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()));
        }

        let optimizer_state = snapshot.optimizer.state()?;
        let mut parameters = Vec::with_capacity(optimizer_state.parameters.len());
        for param in optimizer_state.parameters {
            let shape = param.shape.as_slice();
            let key = |buffer: &str| format!("{OPTIMIZER_PREFIX}{}.{buffer}", param.name);
            tensors.push((
                key("first_moment"),
                Tensor::from_vec(param.first_moment, shape, &Device::Cpu)?,
            ));
            let second_moment = param.second_moment.is_some();
            if let Some(values) = param.second_moment {
                tensors.push((
                    key("second_moment"),
                    Tensor::from_vec(values, shape, &Device::Cpu)?,
                ));
            }
            let master = param.master.is_some();
            if let Some(values) = param.master {
                tensors.push((key("master"), Tensor::from_vec(values, shape, &Device::Cpu)?));
            }
            parameters.push(ParameterHeader {
                name: param.name,
                shape: param.shape,
                second_moment,
                master,
            });
        }
        let header = OptimizerHeader {
            algorithm: optimizer_state.algorithm,
            step: optimizer_state.step,
            learning_rate: optimizer_state.learning_rate,
            parameters,
        };

        let mut metadata = HashMap::new();
        metadata.insert(KEY_FORMAT.to_string(), CHECKPOINT_FORMAT.to_string());
        metadata.insert(KEY_VERSION.to_string(), CHECKPOINT_VERSION.to_string());
        metadata.insert(KEY_EPOCH.to_string(), snapshot.epoch.to_string());
        metadata.insert(KEY_OPTIMIZER.to_string(), serde_json::to_string(&header)?);
        if let Some(scheduler) = snapshot.scheduler {
            metadata.insert(
                KEY_SCHEDULER.to_string(),
                serde_json::to_string(&scheduler.snapshot())?,
            );
        }
        metadata.insert(
            KEY_SCALER.to_string(),
            serde_json::to_string(&snapshot.scaler.state())?,
        );
        metadata.insert(KEY_EXTRA.to_string(), serde_json::to_string(&snapshot.extra)?);
        if let Some(fingerprint) = self.config_sha256.as_ref() {
            metadata.insert(KEY_CONFIG.to_string(), fingerprint.clone());
        }

        let bytes = safetensors::serialize(tensors, &Some(metadata))?;
        write_atomically(path, &bytes)?;
        debug!(path = %path.display(), epoch = snapshot.epoch, "saved checkpoint");
        Ok(())
    }

    /// Reads and checks the whole file against `target` first; nothing in
    /// `target` changes unless every part of the checkpoint fits.
    pub fn load(&self, path: &Path, target: Restore<'_>) -> Result<Restored, TrainingError> {
        if !path.is_file() {
            return Err(TrainingError::CheckpointNotFound(path.to_path_buf()));
        }
        let bytes = fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let field = |key: &str| {
            metadata.get(key).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "{} is missing checkpoint field '{key}'",
                    path.display()
                ))
            })
        };
        if field(KEY_FORMAT)? != CHECKPOINT_FORMAT {
            return Err(TrainingError::runtime(format!(
                "{} is not a training checkpoint",
                path.display()
            )));
        }
        let version: u32 = field(KEY_VERSION)?.parse().map_err(|_| {
            TrainingError::runtime(format!("{} has an invalid version", path.display()))
        })?;
        if version != CHECKPOINT_VERSION {
            return Err(TrainingError::runtime(format!(
                "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
            )));
        }
        let epoch: usize = field(KEY_EPOCH)?.parse().map_err(|_| {
            TrainingError::runtime(format!("{} has an invalid epoch", path.display()))
        })?;
        let optimizer_header: OptimizerHeader = serde_json::from_str(field(KEY_OPTIMIZER)?)?;
        let scheduler_state: Option<SchedulerState> = metadata
            .get(KEY_SCHEDULER)
            .map(|json| serde_json::from_str(json))
            .transpose()?;
        let scaler_state: GradientScalerState = serde_json::from_str(field(KEY_SCALER)?)?;
        let extra: serde_json::Value = match metadata.get(KEY_EXTRA) {
            Some(json) => serde_json::from_str(json)?,
            None => serde_json::Value::Null,
        };

        let mut tensors = candle_core::safetensors::load_buffer(&bytes, &self.device)?;

        let mut weights = Vec::new();
        for (name, var) in canonical_parameters(target.model) {
            let key = format!("{MODEL_PREFIX}{name}");
            let tensor = tensors.remove(&key).ok_or_else(|| {
                TrainingError::runtime(format!("checkpoint missing parameter {name}"))
            })?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(TrainingError::runtime(format!(
                    "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
            let tensor = if tensor.dtype() == var.as_tensor().dtype() {
                tensor
            } else {
                tensor.to_dtype(var.as_tensor().dtype())?
            };
            weights.push((var, tensor));
        }
        let mut unused: Vec<&str> = tensors
            .keys()
            .filter(|key| key.starts_with(MODEL_PREFIX))
            .map(String::as_str)
            .collect();
        if !unused.is_empty() {
            unused.sort_unstable();
            return Err(TrainingError::runtime(format!(
                "checkpoint contains unused parameters: {}",
                unused.join(", ")
            )));
        }

        let optimizer_state = optimizer_from_parts(optimizer_header, &mut tensors)?;
        target.optimizer.validate_state(&optimizer_state)?;

        match (&scheduler_state, target.scheduler.as_ref()) {
            (Some(saved), Some(live)) if saved.kind() != live.snapshot().kind() => {
                return Err(TrainingError::runtime(format!(
                    "checkpoint holds {} scheduler state, trainer uses {}",
                    saved.kind(),
                    live.snapshot().kind()
                )));
            }
            (Some(_), None) => {
                return Err(TrainingError::runtime(
                    "checkpoint includes scheduler state but trainer has no scheduler",
                ));
            }
            (None, Some(_)) => {
                warn!("checkpoint has no scheduler state; schedule restarts from its first epoch");
            }
            _ => {}
        }

        let config_sha256 = metadata.get(KEY_CONFIG).cloned();
        if let (Some(saved), Some(current)) = (config_sha256.as_ref(), self.config_sha256.as_ref()) {
            if saved != current {
                warn!(
                    path = %path.display(),
                    "checkpoint was written under a different training configuration"
                );
            }
        }

        for (var, tensor) in weights {
            var.set(&tensor)?;
        }
        target.optimizer.load_state(optimizer_state)?;
        if let (Some(state), Some(scheduler)) = (scheduler_state, target.scheduler) {
            scheduler.load_snapshot(&state)?;
        }
        target.scaler.load_state(scaler_state);

        debug!(path = %path.display(), epoch, "restored checkpoint");
        Ok(Restored {
            epoch,
            extra,
            config_sha256,
        })
    }

    /// Deletes every intra-epoch file of `epoch` below the log directory and
    /// returns how many were removed.
    pub fn remove_intra_epoch(&self, epoch: usize) -> Result<usize, TrainingError> {
        let pattern = format!(
            "{}/**/{}_epoch_{epoch:03}_ckpt_*",
            glob::Pattern::escape(&self.log_dir.to_string_lossy()),
            glob::Pattern::escape(&self.prefix)
        );
        let entries = glob::glob(&pattern)
            .map_err(|err| TrainingError::runtime(format!("invalid retention pattern: {err}")))?;
        let mut removed = 0;
        for entry in entries {
            let path = entry
                .map_err(|err| TrainingError::runtime(format!("failed to scan log directory: {err}")))?;
            if path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn optimizer_from_parts(
    header: OptimizerHeader,
    tensors: &mut HashMap<String, Tensor>,
) -> Result<OptimizerState, TrainingError> {
    let mut parameters = Vec::with_capacity(header.parameters.len());
    for param in header.parameters {
        let mut take = |buffer: &str| -> Result<Vec<f32>, TrainingError> {
            let key = format!("{OPTIMIZER_PREFIX}{}.{buffer}", param.name);
            let tensor = tensors.remove(&key).ok_or_else(|| {
                TrainingError::runtime(format!("checkpoint missing optimizer buffer {key}"))
            })?;
            Ok(tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
        };
        let first_moment = take("first_moment")?;
        let second_moment = if param.second_moment {
            Some(take("second_moment")?)
        } else {
            None
        };
        let master = if param.master {
            Some(take("master")?)
        } else {
            None
        };
        parameters.push(ParameterState {
            name: param.name,
            shape: param.shape,
            first_moment,
            second_moment,
            master,
        });
    }
    Ok(OptimizerState {
        algorithm: header.algorithm,
        step: header.step,
        learning_rate: header.learning_rate,
        parameters,
    })
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), TrainingError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            parent.display()
        ))
    })?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!("invalid checkpoint path {}", path.display()))
        })?;
    let staging = parent.join(format!(".{file_name}.tmp"));

    let written = File::create(&staging).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    let result = written.and_then(|_| fs::rename(&staging, path));
    if let Err(err) = result {
        let _ = fs::remove_file(&staging);
        return Err(TrainingError::runtime(format!(
            "failed to write checkpoint {}: {err}",
            path.display()
        )));
    }
    Ok(())
}

/// Settings that change what training produces. Paths, the epoch budget and
/// the resume source stay out so a resumed run keeps its fingerprint.
#[derive(Serialize)]
struct Fingerprinted<'a> {
    model: &'a ModelConfig,
    optimizer: &'a OptimizerSettings,
    scheduler: &'a SchedulerSettings,
    strategy: StrategyKind,
    precision: Precision,
    segment_frames: usize,
    segment_stride: usize,
    seed: u64,
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let fingerprinted = Fingerprinted {
        model: &config.model,
        optimizer: &config.optimizer,
        scheduler: &config.scheduler,
        strategy: config.runtime.strategy,
        precision: config.runtime.precision,
        segment_frames: config.data.segment_frames,
        segment_stride: config.data.segment_stride,
        seed: config.runtime.seed,
    };
    let json = serde_json::to_vec(&fingerprinted)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}
