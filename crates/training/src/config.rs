use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::TrainingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub decoder: Option<DecoderConfig>,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.feature_dim == 0 {
            errors.push("model.feature_dim must be greater than 0".to_string());
        }

        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        if self.model.num_labels < 2 {
            errors.push("model.num_labels must include the blank and at least one label".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.runtime.strategy == StrategyKind::Split {
            if self.data.segment_frames == 0 {
                errors.push("data.segment_frames must be greater than 0".to_string());
            }
            if self.data.segment_stride == 0 {
                errors.push("data.segment_stride must be greater than 0".to_string());
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.max_norm <= 0.0 {
            errors.push("optimizer.max_norm must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.scheduler.t_max == 0 {
            errors.push("scheduler.t_max must be greater than 0".to_string());
        }

        if self.scheduler.t_mult == 0 {
            errors.push("scheduler.t_mult must be greater than 0".to_string());
        }

        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }

        if self.runtime.num_epochs == 0 {
            errors.push("runtime.num_epochs must be greater than 0".to_string());
        }

        if self.runtime.model_prefix.trim().is_empty() {
            errors.push("runtime.model_prefix must not be empty".to_string());
        }

        if self.runtime.static_loss_scale <= 0.0 {
            errors.push("runtime.static_loss_scale must be greater than 0".to_string());
        }

        if self.runtime.distributed.timeout_secs == 0 {
            errors.push("runtime.distributed.timeout_secs must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.apply_base_path(base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    pub num_labels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_manifest: PathBuf,
    #[serde(default)]
    pub validation_manifest: Option<PathBuf>,
    #[serde(default)]
    pub test_manifest: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Frames per window when utterances are cut into fixed segments.
    #[serde(default = "default_segment_frames")]
    pub segment_frames: usize,
    #[serde(default = "default_segment_stride")]
    pub segment_stride: usize,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_manifest, base);
        for path in [
            self.validation_manifest.as_mut(),
            self.test_manifest.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_norm")]
    pub max_norm: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_norm: default_max_norm(),
        }
    }
}

/// `sgd` pairs momentum SGD with cosine annealing, `sgdr` adds warm restarts,
/// `adamw` runs without a schedule.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Sgd,
    #[default]
    Sgdr,
    #[serde(rename = "adamw", alias = "adam")]
    AdamW,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_t_max")]
    pub t_max: usize,
    #[serde(default = "default_t_mult")]
    pub t_mult: usize,
    #[serde(default)]
    pub min_lr: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            t_max: default_t_max(),
            t_mult: default_t_mult(),
            min_lr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_true")]
    pub use_accelerator: bool,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_model_prefix")]
    pub model_prefix: String,
    /// Save intra-epoch checkpoints every tenth of an epoch.
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default)]
    pub continue_from: Option<PathBuf>,
    #[serde(default = "default_static_loss_scale")]
    pub static_loss_scale: f32,
    #[serde(default)]
    pub dynamic_loss_scale: bool,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            precision: Precision::default(),
            use_accelerator: true,
            strategy: StrategyKind::default(),
            num_epochs: default_num_epochs(),
            log_dir: default_log_dir(),
            model_prefix: default_model_prefix(),
            checkpoint: false,
            continue_from: None,
            static_loss_scale: default_static_loss_scale(),
            dynamic_loss_scale: false,
            distributed: DistributedConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.log_dir, base);
        if let Some(path) = self.continue_from.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    NonSplit,
    Split,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub init: InitMethod,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init: InitMethod::default(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Which launcher's environment variables carry rank and world size.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InitMethod {
    #[default]
    Slurm,
    Ompi,
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub tensorboard: bool,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    #[serde(default = "default_true")]
    pub log_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            tensorboard: true,
            flush_every: default_flush_every(),
            log_file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// One label per line; line 0 is the blank.
    pub labels: PathBuf,
    /// One word per line; the line number is the word id.
    pub lexicon: PathBuf,
    #[serde(default = "default_word_separator")]
    pub word_separator: String,
    #[serde(default = "default_unknown_word")]
    pub unknown_word: String,
}

impl DecoderConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.labels, base);
        absolutize_in_place(&mut self.lexicon, base);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn is_reduced(self) -> bool {
        !matches!(self, Precision::Fp32)
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_feature_dim() -> usize {
    40
}

fn default_hidden_size() -> usize {
    256
}

fn default_batch_size() -> usize {
    8
}

fn default_segment_frames() -> usize {
    21
}

fn default_segment_stride() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_momentum() -> f64 {
    0.9
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_max_norm() -> f64 {
    400.0
}

fn default_t_max() -> usize {
    5
}

fn default_t_mult() -> usize {
    2
}

fn default_seed() -> u64 {
    42
}

fn default_num_epochs() -> usize {
    100
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_model_prefix() -> String {
    "model".to_string()
}

fn default_static_loss_scale() -> f32 {
    128.0
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_flush_every() -> usize {
    10
}

fn default_word_separator() -> String {
    "|".to_string()
}

fn default_unknown_word() -> String {
    "<unk>".to_string()
}

/// A `key.path=value` patch applied to the serialized configuration, as
/// given on the command line. Values are read as JSON scalars where they
/// parse as one and as strings otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: Vec<String>,
    pub value: serde_json::Value,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        let path: Vec<String> = path.trim().split('.').map(str::to_string).collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return Err(format!("invalid override key '{s}'"));
        }
        Ok(Self {
            path,
            value: parse_override_value(value),
        })
    }
}

impl TrainingConfig {
    pub fn with_overrides(self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut value = serde_json::to_value(&self)?;
        for patch in overrides {
            assign_at_path(&mut value, &patch.path, patch.value.clone())?;
        }
        let config: TrainingConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_override_value(raw: &str) -> serde_json::Value {
    use serde_json::Value;

    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::from(int_val);
    }
    if let Some(number) = trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
    {
        return Value::Number(number);
    }
    Value::String(trimmed.to_string())
}

fn assign_at_path(
    target: &mut serde_json::Value,
    path: &[String],
    new_value: serde_json::Value,
) -> Result<(), TrainingError> {
    use serde_json::{Map, Value};

    let Some((last, parents)) = path.split_last() else {
        return Err(TrainingError::ConfigFormat("override path must not be empty".into()));
    };
    let not_a_table = |key: &str| {
        TrainingError::ConfigFormat(format!("override path segment '{key}' is not a table"))
    };

    let mut current = target;
    for key in parents {
        let map = current.as_object_mut().ok_or_else(|| not_a_table(key))?;
        let entry = map.entry(key.clone()).or_insert(Value::Null);
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
    current
        .as_object_mut()
        .ok_or_else(|| not_a_table(last))?
        .insert(last.clone(), new_value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> TrainingConfig {
        toml::from_str(
            r#"
            [model]
            num_labels = 5

            [data]
            train_manifest = "train.jsonl"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_follow_sgdr_recipe() {
        let config = minimal();
        assert_eq!(config.optimizer.algorithm, OptimizerType::Sgdr);
        assert_eq!(config.optimizer.max_norm, 400.0);
        assert_eq!(config.scheduler.t_max, 5);
        assert_eq!(config.scheduler.t_mult, 2);
        assert_eq!(config.runtime.strategy, StrategyKind::NonSplit);
        assert!(!config.runtime.checkpoint);
        config.validate().unwrap();
    }

    #[test]
    fn collects_every_violation() {
        let mut config = minimal();
        config.data.batch_size = 0;
        config.optimizer.learning_rate = 0.0;
        config.model.num_labels = 1;
        match config.validate() {
            Err(TrainingError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn resolves_relative_paths_against_config_dir() {
        let mut config = minimal();
        config.apply_base_path(Path::new("/srv/run"));
        assert_eq!(config.data.train_manifest, PathBuf::from("/srv/run/train.jsonl"));
        assert_eq!(config.runtime.log_dir, PathBuf::from("/srv/run/logs"));
    }

    #[test]
    fn overrides_patch_nested_values() {
        let overrides: Vec<ConfigOverride> = [
            "optimizer.algorithm=adamw",
            "optimizer.learning_rate=3e-4",
            "runtime.distributed.enabled=false",
            "runtime.strategy=split",
        ]
        .iter()
        .map(|raw| raw.parse().unwrap())
        .collect();
        let config = minimal().with_overrides(&overrides).unwrap();
        assert_eq!(config.optimizer.algorithm, OptimizerType::AdamW);
        assert_eq!(config.optimizer.learning_rate, 3e-4);
        assert!(!config.runtime.distributed.enabled);
        assert_eq!(config.runtime.strategy, StrategyKind::Split);
    }

    #[test]
    fn overrides_are_validated() {
        let patch: ConfigOverride = "data.batch_size=0".parse().unwrap();
        assert!(minimal().with_overrides(&[patch]).is_err());
        assert!("batch_size".parse::<ConfigOverride>().is_err());
        assert!("data..batch_size=1".parse::<ConfigOverride>().is_err());
    }
}
