pub mod align;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod decoder;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod scoring;
pub mod trainer;

pub use checkpoint::CheckpointManager;
pub use config::TrainingConfig;
pub use data::{Batch, BatchSource, ManifestLoader, VecBatchSource};
pub use decoder::{Decoder, DecoderOutput, GreedyCtcDecoder};
pub use distributed::DistributedContext;
pub use error::{Result, TrainingError};
pub use loss::{CtcLoss, LossOutput};
pub use metrics::{EpochSummary, ErrorRate, EvaluationSummary};
pub use model::AcousticModel;
pub use optimizer::{OptimizerConfig, OptimizerState, TrainerOptimizer};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::{LossValue, Phase, Segmentation, Trainer, Transcript};
