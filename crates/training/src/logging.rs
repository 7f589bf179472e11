use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing::warn;
use tracing_subscriber::{
    fmt::{
        self,
        format::{DefaultFields, Format},
    },
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::{
    distributed::DistributedContext,
    metrics::{EpochSummary, EvaluationSummary},
    TrainingError,
};

pub const TRAIN_LOSS_TAG: &str = "train/loss";
pub const VALIDATE_TAG: &str = "validate/ler";
pub const TEST_TAG: &str = "test/wer";

type FileLayer = fmt::Layer<Registry, DefaultFields, Format, Mutex<File>>;

/// Installs the global subscriber on stderr. `RUST_LOG` overrides the default
/// `info` filter. The plain-text log file is attached later through the
/// returned handle, once the process knows its rank. Calling this twice keeps
/// the first subscriber and returns an inert handle.
pub fn init_tracing() -> LogFile {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, handle) = reload::Layer::new(None::<FileLayer>);

    let installed = tracing_subscriber::registry()
        .with(file_layer)
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok();
    LogFile {
        handle: installed.then_some(handle),
    }
}

/// Slot for the plain-text log file of the global subscriber.
pub struct LogFile {
    handle: Option<reload::Handle<Option<FileLayer>, Registry>>,
}

impl LogFile {
    /// Appends log lines to `path` when this process is the primary one.
    /// Returns whether the file was attached.
    pub fn attach(&self, context: &DistributedContext, path: &Path) -> Result<bool, TrainingError> {
        if !context.is_primary() {
            return Ok(false);
        }
        let Some(handle) = self.handle.as_ref() else {
            return Ok(false);
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file));
        handle.reload(Some(layer)).map_err(|err| {
            TrainingError::runtime(format!("failed to attach log file {}: {err}", path.display()))
        })?;
        Ok(true)
    }
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(tensorboard_dir: Option<PathBuf>, flush_every: usize) -> Self {
        Self {
            tensorboard_dir,
            tensorboard_flush_every_n: flush_every.max(1),
        }
    }
}

/// Scalar metric sink. Only rank 0 builds one with a TensorBoard writer;
/// every other process holds a disabled logger.
pub struct Logger {
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self { tensorboard })
    }

    pub fn disabled() -> Self {
        Self { tensorboard: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tensorboard.is_some()
    }

    /// Running training loss at a global batch index.
    pub fn log_training_loss(&mut self, step: usize, loss: f64, learning_rate: f64) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            if let Err(err) = writer
                .write_scalar(TRAIN_LOSS_TAG, step, loss)
                .and_then(|_| writer.write_scalar("train/learning_rate", step, learning_rate))
            {
                warn!("{err}");
            }
        }
    }

    pub fn log_epoch(&mut self, summary: &EpochSummary) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let step = summary.epoch as i64;
            if let Err(err) = writer
                .write_scalar("train/epoch_loss", step, summary.average_loss)
                .and_then(|_| {
                    writer.write_scalar("train/degraded_batches", step, summary.degraded_batches as f64)
                })
            {
                warn!("{err}");
            }
        }
    }

    /// Error rate in percent under `tag`, at the current epoch.
    pub fn log_evaluation(&mut self, tag: &str, summary: &EvaluationSummary) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.write_scalar(tag, summary.epoch as i64, summary.percent) {
                warn!("{err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                warn!("{err}");
            }
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_record(&event)
    }

    /// TFRecord framing: length, masked crc of the length, payload, masked
    /// crc of the payload.
    fn write_record(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut payload = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut payload).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let payload = payload.freeze();
        let len_bytes = (payload.len() as u64).to_le_bytes();

        let mut record = Vec::with_capacity(payload.len() + 16);
        record.extend_from_slice(&len_bytes);
        record.extend_from_slice(&masked_crc32(&len_bytes).to_le_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(&masked_crc32(&payload).to_le_bytes());
        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ErrorRate;

    fn read_records(dir: &Path) -> Vec<Event> {
        let entry = fs::read_dir(dir).unwrap().next().unwrap().unwrap();
        let bytes = fs::read(entry.path()).unwrap();
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let mut len = [0u8; 8];
            len.copy_from_slice(&bytes[offset..offset + 8]);
            let len = u64::from_le_bytes(len) as usize;
            let crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(crc, masked_crc32(&bytes[offset..offset + 8]));
            let payload = &bytes[offset + 12..offset + 12 + len];
            events.push(Event::decode(payload).unwrap());
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn writes_framed_scalar_events() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut logger = Logger::new(LoggingSettings::from_config(
                Some(dir.path().to_path_buf()),
                100,
            ))
            .unwrap();
            logger.log_training_loss(3, 1.5, 0.01);
            logger.log_evaluation(
                VALIDATE_TAG,
                &EvaluationSummary {
                    epoch: 2,
                    rate: ErrorRate {
                        errors: 1,
                        reference_tokens: 4,
                    },
                    percent: 25.0,
                },
            );
        }
        let events = read_records(dir.path());
        let tags: Vec<(String, i64)> = events
            .iter()
            .flat_map(|event| {
                event
                    .summary
                    .iter()
                    .flat_map(|s| s.value.iter().map(|v| (v.tag.clone(), event.step)))
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(
            tags,
            vec![
                (TRAIN_LOSS_TAG.to_string(), 3),
                ("train/learning_rate".to_string(), 3),
                (VALIDATE_TAG.to_string(), 2),
            ]
        );
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let mut logger = Logger::disabled();
        assert!(!logger.is_enabled());
        logger.log_training_loss(1, 1.0, 0.1);
        logger.flush();
    }
}
