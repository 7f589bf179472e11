use candle_core::{backprop::GradStore, DType, Tensor, D};
use tracing::{debug, warn};

use super::TrainingSession;
use crate::{
    align,
    config::{DataConfig, StrategyKind},
    data::{Batch, Collation},
    decoder::{best_path, collapse, Decoder},
    metrics::ErrorRate,
    optimizer::GradientScaler,
    scoring::{edit_distance, reference_length},
    TrainingError,
};

/// Loss of one training step. `degraded` steps had a non-finite loss; their
/// value is reported as zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValue {
    pub value: f64,
    pub degraded: bool,
}

/// How a batch is presented to the model and how its output is mapped back
/// to per-utterance sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segmentation {
    /// The model sees whole padded utterances and returns
    /// `[batch, time, classes]`.
    NonSplit,
    /// The model scores fixed windows, one row of `[segments, classes]` per
    /// window, which are regrouped per utterance.
    Split,
}

impl From<StrategyKind> for Segmentation {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::NonSplit => Segmentation::NonSplit,
            StrategyKind::Split => Segmentation::Split,
        }
    }
}

impl Segmentation {
    pub fn collation(self, data: &DataConfig) -> Collation {
        match self {
            Segmentation::NonSplit => Collation::Frames,
            Segmentation::Split => Collation::Segments {
                window: data.segment_frames,
                stride: data.segment_stride,
            },
        }
    }

    /// Model output as `[batch, time, classes]`, zero beyond each
    /// utterance's input length.
    pub fn align(self, output: &Tensor, batch: &Batch) -> Result<Tensor, TrainingError> {
        match self {
            Segmentation::NonSplit => {
                let (size, time, _) = output.dims3()?;
                if size != batch.len() {
                    return Err(TrainingError::runtime(format!(
                        "model returned {size} sequences for a batch of {}",
                        batch.len()
                    )));
                }
                if let Some(&len) = batch.input_lengths.iter().find(|&&len| len > time) {
                    return Err(TrainingError::runtime(format!(
                        "input length {len} exceeds the {time} frames the model returned"
                    )));
                }
                Ok(output.clone())
            }
            Segmentation::Split => align::align_segments(output, &batch.input_lengths),
        }
    }

    fn predict(
        self,
        session: &TrainingSession,
        batch: &Batch,
    ) -> Result<Tensor, TrainingError> {
        let output = session.model.forward(&batch.inputs)?;
        let output = if output.dtype() == DType::F32 {
            output
        } else {
            output.to_dtype(DType::F32)?
        };
        self.align(&output, batch)
    }

    pub fn unit_train(
        self,
        session: &mut TrainingSession,
        batch: &Batch,
    ) -> Result<LossValue, TrainingError> {
        let aligned = self.predict(session, batch)?;
        let loss = session.loss.compute(
            &aligned,
            &batch.targets,
            &batch.input_lengths,
            &batch.target_lengths,
        )?;

        let degraded = !loss.is_finite();
        if degraded {
            warn!(
                epoch = session.epoch,
                utterances = ?batch.identifiers,
                "non-finite loss ({}); skipping batch",
                loss.value
            );
            if !session.distributed {
                return Ok(LossValue {
                    value: 0.0,
                    degraded,
                });
            }
        }

        let parameters = session.optimizer.parameter_tensors();
        // Every backward pass fills a fresh store, so gradients start at zero.
        let mut grads = if degraded {
            // Peers are waiting in the all-reduce; join it with zeros.
            zero_gradients(&parameters)?
        } else {
            session.scaler.scale(&loss.loss)?.backward()?
        };
        session.model.synchronize_gradients(&mut grads)?;

        let overflow = unscale_gradients(&session.scaler, &parameters, &mut grads)?;
        session.scaler.update(overflow);
        if overflow {
            debug!(
                loss_scale = session.scaler.loss_scale(),
                "gradient overflow; skipping optimizer step"
            );
            session.optimizer.zero_grad(&mut grads);
        } else {
            clip_gradients(&parameters, &mut grads, session.max_norm)?;
            session.optimizer.step(&mut grads)?;
        }

        Ok(LossValue {
            value: if degraded { 0.0 } else { loss.value },
            degraded,
        })
    }

    /// Label error counts: best path per frame, repeats merged, blanks
    /// dropped, compared with the reference label sequences.
    pub fn unit_validate(
        self,
        session: &TrainingSession,
        batch: &Batch,
    ) -> Result<ErrorRate, TrainingError> {
        let aligned = self.predict(session, batch)?.detach();
        let hypotheses: Vec<Vec<u32>> = best_path(&aligned, &batch.input_lengths)?
            .iter()
            .map(|path| collapse(path))
            .collect();
        let references = align::slice_targets(&batch.targets, &batch.target_lengths)?;

        let mut rate = ErrorRate::default();
        rate.update(
            edit_distance(&references, &hypotheses)?,
            reference_length(&references),
        );
        Ok(rate)
    }

    /// Word error counts against the batch transcripts.
    pub fn unit_test(
        self,
        session: &TrainingSession,
        decoder: &dyn Decoder,
        batch: &Batch,
    ) -> Result<ErrorRate, TrainingError> {
        let hypotheses = self.decode(session, decoder, batch)?;
        let texts = batch
            .texts
            .as_ref()
            .ok_or_else(|| TrainingError::runtime("test batches need transcripts"))?;
        let references: Vec<Vec<u32>> = texts
            .iter()
            .map(|text| {
                text.split_whitespace()
                    .map(|word| decoder.word_index(word))
                    .collect()
            })
            .collect();

        let mut rate = ErrorRate::default();
        rate.update(
            edit_distance(&references, &hypotheses)?,
            reference_length(&references),
        );
        Ok(rate)
    }

    /// Decoded word ids per utterance.
    pub fn decode(
        self,
        session: &TrainingSession,
        decoder: &dyn Decoder,
        batch: &Batch,
    ) -> Result<Vec<Vec<u32>>, TrainingError> {
        let aligned = self.predict(session, batch)?.detach();
        let log_probs = candle_nn::ops::log_softmax(&aligned, D::Minus1)?;
        let output = decoder.decode(&log_probs, &batch.input_lengths)?;
        Ok(output
            .words
            .into_iter()
            .zip(output.word_counts)
            .map(|(mut words, count)| {
                words.truncate(count);
                words
            })
            .collect())
    }
}

/// A gradient store holding an explicit zero gradient for every parameter.
fn zero_gradients(parameters: &[Tensor]) -> Result<GradStore, TrainingError> {
    let first = parameters
        .first()
        .ok_or_else(|| TrainingError::runtime("model has no parameters"))?;
    // Backward from an untracked scalar yields a store with no parameter entries.
    let mut grads = Tensor::zeros((), DType::F32, first.device())?.backward()?;
    for param in parameters {
        grads.insert(param, param.zeros_like()?);
    }
    Ok(grads)
}

/// Divides out the loss scale and reports whether any gradient overflowed.
fn unscale_gradients(
    scaler: &GradientScaler,
    parameters: &[Tensor],
    grads: &mut GradStore,
) -> Result<bool, TrainingError> {
    if !scaler.is_enabled() {
        return Ok(false);
    }
    let mut unscaled = Vec::new();
    for tensor in parameters {
        if let Some(grad) = grads.remove(tensor) {
            let grad = scaler.unscale(&grad)?;
            grads.insert(tensor, grad.clone());
            unscaled.push(grad);
        }
    }
    scaler.has_overflow(&unscaled)
}

/// Rescales all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub(crate) fn clip_gradients(
    parameters: &[Tensor],
    grads: &mut GradStore,
    max_norm: f64,
) -> Result<f64, TrainingError> {
    let mut sum_squares = 0.0f64;
    for tensor in parameters {
        if let Some(grad) = grads.get(tensor) {
            sum_squares += grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_vec0::<f32>()? as f64;
        }
    }
    let total_norm = sum_squares.sqrt();

    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for tensor in parameters {
            if let Some(grad) = grads.remove(tensor) {
                grads.insert(tensor, grad.affine(clip_coef, 0.0)?);
            }
        }
    }
    Ok(total_norm)
}
