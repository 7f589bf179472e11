use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::ops;

use crate::{align, TrainingError};

/// Log-space stand-in for zero probability. Large enough to never win a
/// max, small enough that sums of a few of them stay finite in f32.
const NEG: f32 = -1e30;

pub const BLANK: u32 = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    /// Divide by the number of utterances that took part.
    MeanBatch,
    /// Divide by the total number of input frames.
    #[default]
    MeanFrames,
}

/// Connectionist temporal classification loss with the blank at index 0.
///
/// `predictions` are unnormalised scores laid out `[batch, time, classes]`;
/// `log_softmax` is applied here. Utterances with zero input frames carry
/// zero weight. An utterance whose labels cannot fit its frames (fewer frames
/// than labels plus repeated neighbours) makes the whole loss `+inf`, which
/// the trainer treats as a degraded step.
#[derive(Debug, Clone, Default)]
pub struct CtcLoss {
    reduction: Reduction,
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub value: f64,
    pub utterances: usize,
    pub frames: usize,
}

impl LossOutput {
    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}

impl CtcLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    pub fn compute(
        &self,
        predictions: &Tensor,
        targets: &[u32],
        input_lengths: &[usize],
        target_lengths: &[usize],
    ) -> Result<LossOutput, TrainingError> {
        let predictions = if predictions.dtype() == DType::F32 {
            predictions.clone()
        } else {
            predictions.to_dtype(DType::F32)?
        };
        let (batch, time, classes) = predictions.dims3()?;
        if input_lengths.len() != batch || target_lengths.len() != batch {
            return Err(TrainingError::runtime(format!(
                "ctc received {batch} predictions, {} input lengths and {} target lengths",
                input_lengths.len(),
                target_lengths.len()
            )));
        }
        if let Some(&len) = input_lengths.iter().find(|&&len| len > time) {
            return Err(TrainingError::runtime(format!(
                "input length {len} exceeds prediction length {time}"
            )));
        }
        let labels = align::slice_targets(targets, target_lengths)?;
        if let Some(&label) = targets
            .iter()
            .find(|&&label| label == BLANK || label as usize >= classes)
        {
            return Err(TrainingError::runtime(format!(
                "target label {label} is the blank or outside {classes} classes"
            )));
        }

        let device = predictions.device();
        let included: Vec<bool> = input_lengths.iter().map(|&len| len > 0).collect();
        let utterances = included.iter().filter(|&&keep| keep).count();
        let frames: usize = input_lengths.iter().sum();
        let infeasible = labels
            .iter()
            .zip(input_lengths)
            .any(|(seq, &len)| len > 0 && len < required_frames(seq));

        if utterances == 0 {
            let loss = predictions.affine(0.0, 0.0)?.sum_all()?;
            return Ok(LossOutput {
                loss,
                value: 0.0,
                utterances,
                frames,
            });
        }

        let max_labels = labels.iter().map(Vec::len).max().unwrap_or(0);
        let states = 2 * max_labels + 1;

        let mut extended = vec![BLANK; batch * states];
        let mut skip = vec![NEG; batch * states];
        let mut init = vec![NEG; batch * states];
        let mut finals = vec![0u32; batch * 2];
        let mut final_mask = vec![0f32; batch * 2];
        for (b, seq) in labels.iter().enumerate() {
            let row = b * states;
            for (k, &label) in seq.iter().enumerate() {
                extended[row + 2 * k + 1] = label;
            }
            let used = 2 * seq.len() + 1;
            for s in 0..used.min(2) {
                init[row + s] = 0.0;
            }
            for s in 2..used {
                let label = extended[row + s];
                if label != BLANK && label != extended[row + s - 2] {
                    skip[row + s] = 0.0;
                }
            }
            finals[2 * b] = (used - 1) as u32;
            if used >= 2 {
                finals[2 * b + 1] = (used - 2) as u32;
            } else {
                finals[2 * b + 1] = (used - 1) as u32;
                final_mask[2 * b + 1] = NEG;
            }
        }

        let log_probs = ops::log_softmax(&predictions, D::Minus1)?.contiguous()?;
        let index = Tensor::from_vec(extended, (batch, 1, states), device)?
            .broadcast_as((batch, time, states))?
            .contiguous()?;
        let emissions = log_probs.gather(&index, 2)?;
        let skip = Tensor::from_vec(skip, (batch, states), device)?;
        let init = Tensor::from_vec(init, (batch, states), device)?;

        let mut alpha = emissions.i((.., 0, ..))?.add(&init)?;
        for t in 1..time {
            let active: Vec<u8> = input_lengths.iter().map(|&len| u8::from(t < len)).collect();
            if active.iter().all(|&flag| flag == 0) {
                break;
            }
            let stay = alpha.clone();
            let advance = shift_right(&alpha, 1)?;
            let jump = shift_right(&alpha, 2)?.add(&skip)?;
            let next = log_sum_exp(&[stay, advance, jump])?.add(&emissions.i((.., t, ..))?)?;
            let active = Tensor::from_vec(active, (batch, 1), device)?
                .broadcast_as((batch, states))?
                .contiguous()?;
            alpha = active.where_cond(&next, &alpha)?;
        }

        let finals = Tensor::from_vec(finals, (batch, 2), device)?;
        let final_mask = Tensor::from_vec(final_mask, (batch, 2), device)?;
        let ends = alpha.gather(&finals, 1)?.add(&final_mask)?;
        let log_likelihood = log_sum_exp(&[ends.i((.., 0))?, ends.i((.., 1))?])?;

        let weights: Vec<f32> = labels
            .iter()
            .zip(input_lengths)
            .map(|(seq, &len)| {
                if len > 0 && len >= required_frames(seq) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();
        let weights = Tensor::from_vec(weights, batch, device)?;
        let total = log_likelihood.neg()?.mul(&weights)?.sum_all()?;
        let loss = match self.reduction {
            Reduction::Sum => total,
            Reduction::MeanBatch => total.affine(1.0 / utterances as f64, 0.0)?,
            Reduction::MeanFrames => total.affine(1.0 / frames as f64, 0.0)?,
        };

        let value = if infeasible {
            f64::INFINITY
        } else {
            loss.to_vec0::<f32>()? as f64
        };

        Ok(LossOutput {
            loss,
            value,
            utterances,
            frames,
        })
    }
}

/// Minimum frames needed to emit `labels`: one per label plus a separating
/// blank between equal neighbours.
pub fn required_frames(labels: &[u32]) -> usize {
    let repeats = labels.windows(2).filter(|pair| pair[0] == pair[1]).count();
    labels.len() + repeats
}

fn shift_right(alpha: &Tensor, by: usize) -> Result<Tensor, TrainingError> {
    let (batch, states) = alpha.dims2()?;
    if by >= states {
        return Ok(Tensor::full(NEG, (batch, states), alpha.device())?);
    }
    let fill = Tensor::full(NEG, (batch, by), alpha.device())?;
    Ok(Tensor::cat(&[&fill, &alpha.narrow(1, 0, states - by)?], 1)?)
}

fn log_sum_exp(terms: &[Tensor]) -> Result<Tensor, TrainingError> {
    let stacked = Tensor::stack(terms, 0)?;
    let max = stacked.max_keepdim(0)?.detach();
    let summed = stacked.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?.log()?;
    Ok(summed.add(&max)?.squeeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn uniform(batch: usize, time: usize, classes: usize) -> Tensor {
        Tensor::zeros((batch, time, classes), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn single_frame_single_label() {
        let loss = CtcLoss::new(Reduction::Sum)
            .compute(&uniform(1, 1, 2), &[1], &[1], &[1])
            .unwrap();
        assert!((loss.value - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn sums_over_every_alignment() {
        // "1 1", "0 1", "1 0" each have probability 1/4.
        let loss = CtcLoss::new(Reduction::Sum)
            .compute(&uniform(1, 2, 2), &[1], &[2], &[1])
            .unwrap();
        assert!((loss.value - -(0.75f64).ln()).abs() < 1e-5);

        let averaged = CtcLoss::default()
            .compute(&uniform(1, 2, 2), &[1], &[2], &[1])
            .unwrap();
        assert!((averaged.value - -(0.75f64).ln() / 2.0).abs() < 1e-5);
    }

    #[test]
    fn padded_frames_do_not_contribute() {
        let short = CtcLoss::new(Reduction::Sum)
            .compute(&uniform(1, 2, 3), &[2], &[2], &[1])
            .unwrap();
        let padded = CtcLoss::new(Reduction::Sum)
            .compute(&uniform(1, 5, 3), &[2], &[2], &[1])
            .unwrap();
        assert!((short.value - padded.value).abs() < 1e-5);
    }

    #[test]
    fn repeated_labels_need_a_separating_frame() {
        assert_eq!(required_frames(&[1, 1]), 3);
        let loss = CtcLoss::default()
            .compute(&uniform(1, 2, 2), &[1, 1], &[2], &[2])
            .unwrap();
        assert!(loss.value.is_infinite());
        assert!(!loss.is_finite());
    }

    #[test]
    fn empty_utterances_carry_no_weight() {
        let loss = CtcLoss::new(Reduction::Sum)
            .compute(&uniform(2, 1, 2), &[1, 1], &[1, 0], &[1, 1])
            .unwrap();
        assert_eq!(loss.utterances, 1);
        assert!((loss.value - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn gradients_flow_to_predictions() {
        let var = candle_core::Var::from_tensor(&uniform(2, 4, 3)).unwrap();
        let loss = CtcLoss::default()
            .compute(var.as_tensor(), &[1, 2, 2], &[4, 3], &[2, 1])
            .unwrap();
        assert!(loss.is_finite());
        let grads = loss.loss.backward().unwrap();
        let grad = grads.get(var.as_tensor()).unwrap();
        let norm = grad.sqr().unwrap().sum_all().unwrap().to_vec0::<f32>().unwrap();
        assert!(norm > 0.0 && norm.is_finite());
    }

    #[test]
    fn rejects_blank_targets() {
        let err = CtcLoss::default()
            .compute(&uniform(1, 2, 2), &[0], &[2], &[1])
            .unwrap_err();
        assert!(matches!(err, TrainingError::Runtime(_)));
    }
}
