//! Regrouping of per-segment predictions into per-utterance sequences.
//!
//! In split mode the model scores every fixed-size window independently, so
//! its output is a flat `[sum(lengths), classes]` matrix covering the whole
//! batch. The loss and the scorer expect batch-major `[batch, time, classes]`
//! tensors, zero-padded after each utterance's own length.

use candle_core::{DType, Tensor};

use crate::TrainingError;

/// Start offset of every utterance plus the total, so `offsets[i]..offsets[i + 1]`
/// spans utterance `i`.
pub fn cumulative_offsets(lengths: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(lengths.len() + 1);
    let mut total = 0;
    offsets.push(total);
    for &len in lengths {
        total += len;
        offsets.push(total);
    }
    offsets
}

/// Cut a flat `[sum(lengths), classes]` tensor into one `[len_i, classes]` tensor
/// per utterance. Zero-length utterances yield an empty `[0, classes]` tensor.
pub fn split_by_lengths(flat: &Tensor, lengths: &[usize]) -> Result<Vec<Tensor>, TrainingError> {
    let (rows, classes) = flat.dims2()?;
    let offsets = cumulative_offsets(lengths);
    let total = offsets[offsets.len() - 1];
    if total != rows {
        return Err(TrainingError::runtime(format!(
            "segment lengths sum to {total} but prediction has {rows} rows"
        )));
    }

    let mut segments = Vec::with_capacity(lengths.len());
    for (start, &len) in offsets.iter().zip(lengths) {
        if len == 0 {
            segments.push(Tensor::zeros((0, classes), flat.dtype(), flat.device())?);
        } else {
            segments.push(flat.narrow(0, *start, len)?);
        }
    }
    Ok(segments)
}

/// Right-pad every `[len_i, classes]` segment with zeros to `max_len` rows and
/// stack them into `[batch, max_len, classes]`.
pub fn pad_to(segments: &[Tensor], max_len: usize) -> Result<Tensor, TrainingError> {
    let Some(first) = segments.first() else {
        return Err(TrainingError::runtime("cannot pad an empty batch"));
    };
    let (_, classes) = first.dims2()?;
    let device = first.device();
    let dtype: DType = first.dtype();

    let mut padded = Vec::with_capacity(segments.len());
    for segment in segments {
        let (len, width) = segment.dims2()?;
        if width != classes {
            return Err(TrainingError::runtime(format!(
                "segment has {width} classes, expected {classes}"
            )));
        }
        if len > max_len {
            return Err(TrainingError::runtime(format!(
                "segment of length {len} exceeds padding length {max_len}"
            )));
        }
        let row = if len == 0 {
            Tensor::zeros((max_len, classes), dtype, device)?
        } else if len < max_len {
            let fill = Tensor::zeros((max_len - len, classes), dtype, device)?;
            Tensor::cat(&[segment, &fill], 0)?
        } else {
            segment.clone()
        };
        padded.push(row);
    }

    Ok(Tensor::stack(&padded, 0)?)
}

/// Split then pad: `[sum(lengths), classes]` to `[batch, max(lengths), classes]`.
/// The time axis is never shorter than one frame so that a batch made only of
/// empty utterances still has a well-formed shape.
pub fn align_segments(flat: &Tensor, lengths: &[usize]) -> Result<Tensor, TrainingError> {
    let segments = split_by_lengths(flat, lengths)?;
    let max_len = lengths.iter().copied().max().unwrap_or(0).max(1);
    pad_to(&segments, max_len)
}

/// Label counterpart of [`split_by_lengths`] for the flat target vector.
pub fn slice_targets(targets: &[u32], lengths: &[usize]) -> Result<Vec<Vec<u32>>, TrainingError> {
    let offsets = cumulative_offsets(lengths);
    let total = offsets[offsets.len() - 1];
    if total != targets.len() {
        return Err(TrainingError::runtime(format!(
            "target lengths sum to {total} but {} targets were given",
            targets.len()
        )));
    }
    Ok(offsets
        .windows(2)
        .map(|span| targets[span[0]..span[1]].to_vec())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn flat(rows: usize, classes: usize) -> Tensor {
        let data: Vec<f32> = (0..rows * classes).map(|v| v as f32 + 1.0).collect();
        Tensor::from_vec(data, (rows, classes), &Device::Cpu).unwrap()
    }

    #[test]
    fn aligned_rows_reproduce_flat_input() {
        let lengths = [3usize, 1, 4];
        let input = flat(8, 2);
        let aligned = align_segments(&input, &lengths).unwrap();
        assert_eq!(aligned.dims(), &[3, 4, 2]);

        let offsets = cumulative_offsets(&lengths);
        for (i, &len) in lengths.iter().enumerate() {
            let prefix = aligned.get(i).unwrap().narrow(0, 0, len).unwrap();
            let expected = input.narrow(0, offsets[i], len).unwrap();
            assert_eq!(
                prefix.to_vec2::<f32>().unwrap(),
                expected.to_vec2::<f32>().unwrap()
            );
            if len < 4 {
                let tail = aligned.get(i).unwrap().narrow(0, len, 4 - len).unwrap();
                let sum = tail.sum_all().unwrap().to_vec0::<f32>().unwrap();
                assert_eq!(sum, 0.0);
            }
        }
    }

    #[test]
    fn zero_length_segment_becomes_zero_row() {
        let aligned = align_segments(&flat(2, 3), &[2, 0]).unwrap();
        assert_eq!(aligned.dims(), &[2, 2, 3]);
        let empty = aligned.get(1).unwrap().sum_all().unwrap().to_vec0::<f32>().unwrap();
        assert_eq!(empty, 0.0);
    }

    #[test]
    fn all_empty_batch_keeps_one_frame() {
        let input = Tensor::zeros((0, 3), DType::F32, &Device::Cpu).unwrap();
        let aligned = align_segments(&input, &[0, 0]).unwrap();
        assert_eq!(aligned.dims(), &[2, 1, 3]);
    }

    #[test]
    fn rejects_inconsistent_lengths() {
        let err = align_segments(&flat(5, 2), &[2, 2]).unwrap_err();
        assert!(matches!(err, TrainingError::Runtime(_)));
    }

    #[test]
    fn slices_targets_by_label_lengths() {
        let sliced = slice_targets(&[1, 2, 3, 4, 5], &[2, 0, 3]).unwrap();
        assert_eq!(sliced, vec![vec![1, 2], vec![], vec![3, 4, 5]]);
        assert!(slice_targets(&[1, 2], &[3]).is_err());
    }
}
