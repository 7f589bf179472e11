mod manifest;

pub use manifest::{
    read_manifest, Collation, ManifestLoader, ShardSampler, Utterance, FEATURES_TENSOR,
};

use candle_core::Tensor;

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One minibatch. `targets` holds every utterance's labels back to back;
/// `target_lengths` says where each one ends.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Vec<u32>,
    pub input_lengths: Vec<usize>,
    pub target_lengths: Vec<usize>,
    pub identifiers: Vec<String>,
    pub texts: Option<Vec<String>>,
}

impl Batch {
    pub fn new(
        inputs: Tensor,
        targets: Vec<u32>,
        input_lengths: Vec<usize>,
        target_lengths: Vec<usize>,
        identifiers: Vec<String>,
        texts: Option<Vec<String>>,
    ) -> Result<Self> {
        let size = identifiers.len();
        if input_lengths.len() != size || target_lengths.len() != size {
            return Err(TrainingError::runtime(format!(
                "batch of {size} utterances has {} input lengths and {} target lengths",
                input_lengths.len(),
                target_lengths.len()
            )));
        }
        if let Some(texts) = texts.as_ref() {
            if texts.len() != size {
                return Err(TrainingError::runtime(format!(
                    "batch of {size} utterances has {} transcripts",
                    texts.len()
                )));
            }
        }
        let labelled: usize = target_lengths.iter().sum();
        if labelled != targets.len() {
            return Err(TrainingError::runtime(format!(
                "target lengths sum to {labelled} but {} targets were given",
                targets.len()
            )));
        }
        Ok(Self {
            inputs,
            targets,
            input_lengths,
            target_lengths,
            identifiers,
            texts,
        })
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

/// Sequential supplier of batches for one pass at a time.
pub trait BatchSource {
    /// Batches this process will see per pass.
    fn num_batches(&self) -> usize;

    /// Start a new pass; shuffled sources reorder here.
    fn set_epoch(&mut self, epoch: usize);

    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// Replays a fixed list of batches every pass.
#[derive(Debug, Clone)]
pub struct VecBatchSource {
    batches: Vec<Batch>,
    cursor: usize,
}

impl VecBatchSource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl BatchSource for VecBatchSource {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn set_epoch(&mut self, _epoch: usize) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn inputs() -> Tensor {
        Tensor::zeros((2, 3, 1), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn rejects_targets_that_do_not_match_lengths() {
        let result = Batch::new(
            inputs(),
            vec![1, 2, 3],
            vec![3, 3],
            vec![1, 1],
            vec!["a".into(), "b".into()],
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn replays_batches_each_epoch() {
        let batch = Batch::new(inputs(), vec![1], vec![3, 3], vec![1, 0], vec!["a".into(), "b".into()], None)
            .unwrap();
        let mut source = VecBatchSource::new(vec![batch]);
        for epoch in 0..2 {
            source.set_epoch(epoch);
            assert!(source.next_batch().unwrap().is_some());
            assert!(source.next_batch().unwrap().is_none());
        }
    }
}
