use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};

use super::ProcessGroup;
use crate::{model::AcousticModel, TrainingError};

const PREFIX: &str = "module.";

/// One replica of a data-parallel model. Parameters start from rank 0's
/// values and gradients are averaged over all replicas after every backward
/// pass, so replicas stay identical.
pub struct ReplicatedModel {
    inner: Box<dyn AcousticModel>,
    group: Box<dyn ProcessGroup>,
}

impl ReplicatedModel {
    pub fn new(
        inner: Box<dyn AcousticModel>,
        mut group: Box<dyn ProcessGroup>,
    ) -> Result<Self, TrainingError> {
        for (_, var) in inner.named_parameters() {
            let mut values = flatten(var.as_tensor())?;
            group.broadcast(&mut values)?;
            var.set(&restore(values, var.as_tensor())?)?;
        }
        Ok(Self { inner, group })
    }
}

impl AcousticModel for ReplicatedModel {
    fn forward(&self, inputs: &Tensor) -> candle_core::Result<Tensor> {
        self.inner.forward(inputs)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.inner
            .named_parameters()
            .into_iter()
            .map(|(name, var)| (format!("{PREFIX}{name}"), var))
            .collect()
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.inner.is_training()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn dtype(&self) -> DType {
        self.inner.dtype()
    }

    fn wrapper_prefix(&self) -> String {
        format!("{PREFIX}{}", self.inner.wrapper_prefix())
    }

    /// All gradients travel in one buffer; a parameter without a gradient
    /// contributes zeros.
    fn synchronize_gradients(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.inner.synchronize_gradients(grads)?;

        let params = self.inner.named_parameters();
        let mut bucket = Vec::new();
        let mut extents = Vec::with_capacity(params.len());
        for (_, var) in &params {
            let tensor = var.as_tensor();
            let count = tensor.elem_count();
            match grads.get(tensor) {
                Some(grad) => bucket.extend(flatten(grad)?),
                None => bucket.extend(std::iter::repeat(0.0f32).take(count)),
            }
            extents.push(count);
        }

        self.group.all_reduce_mean(&mut bucket)?;

        let mut offset = 0;
        for ((_, var), count) in params.iter().zip(extents) {
            let tensor = var.as_tensor();
            let averaged = restore(bucket[offset..offset + count].to_vec(), tensor)?;
            grads.insert(tensor, averaged);
            offset += count;
        }
        Ok(())
    }
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    Ok(tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

fn restore(values: Vec<f32>, like: &Tensor) -> Result<Tensor, TrainingError> {
    Ok(Tensor::from_vec(values, like.dims(), like.device())?.to_dtype(like.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        distributed::LoopbackGroup,
        model::{canonical_parameters, FrameClassifier},
    };

    fn replicated() -> ReplicatedModel {
        let inner = FrameClassifier::new(2, 3, 4, DType::F32, &Device::Cpu).unwrap();
        ReplicatedModel::new(Box::new(inner), Box::new(LoopbackGroup::new(0, 2))).unwrap()
    }

    #[test]
    fn qualifies_names_and_reports_prefix() {
        let model = replicated();
        assert_eq!(model.wrapper_prefix(), "module.");
        assert!(model
            .named_parameters()
            .iter()
            .all(|(name, _)| name.starts_with("module.")));
        let canonical: Vec<String> = canonical_parameters(&model)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(canonical[0], "hidden.bias");
    }

    #[test]
    fn nested_wrappers_compose_prefixes() {
        let outer =
            ReplicatedModel::new(Box::new(replicated()), Box::new(LoopbackGroup::new(0, 2)))
                .unwrap();
        assert_eq!(outer.wrapper_prefix(), "module.module.");
        assert!(canonical_parameters(&outer)
            .iter()
            .all(|(name, _)| !name.starts_with("module")));
    }

    #[test]
    fn fills_missing_gradients() {
        let mut model = replicated();
        let params = model.named_parameters();
        let (_, first) = &params[0];
        let loss = first.as_tensor().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        model.synchronize_gradients(&mut grads).unwrap();
        for (_, var) in &params {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }
}
