use candle_core::{backprop::GradStore, DType, Device, Module, Tensor, Var};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use crate::TrainingError;

/// The network being trained. Implementations own their parameters as
/// [`Var`]s so the optimizer and checkpoint code can update them in place.
///
/// `forward` returns unnormalised scores: `[batch, time, classes]` for models
/// that see whole utterances, `[segments, classes]` for models that score
/// fixed windows.
pub trait AcousticModel {
    fn forward(&self, inputs: &Tensor) -> candle_core::Result<Tensor>;

    /// Parameters keyed by their qualified name, sorted by name.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType {
        DType::F32
    }

    /// Name prefix added by wrappers around the underlying network, e.g.
    /// `module.` for a replicated model.
    fn wrapper_prefix(&self) -> String {
        String::new()
    }

    /// Called between backward and the optimizer step.
    fn synchronize_gradients(&mut self, _grads: &mut GradStore) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Names without the wrapper prefix, as stored in checkpoints.
pub fn canonical_parameters(model: &dyn AcousticModel) -> Vec<(String, Var)> {
    let prefix = model.wrapper_prefix();
    model
        .named_parameters()
        .into_iter()
        .map(|(name, var)| {
            let name = name.strip_prefix(prefix.as_str()).unwrap_or(&name).to_string();
            (name, var)
        })
        .collect()
}

fn sorted_parameters(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut params: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

/// Two-layer perceptron applied to every frame of `[batch, time, features]`.
pub struct FrameClassifier {
    varmap: VarMap,
    hidden: Linear,
    output: Linear,
    device: Device,
    dtype: DType,
    training: bool,
}

impl FrameClassifier {
    pub fn new(
        feature_dim: usize,
        hidden_size: usize,
        num_labels: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let hidden = linear(feature_dim, hidden_size, vb.pp("hidden"))?;
        let output = linear(hidden_size, num_labels, vb.pp("output"))?;
        Ok(Self {
            varmap,
            hidden,
            output,
            device: device.clone(),
            dtype,
            training: true,
        })
    }
}

impl AcousticModel for FrameClassifier {
    fn forward(&self, inputs: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = self.hidden.forward(inputs)?.relu()?;
        self.output.forward(&hidden)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        sorted_parameters(&self.varmap)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Scores fixed windows `[segments, window, features]`, one prediction per
/// window. Used with split training, where each window stands for one frame
/// of the utterance it was cut from.
pub struct SegmentClassifier {
    varmap: VarMap,
    hidden: Linear,
    output: Linear,
    device: Device,
    dtype: DType,
    training: bool,
}

impl SegmentClassifier {
    pub fn new(
        window: usize,
        feature_dim: usize,
        hidden_size: usize,
        num_labels: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let hidden = linear(window * feature_dim, hidden_size, vb.pp("hidden"))?;
        let output = linear(hidden_size, num_labels, vb.pp("output"))?;
        Ok(Self {
            varmap,
            hidden,
            output,
            device: device.clone(),
            dtype,
            training: true,
        })
    }
}

impl AcousticModel for SegmentClassifier {
    fn forward(&self, inputs: &Tensor) -> candle_core::Result<Tensor> {
        let flat = inputs.flatten_from(1)?;
        let hidden = self.hidden.forward(&flat)?.relu()?;
        self.output.forward(&hidden)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        sorted_parameters(&self.varmap)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_classifier_keeps_time_axis() {
        let model = FrameClassifier::new(4, 8, 5, DType::F32, &Device::Cpu).unwrap();
        let inputs = Tensor::zeros((2, 7, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&inputs).unwrap().dims(), &[2, 7, 5]);
        let names: Vec<String> = model.named_parameters().into_iter().map(|p| p.0).collect();
        assert_eq!(
            names,
            vec!["hidden.bias", "hidden.weight", "output.bias", "output.weight"]
        );
    }

    #[test]
    fn segment_classifier_scores_each_window() {
        let model = SegmentClassifier::new(3, 4, 8, 5, DType::F32, &Device::Cpu).unwrap();
        let inputs = Tensor::zeros((6, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&inputs).unwrap().dims(), &[6, 5]);
    }
}
