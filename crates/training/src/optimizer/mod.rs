use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    AdamW(AdamWConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Sgd,
    AdamW,
}

impl From<&config::OptimizerConfig> for OptimizerConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        match value.algorithm {
            config::OptimizerType::Sgd | config::OptimizerType::Sgdr => {
                OptimizerConfig::Sgd(SgdConfig {
                    learning_rate: value.learning_rate,
                    momentum: value.momentum,
                    weight_decay: value.weight_decay,
                })
            }
            config::OptimizerType::AdamW => OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: value.learning_rate,
                beta1: value.beta1,
                beta2: value.beta2,
                epsilon: value.epsilon,
                weight_decay: value.weight_decay,
            }),
        }
    }
}

impl OptimizerConfig {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            OptimizerConfig::Sgd(_) => Algorithm::Sgd,
            OptimizerConfig::AdamW(_) => Algorithm::AdamW,
        }
    }
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    /// fp32 copy updated in place of reduced-precision parameters.
    master: Option<Var>,
    /// Momentum buffer for SGD, first moment for AdamW.
    first_moment: Tensor,
    second_moment: Option<Tensor>,
}

impl TrainerOptimizer {
    /// Parameters whose dtype is not f32 get an fp32 master copy.
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)?;
            let second_moment = match config {
                OptimizerConfig::AdamW(_) => {
                    Some(Tensor::zeros(shape.as_slice(), DType::F32, device)?)
                }
                OptimizerConfig::Sgd(_) => None,
            };

            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32)?;
                Some(Var::from_tensor(&fp32)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm()
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
        }
    }

    pub fn parameter_tensors(&self) -> Vec<Tensor> {
        self.params
            .iter()
            .map(|slot| slot.param.as_tensor().clone())
            .collect()
    }

    /// Applies the gradients found in `grads` and removes them from the store.
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            processed.push(ProcessedGradient {
                index,
                grad: grad.to_dtype(DType::F32)?,
            });
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, processed),
            OptimizerConfig::AdamW(cfg) => self.step_adamw(cfg, processed),
        }
    }

    fn step_sgd(
        &mut self,
        cfg: SgdConfig,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        for item in processed {
            let slot = &mut self.params[item.index];
            let base = slot.fp32_value()?;

            let grad = if cfg.weight_decay != 0.0 {
                item.grad.add(&base.affine(cfg.weight_decay, 0.0)?)?
            } else {
                item.grad
            };

            let direction = if cfg.momentum != 0.0 {
                let buffer = slot.first_moment.affine(cfg.momentum, 0.0)?.add(&grad)?;
                slot.first_moment = buffer.clone();
                buffer
            } else {
                grad
            };

            let next = base.sub(&direction.affine(cfg.learning_rate, 0.0)?)?;
            slot.write(next)?;
        }
        Ok(())
    }

    fn step_adamw(
        &mut self,
        cfg: AdamWConfig,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];
            let Some(second_moment) = slot.second_moment.as_ref() else {
                return Err(TrainingError::runtime(format!(
                    "adamw slot '{}' has no second moment",
                    slot.name
                )));
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)?
                .add(&item.grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = second_moment
                .affine(cfg.beta2, 0.0)?
                .add(&item.grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

            let base = slot.fp32_value()?;
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };

            slot.write(decayed.sub(&update)?)?;
            slot.first_moment = new_m;
            slot.second_moment = Some(new_v);
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let second_moment = match &slot.second_moment {
                Some(tensor) => Some(flatten_to_vec(tensor, numel)?),
                None => None,
            };
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment,
                master,
            });
        }

        Ok(OptimizerState {
            algorithm: self.algorithm(),
            step: self.step,
            learning_rate: self.learning_rate(),
            parameters,
        })
    }

    /// Checks that `state` fits this optimizer without touching anything.
    pub fn validate_state(&self, state: &OptimizerState) -> Result<(), TrainingError> {
        if state.algorithm != self.algorithm() {
            return Err(TrainingError::runtime(format!(
                "optimizer state was saved by {:?}, current optimizer is {:?}",
                state.algorithm,
                self.algorithm()
            )));
        }

        let by_name: HashMap<_, _> = state
            .parameters
            .iter()
            .map(|param| (param.name.as_str(), param))
            .collect();
        if by_name.len() != self.params.len() {
            return Err(TrainingError::runtime(format!(
                "optimizer state has {} parameters, optimizer has {}",
                by_name.len(),
                self.params.len()
            )));
        }

        for slot in &self.params {
            let saved = by_name.get(slot.name.as_str()).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            if slot.param.as_tensor().dims() != saved.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected = numel(&saved.shape);
            if saved.first_moment.len() != expected
                || saved.second_moment.as_ref().map_or(false, |v| v.len() != expected)
                || saved.master.as_ref().map_or(false, |m| m.len() != expected)
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }
            if saved.second_moment.is_some() != slot.second_moment.is_some() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state second moment mismatch for '{}'",
                    slot.name
                )));
            }
            if saved.master.is_some() != slot.master.is_some() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state master weights mismatch for '{}'",
                    slot.name
                )));
            }
        }
        Ok(())
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.validate_state(&state)?;

        self.step = state.step;
        self.set_learning_rate(state.learning_rate);
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let Some(saved) = by_name.remove(&slot.name) else {
                continue;
            };
            let dims = slot.param.as_tensor().dims().to_vec();
            let device = slot.param.as_tensor().device().clone();
            let restore = |values: Vec<f32>| -> Result<Tensor, TrainingError> {
                Ok(Tensor::from_vec(values, dims.as_slice(), &device)?)
            };

            slot.first_moment = restore(saved.first_moment)?;
            slot.second_moment = match saved.second_moment {
                Some(values) => Some(restore(values)?),
                None => None,
            };
            if let (Some(master), Some(values)) = (&slot.master, saved.master) {
                let tensor = restore(values)?;
                master.set(&tensor)?;
                slot.param.set(&tensor.to_dtype(slot.dtype)?)?;
            }
        }

        Ok(())
    }
}

impl ParameterSlot {
    fn fp32_value(&self) -> Result<Tensor, TrainingError> {
        Ok(match self.master.as_ref() {
            Some(master) => master.as_tensor().clone(),
            None => self.param.as_tensor().to_dtype(DType::F32)?,
        })
    }

    fn write(&self, next: Tensor) -> Result<(), TrainingError> {
        if let Some(master) = self.master.as_ref() {
            master.set(&next)?;
        }
        let cast = if self.dtype == DType::F32 {
            next
        } else {
            next.to_dtype(self.dtype)?
        };
        self.param.set(&cast)?;
        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub algorithm: Algorithm,
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Option<Vec<f32>>,
    pub master: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn parameter(values: &[f32]) -> Var {
        Var::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    fn sgd(momentum: f64) -> OptimizerConfig {
        OptimizerConfig::Sgd(SgdConfig {
            learning_rate: 0.1,
            momentum,
            weight_decay: 0.0,
        })
    }

    fn step_towards_zero(optimizer: &mut TrainerOptimizer, var: &Var) {
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
    }

    #[test]
    fn sgd_momentum_accumulates() {
        let var = parameter(&[1.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".to_string(), var.clone())], sgd(0.9)).unwrap();

        // grad 2.0, buffer 2.0, w = 1.0 - 0.2
        step_towards_zero(&mut optimizer, &var);
        let first = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((first - 0.8).abs() < 1e-6);

        // grad 1.6, buffer 0.9 * 2.0 + 1.6 = 3.4, w = 0.8 - 0.34
        step_towards_zero(&mut optimizer, &var);
        let second = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((second - 0.46).abs() < 1e-6);
    }

    #[test]
    fn adamw_moves_against_gradient() {
        let var = parameter(&[1.0, -1.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: 0.01,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
            }),
        )
        .unwrap();
        step_towards_zero(&mut optimizer, &var);
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.99).abs() < 1e-5);
        assert!((values[1] + 0.99).abs() < 1e-5);
    }

    #[test]
    fn state_round_trips_and_rejects_other_algorithm() {
        let var = parameter(&[1.0, 2.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".to_string(), var.clone())], sgd(0.9)).unwrap();
        step_towards_zero(&mut optimizer, &var);
        let state = optimizer.state().unwrap();
        assert_eq!(state.step, 1);

        let fresh_var = parameter(&[1.0, 2.0]);
        let mut fresh =
            TrainerOptimizer::new(vec![("w".to_string(), fresh_var)], sgd(0.9)).unwrap();
        fresh.load_state(state.clone()).unwrap();
        assert_eq!(fresh.state().unwrap(), state);

        let mut other = TrainerOptimizer::new(
            vec![("w".to_string(), parameter(&[0.0, 0.0]))],
            OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: 0.01,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
            }),
        )
        .unwrap();
        assert!(other.load_state(state).is_err());
        assert_eq!(other.state().unwrap().step, 0);
    }
}
