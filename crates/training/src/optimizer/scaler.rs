use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Loss scaling for reduced-precision training. Full precision runs get a
/// disabled scaler whose operations are identities.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Static { loss_scale: f32 },
    Dynamic(DynamicState),
}

#[derive(Debug, Clone)]
struct DynamicState {
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub loss_scale: f32,
    pub stable_steps: usize,
}

impl GradientScaler {
    pub fn disabled() -> Self {
        Self {
            state: ScalerState::Disabled,
        }
    }

    pub fn fixed(precision: Precision, loss_scale: f32) -> Self {
        if !precision.is_reduced() {
            return Self::disabled();
        }
        Self {
            state: ScalerState::Static {
                loss_scale: loss_scale.max(f32::MIN_POSITIVE),
            },
        }
    }

    pub fn dynamic(config: LossScaleConfig, precision: Precision) -> Self {
        if !precision.is_reduced() {
            return Self::disabled();
        }

        let cfg = sanitize_config(config);
        Self {
            state: ScalerState::Dynamic(DynamicState {
                loss_scale: cfg.initial_scale,
                stable_steps: 0,
                config: cfg,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, ScalerState::Disabled)
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Static { loss_scale } => *loss_scale,
            ScalerState::Dynamic(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        if !self.is_enabled() {
            return Ok(tensor.clone());
        }
        Ok(tensor.affine(self.loss_scale() as f64, 0.0)?)
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        if !self.is_enabled() {
            return Ok(tensor.clone());
        }
        Ok(tensor.affine(1.0 / self.loss_scale() as f64, 0.0)?)
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        if !self.is_enabled() {
            return Ok(false);
        }
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Dynamic(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        GradientScalerState {
            loss_scale: self.loss_scale(),
            stable_steps: match &self.state {
                ScalerState::Dynamic(state) => state.stable_steps,
                _ => 0,
            },
        }
    }

    /// Only a dynamic scaler carries state worth restoring.
    pub fn load_state(&mut self, saved: GradientScalerState) {
        if let ScalerState::Dynamic(state) = &mut self.state {
            state.loss_scale = saved
                .loss_scale
                .clamp(state.config.min_scale, state.config.max_scale);
            state.stable_steps = saved.stable_steps;
        }
    }
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .to_vec0::<f32>()?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}
