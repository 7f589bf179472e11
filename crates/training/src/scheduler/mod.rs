use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

/// Epoch-granular learning-rate schedule. `step` is called once at the start
/// of every training epoch and returns the rate to train that epoch with.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerState {
    CosineAnnealing {
        last_epoch: usize,
        current_lr: f64,
    },
    CosineWithRestarts {
        last_epoch: usize,
        cycle_epoch: usize,
        cycle_length: usize,
        current_lr: f64,
    },
}

impl SchedulerState {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerState::CosineAnnealing { .. } => "cosine_annealing",
            SchedulerState::CosineWithRestarts { .. } => "cosine_with_restarts",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    CosineAnnealing {
        base_lr: f64,
        t_max: usize,
        min_lr: f64,
    },
    CosineWithRestarts {
        base_lr: f64,
        t_0: usize,
        t_mult: usize,
        min_lr: f64,
    },
}

impl SchedulerConfig {
    /// `None` for optimizers that run at a constant rate.
    pub fn from_training_config(
        optimizer: &config::OptimizerConfig,
        scheduler: &config::SchedulerConfig,
    ) -> Option<Self> {
        let base_lr = optimizer.learning_rate;
        let min_lr = scheduler.min_lr;
        match optimizer.algorithm {
            config::OptimizerType::Sgd => Some(SchedulerConfig::CosineAnnealing {
                base_lr,
                t_max: scheduler.t_max,
                min_lr,
            }),
            config::OptimizerType::Sgdr => Some(SchedulerConfig::CosineWithRestarts {
                base_lr,
                t_0: scheduler.t_max,
                t_mult: scheduler.t_mult,
                min_lr,
            }),
            config::OptimizerType::AdamW => None,
        }
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        match self {
            SchedulerConfig::CosineAnnealing {
                base_lr,
                t_max,
                min_lr,
            } => Ok(Box::new(CosineAnnealing::new(base_lr, min_lr, t_max)?)),
            SchedulerConfig::CosineWithRestarts {
                base_lr,
                t_0,
                t_mult,
                min_lr,
            } => Ok(Box::new(CosineWithRestarts::new(
                base_lr, min_lr, t_0, t_mult,
            )?)),
        }
    }
}

fn validate_rates(base_lr: f64, min_lr: f64) -> Result<(), TrainingError> {
    if base_lr <= 0.0 {
        return Err(TrainingError::initialization(
            "scheduler base learning rate must be positive",
        ));
    }
    if min_lr < 0.0 || min_lr > base_lr {
        return Err(TrainingError::initialization(
            "scheduler minimum learning rate must be in [0, base_lr]",
        ));
    }
    Ok(())
}

fn cosine(base_lr: f64, min_lr: f64, position: usize, period: usize) -> f64 {
    let progress = position as f64 / period as f64;
    min_lr + (base_lr - min_lr) * 0.5 * (1.0 + (PI * progress).cos())
}

struct CosineAnnealing {
    base_lr: f64,
    min_lr: f64,
    t_max: usize,
    last_epoch: usize,
    current_lr: f64,
}

impl CosineAnnealing {
    fn new(base_lr: f64, min_lr: f64, t_max: usize) -> Result<Self, TrainingError> {
        validate_rates(base_lr, min_lr)?;
        if t_max == 0 {
            return Err(TrainingError::initialization(
                "cosine annealing requires t_max greater than zero",
            ));
        }
        Ok(Self {
            base_lr,
            min_lr,
            t_max,
            last_epoch: 0,
            current_lr: base_lr,
        })
    }
}

impl LRScheduler for CosineAnnealing {
    fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.current_lr = cosine(self.base_lr, self.min_lr, self.last_epoch, self.t_max);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState::CosineAnnealing {
            last_epoch: self.last_epoch,
            current_lr: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        match state {
            SchedulerState::CosineAnnealing {
                last_epoch,
                current_lr,
            } => {
                self.last_epoch = *last_epoch;
                self.current_lr = *current_lr;
                Ok(())
            }
            other => Err(TrainingError::runtime(format!(
                "cannot restore cosine annealing from {} state",
                other.kind()
            ))),
        }
    }
}

/// Cosine annealing that restarts at `base_lr` after every cycle, each cycle
/// `t_mult` times longer than the previous one.
struct CosineWithRestarts {
    base_lr: f64,
    min_lr: f64,
    t_mult: usize,
    last_epoch: usize,
    cycle_epoch: usize,
    cycle_length: usize,
    current_lr: f64,
}

impl CosineWithRestarts {
    fn new(base_lr: f64, min_lr: f64, t_0: usize, t_mult: usize) -> Result<Self, TrainingError> {
        validate_rates(base_lr, min_lr)?;
        if t_0 == 0 || t_mult == 0 {
            return Err(TrainingError::initialization(
                "warm restarts require t_0 and t_mult greater than zero",
            ));
        }
        Ok(Self {
            base_lr,
            min_lr,
            t_mult,
            last_epoch: 0,
            cycle_epoch: 0,
            cycle_length: t_0,
            current_lr: base_lr,
        })
    }
}

impl LRScheduler for CosineWithRestarts {
    fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.cycle_epoch += 1;
        if self.cycle_epoch >= self.cycle_length {
            self.cycle_epoch -= self.cycle_length;
            self.cycle_length *= self.t_mult;
        }
        self.current_lr = cosine(
            self.base_lr,
            self.min_lr,
            self.cycle_epoch,
            self.cycle_length,
        );
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState::CosineWithRestarts {
            last_epoch: self.last_epoch,
            cycle_epoch: self.cycle_epoch,
            cycle_length: self.cycle_length,
            current_lr: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        match state {
            SchedulerState::CosineWithRestarts {
                last_epoch,
                cycle_epoch,
                cycle_length,
                current_lr,
            } => {
                if *cycle_length == 0 {
                    return Err(TrainingError::runtime(
                        "warm restart state has an empty cycle",
                    ));
                }
                self.last_epoch = *last_epoch;
                self.cycle_epoch = *cycle_epoch;
                self.cycle_length = *cycle_length;
                self.current_lr = *current_lr;
                Ok(())
            }
            other => Err(TrainingError::runtime(format!(
                "cannot restore warm restarts from {} state",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_reaches_minimum_after_t_max() {
        let mut scheduler = CosineAnnealing::new(1.0, 0.0, 4).unwrap();
        let rates: Vec<f64> = (0..4).map(|_| scheduler.step()).collect();
        assert!((rates[1] - 0.5).abs() < 1e-12);
        assert!(rates[3].abs() < 1e-12);
        assert!(rates.windows(2).all(|pair| pair[1] < pair[0]));
    }

    #[test]
    fn restarts_double_the_cycle() {
        let mut scheduler = CosineWithRestarts::new(1.0, 0.0, 2, 2).unwrap();
        // epochs 1..=2 finish the first cycle, the restart lands on epoch 2
        assert!((scheduler.step() - 0.5).abs() < 1e-12);
        assert_eq!(scheduler.step(), 1.0);
        assert_eq!(scheduler.snapshot(), SchedulerState::CosineWithRestarts {
            last_epoch: 2,
            cycle_epoch: 0,
            cycle_length: 4,
            current_lr: 1.0,
        });
        assert!((scheduler.step() - cosine(1.0, 0.0, 1, 4)).abs() < 1e-12);
    }

    #[test]
    fn snapshot_round_trip_continues_schedule() {
        let mut original = CosineWithRestarts::new(0.1, 0.0, 5, 2).unwrap();
        for _ in 0..7 {
            original.step();
        }
        let state = original.snapshot();
        let json = serde_json::to_string(&state).unwrap();
        let decoded: SchedulerState = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, state);

        let mut restored = CosineWithRestarts::new(0.1, 0.0, 5, 2).unwrap();
        restored.load_snapshot(&decoded).unwrap();
        assert_eq!(restored.step(), original.step());
    }

    #[test]
    fn rejects_foreign_state() {
        let mut cosine = CosineAnnealing::new(0.1, 0.0, 5).unwrap();
        let state = CosineWithRestarts::new(0.1, 0.0, 5, 2).unwrap().snapshot();
        assert!(cosine.load_snapshot(&state).is_err());
    }

    #[test]
    fn adamw_runs_without_schedule() {
        let mut optimizer = config::OptimizerConfig::default();
        optimizer.algorithm = config::OptimizerType::AdamW;
        let built = SchedulerConfig::from_training_config(&optimizer, &config::SchedulerConfig::default());
        assert!(built.is_none());
    }
}
