//! Epoch-based learning-rate schedules.
//!
//! Every schedule is a closed-form function of the epoch index, so restoring
//! `last_epoch` is enough to reproduce the learning rate after a resume.

use std::f64::consts::PI;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{config, TrainingError};

/// Names accepted in `[scheduler] name`.
pub const SCHEDULER_NAMES: &[&str] = &["constant", "step", "exponential", "cosine", "polynomial"];

pub trait LRScheduler: Send {
    fn name(&self) -> &'static str;
    /// Advances one epoch and returns the new learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    /// Fails when `state` was written by a different schedule.
    fn check_snapshot(&self, state: &SchedulerState) -> Result<(), TrainingError>;
    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub name: String,
    pub last_epoch: usize,
    pub base_lr: f64,
    pub current_lr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedulePolicy {
    Constant,
    Step { step_size: usize, gamma: f64 },
    Exponential { gamma: f64 },
    Cosine { t_max: usize, eta_min: f64 },
    Polynomial { max_epochs: usize, power: f64, min_lr: f64 },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StepArgs {
    step_size: usize,
    #[serde(default = "default_gamma")]
    gamma: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExponentialArgs {
    gamma: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CosineArgs {
    t_max: usize,
    #[serde(default)]
    eta_min: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PolynomialArgs {
    max_epochs: usize,
    #[serde(default = "default_power")]
    power: f64,
    #[serde(default)]
    min_lr: f64,
}

fn default_gamma() -> f64 {
    0.1
}

fn default_power() -> f64 {
    0.9
}

impl SchedulePolicy {
    pub fn from_config(cfg: &config::SchedulerConfig) -> Result<Self, TrainingError> {
        let policy = match cfg.name.as_str() {
            "constant" => {
                let empty = cfg.args.as_object().map_or(true, |map| map.is_empty());
                if !empty {
                    return Err(TrainingError::initialization(
                        "constant scheduler takes no args",
                    ));
                }
                SchedulePolicy::Constant
            }
            "step" => {
                let args: StepArgs = parse_args("step", &cfg.args)?;
                if args.step_size == 0 {
                    return Err(TrainingError::initialization(
                        "step scheduler requires step_size > 0",
                    ));
                }
                SchedulePolicy::Step {
                    step_size: args.step_size,
                    gamma: args.gamma,
                }
            }
            "exponential" => {
                let args: ExponentialArgs = parse_args("exponential", &cfg.args)?;
                SchedulePolicy::Exponential { gamma: args.gamma }
            }
            "cosine" => {
                let args: CosineArgs = parse_args("cosine", &cfg.args)?;
                if args.t_max == 0 {
                    return Err(TrainingError::initialization(
                        "cosine scheduler requires t_max > 0",
                    ));
                }
                SchedulePolicy::Cosine {
                    t_max: args.t_max,
                    eta_min: args.eta_min,
                }
            }
            "polynomial" => {
                let args: PolynomialArgs = parse_args("polynomial", &cfg.args)?;
                if args.max_epochs == 0 || args.power <= 0.0 {
                    return Err(TrainingError::initialization(
                        "polynomial scheduler requires max_epochs > 0 and power > 0",
                    ));
                }
                SchedulePolicy::Polynomial {
                    max_epochs: args.max_epochs,
                    power: args.power,
                    min_lr: args.min_lr,
                }
            }
            other => {
                return Err(TrainingError::unknown_component(
                    "scheduler",
                    other,
                    SCHEDULER_NAMES,
                ))
            }
        };
        Ok(policy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulePolicy::Constant => "constant",
            SchedulePolicy::Step { .. } => "step",
            SchedulePolicy::Exponential { .. } => "exponential",
            SchedulePolicy::Cosine { .. } => "cosine",
            SchedulePolicy::Polynomial { .. } => "polynomial",
        }
    }

    fn learning_rate_at(&self, base_lr: f64, epoch: usize) -> f64 {
        match *self {
            SchedulePolicy::Constant => base_lr,
            SchedulePolicy::Step { step_size, gamma } => {
                base_lr * gamma.powi((epoch / step_size) as i32)
            }
            SchedulePolicy::Exponential { gamma } => base_lr * gamma.powi(epoch as i32),
            SchedulePolicy::Cosine { t_max, eta_min } => {
                let progress = epoch as f64 / t_max as f64;
                eta_min + (base_lr - eta_min) * (1.0 + (PI * progress).cos()) / 2.0
            }
            SchedulePolicy::Polynomial {
                max_epochs,
                power,
                min_lr,
            } => {
                if epoch >= max_epochs {
                    min_lr
                } else {
                    let remaining = 1.0 - epoch as f64 / max_epochs as f64;
                    (base_lr - min_lr) * remaining.powf(power) + min_lr
                }
            }
        }
    }
}

fn parse_args<T: DeserializeOwned>(name: &str, args: &Value) -> Result<T, TrainingError> {
    serde_json::from_value(args.clone()).map_err(|err| {
        TrainingError::initialization(format!("invalid {name} scheduler args: {err}"))
    })
}

#[derive(Debug, Clone)]
pub struct EpochScheduler {
    policy: SchedulePolicy,
    base_lr: f64,
    last_epoch: usize,
    current_lr: f64,
}

impl EpochScheduler {
    pub fn new(policy: SchedulePolicy, base_lr: f64) -> Self {
        Self {
            policy,
            base_lr,
            last_epoch: 0,
            current_lr: policy.learning_rate_at(base_lr, 0),
        }
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }
}

impl LRScheduler for EpochScheduler {
    fn name(&self) -> &'static str {
        self.policy.name()
    }

    fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.current_lr = self.policy.learning_rate_at(self.base_lr, self.last_epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            name: self.name().to_string(),
            last_epoch: self.last_epoch,
            base_lr: self.base_lr,
            current_lr: self.current_lr,
        }
    }

    fn check_snapshot(&self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.name != self.name() {
            return Err(TrainingError::initialization(format!(
                "checkpoint scheduler is '{}' but run is configured with '{}'",
                state.name,
                self.name()
            )));
        }
        Ok(())
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        self.check_snapshot(state)?;
        self.base_lr = state.base_lr;
        self.last_epoch = state.last_epoch;
        self.current_lr = state.current_lr;
        Ok(())
    }
}

pub fn build_scheduler(
    cfg: &config::SchedulerConfig,
    base_lr: f64,
) -> Result<Box<dyn LRScheduler>, TrainingError> {
    let policy = SchedulePolicy::from_config(cfg)?;
    Ok(Box::new(EpochScheduler::new(policy, base_lr)))
}
