use std::collections::{BTreeMap, HashMap, HashSet};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{config, error::to_runtime_error, TrainingError};

/// Names accepted in `[optimizer] name`.
pub const OPTIMIZER_NAMES: &[&str] = &["sgd", "adam", "adamw", "rmsprop"];

const MOMENTUM: &str = "momentum";
const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";
const SQUARE_AVG: &str = "square_avg";
const GRAD_AVG: &str = "grad_avg";

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    Adam(AdamConfig),
    AdamW(AdamConfig),
    RmsProp(RmsPropConfig),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SgdConfig {
    #[serde(skip)]
    pub learning_rate: f64,
    pub momentum: f64,
    pub dampening: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.0,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdamConfig {
    #[serde(skip)]
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RmsPropConfig {
    #[serde(skip)]
    pub learning_rate: f64,
    pub alpha: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub momentum: f64,
    pub centered: bool,
}

impl Default for RmsPropConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.0,
            alpha: 0.99,
            epsilon: 1e-8,
            weight_decay: 0.0,
            momentum: 0.0,
            centered: false,
        }
    }
}

impl OptimizerConfig {
    pub fn from_config(value: &config::OptimizerConfig) -> Result<Self, TrainingError> {
        let lr = value.learning_rate;
        let config = match value.name.as_str() {
            "sgd" => {
                let mut cfg: SgdConfig = parse_args("sgd", &value.args)?;
                cfg.learning_rate = lr;
                if cfg.nesterov && (cfg.momentum <= 0.0 || cfg.dampening != 0.0) {
                    return Err(TrainingError::initialization(
                        "nesterov momentum requires momentum > 0 and zero dampening",
                    ));
                }
                OptimizerConfig::Sgd(cfg)
            }
            "adam" => {
                let mut cfg: AdamConfig = parse_args("adam", &value.args)?;
                cfg.learning_rate = lr;
                OptimizerConfig::Adam(cfg)
            }
            "adamw" => {
                // Decoupled decay defaults to 1e-2 unless given explicitly.
                let mut args = value.args.clone();
                if let Some(map) = args.as_object_mut() {
                    map.entry("weight_decay").or_insert(Value::from(1e-2));
                }
                let mut cfg: AdamConfig = parse_args("adamw", &args)?;
                cfg.learning_rate = lr;
                OptimizerConfig::AdamW(cfg)
            }
            "rmsprop" => {
                let mut cfg: RmsPropConfig = parse_args("rmsprop", &value.args)?;
                cfg.learning_rate = lr;
                OptimizerConfig::RmsProp(cfg)
            }
            other => {
                return Err(TrainingError::unknown_component(
                    "optimizer",
                    other,
                    OPTIMIZER_NAMES,
                ))
            }
        };
        Ok(config)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Sgd(_) => "sgd",
            OptimizerConfig::Adam(_) => "adam",
            OptimizerConfig::AdamW(_) => "adamw",
            OptimizerConfig::RmsProp(_) => "rmsprop",
        }
    }

    fn learning_rate_mut(&mut self) -> &mut f64 {
        match self {
            OptimizerConfig::Sgd(cfg) => &mut cfg.learning_rate,
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => &mut cfg.learning_rate,
            OptimizerConfig::RmsProp(cfg) => &mut cfg.learning_rate,
        }
    }
}

fn parse_args<T: DeserializeOwned>(name: &str, args: &Value) -> Result<T, TrainingError> {
    serde_json::from_value(args.clone()).map_err(|err| {
        TrainingError::initialization(format!("invalid {name} optimizer args: {err}"))
    })
}

/// Optimizer over named parameters with serializable per-parameter state.
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
    step: usize,
    buffers: BTreeMap<String, Tensor>,
}

impl TrainerOptimizer {
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
            if var.as_tensor().dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters; '{}' is {:?}",
                    name,
                    var.as_tensor().dtype()
                )));
            }
            params.push(ParameterSlot {
                name,
                param: var,
                step: 0,
                buffers: BTreeMap::new(),
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.config.name()
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
            OptimizerConfig::RmsProp(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        *self.config.learning_rate_mut() = lr;
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Applies one update from the accumulated gradients. Parameters without a
    /// gradient are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        let config = self.config;
        for slot in &mut self.params {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };
            slot.apply(&config, grad).map_err(to_runtime_error)?;
        }
        self.step += 1;
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
            let mut buffers = BTreeMap::new();
            for (key, tensor) in &slot.buffers {
                let values = tensor
                    .flatten_all()
                    .and_then(|t| t.to_vec1::<f32>())
                    .map_err(to_runtime_error)?;
                buffers.insert(key.clone(), values);
            }
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                step: slot.step,
                buffers,
            });
        }

        Ok(OptimizerState {
            algorithm: self.name().to_string(),
            step: self.step,
            learning_rate: self.learning_rate(),
            parameters,
        })
    }

    /// Restores state saved by [`TrainerOptimizer::state`].
    ///
    /// With `strict`, the parameter names must match exactly. Otherwise state
    /// is loaded for the overlap and the remaining slots stay fresh. Nothing
    /// is modified when the state is rejected.
    pub fn load_state(&mut self, state: OptimizerState, strict: bool) -> Result<(), TrainingError> {
        self.validate_state(&state, strict)?;
        self.apply_state(state)
    }

    /// Checks `state` against this optimizer without modifying it: algorithm,
    /// parameter names under `strict`, and shapes of every shared slot.
    pub fn validate_state(&self, state: &OptimizerState, strict: bool) -> Result<(), TrainingError> {
        if state.algorithm != self.name() {
            return Err(TrainingError::initialization(format!(
                "checkpoint optimizer is '{}' but run is configured with '{}'",
                state.algorithm,
                self.name()
            )));
        }

        let saved: HashMap<&str, &ParameterState> = state
            .parameters
            .iter()
            .map(|param| (param.name.as_str(), param))
            .collect();
        let known: HashSet<&str> = self.params.iter().map(|slot| slot.name.as_str()).collect();
        let unexpected: Vec<String> = state
            .parameters
            .iter()
            .filter(|param| !known.contains(param.name.as_str()))
            .map(|param| param.name.clone())
            .collect();
        let missing: Vec<String> = self
            .params
            .iter()
            .filter(|slot| !saved.contains_key(slot.name.as_str()))
            .map(|slot| slot.name.clone())
            .collect();

        if !(missing.is_empty() && unexpected.is_empty()) {
            if strict {
                return Err(TrainingError::KeyMismatch {
                    missing,
                    unexpected,
                });
            }
            warn!(
                "optimizer state mismatch; missing={:?} unexpected={:?}",
                missing, unexpected
            );
        }

        for slot in &self.params {
            let Some(param) = saved.get(slot.name.as_str()) else {
                continue;
            };
            let dims = slot.param.as_tensor().dims();
            if param.shape != dims {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}': saved {:?}, model {:?}",
                    slot.name, param.shape, dims
                )));
            }
            let expected: usize = dims.iter().product();
            for (key, values) in &param.buffers {
                if values.len() != expected {
                    return Err(TrainingError::runtime(format!(
                        "optimizer buffer '{}' for '{}' has {} values, expected {}",
                        key,
                        slot.name,
                        values.len(),
                        expected
                    )));
                }
            }
        }
        Ok(())
    }

    /// Loads state already accepted by [`TrainerOptimizer::validate_state`].
    pub(crate) fn apply_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<String, ParameterState> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let Some(saved) = by_name.remove(&slot.name) else {
                continue;
            };
            let device = slot.param.as_tensor().device().clone();
            let mut buffers = BTreeMap::new();
            for (key, values) in saved.buffers {
                let tensor = Tensor::from_vec(values, saved.shape.as_slice(), &device)
                    .map_err(to_runtime_error)?;
                buffers.insert(key, tensor);
            }
            slot.buffers = buffers;
            slot.step = saved.step;
        }

        self.step = state.step;
        self.set_learning_rate(state.learning_rate);
        Ok(())
    }
}

impl ParameterSlot {
    fn apply(&mut self, config: &OptimizerConfig, grad: &Tensor) -> candle_core::Result<()> {
        self.step += 1;
        let param = self.param.as_tensor().detach();
        let grad = grad.to_dtype(DType::F32)?;

        let next = match *config {
            OptimizerConfig::Sgd(cfg) => {
                let mut direction = with_weight_decay(&grad, &param, cfg.weight_decay)?;
                if cfg.momentum != 0.0 {
                    let buffer = match self.buffers.get(MOMENTUM) {
                        Some(prev) => (prev.affine(cfg.momentum, 0.0)?
                            + direction.affine(1.0 - cfg.dampening, 0.0)?)?,
                        None => direction.clone(),
                    };
                    direction = if cfg.nesterov {
                        (direction + buffer.affine(cfg.momentum, 0.0)?)?
                    } else {
                        buffer.clone()
                    };
                    self.buffers.insert(MOMENTUM.to_string(), buffer);
                }
                (param - direction.affine(cfg.learning_rate, 0.0)?)?
            }
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => {
                let decoupled = matches!(config, OptimizerConfig::AdamW(_));
                let (param, grad) = if decoupled {
                    let decay = 1.0 - cfg.learning_rate * cfg.weight_decay;
                    (param.affine(decay, 0.0)?, grad)
                } else {
                    let grad = with_weight_decay(&grad, &param, cfg.weight_decay)?;
                    (param, grad)
                };
                let exp_avg = self.ema(EXP_AVG, &grad, cfg.beta1)?;
                let exp_avg_sq = self.ema(EXP_AVG_SQ, &grad.sqr()?, cfg.beta2)?;
                let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
                let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
                let denom = exp_avg_sq
                    .affine(1.0 / bias_correction2, 0.0)?
                    .sqrt()?
                    .affine(1.0, cfg.epsilon)?;
                let update = exp_avg
                    .affine(cfg.learning_rate / bias_correction1, 0.0)?
                    .div(&denom)?;
                (param - update)?
            }
            OptimizerConfig::RmsProp(cfg) => {
                let grad = with_weight_decay(&grad, &param, cfg.weight_decay)?;
                let square_avg = self.ema(SQUARE_AVG, &grad.sqr()?, cfg.alpha)?;
                let avg = if cfg.centered {
                    let grad_avg = self.ema(GRAD_AVG, &grad, cfg.alpha)?;
                    (square_avg - grad_avg.sqr()?)?.sqrt()?.affine(1.0, cfg.epsilon)?
                } else {
                    square_avg.sqrt()?.affine(1.0, cfg.epsilon)?
                };
                let mut direction = grad.div(&avg)?;
                if cfg.momentum > 0.0 {
                    if let Some(prev) = self.buffers.get(MOMENTUM) {
                        direction = (prev.affine(cfg.momentum, 0.0)? + direction)?;
                    }
                    self.buffers.insert(MOMENTUM.to_string(), direction.clone());
                }
                (param - direction.affine(cfg.learning_rate, 0.0)?)?
            }
        };

        self.param.set(&next)
    }

    fn ema(&mut self, key: &str, value: &Tensor, decay: f64) -> candle_core::Result<Tensor> {
        let next = match self.buffers.get(key) {
            Some(prev) => (prev.affine(decay, 0.0)? + value.affine(1.0 - decay, 0.0)?)?,
            None => value.affine(1.0 - decay, 0.0)?,
        };
        self.buffers.insert(key.to_string(), next.clone());
        Ok(next)
    }
}

fn with_weight_decay(grad: &Tensor, param: &Tensor, weight_decay: f64) -> candle_core::Result<Tensor> {
    if weight_decay == 0.0 {
        Ok(grad.clone())
    } else {
        grad + param.affine(weight_decay, 0.0)?
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub algorithm: String,
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub step: usize,
    pub buffers: BTreeMap<String, Vec<f32>>,
}
