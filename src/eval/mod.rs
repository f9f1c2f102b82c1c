//! Evaluator contract and backend registry.
//!
//! A backend is anything that can turn a batch of input planes into policy
//! priors, a value estimate, and optionally a WDL triple and a moves-left
//! estimate. The search core only ever sees the [`Evaluator`] and
//! [`Computation`] traits; backend-specific configuration never leaks past
//! the factory.

pub mod backends;
pub mod batching;

use crate::encoding::InputPlanes;
use crate::position::VerifyKey;
use crate::weights::WeightsFile;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("computation aborted")]
    Aborted,
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    #[error("no backend available")]
    NoBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFormat {
    Classical,
    Convolutional,
    Attention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Scalar,
    Wdl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovesLeftFormat {
    None,
    V1,
}

/// What a backend can produce; the search adapts its interpretation of the
/// outputs accordingly.
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    pub policy: PolicyFormat,
    pub value: ValueFormat,
    pub moves_left: MovesLeftFormat,
    pub input_planes: usize,
}

/// One batched network evaluation in flight. Inputs are accumulated with
/// [`Computation::add_input`] and executed in one shot.
pub trait Computation: Send {
    fn add_input(&mut self, planes: InputPlanes);
    fn batch_len(&self) -> usize;
    fn compute_blocking(&mut self) -> Result<(), EvalError>;
    /// Scalar value of sample `i`, in [-1, 1], side to move's perspective.
    fn value(&self, i: usize) -> f32;
    /// (win, draw, loss) probabilities of sample `i`.
    fn wdl(&self, i: usize) -> (f32, f32, f32);
    /// Raw policy logit of sample `i` at flat move index `move_idx`.
    fn policy(&self, i: usize, move_idx: usize) -> f32;
    /// Predicted plies remaining for sample `i`; 0 when unsupported.
    fn moves_left(&self, i: usize) -> f32;
}

pub trait Evaluator: Send + Sync {
    fn new_computation(&self) -> Box<dyn Computation>;
    fn capabilities(&self) -> BackendCapabilities;
}

/// Cached network outputs for one position. The policy vector holds raw
/// logits over the full move encoding; the legal-move mask and softmax are
/// applied at expansion time.
#[derive(Debug, Clone)]
pub struct EvalRecord {
    pub value: f32,
    pub wdl: (f32, f32, f32),
    pub policy: Vec<f32>,
    pub moves_left: f32,
    pub verify: VerifyKey,
}

/// Inputs available to a backend factory.
pub struct BackendOptions {
    pub weights: Option<Arc<WeightsFile>>,
    pub max_batch_size: usize,
}

type BackendBuilder = fn(&BackendOptions) -> Result<Arc<dyn Evaluator>, EvalError>;

struct BackendSpec {
    name: &'static str,
    priority: i32,
    build: BackendBuilder,
}

/// Open set of evaluator implementations, selected by name or priority.
pub struct BackendRegistry {
    specs: Vec<BackendSpec>,
}

impl BackendRegistry {
    /// Registry preloaded with the built-in backends.
    pub fn new() -> Self {
        let mut registry = BackendRegistry { specs: Vec::new() };
        registry.register("uniform", -100, backends::build_uniform);
        registry
    }

    pub fn register(&mut self, name: &'static str, priority: i32, build: BackendBuilder) {
        self.specs.push(BackendSpec {
            name,
            priority,
            build,
        });
        self.specs.sort_by_key(|s| std::cmp::Reverse(s.priority));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.iter().map(|s| s.name).collect()
    }

    /// Build a backend by name, or the highest-priority one when no name is
    /// given.
    pub fn create(
        &self,
        name: Option<&str>,
        options: &BackendOptions,
    ) -> Result<Arc<dyn Evaluator>, EvalError> {
        match name {
            Some(wanted) => {
                let spec = self
                    .specs
                    .iter()
                    .find(|s| s.name == wanted)
                    .ok_or_else(|| EvalError::UnknownBackend(wanted.to_string()))?;
                (spec.build)(options)
            }
            None => {
                let spec = self.specs.first().ok_or(EvalError::NoBackend)?;
                (spec.build)(options)
            }
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
