//! Built-in evaluator backends.
//!
//! The `uniform` backend is a deterministic stub: zero value, flat policy,
//! no moves-left head. It is the default when no real network backend is
//! registered, and the reference evaluator for deterministic tests.

use super::{
    BackendCapabilities, BackendOptions, Computation, EvalError, Evaluator, MovesLeftFormat,
    PolicyFormat, ValueFormat,
};
use crate::encoding::{InputPlanes, INPUT_PLANES};
use std::sync::Arc;

pub(super) fn build_uniform(_options: &BackendOptions) -> Result<Arc<dyn Evaluator>, EvalError> {
    Ok(Arc::new(UniformEvaluator))
}

/// Flat-prior, zero-value evaluator.
pub struct UniformEvaluator;

impl Evaluator for UniformEvaluator {
    fn new_computation(&self) -> Box<dyn Computation> {
        Box::new(UniformComputation { batch: 0 })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            policy: PolicyFormat::Classical,
            value: ValueFormat::Scalar,
            moves_left: MovesLeftFormat::None,
            input_planes: INPUT_PLANES,
        }
    }
}

struct UniformComputation {
    batch: usize,
}

impl Computation for UniformComputation {
    fn add_input(&mut self, _planes: InputPlanes) {
        self.batch += 1;
    }

    fn batch_len(&self) -> usize {
        self.batch
    }

    fn compute_blocking(&mut self) -> Result<(), EvalError> {
        Ok(())
    }

    fn value(&self, _i: usize) -> f32 {
        0.0
    }

    fn wdl(&self, _i: usize) -> (f32, f32, f32) {
        (0.5, 0.0, 0.5)
    }

    fn policy(&self, _i: usize, _move_idx: usize) -> f32 {
        // Equal logits: uniform priors after the legal-move softmax.
        0.0
    }

    fn moves_left(&self, _i: usize) -> f32 {
        0.0
    }
}
