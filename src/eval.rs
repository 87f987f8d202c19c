//! Neural-network evaluation types and the network seam.
//!
//! [`NnEvaluation`] is the immutable product of one network call for one
//! position: a value distribution over players and policy logits restricted
//! to the position's legal actions. Evaluations are shared by `Arc` between
//! the tree, the evaluation cache and in-flight batch slots.

use thiserror::Error;

use crate::game::ActionMask;

/// Errors surfaced by network execution or the evaluation service.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("network evaluation failed: {0}")]
    Network(String),

    #[error("evaluation service shut down")]
    ServiceShutDown,
}

/// Raw output of one batched network invocation.
///
/// `values` is row-major `batch × P` (unnormalized value-head outputs);
/// `policy_logits` is row-major `batch × K` over the global action space.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    pub values: Vec<f32>,
    pub policy_logits: Vec<f32>,
}

/// A loadable network artifact. The engine only requires a batched forward
/// pass; device placement and file format are the implementation's concern.
pub trait Network: Send + Sync {
    /// Evaluate `batch_size` samples of `obs_dim` floats each
    /// (`input.len() == batch_size * obs_dim`).
    fn predict(
        &self,
        input: &[f32],
        batch_size: usize,
        obs_dim: usize,
    ) -> Result<NetworkOutput, EvalError>;
}

/// Network surrogate with a flat policy and no opinion on the outcome.
/// Useful for bring-up and for exercising the service without a model.
pub struct UniformNetwork {
    pub num_players: usize,
    pub num_global_actions: usize,
}

impl Network for UniformNetwork {
    fn predict(
        &self,
        _input: &[f32],
        batch_size: usize,
        _obs_dim: usize,
    ) -> Result<NetworkOutput, EvalError> {
        Ok(NetworkOutput {
            values: vec![0.0; batch_size * self.num_players],
            policy_logits: vec![0.0; batch_size * self.num_global_actions],
        })
    }
}

// ---------------------------------------------------------------------------
// NnEvaluation
// ---------------------------------------------------------------------------

/// Immutable per-position evaluation: `value` is the softmax of the value
/// head (a distribution over players), `local_policy_logits` holds the
/// global policy logits gathered onto the legal actions in ascending action
/// order.
#[derive(Debug)]
pub struct NnEvaluation {
    value: Box<[f32]>,
    local_policy_logits: Box<[f32]>,
}

impl NnEvaluation {
    /// Build from one sample of a network output. `value_head` has length P,
    /// `global_policy_logits` length K; `valid` selects the local slice.
    pub fn from_network_output(
        value_head: &[f32],
        global_policy_logits: &[f32],
        valid: ActionMask,
    ) -> Self {
        let local: Box<[f32]> = valid
            .iter()
            .map(|a| global_policy_logits[a])
            .collect();
        Self {
            value: softmax(value_head).into_boxed_slice(),
            local_policy_logits: local,
        }
    }

    /// Uniform surrogate evaluation: flat value, flat policy.
    pub fn uniform(num_players: usize, num_valid_actions: usize) -> Self {
        Self {
            value: vec![1.0 / num_players as f32; num_players].into_boxed_slice(),
            local_policy_logits: vec![0.0; num_valid_actions].into_boxed_slice(),
        }
    }

    /// Value distribution over players (sums to 1).
    pub fn value(&self) -> &[f32] {
        &self.value
    }

    /// Policy logits over the position's legal actions, ascending by action.
    pub fn local_policy_logits(&self) -> &[f32] {
        &self.local_policy_logits
    }
}

/// Numerically stable softmax.
pub(crate) fn softmax(xs: &[f32]) -> Vec<f32> {
    let max = xs.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = xs.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_uniform_on_equal_logits() {
        let p = softmax(&[0.0, 0.0, 0.0]);
        for v in &p {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn softmax_orders_and_normalizes() {
        let p = softmax(&[2.0, 1.0, 0.5]);
        assert!(p[0] > p[1] && p[1] > p[2]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn softmax_large_logits_stable() {
        let p = softmax(&[1000.0, 999.0]);
        assert!(p.iter().all(|v| v.is_finite()));
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn evaluation_extracts_local_policy() {
        let valid: ActionMask = [0usize, 2].into_iter().collect();
        let eval = NnEvaluation::from_network_output(&[0.0, 0.0], &[1.5, -7.0, 0.25], valid);

        assert_eq!(eval.local_policy_logits(), &[1.5, 0.25]);
        assert!((eval.value()[0] - 0.5).abs() < 1e-6);
        assert!((eval.value()[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn evaluation_value_is_softmaxed() {
        let valid = ActionMask::all(2);
        let eval = NnEvaluation::from_network_output(&[1.0, -1.0], &[0.0, 0.0], valid);
        assert!(eval.value()[0] > eval.value()[1]);
        assert!((eval.value().iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn uniform_evaluation_shape() {
        let eval = NnEvaluation::uniform(2, 3);
        assert_eq!(eval.value(), &[0.5, 0.5]);
        assert_eq!(eval.local_policy_logits(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn uniform_network_predict_shapes() {
        let net = UniformNetwork {
            num_players: 2,
            num_global_actions: 3,
        };
        let out = net.predict(&[0.0; 8], 4, 2).unwrap();
        assert_eq!(out.values.len(), 8);
        assert_eq!(out.policy_logits.len(), 12);
    }
}
