//! Shared test fixtures: a tiny deterministic game and scriptable networks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::eval::{EvalError, Network, NetworkOutput};
use crate::game::{ActionMask, GameRules, Outcome, StateEncoder};

// ---------------------------------------------------------------------------
// TakeAway — subtraction game
// ---------------------------------------------------------------------------

/// Two players alternate taking 1–3 stones from a pot; whoever takes the
/// last stone wins. Three global actions (action `a` takes `a + 1` stones),
/// perfect information, deterministic, no symmetries beyond the identity.
pub struct TakeAway;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TakeAwayState {
    pub pot: u8,
    pub to_move: u8,
}

/// Fresh position with `pot` stones, player 0 to move.
pub fn take_away(pot: u8) -> TakeAwayState {
    TakeAwayState { pot, to_move: 0 }
}

impl GameRules for TakeAway {
    type State = TakeAwayState;
    type Key = (u8, u8);

    const NUM_PLAYERS: usize = 2;
    const NUM_GLOBAL_ACTIONS: usize = 3;

    fn legal_actions(state: &TakeAwayState) -> ActionMask {
        (0..3).filter(|a| (a + 1) as u8 <= state.pot).collect()
    }

    fn current_player(state: &TakeAwayState) -> usize {
        state.to_move as usize
    }

    fn apply(state: &mut TakeAwayState, action: usize) -> Outcome {
        let take = (action + 1) as u8;
        debug_assert!(take <= state.pot, "illegal take of {take} from {}", state.pot);
        state.pot -= take;
        state.to_move ^= 1;
        Self::outcome(state)
    }

    fn outcome(state: &TakeAwayState) -> Outcome {
        if state.pot == 0 {
            // The player who just moved took the last stone.
            let winner = 1 - state.to_move as usize;
            let mut outcome = vec![0.0; 2];
            outcome[winner] = 1.0;
            outcome
        } else {
            vec![0.0; 2]
        }
    }

    fn canonical_key(state: &TakeAwayState) -> (u8, u8) {
        (state.pot, state.to_move)
    }
}

/// Flat encoding of a [`TakeAwayState`]; identity symmetry transforms.
pub struct TakeAwayEncoder;

impl StateEncoder<TakeAway> for TakeAwayEncoder {
    fn obs_dim(&self) -> usize {
        4
    }

    fn encode_into(&self, state: &TakeAwayState, buf: &mut [f32]) {
        buf[0] = state.pot as f32 / 32.0;
        buf[1] = (state.to_move == 0) as u8 as f32;
        buf[2] = (state.to_move == 1) as u8 as f32;
        buf[3] = 1.0;
    }
}

// ---------------------------------------------------------------------------
// Scriptable networks
// ---------------------------------------------------------------------------

/// Network returning the same scripted output for every sample, or a
/// scripted failure.
pub struct ScriptedNetwork {
    value_head: Vec<f32>,
    policy_logits: Vec<f32>,
    failure: Option<String>,
}

impl ScriptedNetwork {
    /// Flat value, flat policy.
    pub fn uniform() -> Self {
        Self::constant(vec![0.0; 2], vec![0.0; 3])
    }

    /// Fixed per-sample value head (length P) and global logits (length K).
    pub fn constant(value_head: Vec<f32>, policy_logits: Vec<f32>) -> Self {
        Self {
            value_head,
            policy_logits,
            failure: None,
        }
    }

    /// Every predict call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            value_head: Vec::new(),
            policy_logits: Vec::new(),
            failure: Some(message.to_string()),
        }
    }
}

impl Network for ScriptedNetwork {
    fn predict(
        &self,
        _input: &[f32],
        batch_size: usize,
        _obs_dim: usize,
    ) -> Result<NetworkOutput, EvalError> {
        if let Some(message) = &self.failure {
            return Err(EvalError::Network(message.clone()));
        }
        Ok(NetworkOutput {
            values: self.value_head.repeat(batch_size),
            policy_logits: self.policy_logits.repeat(batch_size),
        })
    }
}

// ---------------------------------------------------------------------------
// SpyNetwork — records invocation counts and batch sizes
// ---------------------------------------------------------------------------

struct SpyState {
    calls: AtomicUsize,
    positions: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    inner: ScriptedNetwork,
}

/// Shared view of a [`SpyNetwork`]'s recordings; clone freely.
#[derive(Clone)]
pub struct SpyHandle(Arc<SpyState>);

impl SpyHandle {
    pub fn new(inner: ScriptedNetwork) -> Self {
        Self(Arc::new(SpyState {
            calls: AtomicUsize::new(0),
            positions: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            inner,
        }))
    }

    pub fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    pub fn total_positions(&self) -> usize {
        self.0.positions.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.0.batch_sizes.lock().unwrap().clone()
    }

    fn record_and_predict(
        &self,
        input: &[f32],
        batch_size: usize,
        obs_dim: usize,
    ) -> Result<NetworkOutput, EvalError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        self.0.positions.fetch_add(batch_size, Ordering::SeqCst);
        self.0.batch_sizes.lock().unwrap().push(batch_size);
        self.0.inner.predict(input, batch_size, obs_dim)
    }
}

/// Wrapper handing an owned `Network` to the service while the test keeps
/// the [`SpyHandle`] for inspection.
pub struct SpyNetwork(pub SpyHandle);

impl Network for SpyNetwork {
    fn predict(
        &self,
        input: &[f32],
        batch_size: usize,
        obs_dim: usize,
    ) -> Result<NetworkOutput, EvalError> {
        self.0.record_and_predict(input, batch_size, obs_dim)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::is_terminal_outcome;

    #[test]
    fn legality_shrinks_with_the_pot() {
        assert_eq!(TakeAway::legal_actions(&take_away(5)).count(), 3);
        assert_eq!(TakeAway::legal_actions(&take_away(2)).count(), 2);
        assert_eq!(TakeAway::legal_actions(&take_away(1)).count(), 1);
        assert_eq!(TakeAway::legal_actions(&take_away(0)).count(), 0);
    }

    #[test]
    fn taking_the_last_stone_wins() {
        let mut state = take_away(3);
        let outcome = TakeAway::apply(&mut state, 2);
        assert!(is_terminal_outcome(&outcome));
        assert_eq!(outcome, vec![1.0, 0.0]);
        assert_eq!(state.pot, 0);
    }

    #[test]
    fn players_alternate() {
        let mut state = take_away(9);
        assert_eq!(TakeAway::current_player(&state), 0);
        let outcome = TakeAway::apply(&mut state, 0);
        assert!(!is_terminal_outcome(&outcome));
        assert_eq!(TakeAway::current_player(&state), 1);
        assert_eq!(state.pot, 8);
    }

    #[test]
    fn keys_distinguish_pot_and_mover() {
        let a = TakeAway::canonical_key(&take_away(4));
        let mut s = take_away(5);
        TakeAway::apply(&mut s, 0);
        let b = TakeAway::canonical_key(&s);
        assert_ne!(a, b, "same pot, different mover");
    }

    #[test]
    fn scripted_network_tiles_per_sample() {
        let net = ScriptedNetwork::constant(vec![1.0, 2.0], vec![3.0, 4.0, 5.0]);
        let out = net.predict(&[0.0; 8], 2, 4).unwrap();
        assert_eq!(out.values, vec![1.0, 2.0, 1.0, 2.0]);
        assert_eq!(out.policy_logits, vec![3.0, 4.0, 5.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn spy_records_batches() {
        let spy = SpyHandle::new(ScriptedNetwork::uniform());
        let net = SpyNetwork(spy.clone());
        net.predict(&[0.0; 12], 3, 4).unwrap();
        net.predict(&[0.0; 4], 1, 4).unwrap();

        assert_eq!(spy.calls(), 2);
        assert_eq!(spy.total_positions(), 4);
        assert_eq!(spy.batch_sizes(), vec![3, 1]);
    }
}
