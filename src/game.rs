//! Game-layer contracts consumed by the engine.
//!
//! The engine itself carries no game knowledge. Rules enter through
//! [`GameRules`] (legal moves, move application, terminal detection,
//! canonical keys, symmetries) and tensor layout enters through
//! [`StateEncoder`]. Everything else — the tree, the search threads, the
//! evaluation service — is written against these two traits.

use rand::Rng;

/// Largest supported global action space. Legality masks are a single
/// `u128`, so games must index their actions into `0..128`.
pub const MAX_GLOBAL_ACTIONS: usize = 128;

/// Largest supported symmetry group size.
pub const MAX_SYMMETRIES: usize = 64;

// ---------------------------------------------------------------------------
// ActionMask — legality / analysis bitset over the global action space
// ---------------------------------------------------------------------------

/// Bitset over global action indices. Bit `a` set means action `a` is in
/// the set. Children of a node correspond to the on-bits of the node's
/// legality mask, in ascending action order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct ActionMask(u128);

impl ActionMask {
    pub const EMPTY: ActionMask = ActionMask(0);

    pub fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u128 {
        self.0
    }

    /// Mask with bits `0..k` set.
    pub fn all(k: usize) -> Self {
        debug_assert!(k <= MAX_GLOBAL_ACTIONS);
        if k == MAX_GLOBAL_ACTIONS {
            Self(u128::MAX)
        } else {
            Self((1u128 << k) - 1)
        }
    }

    pub fn set(&mut self, action: usize) {
        debug_assert!(action < MAX_GLOBAL_ACTIONS);
        self.0 |= 1u128 << action;
    }

    pub fn clear(&mut self, action: usize) {
        debug_assert!(action < MAX_GLOBAL_ACTIONS);
        self.0 &= !(1u128 << action);
    }

    pub fn is_set(self, action: usize) -> bool {
        debug_assert!(action < MAX_GLOBAL_ACTIONS);
        self.0 & (1u128 << action) != 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Set complement restricted to actions `0..k`.
    pub fn complement_within(self, k: usize) -> Self {
        Self(!self.0 & Self::all(k).0)
    }

    /// True when every action in `0..k` is in the set.
    pub fn contains_all(self, k: usize) -> bool {
        self.0 & Self::all(k).0 == Self::all(k).0
    }

    /// Ascending iteration over on-bits.
    pub fn iter(self) -> ActionMaskIter {
        ActionMaskIter(self.0)
    }

    /// Position of `action` among the on-bits (its local index), assuming
    /// `action` is set.
    pub fn local_index(self, action: usize) -> usize {
        debug_assert!(self.is_set(action));
        (self.0 & ((1u128 << action) - 1)).count_ones() as usize
    }

    /// Uniformly random on-bit. The set must be non-empty.
    pub fn choose_set_bit(self, rng: &mut impl Rng) -> usize {
        debug_assert!(!self.is_empty());
        let n = rng.gen_range(0..self.count());
        self.iter().nth(n).expect("choose_set_bit: empty mask")
    }
}

impl std::ops::BitOr for ActionMask {
    type Output = ActionMask;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for ActionMask {
    type Output = ActionMask;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl FromIterator<usize> for ActionMask {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut mask = Self::EMPTY;
        for a in iter {
            mask.set(a);
        }
        mask
    }
}

pub struct ActionMaskIter(u128);

impl Iterator for ActionMaskIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let a = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(a)
    }
}

// ---------------------------------------------------------------------------
// SymmetryMask — applicable symmetry indices for a state
// ---------------------------------------------------------------------------

/// Bitset over symmetry indices. Bit `i` set means symmetry `i` applies to
/// the state. Every state admits at least the identity (bit 0).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SymmetryMask(u64);

impl SymmetryMask {
    /// Identity-only symmetry group.
    pub fn identity() -> Self {
        Self(1)
    }

    pub fn from_bits(bits: u64) -> Self {
        debug_assert!(bits != 0, "symmetry mask must contain the identity");
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_set(self, index: u8) -> bool {
        debug_assert!((index as usize) < MAX_SYMMETRIES);
        self.0 & (1u64 << index) != 0
    }

    /// Uniformly random applicable symmetry index.
    pub fn choose(self, rng: &mut impl Rng) -> u8 {
        debug_assert!(self.0 != 0);
        let mut n = rng.gen_range(0..self.count());
        let mut bits = self.0;
        loop {
            let i = bits.trailing_zeros() as u8;
            if n == 0 {
                return i;
            }
            bits &= bits - 1;
            n -= 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome helpers
// ---------------------------------------------------------------------------

/// Per-player outcome distribution. The zero vector means "not terminal";
/// terminal outcomes are non-negative and sum to 1 (a one-hot vector for a
/// decisive result, fractional for draws).
pub type Outcome = Vec<f32>;

/// Outcome of a non-terminal transition.
pub fn non_terminal_outcome(num_players: usize) -> Outcome {
    vec![0.0; num_players]
}

pub fn is_terminal_outcome(outcome: &[f32]) -> bool {
    outcome.iter().sum::<f32>() > 0.0
}

// ---------------------------------------------------------------------------
// GameRules — the rule-layer contract
// ---------------------------------------------------------------------------

/// Two-player-or-more, perfect-information, deterministic game rules.
///
/// All functions are pure with respect to the passed state; the engine never
/// holds rule-layer objects, only states.
pub trait GameRules: Sized + Send + Sync + 'static {
    /// Full game state. Cloned once per tree edge during descent.
    type State: Clone + Send + Sync + 'static;

    /// Canonical transposition key. States with equal keys are
    /// interchangeable for search purposes.
    type Key: Eq + std::hash::Hash + Clone + Send + Sync + 'static;

    /// Number of players P. Outcomes and value vectors have this length.
    const NUM_PLAYERS: usize;

    /// Size of the global action space K (≤ [`MAX_GLOBAL_ACTIONS`]).
    const NUM_GLOBAL_ACTIONS: usize;

    /// Legal actions in `state`.
    fn legal_actions(state: &Self::State) -> ActionMask;

    /// Player to move in `state`.
    fn current_player(state: &Self::State) -> usize;

    /// Apply `action` to `state` in place. Returns the terminal outcome of
    /// the resulting position, or the zero vector if play continues.
    fn apply(state: &mut Self::State, action: usize) -> Outcome;

    /// Terminal outcome of `state` itself (zero vector if non-terminal).
    fn outcome(state: &Self::State) -> Outcome;

    /// Canonical key of `state`.
    fn canonical_key(state: &Self::State) -> Self::Key;

    /// Symmetries applicable to `state`. Defaults to identity-only.
    fn symmetries(_state: &Self::State) -> SymmetryMask {
        SymmetryMask::identity()
    }
}

// ---------------------------------------------------------------------------
// StateEncoder — tensorization seam
// ---------------------------------------------------------------------------

/// Converts states into network input slabs and maps symmetries onto the
/// input/policy tensors. Symmetry transforms are in-place and invertible:
/// applying a symmetry to the input and inverting it on the policy output
/// keeps search statistics in the state's canonical frame.
pub trait StateEncoder<G: GameRules>: Send + Sync + 'static {
    /// Per-sample input length in `f32`s.
    fn obs_dim(&self) -> usize;

    /// Write the encoding of `state` into `buf` (`buf.len() == obs_dim()`).
    fn encode_into(&self, state: &G::State, buf: &mut [f32]);

    /// Apply symmetry `sym` to an encoded input, in place.
    fn apply_input_symmetry(&self, _sym: u8, _buf: &mut [f32]) {}

    /// Apply the inverse of symmetry `sym` to a global policy vector
    /// (`len == NUM_GLOBAL_ACTIONS`), in place.
    fn invert_policy_symmetry(&self, _sym: u8, _policy: &mut [f32]) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
