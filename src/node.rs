//! Search-tree nodes.
//!
//! A node's non-constant data falls into four groups with distinct write
//! lifecycles:
//!
//! - stable data: parent link, incoming action, move number — written at
//!   construction (plus a detachment flag flipped only while no search
//!   thread is running);
//! - lazily initialized data: the game state and everything derived from it,
//!   published exactly once through a [`OnceLock`] by the first visitor;
//! - children: a contiguous, action-sorted array published exactly once
//!   through a [`OnceLock`] (readers that observe "unset" see no children);
//! - evaluation data and stats: mutated throughout the search under their
//!   own mutexes.
//!
//! Multiple search threads read and write nodes concurrently; every
//! operation here is safe to call from any thread once the publication
//! rules above are respected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};

use rand::Rng;
use tracing::trace;

use crate::eval::NnEvaluation;
use crate::game::{is_terminal_outcome, ActionMask, GameRules, Outcome};
use crate::lookup::LookupTable;

/// Slack when deciding that per-player lower bounds cover the simplex.
const CERTAINTY_EPS: f32 = 1e-5;

// ---------------------------------------------------------------------------
// NodeStats
// ---------------------------------------------------------------------------

/// Per-node aggregates updated by backpropagation. Guarded by the node's
/// stats mutex.
#[derive(Clone, Debug)]
pub struct NodeStats {
    /// Mean backpropagated value per player, on [0, 1], summing to ~1 once
    /// `count > 0`.
    pub value_avg: Vec<f32>,
    /// Equals `v_floor` once the outcome is certain, `value_avg` otherwise.
    pub effective_value_avg: Vec<f32>,
    /// Proven per-player lower bound on the outcome.
    pub v_floor: Vec<f32>,
    /// Backpropagations that have reached this node (virtual ones included
    /// until undone).
    pub count: i32,
    /// Outstanding virtual-loss charges.
    pub virtual_count: i32,
    /// Outcome proven decisive under best play; the node no longer attracts
    /// visits.
    pub eliminated: bool,
}

impl NodeStats {
    fn new(num_players: usize) -> Self {
        Self {
            value_avg: vec![0.0; num_players],
            effective_value_avg: vec![0.0; num_players],
            v_floor: vec![0.0; num_players],
            count: 0,
            virtual_count: 0,
            eliminated: false,
        }
    }

    /// Visits that count toward the search budget and PUCT denominators.
    pub fn effective_count(&self) -> i32 {
        if self.eliminated {
            0
        } else {
            self.count
        }
    }

    /// The per-player lower bounds jointly cover the simplex: the node's
    /// outcome is fully determined.
    pub fn has_certain_outcome(&self) -> bool {
        self.v_floor.iter().sum::<f32>() > 1.0 - CERTAINTY_EPS
    }

    /// Some player is proven to win outright.
    pub fn can_be_eliminated(&self) -> bool {
        self.v_floor.iter().any(|&v| v >= 1.0)
    }

    /// Player `p` is proven to win under best play.
    pub fn provably_winning(&self, p: usize) -> bool {
        self.v_floor[p] >= 1.0
    }

    /// Player `p` is proven to get nothing under best play.
    pub fn provably_losing(&self, p: usize) -> bool {
        self.has_certain_outcome() && self.v_floor[p] <= 0.0
    }

    fn refresh_effective(&mut self) {
        let src = if self.has_certain_outcome() {
            &self.v_floor
        } else {
            &self.value_avg
        };
        self.effective_value_avg.clone_from(src);
    }
}

// ---------------------------------------------------------------------------
// Lazily initialized data
// ---------------------------------------------------------------------------

/// State-derived data, computed by the first visitor.
pub struct LazyData<G: GameRules> {
    pub state: G::State,
    /// Zero vector while play continues.
    pub outcome: Outcome,
    pub valid_actions: ActionMask,
    pub current_player: usize,
    /// Symmetry applied when tensorizing this position.
    pub sym_index: u8,
}

impl<G: GameRules> LazyData<G> {
    pub fn is_terminal(&self) -> bool {
        is_terminal_outcome(&self.outcome)
    }

    pub fn num_valid_actions(&self) -> usize {
        self.valid_actions.count()
    }
}

// ---------------------------------------------------------------------------
// Evaluation data
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvalState {
    Unset,
    /// Some thread is evaluating; the result will arrive through `eval_cv`.
    Pending,
    /// Evaluation present; `eval` and `local_policy` are frozen.
    Set,
}

/// Guarded by the node's eval mutex, signalled through `eval_cv`.
pub struct EvalData {
    pub eval: Option<Arc<NnEvaluation>>,
    /// Policy distribution over legal actions (noise and tempering already
    /// applied for roots). Empty until `state == Set`.
    pub local_policy: Box<[f32]>,
    pub state: EvalState,
    /// Actions whose subtrees are proven terminal. Seeded with the
    /// complement of the legality mask so "all bits set" means "all legal
    /// actions analyzed".
    pub fully_analyzed: ActionMask,
}

impl EvalData {
    fn new() -> Self {
        Self {
            eval: None,
            local_policy: Box::new([]),
            state: EvalState::Unset,
            fully_analyzed: ActionMask::EMPTY,
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

struct StableData<G: GameRules> {
    parent: Weak<Node<G>>,
    /// Action taken from the parent; `None` for roots.
    action: Option<usize>,
    move_number: u32,
    /// Set when the node is promoted to root; backpropagation stops here
    /// even while the old parent is still being reclaimed.
    severed: AtomicBool,
}

/// One game position reached by search. See the module docs for the write
/// lifecycle of each field group.
pub struct Node<G: GameRules> {
    stable: StableData<G>,
    lazy: OnceLock<LazyData<G>>,
    children: OnceLock<Box<[Arc<Node<G>>]>>,
    pub(crate) eval: Mutex<EvalData>,
    pub(crate) eval_cv: Condvar,
    stats: Mutex<NodeStats>,
}

impl<G: GameRules> Node<G> {
    fn with_stable(stable: StableData<G>) -> Self {
        Self {
            stable,
            lazy: OnceLock::new(),
            children: OnceLock::new(),
            eval: Mutex::new(EvalData::new()),
            eval_cv: Condvar::new(),
            stats: Mutex::new(NodeStats::new(G::NUM_PLAYERS)),
        }
    }

    /// Construct a fully initialized root for `state`.
    pub fn new_root(state: G::State, move_number: u32, sym_index: u8) -> Arc<Self> {
        let outcome = G::outcome(&state);
        let valid_actions = G::legal_actions(&state);
        let current_player = G::current_player(&state);

        let node = Arc::new(Self::with_stable(StableData {
            parent: Weak::new(),
            action: None,
            move_number,
            severed: AtomicBool::new(false),
        }));
        let set = node.lazy.set(LazyData {
            state,
            outcome,
            valid_actions,
            current_player,
            sym_index,
        });
        debug_assert!(set.is_ok());
        node.eval.lock().unwrap().fully_analyzed =
            valid_actions.complement_within(G::NUM_GLOBAL_ACTIONS);
        node
    }

    fn new_child(parent: &Arc<Self>, action: usize) -> Self {
        Self::with_stable(StableData {
            parent: Arc::downgrade(parent),
            action: Some(action),
            move_number: parent.stable.move_number + 1,
            severed: AtomicBool::new(false),
        })
    }

    // --- Stable accessors ---

    /// Parent link; `None` for roots and detached subtree roots.
    pub fn parent(&self) -> Option<Arc<Self>> {
        if self.stable.severed.load(Ordering::Acquire) {
            return None;
        }
        self.stable.parent.upgrade()
    }

    pub fn action(&self) -> Option<usize> {
        self.stable.action
    }

    pub fn move_number(&self) -> u32 {
        self.stable.move_number
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Detach from the parent. Only called while search threads are stopped.
    pub fn sever(&self) {
        self.stable.severed.store(true, Ordering::Release);
    }

    // --- Lazy data ---

    pub fn lazy(&self) -> Option<&LazyData<G>> {
        self.lazy.get()
    }

    pub(crate) fn lazy_data(&self) -> &LazyData<G> {
        self.lazy.get().expect("node not lazily initialized")
    }

    /// Derive and publish the state-dependent data, exactly once. The
    /// initializing thread also seeds the fully-analyzed mask and registers
    /// the node in `table`; concurrent callers block until publication and
    /// then share the result.
    pub fn lazy_init<'a>(
        node: &'a Arc<Self>,
        table: &LookupTable<G>,
        random_symmetries: bool,
        rng: &mut impl Rng,
    ) -> &'a LazyData<G> {
        node.lazy.get_or_init(|| {
            let parent = node
                .parent()
                .expect("lazy_init: uninitialized node has no parent");
            let parent_lazy = parent.lazy_data();
            let action = node
                .stable
                .action
                .expect("lazy_init: non-root node without action");

            let mut state = parent_lazy.state.clone();
            let outcome = G::apply(&mut state, action);
            let valid_actions = G::legal_actions(&state);
            let current_player = G::current_player(&state);
            let sym_index = if random_symmetries {
                G::symmetries(&state).choose(rng)
            } else {
                0
            };

            node.eval.lock().unwrap().fully_analyzed =
                valid_actions.complement_within(G::NUM_GLOBAL_ACTIONS);
            table.insert_if_absent(
                node.stable.move_number,
                G::canonical_key(&state),
                Arc::clone(node),
            );

            LazyData {
                state,
                outcome,
                valid_actions,
                current_player,
                sym_index,
            }
        })
    }

    // --- Children ---

    /// Children in ascending action order; empty until expanded.
    pub fn children(&self) -> &[Arc<Self>] {
        self.children.get().map(|c| &c[..]).unwrap_or(&[])
    }

    pub fn has_children(&self) -> bool {
        self.children.get().is_some()
    }

    /// Allocate and publish one child per legal action. Publication is a
    /// single release-store; a racing expander loses and its shells are
    /// dropped untouched.
    pub fn expand_children(node: &Arc<Self>) {
        if node.children.get().is_some() {
            return;
        }
        let lazy = node.lazy_data();
        let kids: Box<[Arc<Self>]> = lazy
            .valid_actions
            .iter()
            .map(|a| Arc::new(Self::new_child(node, a)))
            .collect();
        let _ = node.children.set(kids);
    }

    /// Child taken by `action`, if expanded. Children are action-sorted, so
    /// a binary search suffices.
    pub fn find_child(&self, action: usize) -> Option<Arc<Self>> {
        let children = self.children.get()?;
        let idx = children
            .binary_search_by_key(&action, |c| {
                c.stable.action.expect("child node without action")
            })
            .ok()?;
        Some(Arc::clone(&children[idx]))
    }

    /// Total nodes in this subtree (this node included).
    pub fn subtree_len(&self) -> usize {
        1 + self
            .children()
            .iter()
            .map(|c| c.subtree_len())
            .sum::<usize>()
    }

    // --- Stats ---

    pub fn stats(&self) -> MutexGuard<'_, NodeStats> {
        self.stats.lock().unwrap()
    }

    pub fn stats_snapshot(&self) -> NodeStats {
        self.stats.lock().unwrap().clone()
    }

    /// Transient bias charged against the player to move here: losing one
    /// unit of probability mass split over the opponents.
    pub fn make_virtual_loss(&self) -> Vec<f32> {
        let mut loss = vec![0.0; G::NUM_PLAYERS];
        loss[self.lazy_data().current_player] = 1.0 / (G::NUM_PLAYERS - 1) as f32;
        loss
    }

    // --- Backpropagation family ---
    //
    // All three walks are iterative leaf→root loops; at most one stats mutex
    // is held at any time.

    /// Fold `value` into the running averages of this node and every
    /// ancestor.
    pub fn backprop(node: &Arc<Self>, value: &[f32]) {
        let mut cur = Arc::clone(node);
        loop {
            {
                let mut stats = cur.stats.lock().unwrap();
                let n = stats.count as f32;
                for p in 0..G::NUM_PLAYERS {
                    stats.value_avg[p] = (stats.value_avg[p] * n + value[p]) / (n + 1.0);
                }
                stats.count += 1;
                stats.refresh_effective();
            }
            match cur.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
        }
    }

    /// Charge a virtual loss along the path to the root, discouraging other
    /// threads from piling onto the same line before the real value arrives.
    pub fn virtual_backprop(node: &Arc<Self>) {
        let mut cur = Arc::clone(node);
        loop {
            let loss = cur.make_virtual_loss();
            {
                let mut stats = cur.stats.lock().unwrap();
                let n = stats.count as f32;
                for p in 0..G::NUM_PLAYERS {
                    stats.value_avg[p] = (stats.value_avg[p] * n + loss[p]) / (n + 1.0);
                }
                stats.count += 1;
                stats.virtual_count += 1;
                stats.refresh_effective();
            }
            match cur.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
        }
    }

    /// Replace the previously charged virtual loss with `value` along the
    /// path to the root. Pairs one-to-one with [`Node::virtual_backprop`];
    /// `count` is unchanged because the virtual charge already counted.
    pub fn backprop_with_virtual_undo(node: &Arc<Self>, value: &[f32]) {
        let mut cur = Arc::clone(node);
        loop {
            let loss = cur.make_virtual_loss();
            {
                let mut stats = cur.stats.lock().unwrap();
                debug_assert!(stats.count > 0, "virtual undo before any backprop");
                debug_assert!(stats.virtual_count > 0, "unbalanced virtual undo");
                let n = stats.count as f32;
                for p in 0..G::NUM_PLAYERS {
                    stats.value_avg[p] += (value[p] - loss[p]) / n;
                }
                stats.virtual_count -= 1;
                stats.refresh_effective();
            }
            match cur.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
        }
    }

    // --- Eliminations ---

    /// Tighten `v_floor` from proven child bounds (or the terminal outcome
    /// itself), marking nodes whose outcome is a proven win as eliminated
    /// and recursing upward while eliminations keep firing.
    pub fn perform_eliminations(node: &Arc<Self>) {
        let mut cur = Arc::clone(node);
        loop {
            let lazy = cur.lazy_data();
            let v_floor: Vec<f32> = if lazy.is_terminal() {
                lazy.outcome.clone()
            } else {
                let children = cur.children();
                if children.is_empty() {
                    return;
                }
                let cp = lazy.current_player;
                (0..G::NUM_PLAYERS)
                    .map(|p| {
                        if p == cp {
                            Self::max_v_floor(children, p)
                        } else {
                            Self::min_v_floor(children, p)
                        }
                    })
                    .collect()
            };

            let eliminate = {
                let mut stats = cur.stats.lock().unwrap();
                stats.v_floor = v_floor;
                stats.refresh_effective();
                if stats.can_be_eliminated() {
                    if !stats.eliminated {
                        trace!(
                            action = ?cur.action(),
                            move_number = cur.move_number(),
                            "node eliminated"
                        );
                    }
                    stats.eliminated = true;
                    true
                } else {
                    false
                }
            };

            if !eliminate {
                return;
            }
            match cur.parent() {
                Some(parent) => cur = parent,
                None => return,
            }
        }
    }

    fn max_v_floor(children: &[Arc<Self>], p: usize) -> f32 {
        children
            .iter()
            .map(|c| c.stats.lock().unwrap().v_floor[p])
            .fold(0.0, f32::max)
    }

    fn min_v_floor(children: &[Arc<Self>], p: usize) -> f32 {
        children
            .iter()
            .map(|c| c.stats.lock().unwrap().v_floor[p])
            .fold(1.0, f32::min)
    }

    /// Record at the parent that this node's subtree is fully analyzed;
    /// propagate upward whenever a parent's legal actions are all covered.
    pub fn mark_as_fully_analyzed(node: &Arc<Self>) {
        let mut cur = Arc::clone(node);
        loop {
            let parent = match cur.parent() {
                Some(p) => p,
                None => return,
            };
            let action = cur
                .stable
                .action
                .expect("non-root node without action");
            let full = {
                let mut eval = parent.eval.lock().unwrap();
                eval.fully_analyzed.set(action);
                eval.fully_analyzed.contains_all(G::NUM_GLOBAL_ACTIONS)
            };
            if !full {
                return;
            }
            cur = parent;
        }
    }

    // --- Result extraction ---

    /// Per-action visit counts over the global action space. For an
    /// eliminated node, an indicator over the children realizing the best
    /// proven bound for the player to move; otherwise each child's effective
    /// count.
    pub fn get_effective_counts(&self) -> Vec<f32> {
        let eliminated = self.stats.lock().unwrap().eliminated;
        let children = self.children();
        let mut counts = vec![0.0; G::NUM_GLOBAL_ACTIONS];

        if eliminated {
            let cp = self.lazy_data().current_player;
            let max_floor = Self::max_v_floor(children, cp);
            for child in children {
                let floor = child.stats.lock().unwrap().v_floor[cp];
                let action = child.stable.action.expect("child node without action");
                counts[action] = if floor == max_floor { 1.0 } else { 0.0 };
            }
        } else {
            for child in children {
                let action = child.stable.action.expect("child node without action");
                counts[action] = child.stats.lock().unwrap().effective_count() as f32;
            }
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{take_away, TakeAway};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn table() -> LookupTable<TakeAway> {
        LookupTable::new()
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(1)
    }

    /// Root at pot=5 plus its expanded, lazily initialized children.
    fn expanded_root() -> (Arc<Node<TakeAway>>, LookupTable<TakeAway>) {
        let t = table();
        let mut r = rng();
        let root = Node::<TakeAway>::new_root(take_away(5), 0, 0);
        Node::expand_children(&root);
        for child in root.children() {
            Node::lazy_init(child, &t, false, &mut r);
        }
        (root, t)
    }

    // ---- construction / children publication ----

    #[test]
    fn root_is_initialized_at_construction() {
        let root = Node::<TakeAway>::new_root(take_away(5), 0, 0);
        let lazy = root.lazy().expect("root should be initialized");
        assert_eq!(lazy.num_valid_actions(), 3);
        assert_eq!(lazy.current_player, 0);
        assert!(!lazy.is_terminal());
        assert!(root.is_root());
        assert!(root.children().is_empty());
    }

    #[test]
    fn expand_creates_children_in_action_order() {
        let root = Node::<TakeAway>::new_root(take_away(5), 0, 0);
        Node::expand_children(&root);

        let actions: Vec<usize> = root.children().iter().filter_map(|c| c.action()).collect();
        assert_eq!(actions, vec![0, 1, 2]);
        for child in root.children() {
            assert_eq!(child.move_number(), 1);
            assert!(child.lazy().is_none(), "children start uninitialized");
        }
    }

    #[test]
    fn expand_matches_reduced_legality() {
        // Pot of 2: only "take 1" and "take 2" are legal.
        let root = Node::<TakeAway>::new_root(take_away(2), 0, 0);
        Node::expand_children(&root);
        let actions: Vec<usize> = root.children().iter().filter_map(|c| c.action()).collect();
        assert_eq!(actions, vec![0, 1]);
    }

    #[test]
    fn expand_is_idempotent() {
        let root = Node::<TakeAway>::new_root(take_away(5), 0, 0);
        Node::expand_children(&root);
        let first = root.children()[0].clone();
        Node::expand_children(&root);
        assert!(Arc::ptr_eq(&first, &root.children()[0]));
    }

    #[test]
    fn find_child_by_action() {
        let root = Node::<TakeAway>::new_root(take_away(5), 0, 0);
        Node::expand_children(&root);

        assert!(root.find_child(1).is_some());
        assert_eq!(root.find_child(1).unwrap().action(), Some(1));
        assert!(root.find_child(2).is_some());
    }

    #[test]
    fn find_child_before_expansion_is_none() {
        let root = Node::<TakeAway>::new_root(take_away(5), 0, 0);
        assert!(root.find_child(0).is_none());
    }

    // ---- lazy init ----

    #[test]
    fn lazy_init_derives_child_state() {
        let (root, t) = expanded_root();
        let mut r = rng();

        // Taking 3 stones (action 2) from a pot of 5 leaves 2, opponent to move.
        let child = root.find_child(2).unwrap();
        let lazy = Node::lazy_init(&child, &t, false, &mut r);
        assert_eq!(lazy.current_player, 1);
        assert_eq!(lazy.num_valid_actions(), 2);
        assert!(!lazy.is_terminal());
        assert_eq!(lazy.sym_index, 0);
    }

    #[test]
    fn lazy_init_detects_terminal() {
        let t = table();
        let mut r = rng();
        let root = Node::<TakeAway>::new_root(take_away(3), 0, 0);
        Node::expand_children(&root);

        // Taking all 3 stones ends the game; player 0 took the last stone.
        let child = root.find_child(2).unwrap();
        let lazy = Node::lazy_init(&child, &t, false, &mut r);
        assert!(lazy.is_terminal());
        assert_eq!(lazy.outcome, vec![1.0, 0.0]);
    }

    #[test]
    fn lazy_init_registers_in_table() {
        let t = table();
        let mut r = rng();
        let root = Node::<TakeAway>::new_root(take_away(5), 0, 0);
        Node::expand_children(&root);

        assert_eq!(t.len(), 0);
        let child = root.find_child(0).unwrap();
        Node::lazy_init(&child, &t, false, &mut r);
        assert_eq!(t.len(), 1);

        // Re-init is a no-op.
        Node::lazy_init(&child, &t, false, &mut r);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn lazy_init_seeds_fully_analyzed_with_illegal_actions() {
        let (root, t) = expanded_root();
        let mut r = rng();

        // Pot 5 → take 3 (action 2) → pot 2: action 2 now illegal.
        let child = root.find_child(2).unwrap();
        Node::lazy_init(&child, &t, false, &mut r);
        let eval = child.eval.lock().unwrap();
        assert!(eval.fully_analyzed.is_set(2));
        assert!(!eval.fully_analyzed.is_set(0));
        assert!(!eval.fully_analyzed.is_set(1));
    }

    // ---- backprop family ----

    #[test]
    fn backprop_updates_leaf_and_ancestors() {
        let (root, _t) = expanded_root();
        let child = root.find_child(0).unwrap();

        Node::backprop(&child, &[1.0, 0.0]);
        Node::backprop(&child, &[0.0, 1.0]);

        let cs = child.stats_snapshot();
        assert_eq!(cs.count, 2);
        assert!((cs.value_avg[0] - 0.5).abs() < 1e-6);
        assert!((cs.value_avg[1] - 0.5).abs() < 1e-6);

        let rs = root.stats_snapshot();
        assert_eq!(rs.count, 2);
        assert!((rs.value_avg[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn backprop_value_avg_stays_on_simplex() {
        let (root, _t) = expanded_root();
        let child = root.find_child(1).unwrap();

        for _ in 0..7 {
            Node::backprop(&child, &[0.25, 0.75]);
        }
        let stats = root.stats_snapshot();
        let sum: f32 = stats.value_avg.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(stats.value_avg.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn virtual_backprop_charges_current_player() {
        let (root, _t) = expanded_root();
        // Child of the root: player 1 to move there, player 0 at the root.
        let child = root.find_child(0).unwrap();

        Node::virtual_backprop(&child);

        let cs = child.stats_snapshot();
        assert_eq!(cs.count, 1);
        assert_eq!(cs.virtual_count, 1);
        // Virtual loss at the child charges the child's current player (1).
        assert!((cs.value_avg[1] - 1.0).abs() < 1e-6);
        assert!((cs.value_avg[0] - 0.0).abs() < 1e-6);

        let rs = root.stats_snapshot();
        assert_eq!(rs.virtual_count, 1);
        // At the root the loss charges player 0.
        assert!((rs.value_avg[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn virtual_undo_restores_balance() {
        let (root, _t) = expanded_root();
        let child = root.find_child(0).unwrap();

        Node::virtual_backprop(&child);
        Node::backprop_with_virtual_undo(&child, &[0.3, 0.7]);

        for node in [&root, &child] {
            let s = node.stats_snapshot();
            assert_eq!(s.virtual_count, 0, "virtual charges must balance");
            assert_eq!(s.count, 1);
            assert!((s.value_avg[0] - 0.3).abs() < 1e-6);
            assert!((s.value_avg[1] - 0.7).abs() < 1e-6);
        }
    }

    #[test]
    fn virtual_undo_mixes_with_earlier_visits() {
        let (root, _t) = expanded_root();
        let child = root.find_child(0).unwrap();

        Node::backprop(&child, &[1.0, 0.0]);
        Node::virtual_backprop(&child);
        Node::backprop_with_virtual_undo(&child, &[1.0, 0.0]);

        let s = child.stats_snapshot();
        assert_eq!(s.count, 2);
        assert_eq!(s.virtual_count, 0);
        assert!((s.value_avg[0] - 1.0).abs() < 1e-6);
        assert!((s.value_avg[1] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn backprop_stops_at_severed_node() {
        let (root, t) = expanded_root();
        let mut r = rng();
        let child = root.find_child(0).unwrap();
        Node::lazy_init(&child, &t, false, &mut r);

        child.sever();
        assert!(child.is_root());

        Node::backprop(&child, &[1.0, 0.0]);
        assert_eq!(child.stats_snapshot().count, 1);
        assert_eq!(root.stats_snapshot().count, 0, "severed: root untouched");
    }

    // ---- eliminations / fully analyzed ----

    #[test]
    fn terminal_win_eliminates_up_the_line() {
        let t = table();
        let mut r = rng();
        // Pot 3: player 0 can take all three and win.
        let root = Node::<TakeAway>::new_root(take_away(3), 0, 0);
        Node::expand_children(&root);
        let winning = root.find_child(2).unwrap();
        Node::lazy_init(&winning, &t, false, &mut r);

        Node::perform_eliminations(&winning);

        let ws = winning.stats_snapshot();
        assert_eq!(ws.v_floor, vec![1.0, 0.0]);
        assert!(ws.eliminated);
        assert!(ws.has_certain_outcome());
        assert_eq!(ws.effective_count(), 0);

        // Root: mover (player 0) takes the max over children → proven win.
        let rs = root.stats_snapshot();
        assert!((rs.v_floor[0] - 1.0).abs() < 1e-6);
        assert!(rs.eliminated);
        assert_eq!(rs.effective_value_avg, vec![1.0, 0.0]);
    }

    #[test]
    fn lost_child_alone_does_not_eliminate_parent() {
        let t = table();
        let mut r = rng();
        // Pot 4: taking 3 leaves 1 stone — the opponent takes it and wins.
        let root = Node::<TakeAway>::new_root(take_away(4), 0, 0);
        Node::expand_children(&root);

        let bad = root.find_child(2).unwrap();
        Node::lazy_init(&bad, &t, false, &mut r);
        Node::expand_children(&bad);
        let opp_win = bad.find_child(0).unwrap();
        Node::lazy_init(&opp_win, &t, false, &mut r);

        Node::perform_eliminations(&opp_win);

        // The grandchild is a proven player-1 win, so `bad` is eliminated
        // (its mover, player 1, has a winning reply)...
        assert!(bad.stats_snapshot().eliminated);
        assert_eq!(bad.stats_snapshot().v_floor, vec![0.0, 1.0]);

        // ...but the root is not: its other children are unproven.
        let rs = root.stats_snapshot();
        assert!(!rs.eliminated);
        assert!((rs.v_floor[0] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn eliminated_invariant_some_floor_is_one() {
        let t = table();
        let mut r = rng();
        let root = Node::<TakeAway>::new_root(take_away(3), 0, 0);
        Node::expand_children(&root);
        let child = root.find_child(2).unwrap();
        Node::lazy_init(&child, &t, false, &mut r);
        Node::perform_eliminations(&child);

        for node in [&root, &child] {
            let s = node.stats_snapshot();
            if s.eliminated {
                assert!(s.v_floor.iter().any(|&v| v >= 1.0));
            }
        }
    }

    #[test]
    fn provable_outcome_predicates() {
        let mut stats = NodeStats::new(2);
        assert!(!stats.provably_winning(0));
        assert!(!stats.provably_losing(0), "open outcome proves nothing");

        stats.v_floor = vec![1.0, 0.0];
        assert!(stats.provably_winning(0));
        assert!(!stats.provably_winning(1));
        assert!(stats.provably_losing(1));

        // A proven draw: nobody wins, nobody is losing.
        stats.v_floor = vec![0.5, 0.5];
        assert!(!stats.provably_winning(0));
        assert!(!stats.provably_losing(0));
        assert!(!stats.provably_losing(1));
    }

    #[test]
    fn fully_analyzed_propagates_when_all_actions_covered() {
        let t = table();
        let mut r = rng();
        // Pot 1: single legal action, which ends the game.
        let root = Node::<TakeAway>::new_root(take_away(1), 0, 0);
        Node::expand_children(&root);
        assert_eq!(root.children().len(), 1);

        let only = root.find_child(0).unwrap();
        Node::lazy_init(&only, &t, false, &mut r);
        Node::mark_as_fully_analyzed(&only);

        let eval = root.eval.lock().unwrap();
        assert!(eval.fully_analyzed.contains_all(3));
    }

    #[test]
    fn fully_analyzed_partial_does_not_propagate() {
        let (root, _t) = expanded_root();
        let child = root.find_child(0).unwrap();
        Node::mark_as_fully_analyzed(&child);

        let eval = root.eval.lock().unwrap();
        assert!(eval.fully_analyzed.is_set(0));
        assert!(!eval.fully_analyzed.contains_all(3));
    }

    // ---- effective counts ----

    #[test]
    fn effective_counts_mirror_child_visits() {
        let (root, _t) = expanded_root();
        for (i, visits) in [(0usize, 3), (1, 1)] {
            let child = root.find_child(i).unwrap();
            for _ in 0..visits {
                Node::backprop(&child, &[0.5, 0.5]);
            }
        }

        let counts = root.get_effective_counts();
        assert_eq!(counts, vec![3.0, 1.0, 0.0]);
    }

    #[test]
    fn effective_counts_for_eliminated_root_are_indicator() {
        let t = table();
        let mut r = rng();
        let root = Node::<TakeAway>::new_root(take_away(3), 0, 0);
        Node::expand_children(&root);
        for child in root.children() {
            Node::lazy_init(child, &t, false, &mut r);
        }
        // Give non-winning children some visits; then prove the win.
        Node::backprop(&root.find_child(0).unwrap(), &[0.5, 0.5]);
        Node::perform_eliminations(&root.find_child(2).unwrap());

        let counts = root.get_effective_counts();
        assert_eq!(counts, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn count_identity_at_rest() {
        let (root, _t) = expanded_root();
        // Root's own evaluation counts once...
        Node::backprop(&root, &[0.5, 0.5]);
        // ...then visits flow through children.
        for (i, visits) in [(0usize, 2), (1, 3), (2, 1)] {
            let child = root.find_child(i).unwrap();
            for _ in 0..visits {
                Node::backprop(&child, &[0.5, 0.5]);
            }
        }

        let child_sum: i32 = root
            .children()
            .iter()
            .map(|c| c.stats_snapshot().count)
            .sum();
        let rs = root.stats_snapshot();
        assert_eq!(rs.count, 1 + child_sum);
        assert_eq!(rs.virtual_count, 0);
    }

    #[test]
    fn subtree_len_counts_all_nodes() {
        let (root, t) = expanded_root();
        let mut r = rng();
        let child = root.find_child(0).unwrap();
        Node::lazy_init(&child, &t, false, &mut r);
        Node::expand_children(&child);

        // Root + 3 children + child 0's 3 children.
        assert_eq!(root.subtree_len(), 7);
    }
}
