//! Tree traversal.
//!
//! Each search thread repeatedly descends from the root: PUCT-select a
//! child, lazily materialize its state, evaluate leaves through the shared
//! service (charging a virtual loss along the path while the network runs),
//! and fold the result back leaf→root. Terminal leaves backpropagate their
//! exact outcome and feed the proven-outcome machinery instead.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Gamma};
use tracing::trace;

use crate::eval::{softmax, EvalError, NnEvaluation};
use crate::game::GameRules;
use crate::manager::{ManagerParams, SearchParams, SharedData};
use crate::node::{EvalState, Node};

/// Boost that guarantees selection of forced-playout children. Large but
/// finite so elimination masking stays NaN-free.
const FORCED_PLAYOUT_SCORE: f32 = 1e20;

/// Keeps `sqrt(ΣN)` positive before any child has visits.
pub(crate) const PUCT_EPS: f32 = 1e-6;

/// Cap on speculative work-stealing recursion.
const SPECULATION_DEPTH_LIMIT: usize = 8;

// ---------------------------------------------------------------------------
// PuctStats
// ---------------------------------------------------------------------------

/// Per-child PUCT inputs and base scores for one node, read under each
/// child's stats mutex. `puct` is the base formula (FPU already folded into
/// `v`); selection-time adjustments (forced playouts, elimination masking)
/// happen in [`SearchThread::get_best_child`].
pub(crate) struct PuctStats {
    pub actions: Vec<usize>,
    /// Prior over children (the node's local policy).
    pub p: Vec<f32>,
    /// Value from the perspective of the player to move at the node.
    pub v: Vec<f32>,
    /// Effective visit counts.
    pub n: Vec<f32>,
    /// 1.0 for eliminated children.
    pub e: Vec<f32>,
    pub puct: Vec<f32>,
}

impl PuctStats {
    pub fn compute<G: GameRules>(
        node: &Node<G>,
        params: &ManagerParams,
        search_params: &SearchParams,
    ) -> Self {
        let children = node.children();
        let num = children.len();
        let cp = node.lazy_data().current_player;

        let p: Vec<f32> = node.eval.lock().unwrap().local_policy.to_vec();
        debug_assert_eq!(p.len(), num, "local policy must cover the children");

        let mut actions = Vec::with_capacity(num);
        let mut v = vec![0.0f32; num];
        let mut n = vec![0.0f32; num];
        let mut e = vec![0.0f32; num];
        let mut any_unvisited = false;

        for (c, child) in children.iter().enumerate() {
            actions.push(child.action().expect("child node without action"));
            let stats = child.stats();
            v[c] = stats.effective_value_avg[cp];
            n[c] = stats.effective_count() as f32;
            e[c] = if stats.eliminated { 1.0 } else { 0.0 };
            any_unvisited |= n[c] == 0.0;
        }

        // First-play urgency: unvisited children inherit the parent's value
        // minus a penalty growing with the prior mass already explored.
        if params.enable_first_play_urgency && any_unvisited {
            let parent_value = node.stats().effective_value_avg[cp];
            let add_noise = !search_params.disable_exploration && params.dirichlet_mult > 0.0;
            let c_fpu = if node.is_root() && add_noise {
                0.0
            } else {
                params.c_fpu
            };
            let visited_mass: f32 = (0..num).filter(|&c| n[c] > 0.0).map(|c| p[c]).sum();
            let fpu_value = parent_value - c_fpu * visited_mass.sqrt();
            for c in 0..num {
                if n[c] == 0.0 {
                    v[c] = fpu_value;
                }
            }
        }

        // Values live on [0, 1] rather than AlphaZero's [-1, 1]; the factor
        // of 2 keeps cPUCT on the conventional scale.
        let n_sum: f32 = n.iter().sum();
        let sqrt_n = (n_sum + PUCT_EPS).sqrt();
        let puct: Vec<f32> = (0..num)
            .map(|c| 2.0 * v[c] + params.c_puct * p[c] * sqrt_n / (n[c] + 1.0))
            .collect();

        Self {
            actions,
            p,
            v,
            n,
            e,
            puct,
        }
    }
}

// ---------------------------------------------------------------------------
// SearchThread
// ---------------------------------------------------------------------------

enum ExpandOutcome {
    /// This thread expanded and evaluated the node.
    Expanded(Arc<NnEvaluation>),
    /// Evaluation already present.
    Present(Arc<NnEvaluation>),
    /// Speculative caller: nothing to report.
    Speculated,
}

/// One tree walker. Owns its RNG; everything else is shared.
pub(crate) struct SearchThread<G: GameRules> {
    shared: Arc<SharedData<G>>,
    params: ManagerParams,
    search_params: SearchParams,
    rng: SmallRng,
    thread_id: usize,
}

impl<G: GameRules> SearchThread<G> {
    pub fn new(
        shared: Arc<SharedData<G>>,
        params: ManagerParams,
        search_params: SearchParams,
        seed: u64,
        thread_id: usize,
    ) -> Self {
        Self {
            shared,
            params,
            search_params,
            rng: SmallRng::seed_from_u64(seed),
            thread_id,
        }
    }

    /// Iterate until the budget is reached, the search is stopped, the root
    /// is proven, or an evaluation error aborts the run.
    pub fn run(&mut self, root: &Arc<Node<G>>) {
        while self.needs_more_visits(root) {
            if let Err(err) = self.visit(root, 0) {
                trace!(thread = self.thread_id, error = %err, "search aborted");
                let mut slot = self.shared.search_error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(err);
                }
                self.shared.search_active.store(false, Ordering::Release);
                return;
            }

            // With at most one reply there is nothing to compare; a single
            // visit produces the priors and the answer.
            let single = root
                .lazy()
                .map(|l| l.num_valid_actions() <= 1)
                .unwrap_or(false);
            if single {
                return;
            }
        }
    }

    fn needs_more_visits(&self, root: &Arc<Node<G>>) -> bool {
        if !self.shared.search_active.load(Ordering::Acquire) {
            return false;
        }
        let stats = root.stats();
        stats.effective_count() <= self.search_params.tree_size_limit && !stats.eliminated
    }

    /// One selection/expansion/backpropagation pass from `node` downward.
    fn visit(&mut self, node: &Arc<Node<G>>, depth: usize) -> Result<(), EvalError> {
        let lazy = Node::lazy_init(
            node,
            &self.shared.lookup,
            self.params.apply_random_symmetries,
            &mut self.rng,
        );

        if lazy.is_terminal() {
            let outcome = lazy.outcome.clone();
            Node::backprop(node, &outcome);
            if !self.params.disable_eliminations {
                Node::perform_eliminations(node);
            }
            Node::mark_as_fully_analyzed(node);
            return Ok(());
        }

        if !self.shared.search_active.load(Ordering::Acquire) {
            return Ok(());
        }

        match self.evaluate_and_expand(node, false, depth)? {
            ExpandOutcome::Expanded(eval) => {
                Node::backprop_with_virtual_undo(node, eval.value());
                Ok(())
            }
            ExpandOutcome::Present(_) => {
                let best = self.get_best_child(node);
                self.visit(&best, depth + 1)
            }
            ExpandOutcome::Speculated => Ok(()),
        }
    }

    /// Resolve the node's evaluation state. The `Unset` finder expands the
    /// children, flips the node to `Pending`, releases the eval mutex for
    /// the duration of the network call, then publishes `Set`. `Pending`
    /// observers steal work elsewhere in the tree when speculation is on,
    /// or park on the eval condvar otherwise.
    fn evaluate_and_expand(
        &mut self,
        node: &Arc<Node<G>>,
        speculative: bool,
        depth: usize,
    ) -> Result<ExpandOutcome, EvalError> {
        let mut guard = node.eval.lock().unwrap();
        match guard.state {
            EvalState::Set => {
                let eval = guard.eval.clone().expect("Set state without evaluation");
                Ok(ExpandOutcome::Present(eval))
            }

            EvalState::Unset => {
                Node::expand_children(node);
                guard.state = EvalState::Pending;
                drop(guard);

                if !speculative {
                    Node::virtual_backprop(node);
                }

                let lazy = node.lazy_data();
                let (eval, _used_cache) = match &self.shared.service {
                    None => (
                        Arc::new(NnEvaluation::uniform(
                            G::NUM_PLAYERS,
                            lazy.num_valid_actions(),
                        )),
                        false,
                    ),
                    Some(service) => {
                        match service.evaluate(&lazy.state, lazy.valid_actions, lazy.sym_index, 1.0)
                        {
                            Ok(response) => (response.eval, response.used_cache),
                            Err(err) => {
                                // Unblock any threads parked on this node
                                // before surfacing the failure.
                                self.publish_evaluation(
                                    node,
                                    Arc::new(NnEvaluation::uniform(
                                        G::NUM_PLAYERS,
                                        lazy.num_valid_actions(),
                                    )),
                                );
                                return Err(err);
                            }
                        }
                    }
                };

                self.publish_evaluation(node, Arc::clone(&eval));
                Ok(ExpandOutcome::Expanded(eval))
            }

            EvalState::Pending => {
                if self.params.speculative_evals && depth < SPECULATION_DEPTH_LIMIT {
                    drop(guard);
                    self.speculate(node, depth)?;
                    if speculative {
                        return Ok(ExpandOutcome::Speculated);
                    }
                    guard = node.eval.lock().unwrap();
                } else if speculative {
                    return Ok(ExpandOutcome::Speculated);
                }

                while guard.state != EvalState::Set {
                    guard = node.eval_cv.wait(guard).unwrap();
                }
                let eval = guard.eval.clone().expect("Set state without evaluation");
                Ok(ExpandOutcome::Present(eval))
            }
        }
    }

    /// Turn raw logits into the node's policy (root noise and tempering
    /// included), store it with the evaluation, and wake waiters.
    fn publish_evaluation(&mut self, node: &Arc<Node<G>>, eval: Arc<NnEvaluation>) {
        let mut policy = softmax(eval.local_policy_logits());

        if node.is_root() && !self.search_params.disable_exploration {
            if self.params.dirichlet_mult > 0.0 {
                self.add_dirichlet_noise(&mut policy);
            }
            let temperature = self.shared.root_softmax_temperature.lock().unwrap().value();
            temper_policy(&mut policy, temperature);
        }

        let mut guard = node.eval.lock().unwrap();
        guard.local_policy = policy.into_boxed_slice();
        guard.eval = Some(eval);
        guard.state = EvalState::Set;
        drop(guard);
        node.eval_cv.notify_all();
    }

    /// Another thread owns this node's evaluation; do useful work in a
    /// not-yet-analyzed subtree instead of blocking.
    fn speculate(&mut self, node: &Arc<Node<G>>, depth: usize) -> Result<(), EvalError> {
        let child = {
            let guard = node.eval.lock().unwrap();
            let unanalyzed = guard
                .fully_analyzed
                .complement_within(G::NUM_GLOBAL_ACTIONS);
            if unanalyzed.is_empty() {
                drop(guard);
                node.children().first().cloned()
            } else {
                let action = unanalyzed.choose_set_bit(&mut self.rng);
                drop(guard);
                node.find_child(action)
            }
        };
        let Some(child) = child else {
            return Ok(());
        };

        let lazy = Node::lazy_init(
            &child,
            &self.shared.lookup,
            self.params.apply_random_symmetries,
            &mut self.rng,
        );
        if lazy.is_terminal() {
            if !self.params.disable_eliminations {
                Node::perform_eliminations(&child);
            }
            Node::mark_as_fully_analyzed(&child);
        } else {
            self.evaluate_and_expand(&child, true, depth + 1)?;
        }
        Ok(())
    }

    /// PUCT argmax over the children, ties broken toward the lowest action.
    fn get_best_child(&mut self, node: &Arc<Node<G>>) -> Arc<Node<G>> {
        let stats = PuctStats::compute(node, &self.params, &self.search_params);
        let mut puct = stats.puct;

        // Forced playouts: at a noisy root, undervisited children with
        // positive priors jump the queue.
        let add_noise = !self.search_params.disable_exploration && self.params.dirichlet_mult > 0.0;
        if self.params.forced_playouts && add_noise && node.is_root() {
            let n_sum: f32 = stats.n.iter().sum();
            for c in 0..puct.len() {
                let n_forced = (stats.p[c] * self.params.k_forced * n_sum).sqrt();
                if stats.n[c] > 0.0 && stats.n[c] < n_forced {
                    puct[c] = FORCED_PLAYOUT_SCORE;
                }
            }
        }

        // Eliminated children are invisible while siblings remain.
        for c in 0..puct.len() {
            puct[c] *= 1.0 - stats.e[c];
        }

        let mut best = 0;
        for c in 1..puct.len() {
            if puct[c] > puct[best] {
                best = c;
            }
        }

        let children = node.children();
        debug_assert!(!children.is_empty(), "PUCT selection on unexpanded node");
        Arc::clone(&children[best])
    }

    /// Mix Dirichlet noise into a root policy:
    /// `P ← (1−mult)·P + mult·Dir(α)` with `α = factor / √|A|`.
    fn add_dirichlet_noise(&mut self, policy: &mut [f32]) {
        let n = policy.len();
        if n < 2 {
            return;
        }
        let alpha = self.params.dirichlet_alpha_factor / (n as f32).sqrt();
        let Ok(gamma) = Gamma::new(alpha as f64, 1.0) else {
            return;
        };
        let mut noise: Vec<f32> = (0..n)
            .map(|_| gamma.sample(&mut self.rng) as f32)
            .collect();
        let sum: f32 = noise.iter().sum();
        if sum <= 0.0 {
            return;
        }
        for x in &mut noise {
            *x /= sum;
        }
        let mult = self.params.dirichlet_mult;
        for (p, x) in policy.iter_mut().zip(&noise) {
            *p = (1.0 - mult) * *p + mult * x;
        }
    }
}

/// Sharpen or flatten a policy by `P ← P^(1/temperature)`, renormalized.
fn temper_policy(policy: &mut [f32], temperature: f32) {
    if (temperature - 1.0).abs() < 1e-6 {
        return;
    }
    let inv = 1.0 / temperature;
    for p in policy.iter_mut() {
        *p = p.powf(inv);
    }
    let sum: f32 = policy.iter().sum();
    if sum > 0.0 {
        for p in policy.iter_mut() {
            *p /= sum;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
