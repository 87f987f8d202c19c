//! Search orchestration.
//!
//! The [`Manager`] owns the root, the worker threads, and the connection to
//! the evaluation service. `search` answers one query; `receive_state_change`
//! advances the root along the played action, recycling the abandoned
//! siblings in the background and optionally pondering until the next query.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::eval::{EvalError, Network};
use crate::game::{is_terminal_outcome, ActionMask, GameRules, StateEncoder};
use crate::lookup::LookupTable;
use crate::math::{ExponentialDecay, ScheduleParseError};
use crate::node::Node;
use crate::release::NodeReleaseService;
use crate::search::{PuctStats, SearchThread, PUCT_EPS};
use crate::service::{NnEvaluationService, ServiceParams};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Construction-time configuration failures. Fatal to the manager.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("num_search_threads must be >= 1 (got {0})")]
    NumSearchThreads(usize),

    #[error("pondering requires at least 2 search threads")]
    PonderingNeedsThreads,

    #[error("model_filename is set but no network was supplied")]
    MissingNetwork,

    #[error("a network was supplied but model_filename is empty")]
    UnusedNetwork,

    #[error("conflicting evaluation service reuse for {filename:?}: {detail}")]
    ServiceConflict { filename: String, detail: String },

    #[error(transparent)]
    Schedule(#[from] ScheduleParseError),
}

/// Failures surfaced by a `search` call.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Eval(#[from] EvalError),
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Engine-wide configuration. [`ManagerParams::training`] enables root
/// exploration (Dirichlet noise, forced playouts, tempered root policy);
/// [`ManagerParams::competitive`] plays straight.
#[derive(Clone, Debug)]
pub struct ManagerParams {
    /// Network artifact location; empty means the uniform surrogate.
    pub model_filename: String,
    pub num_search_threads: usize,
    /// Maximum NN batch fill before a flush.
    pub batch_size_limit: usize,
    /// Maximum wait from the first reservation to a flush, in nanoseconds.
    pub nn_eval_timeout_ns: u64,
    /// LRU evaluation-cache capacity.
    pub cache_size: usize,
    pub c_puct: f32,
    pub c_fpu: f32,
    /// Fraction of root prior mass replaced by Dirichlet noise.
    pub dirichlet_mult: f32,
    /// Noise concentration: α = factor / √|A|.
    pub dirichlet_alpha_factor: f32,
    /// Root-policy temperature schedule, e.g. `"1"` or `"1.4->1.1:12"`.
    pub root_softmax_temperature_str: String,
    /// Forced-playout coefficient.
    pub k_forced: f32,
    /// Keep searching between received moves.
    pub enable_pondering: bool,
    pub pondering_tree_size_limit: i32,
    /// Steal work elsewhere instead of waiting on a pending evaluation.
    pub speculative_evals: bool,
    pub forced_playouts: bool,
    pub enable_first_play_urgency: bool,
    pub avoid_proven_losers: bool,
    pub exploit_proven_winners: bool,
    /// Tensorize under a random applicable symmetry (false ⇒ identity).
    pub apply_random_symmetries: bool,
    pub disable_eliminations: bool,
    /// Base of the per-thread RNG seed sequence.
    pub rng_seed: u64,
}

impl ManagerParams {
    /// Self-play defaults: noisy root, forced playouts, tempered policy.
    pub fn training() -> Self {
        Self {
            model_filename: String::new(),
            num_search_threads: 4,
            batch_size_limit: 16,
            nn_eval_timeout_ns: 1_000_000,
            cache_size: 65_536,
            c_puct: 1.1,
            c_fpu: 0.2,
            dirichlet_mult: 0.25,
            dirichlet_alpha_factor: 0.3,
            root_softmax_temperature_str: "1.4->1.1:12".to_string(),
            k_forced: 2.0,
            enable_pondering: false,
            pondering_tree_size_limit: 4096,
            speculative_evals: false,
            forced_playouts: true,
            enable_first_play_urgency: true,
            avoid_proven_losers: true,
            exploit_proven_winners: true,
            apply_random_symmetries: true,
            disable_eliminations: false,
            rng_seed: 0,
        }
    }

    /// Match-play defaults: no root noise, no forced playouts, flat
    /// temperature.
    pub fn competitive() -> Self {
        Self {
            dirichlet_mult: 0.0,
            forced_playouts: false,
            root_softmax_temperature_str: "1".to_string(),
            ..Self::training()
        }
    }

    pub fn with_model_filename(mut self, filename: impl Into<String>) -> Self {
        self.model_filename = filename.into();
        self
    }

    pub fn with_num_search_threads(mut self, n: usize) -> Self {
        self.num_search_threads = n;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    pub fn with_c_puct(mut self, c: f32) -> Self {
        self.c_puct = c;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_search_threads < 1 {
            return Err(ConfigError::NumSearchThreads(self.num_search_threads));
        }
        if self.enable_pondering && self.num_search_threads < 2 {
            return Err(ConfigError::PonderingNeedsThreads);
        }
        Ok(())
    }

    pub(crate) fn service_params(&self) -> ServiceParams {
        ServiceParams {
            model_filename: self.model_filename.clone(),
            batch_size_limit: self.batch_size_limit,
            nn_eval_timeout: Duration::from_nanos(self.nn_eval_timeout_ns),
            cache_size: self.cache_size,
        }
    }
}

impl Default for ManagerParams {
    fn default() -> Self {
        Self::training()
    }
}

/// Per-call search limits.
#[derive(Clone, Copy, Debug)]
pub struct SearchParams {
    /// Stop once the root's effective count exceeds this.
    pub tree_size_limit: i32,
    /// Suppress Dirichlet noise and root-policy tempering.
    pub disable_exploration: bool,
}

impl SearchParams {
    pub fn new(tree_size_limit: i32) -> Self {
        Self {
            tree_size_limit,
            disable_exploration: false,
        }
    }

    pub fn competitive(tree_size_limit: i32) -> Self {
        Self {
            tree_size_limit,
            disable_exploration: true,
        }
    }

    pub(crate) fn pondering(tree_size_limit: i32) -> Self {
        Self::competitive(tree_size_limit)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Answer to one `search` call.
#[derive(Clone, Debug)]
pub struct SearchResults {
    pub valid_actions: ActionMask,
    /// Visit counts over the global action space — raw, or target-pruned
    /// when forced playouts and root noise were active.
    pub counts: Vec<f32>,
    /// Root policy over legal actions (noise and tempering included).
    pub policy_prior: Vec<f32>,
    /// Mean backpropagated value per player at the root.
    pub win_rates: Vec<f32>,
    /// Network value estimate per player at the root.
    pub value_prior: Vec<f32>,
}

// ---------------------------------------------------------------------------
// SharedData
// ---------------------------------------------------------------------------

/// State shared between the manager and its search threads.
pub(crate) struct SharedData<G: GameRules> {
    pub(crate) search_active: AtomicBool,
    pub(crate) active_threads: Mutex<usize>,
    pub(crate) cv_search: Condvar,
    pub(crate) lookup: LookupTable<G>,
    pub(crate) service: Option<Arc<NnEvaluationService<G>>>,
    pub(crate) root_softmax_temperature: Mutex<ExponentialDecay>,
    /// First evaluation failure observed by any worker this search.
    pub(crate) search_error: Mutex<Option<EvalError>>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Hosts the tree and answers search queries. One manager per playing agent;
/// managers naming the same model share one evaluation service.
pub struct Manager<G: GameRules> {
    params: ManagerParams,
    shared: Arc<SharedData<G>>,
    root: Option<Arc<Node<G>>>,
    move_number: u32,
    handles: Vec<JoinHandle<()>>,
    connected: bool,
    rng: SmallRng,
    seed_counter: u64,
}

impl<G: GameRules> Manager<G> {
    /// Manager backed by the uniform surrogate (`model_filename` empty).
    pub fn new(params: ManagerParams) -> Result<Self, ConfigError> {
        if !params.model_filename.is_empty() {
            return Err(ConfigError::MissingNetwork);
        }
        Self::build(params, None)
    }

    /// Manager backed by a network artifact. The service is shared and
    /// deduplicated per `model_filename`.
    pub fn with_network(
        params: ManagerParams,
        network: Box<dyn Network>,
        encoder: Box<dyn StateEncoder<G>>,
    ) -> Result<Self, ConfigError> {
        if params.model_filename.is_empty() {
            return Err(ConfigError::UnusedNetwork);
        }
        let service = NnEvaluationService::create(&params.service_params(), network, encoder)?;
        Self::build(params, Some(service))
    }

    fn build(
        params: ManagerParams,
        service: Option<Arc<NnEvaluationService<G>>>,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        let temperature = ExponentialDecay::parse(&params.root_softmax_temperature_str)?;
        let rng = SmallRng::seed_from_u64(params.rng_seed);

        Ok(Self {
            shared: Arc::new(SharedData {
                search_active: AtomicBool::new(false),
                active_threads: Mutex::new(0),
                cv_search: Condvar::new(),
                lookup: LookupTable::new(),
                service,
                root_softmax_temperature: Mutex::new(temperature),
                search_error: Mutex::new(None),
            }),
            params,
            root: None,
            move_number: 0,
            handles: Vec::new(),
            connected: false,
            rng,
            seed_counter: 0,
        })
    }

    /// Reset for a new game: drop the tree, rewind the temperature
    /// schedule, and (lazily) connect to the evaluation service.
    pub fn start(&mut self) {
        self.clear();
        self.shared.root_softmax_temperature.lock().unwrap().reset();
        self.shared.lookup.clear();
        self.move_number = 0;
        self.ensure_connected();
    }

    /// Stop the workers and release the whole tree.
    pub fn clear(&mut self) {
        self.stop_search_threads();
        if let Some(root) = self.root.take() {
            NodeReleaseService::global().release(root, None);
        }
    }

    /// A move was played. Re-root onto the matching child (reusing its
    /// subtree), hand the rest of the old tree to the release worker, and
    /// resume searching when pondering is enabled.
    pub fn receive_state_change(
        &mut self,
        _seat: usize,
        _state: &G::State,
        action: usize,
        outcome: &[f32],
    ) {
        self.shared.root_softmax_temperature.lock().unwrap().step();
        self.move_number += 1;
        self.stop_search_threads();
        self.shared.lookup.clear_before(self.move_number);

        let Some(root) = self.root.take() else {
            return;
        };

        if is_terminal_outcome(outcome) {
            NodeReleaseService::global().release(root, None);
            return;
        }

        match root.find_child(action) {
            Some(new_root) => {
                // Materialize the child before its parent's state goes away.
                Node::lazy_init(
                    &new_root,
                    &self.shared.lookup,
                    self.params.apply_random_symmetries,
                    &mut self.rng,
                );
                new_root.sever();
                trace!(
                    action,
                    move_number = self.move_number,
                    "re-rooted onto played action"
                );
                NodeReleaseService::global().release(root, Some(Arc::clone(&new_root)));
                self.root = Some(new_root);

                if self.params.enable_pondering {
                    let root = Arc::clone(self.root.as_ref().expect("root just set"));
                    let params = SearchParams::pondering(self.params.pondering_tree_size_limit);
                    self.start_search_threads(&root, params);
                }
            }
            None => {
                debug!(action, "played action not in tree; dropping root");
                NodeReleaseService::global().release(root, None);
            }
        }
    }

    /// Run a search from `state` and report the root distribution.
    pub fn search(
        &mut self,
        state: &G::State,
        search_params: &SearchParams,
    ) -> Result<SearchResults, SearchError> {
        self.stop_search_threads();
        self.ensure_connected();

        let add_noise = !search_params.disable_exploration && self.params.dirichlet_mult > 0.0;

        // Fresh noise must not mix with stale priors, so a noisy search
        // always starts from a brand-new root. Otherwise reuse what we
        // have, or recover a transposed subtree from the lookup table.
        if self.root.is_none() || add_noise {
            if let Some(old) = self.root.take() {
                NodeReleaseService::global().release(old, None);
            }
            let sym_index = if self.params.apply_random_symmetries {
                G::symmetries(state).choose(&mut self.rng)
            } else {
                0
            };
            let root = if add_noise {
                Node::new_root(state.clone(), self.move_number, sym_index)
            } else {
                self.shared
                    .lookup
                    .fetch_or_create(self.move_number, state.clone(), sym_index)
            };
            root.sever();
            self.root = Some(root);
        }

        let root = Arc::clone(self.root.as_ref().expect("root just ensured"));
        self.start_search_threads(&root, *search_params);
        self.wait_for_search_threads();

        let search_err = self.shared.search_error.lock().unwrap().take();
        if let Some(err) = search_err {
            self.clear();
            return Err(SearchError::Eval(err));
        }

        let lazy = root.lazy().expect("root initialized during search");
        let mut counts = root.get_effective_counts();
        self.filter_proven_counts(&root, &mut counts);
        let (policy_prior, value_prior) = {
            let eval = root.eval.lock().unwrap();
            let policy = eval.local_policy.to_vec();
            let value = eval
                .eval
                .as_ref()
                .map(|e| e.value().to_vec())
                .unwrap_or_else(|| lazy.outcome.clone());
            (policy, value)
        };

        if self.params.forced_playouts && add_noise && self.shared.service.is_some() {
            self.prune_counts(&root, search_params, &mut counts);
        }

        let stats = root.stats_snapshot();
        Ok(SearchResults {
            valid_actions: lazy.valid_actions,
            counts,
            policy_prior,
            win_rates: stats.value_avg,
            value_prior,
        })
    }

    /// Root of the current tree, for inspection.
    pub fn root(&self) -> Option<&Arc<Node<G>>> {
        self.root.as_ref()
    }

    /// Counters of the shared evaluation service, if one is attached.
    pub fn service_stats(&self) -> Option<&crate::service::ServiceStats> {
        self.shared.service.as_deref().map(|s| s.stats())
    }

    // --- Thread lifecycle ---

    fn ensure_connected(&mut self) {
        if !self.connected {
            if let Some(service) = &self.shared.service {
                service.connect();
            }
            self.connected = true;
        }
    }

    fn start_search_threads(&mut self, root: &Arc<Node<G>>, search_params: SearchParams) {
        debug_assert!(!self.shared.search_active.load(Ordering::Acquire));
        debug_assert!(self.handles.is_empty());

        self.shared.search_active.store(true, Ordering::Release);
        *self.shared.search_error.lock().unwrap() = None;
        *self.shared.active_threads.lock().unwrap() = self.params.num_search_threads;

        for thread_id in 0..self.params.num_search_threads {
            let shared = Arc::clone(&self.shared);
            let params = self.params.clone();
            let root = Arc::clone(root);
            let seed = self.next_seed();
            let handle = thread::Builder::new()
                .name(format!("search-{thread_id}"))
                .spawn(move || {
                    let mut worker =
                        SearchThread::new(Arc::clone(&shared), params, search_params, seed, thread_id);
                    worker.run(&root);
                    let mut active = shared.active_threads.lock().unwrap();
                    *active -= 1;
                    drop(active);
                    shared.cv_search.notify_all();
                })
                .expect("failed to spawn search thread");
            self.handles.push(handle);
        }
    }

    /// Signal the workers to stop at their next iteration boundary and wait
    /// until they all have.
    fn stop_search_threads(&mut self) {
        self.shared.search_active.store(false, Ordering::Release);
        {
            let guard = self.shared.active_threads.lock().unwrap();
            let _done = self
                .shared
                .cv_search
                .wait_while(guard, |active| *active > 0)
                .unwrap();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Let the workers run to their budget, then reap them.
    fn wait_for_search_threads(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.shared.search_active.store(false, Ordering::Release);
    }

    fn next_seed(&mut self) -> u64 {
        let seed = self.params.rng_seed.wrapping_add(self.seed_counter);
        self.seed_counter += 1;
        seed
    }

    /// Proven-outcome filtering of the returned counts. Only called while
    /// the search threads are inactive, so the child stats are at rest.
    ///
    /// With `avoid_proven_losers`, children whose line is a proven loss for
    /// the player to move contribute nothing — unless the whole position is
    /// already lost, in which case the raw counts stand. With
    /// `exploit_proven_winners`, once the root is a proven win only the
    /// children that realize it keep their counts.
    fn filter_proven_counts(&self, root: &Node<G>, counts: &mut [f32]) {
        if !self.params.avoid_proven_losers && !self.params.exploit_proven_winners {
            return;
        }
        let cp = root.lazy_data().current_player;
        let (provably_winning, provably_losing) = {
            let stats = root.stats();
            (stats.provably_winning(cp), stats.provably_losing(cp))
        };

        for child in root.children() {
            let action = child.action().expect("child node without action");
            let stats = child.stats();
            if self.params.avoid_proven_losers && !provably_losing && stats.provably_losing(cp) {
                counts[action] = 0.0;
            } else if self.params.exploit_proven_winners
                && provably_winning
                && !stats.provably_winning(cp)
            {
                counts[action] = 0.0;
            }
        }
    }

    // --- Target pruning ---

    /// Shave forced-playout inflation off the visit counts so they make a
    /// cleaner policy target. Counts of non-argmax children drop to
    /// `max(N_floor, N − n_forced)`, zeroed at ≤ 1; degenerate results fall
    /// back to the raw counts.
    fn prune_counts(
        &self,
        root: &Arc<Node<G>>,
        search_params: &SearchParams,
        counts: &mut [f32],
    ) {
        let stats = PuctStats::compute(root, &self.params, search_params);
        let n_sum: f32 = stats.n.iter().sum();
        if n_sum <= 0.0 {
            return;
        }
        let orig = counts.to_vec();

        let puct_max = stats.puct.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let n_max = stats.n.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sqrt_n = (n_sum + PUCT_EPS).sqrt();

        for c in 0..stats.n.len() {
            if stats.n[c] == n_max {
                continue;
            }
            let denom = puct_max - 2.0 * stats.v[c];
            if denom <= 0.0 {
                continue;
            }
            let n_floor = self.params.c_puct * stats.p[c] * sqrt_n / denom - 1.0;
            if !n_floor.is_finite() {
                continue;
            }
            let n_forced = (stats.p[c] * self.params.k_forced * n_sum).sqrt();
            let mut pruned = n_floor.max(stats.n[c] - n_forced);
            if pruned <= 1.0 {
                pruned = 0.0;
            }
            counts[stats.actions[c]] = pruned;
        }

        if counts.iter().any(|x| !x.is_finite()) || counts.iter().sum::<f32>() <= 0.0 {
            warn!("target pruning produced degenerate counts; keeping raw counts");
            counts.copy_from_slice(&orig);
        }
    }
}

impl<G: GameRules> Drop for Manager<G> {
    fn drop(&mut self) {
        self.clear();
        if self.connected {
            if let Some(service) = &self.shared.service {
                service.disconnect();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
