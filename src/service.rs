//! Batched neural-network evaluation.
//!
//! Search threads hand positions to a shared [`NnEvaluationService`]; a
//! dedicated service thread accumulates a batch, invokes the network once,
//! and distributes per-position evaluations back. An LRU cache keyed by
//! `(canonical state key, inverse temperature, symmetry)` short-circuits
//! repeated positions.
//!
//! The slot protocol, per evaluate call:
//!
//! 1. cache probe — a hit returns immediately;
//! 2. reserve a slot index under the metadata mutex (blocking while the
//!    previous batch is being read out or the current one is full);
//! 3. tensorize into the reserved input slice under the batch-data mutex;
//! 4. commit, then wait for the service thread to flush the batch;
//! 5. read the slot's evaluation, then wait for every sibling slot owner to
//!    read before the batch is recycled.
//!
//! The service thread flushes when the batch fills or when the deadline —
//! set by the first reservation — expires. `accepting_reservations` is
//! dropped between the flush decision and completion so no reservation can
//! be lost. Cache insertion happens before slot owners are woken, so
//! concurrent identical requests behind the flush hit the cache.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::LruCache;
use crate::eval::{EvalError, Network, NnEvaluation};
use crate::game::{ActionMask, GameRules, StateEncoder};
use crate::manager::ConfigError;

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Identity of one evaluation request: canonical state key, inverse
/// temperature, symmetry index. Temperature participates as raw bits so the
/// key stays `Eq + Hash`.
pub struct CacheKey<G: GameRules> {
    pub state_key: G::Key,
    inv_temp_bits: u32,
    pub sym_index: u8,
}

impl<G: GameRules> CacheKey<G> {
    pub fn new(state_key: G::Key, inverse_temperature: f32, sym_index: u8) -> Self {
        Self {
            state_key,
            inv_temp_bits: inverse_temperature.to_bits(),
            sym_index,
        }
    }

    pub fn inverse_temperature(&self) -> f32 {
        f32::from_bits(self.inv_temp_bits)
    }
}

impl<G: GameRules> Clone for CacheKey<G> {
    fn clone(&self) -> Self {
        Self {
            state_key: self.state_key.clone(),
            inv_temp_bits: self.inv_temp_bits,
            sym_index: self.sym_index,
        }
    }
}

impl<G: GameRules> PartialEq for CacheKey<G> {
    fn eq(&self, other: &Self) -> bool {
        self.state_key == other.state_key
            && self.inv_temp_bits == other.inv_temp_bits
            && self.sym_index == other.sym_index
    }
}

impl<G: GameRules> Eq for CacheKey<G> {}

impl<G: GameRules> Hash for CacheKey<G> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.state_key.hash(state);
        self.inv_temp_bits.hash(state);
        self.sym_index.hash(state);
    }
}

// ---------------------------------------------------------------------------
// Params / stats / response
// ---------------------------------------------------------------------------

/// Service construction parameters. A second `create` against the same
/// artifact must agree on all of these.
#[derive(Clone, Debug)]
pub struct ServiceParams {
    pub model_filename: String,
    pub batch_size_limit: usize,
    pub nn_eval_timeout: Duration,
    pub cache_size: usize,
}

/// Lock-free service counters.
#[derive(Default)]
pub struct ServiceStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    batches_evaluated: AtomicU64,
    positions_evaluated: AtomicU64,
}

impl ServiceStats {
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn batches_evaluated(&self) -> u64 {
        self.batches_evaluated.load(Ordering::Relaxed)
    }

    pub fn positions_evaluated(&self) -> u64 {
        self.positions_evaluated.load(Ordering::Relaxed)
    }

    /// Average positions per network invocation.
    pub fn avg_batch_size(&self) -> f64 {
        let b = self.batches_evaluated();
        if b == 0 {
            return 0.0;
        }
        self.positions_evaluated() as f64 / b as f64
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits() + self.cache_misses();
        if total == 0 {
            return 0.0;
        }
        self.cache_hits() as f64 / total as f64
    }
}

/// Evaluation plus whether it came from the cache.
pub struct EvalResponse {
    pub eval: Arc<NnEvaluation>,
    pub used_cache: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct BatchMetadata {
    reserve_index: usize,
    commit_count: usize,
    unread_count: usize,
    accepting_reservations: bool,
    /// Flush-by time, armed by the first reservation of a batch.
    deadline: Instant,
    /// Per-slot results of the flushed batch; each owner `take`s its own.
    slot_evals: Vec<Option<Arc<NnEvaluation>>>,
    shutting_down: bool,
    /// Latched network failure; all current and future calls surface it.
    error: Option<EvalError>,
}

struct SlotData<G: GameRules> {
    key: Option<CacheKey<G>>,
    valid: ActionMask,
    sym: u8,
}

struct BatchData<G: GameRules> {
    /// Row-major input slab, `batch_size_limit × obs_dim`.
    input: Vec<f32>,
    slots: Vec<SlotData<G>>,
}

struct Connection {
    handle: Option<JoinHandle<()>>,
    num_connections: usize,
}

// ---------------------------------------------------------------------------
// NnEvaluationService
// ---------------------------------------------------------------------------

type Registry = Mutex<HashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// One service per network artifact, shared by every manager that names the
/// same `model_filename`.
pub struct NnEvaluationService<G: GameRules> {
    network: Box<dyn Network>,
    encoder: Box<dyn StateEncoder<G>>,
    batch_size_limit: usize,
    timeout: Duration,
    cache: Mutex<LruCache<CacheKey<G>, Arc<NnEvaluation>>>,
    batch: Mutex<BatchData<G>>,
    meta: Mutex<BatchMetadata>,
    cv_service_loop: Condvar,
    cv_evaluate: Condvar,
    connection: Mutex<Connection>,
    stats: ServiceStats,
    cache_size: usize,
}

impl<G: GameRules> NnEvaluationService<G> {
    /// Fetch or construct the service for `params.model_filename`.
    /// Conflicting reuse (different batch size, timeout or cache size) is a
    /// configuration error.
    pub fn create(
        params: &ServiceParams,
        network: Box<dyn Network>,
        encoder: Box<dyn StateEncoder<G>>,
    ) -> Result<Arc<Self>, ConfigError> {
        let key = (TypeId::of::<G>(), params.model_filename.clone());
        let mut map = registry().lock().unwrap();

        if let Some(existing) = map.get(&key) {
            let service = Arc::clone(existing)
                .downcast::<NnEvaluationService<G>>()
                .ok()
                .expect("registry entry with mismatched game type");
            let conflict = if service.batch_size_limit != params.batch_size_limit {
                Some(format!(
                    "batch_size_limit {} vs {}",
                    service.batch_size_limit, params.batch_size_limit
                ))
            } else if service.timeout != params.nn_eval_timeout {
                Some(format!(
                    "nn_eval_timeout {:?} vs {:?}",
                    service.timeout, params.nn_eval_timeout
                ))
            } else if service.cache_size != params.cache_size {
                Some(format!(
                    "cache_size {} vs {}",
                    service.cache_size, params.cache_size
                ))
            } else {
                None
            };
            if let Some(detail) = conflict {
                return Err(ConfigError::ServiceConflict {
                    filename: params.model_filename.clone(),
                    detail,
                });
            }
            return Ok(service);
        }

        let service = Arc::new(Self::new(params, network, encoder));
        map.insert(key, Arc::clone(&service) as Arc<dyn Any + Send + Sync>);
        Ok(service)
    }

    fn new(
        params: &ServiceParams,
        network: Box<dyn Network>,
        encoder: Box<dyn StateEncoder<G>>,
    ) -> Self {
        let b = params.batch_size_limit.max(1);
        let obs_dim = encoder.obs_dim();
        Self {
            network,
            batch_size_limit: b,
            timeout: params.nn_eval_timeout,
            cache: Mutex::new(LruCache::new(params.cache_size)),
            batch: Mutex::new(BatchData {
                input: vec![0.0; b * obs_dim],
                slots: (0..b)
                    .map(|_| SlotData {
                        key: None,
                        valid: ActionMask::EMPTY,
                        sym: 0,
                    })
                    .collect(),
            }),
            meta: Mutex::new(BatchMetadata {
                reserve_index: 0,
                commit_count: 0,
                unread_count: 0,
                accepting_reservations: true,
                deadline: Instant::now(),
                slot_evals: vec![None; b],
                shutting_down: false,
                error: None,
            }),
            cv_service_loop: Condvar::new(),
            cv_evaluate: Condvar::new(),
            connection: Mutex::new(Connection {
                handle: None,
                num_connections: 0,
            }),
            stats: ServiceStats::default(),
            cache_size: params.cache_size,
            encoder,
        }
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub fn batch_size_limit(&self) -> usize {
        self.batch_size_limit
    }

    /// Number of cached evaluations.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Register a consumer; the service thread starts on the first
    /// connection.
    pub fn connect(self: &Arc<Self>) {
        let mut conn = self.connection.lock().unwrap();
        conn.num_connections += 1;
        if conn.handle.is_none() {
            self.meta.lock().unwrap().shutting_down = false;
            let service = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("nn-eval".into())
                .spawn(move || service.service_loop())
                .expect("failed to spawn evaluation service thread");
            conn.handle = Some(handle);
        }
    }

    /// Deregister a consumer; the last disconnect stops and joins the
    /// service thread.
    pub fn disconnect(&self) {
        let mut conn = self.connection.lock().unwrap();
        if conn.handle.is_none() {
            return;
        }
        conn.num_connections = conn.num_connections.saturating_sub(1);
        if conn.num_connections > 0 {
            return;
        }
        self.meta.lock().unwrap().shutting_down = true;
        self.cv_service_loop.notify_all();
        self.cv_evaluate.notify_all();
        if let Some(handle) = conn.handle.take() {
            let _ = handle.join();
        }
    }

    // --- Evaluate protocol (called on search threads) ---

    /// Evaluate one position. Blocks until the result is available; the
    /// tensorization runs on the calling thread.
    pub fn evaluate(
        &self,
        state: &G::State,
        valid: ActionMask,
        sym_index: u8,
        inverse_temperature: f32,
    ) -> Result<EvalResponse, EvalError> {
        let key = CacheKey::<G>::new(G::canonical_key(state), inverse_temperature, sym_index);

        // 1. Cache probe.
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(hit) = cache.get(&key) {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(EvalResponse {
                    eval: Arc::clone(hit),
                    used_cache: true,
                });
            }
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        // 2. Reserve a slot.
        let my_index = {
            let meta = self.meta.lock().unwrap();
            let mut meta = self
                .cv_evaluate
                .wait_while(meta, |m| {
                    m.error.is_none()
                        && !m.shutting_down
                        && !(m.unread_count == 0
                            && m.reserve_index < self.batch_size_limit
                            && m.accepting_reservations)
                })
                .unwrap();
            Self::check_live(&meta)?;
            let my_index = meta.reserve_index;
            meta.reserve_index += 1;
            if my_index == 0 {
                meta.deadline = Instant::now() + self.timeout;
            }
            self.cv_service_loop.notify_one();
            my_index
        };

        // 3. Tensorize into the reserved slot.
        {
            let mut batch = self.batch.lock().unwrap();
            let dim = self.encoder.obs_dim();
            let BatchData { input, slots } = &mut *batch;
            let buf = &mut input[my_index * dim..(my_index + 1) * dim];
            self.encoder.encode_into(state, buf);
            self.encoder.apply_input_symmetry(sym_index, buf);
            slots[my_index] = SlotData {
                key: Some(key),
                valid,
                sym: sym_index,
            };
        }

        // 4. Commit, wait for the flush, read the slot.
        let eval = {
            let mut meta = self.meta.lock().unwrap();
            meta.commit_count += 1;
            self.cv_service_loop.notify_one();

            let mut meta = self
                .cv_evaluate
                .wait_while(meta, |m| {
                    m.reserve_index != 0 && m.error.is_none() && !m.shutting_down
                })
                .unwrap();
            Self::check_live(&meta)?;
            let eval = meta.slot_evals[my_index]
                .take()
                .expect("flushed batch missing a slot evaluation");

            // 5. Release the slot once every sibling has read.
            debug_assert!(meta.unread_count > 0);
            meta.unread_count -= 1;
            let meta = self
                .cv_evaluate
                .wait_while(meta, |m| {
                    m.unread_count != 0 && m.error.is_none() && !m.shutting_down
                })
                .unwrap();
            drop(meta);
            eval
        };

        self.cv_evaluate.notify_all();
        self.cv_service_loop.notify_one();
        Ok(EvalResponse {
            eval,
            used_cache: false,
        })
    }

    fn check_live(meta: &BatchMetadata) -> Result<(), EvalError> {
        if let Some(err) = &meta.error {
            return Err(err.clone());
        }
        if meta.shutting_down {
            return Err(EvalError::ServiceShutDown);
        }
        Ok(())
    }

    // --- Service loop (runs on the service thread) ---

    fn service_loop(self: Arc<Self>) {
        loop {
            let n = {
                let meta = self.meta.lock().unwrap();

                // Previous batch fully consumed.
                let meta = self
                    .cv_service_loop
                    .wait_while(meta, |m| m.unread_count != 0 && !m.shutting_down)
                    .unwrap();
                if meta.shutting_down {
                    return;
                }

                // First reservation arrived.
                let meta = self
                    .cv_service_loop
                    .wait_while(meta, |m| m.reserve_index == 0 && !m.shutting_down)
                    .unwrap();
                if meta.shutting_down {
                    return;
                }

                // Batch full, or deadline expired.
                let mut meta = meta;
                loop {
                    if meta.reserve_index >= self.batch_size_limit {
                        break;
                    }
                    let now = Instant::now();
                    if now >= meta.deadline {
                        break;
                    }
                    let remaining = meta.deadline - now;
                    let (guard, _) = self
                        .cv_service_loop
                        .wait_timeout(meta, remaining)
                        .unwrap();
                    meta = guard;
                    if meta.shutting_down {
                        return;
                    }
                }
                meta.accepting_reservations = false;

                // All reserved slots committed.
                let meta = self
                    .cv_service_loop
                    .wait_while(meta, |m| m.commit_count != m.reserve_index && !m.shutting_down)
                    .unwrap();
                if meta.shutting_down {
                    return;
                }
                meta.reserve_index
            };

            match self.flush_batch(n) {
                Ok(results) => {
                    // Cache before waking the slot owners, so identical
                    // requests racing in behind the flush hit the cache.
                    {
                        let mut cache = self.cache.lock().unwrap();
                        for (key, eval) in &results {
                            cache.insert(key.clone(), Arc::clone(eval));
                        }
                    }

                    self.stats.batches_evaluated.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .positions_evaluated
                        .fetch_add(n as u64, Ordering::Relaxed);
                    debug!(batch = n, "evaluation batch flushed");

                    {
                        let mut meta = self.meta.lock().unwrap();
                        for (i, (_, eval)) in results.into_iter().enumerate() {
                            meta.slot_evals[i] = Some(eval);
                        }
                        meta.unread_count = meta.commit_count;
                        meta.reserve_index = 0;
                        meta.commit_count = 0;
                        meta.accepting_reservations = true;
                    }
                    self.cv_evaluate.notify_all();
                }
                Err(err) => {
                    warn!(error = %err, "network evaluation failed; service stopping");
                    let mut meta = self.meta.lock().unwrap();
                    meta.error = Some(err);
                    drop(meta);
                    self.cv_evaluate.notify_all();
                    return;
                }
            }
        }
    }

    /// Run the network over the first `n` committed slots and build the
    /// per-slot evaluations, inverting each slot's symmetry on its policy.
    fn flush_batch(&self, n: usize) -> Result<Vec<(CacheKey<G>, Arc<NnEvaluation>)>, EvalError> {
        let mut batch = self.batch.lock().unwrap();
        let dim = self.encoder.obs_dim();
        let output = self.network.predict(&batch.input[..n * dim], n, dim)?;

        let p = G::NUM_PLAYERS;
        let k = G::NUM_GLOBAL_ACTIONS;
        if output.values.len() < n * p || output.policy_logits.len() < n * k {
            return Err(EvalError::Network(format!(
                "network output shape mismatch: got {} values / {} logits for batch {n}",
                output.values.len(),
                output.policy_logits.len()
            )));
        }

        let mut results = Vec::with_capacity(n);
        for i in 0..n {
            let slot = &mut batch.slots[i];
            let mut policy = output.policy_logits[i * k..(i + 1) * k].to_vec();
            self.encoder.invert_policy_symmetry(slot.sym, &mut policy);
            let value = &output.values[i * p..(i + 1) * p];
            let eval = Arc::new(NnEvaluation::from_network_output(value, &policy, slot.valid));
            let key = slot.key.take().expect("committed slot without a cache key");
            results.push((key, eval));
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
