//! Parallel PUCT tree search for two-player, perfect-information,
//! deterministic games, with batched neural-network evaluation.
//!
//! Game rules and tensor layout enter through the [`GameRules`] and
//! [`StateEncoder`] traits; the network artifact enters through [`Network`].
//! A [`Manager`] hosts the shared tree, runs the configured number of
//! search threads, and answers `search(state)` with a visit-count
//! distribution and per-player value estimates. All managers naming the
//! same model share one batching [`NnEvaluationService`].

pub mod cache;
pub mod eval;
pub mod game;
pub mod lookup;
pub mod manager;
pub mod math;
pub mod node;
pub mod onnx;
pub mod release;
pub mod service;

mod search;

#[cfg(test)]
pub(crate) mod test_util;

pub use eval::{EvalError, Network, NetworkOutput, NnEvaluation, UniformNetwork};
pub use game::{
    ActionMask, GameRules, Outcome, StateEncoder, SymmetryMask, MAX_GLOBAL_ACTIONS, MAX_SYMMETRIES,
};
pub use lookup::LookupTable;
pub use manager::{
    ConfigError, Manager, ManagerParams, SearchError, SearchParams, SearchResults,
};
pub use node::{EvalState, LazyData, Node, NodeStats};
pub use release::NodeReleaseService;
pub use service::{CacheKey, EvalResponse, NnEvaluationService, ServiceParams, ServiceStats};

#[cfg(feature = "onnx")]
pub use onnx::OrtNetwork;
