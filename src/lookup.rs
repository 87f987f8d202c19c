//! Canonical-key node lookup.
//!
//! Maps `(move number, canonical state key)` to a shared node handle so that
//! transposed positions reuse one node and re-rooting can recover subtrees
//! built under other lines (pondering, state-change misses). Entries are
//! sharded by move number: once play has advanced past a move number, every
//! entry behind it can be released in one call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::game::GameRules;
use crate::node::Node;

/// Process-shared `(move number, canonical key) → Arc<Node>` map.
pub struct LookupTable<G: GameRules> {
    shards: Mutex<BTreeMap<u32, HashMap<G::Key, Arc<Node<G>>>>>,
}

impl<G: GameRules> LookupTable<G> {
    pub fn new() -> Self {
        Self {
            shards: Mutex::new(BTreeMap::new()),
        }
    }

    /// Return the node registered for `(move_number, key(state))`, or
    /// construct a root-style node from `state` and register it.
    pub fn fetch_or_create(&self, move_number: u32, state: G::State, sym_index: u8) -> Arc<Node<G>> {
        let key = G::canonical_key(&state);
        let mut shards = self.shards.lock().unwrap();
        let shard = shards.entry(move_number).or_default();
        if let Some(node) = shard.get(&key) {
            return Arc::clone(node);
        }
        let node = Node::new_root(state, move_number, sym_index);
        shard.insert(key, Arc::clone(&node));
        node
    }

    /// Register `node` unless the key is already taken (first writer wins —
    /// transposed siblings share the earlier registration).
    pub fn insert_if_absent(&self, move_number: u32, key: G::Key, node: Arc<Node<G>>) {
        let mut shards = self.shards.lock().unwrap();
        shards.entry(move_number).or_default().entry(key).or_insert(node);
    }

    /// Look up without creating.
    pub fn get(&self, move_number: u32, key: &G::Key) -> Option<Arc<Node<G>>> {
        let shards = self.shards.lock().unwrap();
        shards.get(&move_number)?.get(key).cloned()
    }

    /// Drop every entry with a strictly smaller move number.
    pub fn clear_before(&self, move_number: u32) {
        let mut shards = self.shards.lock().unwrap();
        let keep = shards.split_off(&move_number);
        *shards = keep;
    }

    pub fn clear(&self) {
        self.shards.lock().unwrap().clear();
    }

    /// Total registered nodes across all shards.
    pub fn len(&self) -> usize {
        self.shards.lock().unwrap().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<G: GameRules> Default for LookupTable<G> {
    fn default() -> Self {
        Self::new()
    }
}
