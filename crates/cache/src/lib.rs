//! In-memory key-value cache with logical-commit-time write semantics.
//!
//! Writes are ordered by producer-assigned logical commit time (LCT), not by
//! arrival order: a mutation applies only when its LCT strictly exceeds the
//! stored LCT for that key. Deletes leave a tombstone carrying the deletion
//! LCT so late-arriving stale updates stay no-ops until the tombstone is
//! garbage-collected past the retention cutoff.
//!
//! The cache is striped to mitigate lock contention: each stripe holds its
//! own maps behind a `parking_lot::RwLock`, and a key's stripe is picked by
//! hash. Readers never block each other; a writer serializes with readers
//! only for the stripe it touches. Snapshot consistency across keys is not
//! guaranteed.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};

/// Number of lock stripes. Power of two so the hash maps to a stripe with a
/// mask.
const STRIPE_COUNT: usize = 16;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A scalar cache slot. `value == None` is a tombstone: the key was deleted
/// at `last_logical_commit_time` and the slot survives until clean-up so
/// stale updates keep losing the LCT comparison.
#[derive(Debug)]
struct CacheValue {
    value: Option<String>,
    last_logical_commit_time: i64,
}

/// A set-typed cache slot, same tombstone convention.
#[derive(Debug)]
struct SetValue {
    elements: Option<HashSet<String>>,
    last_logical_commit_time: i64,
}

#[derive(Debug)]
struct Stripe<V> {
    map: HashMap<String, V>,
    /// Tombstoned keys ordered by deletion LCT, for efficient clean-up.
    deleted_nodes: BTreeMap<i64, Vec<String>>,
    /// Highest clean-up cutoff applied so far. Mutations at or below this
    /// are ignored: their tombstones may already be gone.
    max_cleanup_lct: i64,
}

impl<V> Default for Stripe<V> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            deleted_nodes: BTreeMap::new(),
            max_cleanup_lct: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// KeyValueCache
// ---------------------------------------------------------------------------

/// Concurrent map of key→scalar and key→set with LCT write semantics.
pub struct KeyValueCache {
    scalar_stripes: Vec<RwLock<Stripe<CacheValue>>>,
    set_stripes: Vec<RwLock<Stripe<SetValue>>>,
}

impl Default for KeyValueCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyValueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueCache").finish_non_exhaustive()
    }
}

fn stripe_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) & (STRIPE_COUNT - 1)
}

impl KeyValueCache {
    pub fn new() -> Self {
        Self {
            scalar_stripes: (0..STRIPE_COUNT).map(|_| RwLock::default()).collect(),
            set_stripes: (0..STRIPE_COUNT).map(|_| RwLock::default()).collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Scalar writes
    // -----------------------------------------------------------------------

    /// Insert or update `key` with `value` if `logical_commit_time` strictly
    /// exceeds the stored LCT (or the key is absent). Otherwise a no-op.
    pub fn update_scalar(&self, key: &str, value: String, logical_commit_time: i64) {
        let mut stripe = self.scalar_stripes[stripe_index(key)].write();
        if logical_commit_time <= stripe.max_cleanup_lct {
            tracing::debug!(
                key,
                logical_commit_time,
                "ignoring update at or below the clean-up watermark"
            );
            return;
        }
        match stripe.map.get(key) {
            Some(existing) if logical_commit_time <= existing.last_logical_commit_time => {}
            Some(existing) => {
                if existing.value.is_none() {
                    let old_lct = existing.last_logical_commit_time;
                    remove_deleted_node(&mut stripe.deleted_nodes, old_lct, key);
                }
                stripe.map.insert(
                    key.to_string(),
                    CacheValue {
                        value: Some(value),
                        last_logical_commit_time: logical_commit_time,
                    },
                );
            }
            None => {
                stripe.map.insert(
                    key.to_string(),
                    CacheValue {
                        value: Some(value),
                        last_logical_commit_time: logical_commit_time,
                    },
                );
            }
        }
    }

    /// Tombstone `key` at `logical_commit_time` if it strictly exceeds the
    /// stored LCT. The tombstone is inserted even when the key is absent so
    /// that out-of-order stale updates stay no-ops.
    pub fn delete(&self, key: &str, logical_commit_time: i64) {
        let mut stripe = self.scalar_stripes[stripe_index(key)].write();
        if logical_commit_time <= stripe.max_cleanup_lct {
            return;
        }
        match stripe.map.get(key) {
            Some(existing) if logical_commit_time <= existing.last_logical_commit_time => {
                return;
            }
            Some(existing) => {
                if existing.value.is_none() {
                    let old_lct = existing.last_logical_commit_time;
                    remove_deleted_node(&mut stripe.deleted_nodes, old_lct, key);
                }
            }
            None => {}
        }
        stripe.map.insert(
            key.to_string(),
            CacheValue {
                value: None,
                last_logical_commit_time: logical_commit_time,
            },
        );
        stripe
            .deleted_nodes
            .entry(logical_commit_time)
            .or_default()
            .push(key.to_string());
    }

    // -----------------------------------------------------------------------
    // Set writes
    // -----------------------------------------------------------------------

    /// Replace the set for `key` with `elements` if `logical_commit_time`
    /// strictly exceeds the stored LCT. Element removal is expressed by
    /// supplying the new set.
    pub fn update_set(&self, key: &str, elements: Vec<String>, logical_commit_time: i64) {
        let mut stripe = self.set_stripes[stripe_index(key)].write();
        if logical_commit_time <= stripe.max_cleanup_lct {
            tracing::debug!(
                key,
                logical_commit_time,
                "ignoring set update at or below the clean-up watermark"
            );
            return;
        }
        match stripe.map.get(key) {
            Some(existing) if logical_commit_time <= existing.last_logical_commit_time => {}
            Some(existing) => {
                if existing.elements.is_none() {
                    let old_lct = existing.last_logical_commit_time;
                    remove_deleted_node(&mut stripe.deleted_nodes, old_lct, key);
                }
                stripe.map.insert(
                    key.to_string(),
                    SetValue {
                        elements: Some(elements.into_iter().collect()),
                        last_logical_commit_time: logical_commit_time,
                    },
                );
            }
            None => {
                stripe.map.insert(
                    key.to_string(),
                    SetValue {
                        elements: Some(elements.into_iter().collect()),
                        last_logical_commit_time: logical_commit_time,
                    },
                );
            }
        }
    }

    /// Tombstone the entire set for `key` at `logical_commit_time`.
    pub fn delete_set(&self, key: &str, logical_commit_time: i64) {
        let mut stripe = self.set_stripes[stripe_index(key)].write();
        if logical_commit_time <= stripe.max_cleanup_lct {
            return;
        }
        match stripe.map.get(key) {
            Some(existing) if logical_commit_time <= existing.last_logical_commit_time => {
                return;
            }
            Some(existing) => {
                if existing.elements.is_none() {
                    let old_lct = existing.last_logical_commit_time;
                    remove_deleted_node(&mut stripe.deleted_nodes, old_lct, key);
                }
            }
            None => {}
        }
        stripe.map.insert(
            key.to_string(),
            SetValue {
                elements: None,
                last_logical_commit_time: logical_commit_time,
            },
        );
        stripe
            .deleted_nodes
            .entry(logical_commit_time)
            .or_default()
            .push(key.to_string());
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Scalar lookup. Tombstoned and absent keys are omitted.
    pub fn get<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, String> {
        let mut result = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            let stripe = self.scalar_stripes[stripe_index(key)].read();
            if let Some(CacheValue {
                value: Some(value), ..
            }) = stripe.map.get(key)
            {
                result.insert(key.to_string(), value.clone());
            }
        }
        result
    }

    /// Set lookup. Tombstoned and absent keys are omitted.
    pub fn get_sets<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, HashSet<String>> {
        let mut result = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            let stripe = self.set_stripes[stripe_index(key)].read();
            if let Some(SetValue {
                elements: Some(elements),
                ..
            }) = stripe.map.get(key)
            {
                result.insert(key.to_string(), elements.clone());
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Clean-up
    // -----------------------------------------------------------------------

    /// Drop tombstones with deletion LCT strictly below `cutoff`. The cutoff
    /// is the lowest LCT still interesting for replay safety; it only moves
    /// forward.
    pub fn remove_deleted_below(&self, cutoff_lct: i64) {
        let mut removed = 0usize;
        for stripe in &self.scalar_stripes {
            let mut stripe = stripe.write();
            if cutoff_lct <= stripe.max_cleanup_lct {
                continue;
            }
            let keep = stripe.deleted_nodes.split_off(&cutoff_lct);
            let below = std::mem::replace(&mut stripe.deleted_nodes, keep);
            for (lct, keys) in below {
                for key in keys {
                    if let Some(entry) = stripe.map.get(&key) {
                        if entry.value.is_none() && entry.last_logical_commit_time == lct {
                            stripe.map.remove(&key);
                            removed += 1;
                        }
                    }
                }
            }
            stripe.max_cleanup_lct = cutoff_lct;
        }
        for stripe in &self.set_stripes {
            let mut stripe = stripe.write();
            if cutoff_lct <= stripe.max_cleanup_lct {
                continue;
            }
            let keep = stripe.deleted_nodes.split_off(&cutoff_lct);
            let below = std::mem::replace(&mut stripe.deleted_nodes, keep);
            for (lct, keys) in below {
                for key in keys {
                    if let Some(entry) = stripe.map.get(&key) {
                        if entry.elements.is_none() && entry.last_logical_commit_time == lct {
                            stripe.map.remove(&key);
                            removed += 1;
                        }
                    }
                }
            }
            stripe.max_cleanup_lct = cutoff_lct;
        }
        if removed > 0 {
            tracing::debug!(removed, cutoff_lct, "removed tombstones below cutoff");
        }
    }

    /// Number of live scalar keys (tombstones excluded). For stats/tests.
    pub fn scalar_key_count(&self) -> usize {
        self.scalar_stripes
            .iter()
            .map(|s| s.read().map.values().filter(|v| v.value.is_some()).count())
            .sum()
    }

    /// Number of live set keys (tombstones excluded). For stats/tests.
    pub fn set_key_count(&self) -> usize {
        self.set_stripes
            .iter()
            .map(|s| {
                s.read()
                    .map
                    .values()
                    .filter(|v| v.elements.is_some())
                    .count()
            })
            .sum()
    }
}

fn remove_deleted_node(deleted_nodes: &mut BTreeMap<i64, Vec<String>>, lct: i64, key: &str) {
    if let Some(keys) = deleted_nodes.get_mut(&lct) {
        keys.retain(|k| k != key);
        if keys.is_empty() {
            deleted_nodes.remove(&lct);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
