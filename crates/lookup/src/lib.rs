//! Lookup fabric: the uniform [`Lookup`] capability and its variants.
//!
//! Provides:
//! - `LocalLookup`: serves straight from the in-memory cache
//! - `ShardedLookup`: routes key sets to owning shards and merges results
//! - `RemoteLookupClient`: the client seam to a peer node's lookup service
//! - `ShardManager` / `ClusterMappingsManager`: replica address snapshots
//! - query parsing and evaluation for `run_query`
//! - payload sealing for the shard-to-shard wire

pub mod local;
pub mod query;
pub mod remote;
pub mod sealing;
pub mod shard_manager;
pub mod sharded;

pub use local::LocalLookup;
pub use remote::RemoteLookupClient;
pub use shard_manager::{
    ClusterMappingsManager, InstanceClient, ShardManager, ShardMap, StaticInstanceClient,
};
pub use sharded::ShardedLookup;

use silo_common::{Error, LookupStatus};
use std::collections::HashMap;

/// Uniform lookup capability implemented by the local, sharded and remote
/// variants.
#[async_trait::async_trait]
pub trait Lookup: Send + Sync {
    /// Scalar lookup. Every requested key appears in the result, as a value
    /// or a per-key status.
    async fn get_key_values(&self, keys: Vec<String>) -> Result<LookupResponse, Error>;

    /// Set lookup, same per-key shape.
    async fn get_key_value_set(&self, keys: Vec<String>) -> Result<LookupResponse, Error>;

    /// Evaluate a boolean set-algebra expression over set-typed keys.
    async fn run_query(&self, query: String) -> Result<QueryResult, Error>;
}

/// Per-key lookup outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleLookupResult {
    Value(String),
    ValueSet(Vec<String>),
    Status(LookupStatus),
}

/// Result of a scalar or set lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupResponse {
    pub kv_pairs: HashMap<String, SingleLookupResult>,
}

/// Result of `run_query`: the matching set elements, sorted for stable
/// output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub elements: Vec<String>,
}

impl QueryResult {
    pub fn from_set(set: std::collections::HashSet<String>) -> Self {
        let mut elements: Vec<String> = set.into_iter().collect();
        elements.sort();
        Self { elements }
    }
}
