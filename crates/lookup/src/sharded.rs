//! Sharded lookup: routes key sets to owning shards and merges results.

use crate::query::{self, Node};
use crate::remote::RemoteLookupClient;
use crate::shard_manager::{ShardManager, ShardMap};
use crate::{Lookup, LookupResponse, QueryResult, SingleLookupResult};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use silo_common::{Error, LookupStatus, ShardingFunction};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Lookup over the whole fleet. Keys owned by the current shard are served
/// from the local lookup; every other non-empty bucket becomes one remote
/// RPC, issued in parallel.
pub struct ShardedLookup<L: Lookup, R: RemoteLookupClient> {
    local: Arc<L>,
    remote: Arc<R>,
    shard_manager: Arc<ShardManager>,
    shard_map: Arc<ShardMap>,
    shard_function: ShardingFunction,
    num_shards: u32,
    current_shard: u32,
}

impl<L: Lookup, R: RemoteLookupClient> std::fmt::Debug for ShardedLookup<L, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedLookup")
            .field("num_shards", &self.num_shards)
            .field("current_shard", &self.current_shard)
            .finish_non_exhaustive()
    }
}

impl<L: Lookup, R: RemoteLookupClient> ShardedLookup<L, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<L>,
        remote: Arc<R>,
        shard_manager: Arc<ShardManager>,
        shard_map: Arc<ShardMap>,
        shard_function: ShardingFunction,
        num_shards: u32,
        current_shard: u32,
    ) -> Self {
        Self {
            local,
            remote,
            shard_manager,
            shard_map,
            shard_function,
            num_shards,
            current_shard,
        }
    }

    /// Physical shard owning `key`.
    fn shard_for(&self, key: &str) -> u32 {
        let logical = self.shard_function.shard_for_key(key, self.num_shards);
        self.shard_map.physical_for(logical)
    }

    /// Bucket keys by owning physical shard, deduplicating.
    fn bucket_keys(&self, keys: &[String]) -> HashMap<u32, Vec<String>> {
        let mut buckets: HashMap<u32, Vec<String>> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            buckets.entry(self.shard_for(key)).or_default().push(key.clone());
        }
        buckets
    }

    /// Fan a lookup out across shards and merge per-key results. A failing
    /// shard yields a status on exactly the keys routed to it.
    async fn fan_out(&self, keys: Vec<String>, lookup_sets: bool) -> Result<LookupResponse, Error> {
        let mut buckets = self.bucket_keys(&keys);
        let max_bucket = buckets.values().map(Vec::len).max().unwrap_or(0);
        let local_bucket = buckets.remove(&self.current_shard);

        let m = silo_metrics::metrics();
        let mut futs = FuturesUnordered::new();
        for (shard, bucket) in buckets {
            let remote = self.remote.clone();
            let address = self.shard_manager.get(shard);
            let padding = max_bucket - bucket.len();
            m.sharded_lookup_keys
                .with_label_values(&["remote"])
                .inc_by(bucket.len() as u64);
            futs.push(async move {
                let result = match address {
                    Some(address) => {
                        silo_metrics::metrics().remote_lookups_sent.inc();
                        remote
                            .get_values(&address, bucket.clone(), lookup_sets, padding)
                            .await
                    }
                    None => Err(Error::Unavailable(format!(
                        "no replica available for shard {shard}"
                    ))),
                };
                (bucket, result)
            });
        }

        let mut response = LookupResponse::default();
        if let Some(bucket) = local_bucket {
            m.sharded_lookup_keys
                .with_label_values(&["local"])
                .inc_by(bucket.len() as u64);
            let local_response = if lookup_sets {
                self.local.get_key_value_set(bucket).await?
            } else {
                self.local.get_key_values(bucket).await?
            };
            response.kv_pairs.extend(local_response.kv_pairs);
        }

        while let Some((bucket, result)) = futs.next().await {
            match result {
                Ok(remote_response) => {
                    // Only take results for keys we actually routed there;
                    // padding keys never come back non-empty but a confused
                    // peer must not pollute the merge.
                    let wanted: HashSet<&String> = bucket.iter().collect();
                    for (key, value) in remote_response.kv_pairs {
                        if wanted.contains(&key) {
                            response.kv_pairs.insert(key, value);
                        }
                    }
                }
                Err(e) => {
                    silo_metrics::metrics().remote_lookup_failures.inc();
                    tracing::warn!("remote lookup failed: {}", e);
                    let status = LookupStatus::from(&e);
                    for key in bucket {
                        response
                            .kv_pairs
                            .insert(key, SingleLookupResult::Status(status.clone()));
                    }
                }
            }
        }
        Ok(response)
    }

    /// Resolve every leaf's set, fetching per owning shard, and evaluate
    /// the query locally.
    async fn eval_cross_shard(&self, ast: &Node) -> Result<QueryResult, Error> {
        let leaves: Vec<String> = ast
            .leaves()
            .into_iter()
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let response = self.fan_out(leaves, true).await?;

        // A shard failure poisons query semantics; surface the first one.
        for (key, result) in &response.kv_pairs {
            if let SingleLookupResult::Status(status) = result {
                if status.code != 5 {
                    return Err(Error::Unavailable(format!(
                        "failed to fetch set for query leaf {key}: {}",
                        status.message
                    )));
                }
            }
        }

        let sets: HashMap<String, HashSet<String>> = response
            .kv_pairs
            .into_iter()
            .filter_map(|(key, result)| match result {
                SingleLookupResult::ValueSet(elements) => {
                    Some((key, elements.into_iter().collect()))
                }
                _ => None,
            })
            .collect();

        let result = ast.eval(&|key| sets.get(key).cloned().unwrap_or_default());
        Ok(QueryResult::from_set(result))
    }
}

#[async_trait::async_trait]
impl<L: Lookup, R: RemoteLookupClient> Lookup for ShardedLookup<L, R> {
    async fn get_key_values(&self, keys: Vec<String>) -> Result<LookupResponse, Error> {
        self.fan_out(keys, false).await
    }

    async fn get_key_value_set(&self, keys: Vec<String>) -> Result<LookupResponse, Error> {
        self.fan_out(keys, true).await
    }

    async fn run_query(&self, query: String) -> Result<QueryResult, Error> {
        let ast = query::parse(&query)?;
        let shards: HashSet<u32> = ast.leaves().iter().map(|leaf| self.shard_for(leaf)).collect();

        // A query whose leaves live on one shard is delegated whole.
        if shards.len() == 1 {
            let shard = *shards.iter().next().expect("non-empty shard set");
            if shard == self.current_shard {
                return self.local.run_query(query).await;
            }
            let address = self.shard_manager.get(shard).ok_or_else(|| {
                Error::Unavailable(format!("no replica available for shard {shard}"))
            })?;
            silo_metrics::metrics().remote_lookups_sent.inc();
            return self.remote.run_query(&address, query).await;
        }

        self.eval_cross_shard(&ast).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
