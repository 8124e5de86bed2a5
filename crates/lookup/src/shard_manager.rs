//! Shard replica management.
//!
//! `ShardManager` owns the logical-shard → replica-set snapshot; the
//! `ClusterMappingsManager` refreshes it in the background from an
//! [`InstanceClient`]. `ShardMap` is the logical→physical translation fed
//! by shard-mapping delta records. Both snapshots swap atomically behind a
//! lock so readers never see a partial update.

use parking_lot::RwLock;
use rand::Rng;
use silo_common::Error;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Duration;

// ---------------------------------------------------------------------------
// ShardManager
// ---------------------------------------------------------------------------

/// Snapshot of replica addresses per logical shard.
pub struct ShardManager {
    replica_sets: RwLock<Arc<Vec<Vec<String>>>>,
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("num_shards", &self.num_shards())
            .finish_non_exhaustive()
    }
}

fn validate_mappings(cluster_mappings: &[HashSet<String>]) -> Result<(), Error> {
    if cluster_mappings.is_empty() {
        return Err(Error::InvalidArgument("cluster mappings are empty".into()));
    }
    for (shard, replicas) in cluster_mappings.iter().enumerate() {
        if replicas.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "shard {shard} has no replicas"
            )));
        }
    }
    Ok(())
}

fn snapshot_from(cluster_mappings: Vec<HashSet<String>>) -> Arc<Vec<Vec<String>>> {
    Arc::new(
        cluster_mappings
            .into_iter()
            .map(|replicas| {
                let mut replicas: Vec<String> = replicas.into_iter().collect();
                replicas.sort();
                replicas
            })
            .collect(),
    )
}

impl ShardManager {
    /// Build a manager from initial mappings; every logical shard must have
    /// at least one replica.
    pub fn create(cluster_mappings: Vec<HashSet<String>>) -> Result<Self, Error> {
        validate_mappings(&cluster_mappings)?;
        Ok(Self {
            replica_sets: RwLock::new(snapshot_from(cluster_mappings)),
        })
    }

    pub fn num_shards(&self) -> u32 {
        self.replica_sets.read().len() as u32
    }

    /// A replica address for `shard`, picked uniformly at random.
    pub fn get(&self, shard: u32) -> Option<String> {
        let snapshot = self.replica_sets.read().clone();
        let replicas = snapshot.get(shard as usize)?;
        if replicas.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..replicas.len());
        Some(replicas[index].clone())
    }

    /// Atomically replace the snapshot. Invalid mappings are rejected and
    /// the previous snapshot stays live.
    pub fn insert_batch(&self, cluster_mappings: Vec<HashSet<String>>) -> Result<(), Error> {
        validate_mappings(&cluster_mappings)?;
        *self.replica_sets.write() = snapshot_from(cluster_mappings);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ShardMap (logical → physical)
// ---------------------------------------------------------------------------

/// Logical→physical shard translation, identity until shard-mapping records
/// say otherwise.
pub struct ShardMap {
    map: RwLock<Arc<Vec<u32>>>,
}

impl ShardMap {
    pub fn identity(num_shards: u32) -> Self {
        Self {
            map: RwLock::new(Arc::new((0..num_shards).collect())),
        }
    }

    pub fn physical_for(&self, logical_shard: u32) -> u32 {
        let snapshot = self.map.read().clone();
        snapshot
            .get(logical_shard as usize)
            .copied()
            .unwrap_or(logical_shard)
    }

    pub fn set(&self, logical_shard: u32, physical_shard: u32) {
        let mut guard = self.map.write();
        let mut next = (**guard).clone();
        if (logical_shard as usize) >= next.len() {
            tracing::warn!(
                logical_shard,
                physical_shard,
                "ignoring shard mapping outside the fleet"
            );
            return;
        }
        next[logical_shard as usize] = physical_shard;
        *guard = Arc::new(next);
    }
}

// ---------------------------------------------------------------------------
// Cluster mappings manager
// ---------------------------------------------------------------------------

/// External collaborator that knows the fleet topology.
#[async_trait::async_trait]
pub trait InstanceClient: Send + Sync {
    /// Current replica addresses per logical shard.
    async fn get_cluster_mappings(&self, num_shards: u32) -> Result<Vec<HashSet<String>>, Error>;
}

/// Instance client backed by static configuration.
pub struct StaticInstanceClient {
    mappings: Vec<HashSet<String>>,
}

impl StaticInstanceClient {
    pub fn new(cluster: Vec<Vec<String>>) -> Self {
        Self {
            mappings: cluster
                .into_iter()
                .map(|replicas| replicas.into_iter().collect())
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl InstanceClient for StaticInstanceClient {
    async fn get_cluster_mappings(&self, num_shards: u32) -> Result<Vec<HashSet<String>>, Error> {
        if self.mappings.len() != num_shards as usize {
            return Err(Error::Internal(format!(
                "static cluster has {} shards, expected {num_shards}",
                self.mappings.len()
            )));
        }
        Ok(self.mappings.clone())
    }
}

/// Keeps the [`ShardManager`] snapshot fresh.
pub struct ClusterMappingsManager<I: InstanceClient> {
    instance_client: Arc<I>,
    num_shards: u32,
    refresh_interval: Duration,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

impl<I: InstanceClient + 'static> ClusterMappingsManager<I> {
    pub fn new(instance_client: Arc<I>, num_shards: u32, refresh_interval: Duration) -> Self {
        Self {
            instance_client,
            num_shards,
            refresh_interval,
        }
    }

    /// Fetch the initial mappings, retrying with exponential backoff until
    /// every logical shard has at least one replica.
    pub async fn initial_cluster_mappings(&self) -> Vec<HashSet<String>> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self
                .instance_client
                .get_cluster_mappings(self.num_shards)
                .await
            {
                Ok(mappings) if validate_mappings(&mappings).is_ok() => return mappings,
                Ok(_) => {
                    tracing::warn!("instance client returned an incomplete cluster mapping");
                }
                Err(e) => {
                    tracing::warn!("failed to fetch cluster mappings: {}", e);
                }
            }
            let jitter = Duration::from_millis(
                rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2),
            );
            tokio::time::sleep(backoff + jitter).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Spawn the periodic refresh loop. Failed refreshes keep the previous
    /// snapshot.
    pub fn spawn_refresh_task(
        self: Arc<Self>,
        shard_manager: Arc<ShardManager>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, construction
            // already installed a snapshot.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self
                    .instance_client
                    .get_cluster_mappings(self.num_shards)
                    .await
                {
                    Ok(mappings) => {
                        if let Err(e) = shard_manager.insert_batch(mappings) {
                            tracing::warn!("rejected refreshed cluster mapping: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("cluster mapping refresh failed: {}", e);
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
