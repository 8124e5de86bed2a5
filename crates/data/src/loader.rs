//! Ingestion: applies delta records to the cache and side sinks.

use crate::blob::BlobStorageClient;
use crate::reader::{ConcurrentDeltaReader, ConcurrentReadOptions, StreamFactory};
use crate::records::{DeltaRecord, KvMutation, MutationOp, MutationValue, UdfConfigRecord};
use silo_cache::KeyValueCache;
use silo_common::Error;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// Delta files are named `DELTA_<sortable id>`; the watch loop ingests them
/// in lexicographic order.
pub const DELTA_FILE_PREFIX: &str = "DELTA_";

/// Receives UDF code objects found in the delta stream.
#[async_trait::async_trait]
pub trait UdfCodeSink: Send + Sync {
    async fn apply_udf_config(&self, record: UdfConfigRecord) -> Result<(), Error>;
}

/// Receives logical→physical shard translation entries.
pub trait ShardMappingSink: Send + Sync {
    fn apply_shard_mapping(&self, logical_shard: u32, physical_shard: u32);
}

/// Routes delta records into the cache, the UDF client and the shard map.
pub struct DeltaApplier {
    cache: Arc<KeyValueCache>,
    udf_sink: Option<Arc<dyn UdfCodeSink>>,
    shard_mapping_sink: Option<Arc<dyn ShardMappingSink>>,
    /// This node's shard; files stamped for another shard are skipped.
    shard_num: u32,
    read_options: ConcurrentReadOptions,
    max_lct_seen: AtomicI64,
}

impl DeltaApplier {
    pub fn new(cache: Arc<KeyValueCache>, shard_num: u32, read_options: ConcurrentReadOptions) -> Self {
        Self {
            cache,
            udf_sink: None,
            shard_mapping_sink: None,
            shard_num,
            read_options,
            max_lct_seen: AtomicI64::new(0),
        }
    }

    pub fn with_udf_sink(mut self, sink: Arc<dyn UdfCodeSink>) -> Self {
        self.udf_sink = Some(sink);
        self
    }

    pub fn with_shard_mapping_sink(mut self, sink: Arc<dyn ShardMappingSink>) -> Self {
        self.shard_mapping_sink = Some(sink);
        self
    }

    /// Highest logical commit time observed across ingested files. Drives
    /// the tombstone retention cutoff.
    pub fn max_lct_seen(&self) -> i64 {
        self.max_lct_seen.load(Ordering::Relaxed)
    }

    fn observe_lct(&self, lct: i64) {
        self.max_lct_seen.fetch_max(lct, Ordering::Relaxed);
    }

    /// Ingest one delta file from blob storage. Returns the number of
    /// records read.
    pub async fn load_from_blob(
        &self,
        blob: Arc<dyn BlobStorageClient>,
        name: &str,
    ) -> Result<u64, Error> {
        let factory: StreamFactory = {
            let blob = blob.clone();
            let name = name.to_string();
            Arc::new(move || blob.get_reader(&name))
        };
        let reader = ConcurrentDeltaReader::new(factory, self.read_options.clone());

        let metadata = reader.metadata().map_err(Error::from)?;
        if let Some(file_shard) = metadata.shard_num {
            if file_shard != self.shard_num {
                tracing::warn!(
                    name,
                    file_shard,
                    our_shard = self.shard_num,
                    "skipping delta file stamped for another shard"
                );
                return Ok(0);
            }
        }

        // Mutations apply straight into the cache from the shard tasks;
        // code objects and mappings are collected and applied afterwards
        // so their sinks stay async and run once per file.
        let cache = self.cache.clone();
        let side_records: Arc<Mutex<Vec<DeltaRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let side_records_cb = side_records.clone();

        let total = reader
            .read_records(move |record| {
                match record {
                    DeltaRecord::KvMutation(mutation) => apply_mutation(&cache, &mutation),
                    other => side_records_cb
                        .lock()
                        .expect("side record collection poisoned")
                        .push(other),
                }
                Ok(())
            })
            .await
            .map_err(Error::from)?;

        let side_records = std::mem::take(
            &mut *side_records
                .lock()
                .expect("side record collection poisoned"),
        );
        for record in side_records {
            match record {
                DeltaRecord::UdfConfig(config) => {
                    self.observe_lct(config.logical_commit_time);
                    if let Some(sink) = &self.udf_sink {
                        if let Err(e) = sink.apply_udf_config(config).await {
                            tracing::error!("failed to apply UDF code object: {}", e);
                        }
                    } else {
                        tracing::debug!("dropping UDF code object: no sink configured");
                    }
                }
                DeltaRecord::ShardMapping(mapping) => {
                    if let Some(sink) = &self.shard_mapping_sink {
                        sink.apply_shard_mapping(mapping.logical_shard, mapping.physical_shard);
                    }
                }
                DeltaRecord::KvMutation(_) => unreachable!("mutations are applied inline"),
            }
        }

        self.observe_lct(metadata.max_logical_commit_time);
        let m = silo_metrics::metrics();
        m.delta_files_loaded.inc();
        m.delta_records_loaded.inc_by(total);
        tracing::info!(name, records = total, "ingested delta file");
        Ok(total)
    }
}

fn apply_mutation(cache: &KeyValueCache, mutation: &KvMutation) {
    match (&mutation.op, &mutation.value) {
        (MutationOp::Update, MutationValue::Scalar(value)) => {
            cache.update_scalar(&mutation.key, value.clone(), mutation.logical_commit_time)
        }
        (MutationOp::Update, MutationValue::Set(elements)) => {
            cache.update_set(&mutation.key, elements.clone(), mutation.logical_commit_time)
        }
        (MutationOp::Delete, MutationValue::Scalar(_)) => {
            cache.delete(&mutation.key, mutation.logical_commit_time)
        }
        (MutationOp::Delete, MutationValue::Set(_)) => {
            cache.delete_set(&mutation.key, mutation.logical_commit_time)
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Spawn the delta watch loop: poll blob storage for unseen `DELTA_` blobs
/// and ingest them in name order.
pub fn spawn_delta_watch_task(
    applier: Arc<DeltaApplier>,
    blob: Arc<dyn BlobStorageClient>,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut names = match blob.list(DELTA_FILE_PREFIX) {
                Ok(names) => names,
                Err(e) => {
                    tracing::warn!("failed to list delta files: {}", e);
                    continue;
                }
            };
            names.sort();
            for name in names {
                if seen.contains(&name) {
                    continue;
                }
                match applier.load_from_blob(blob.clone(), &name).await {
                    Ok(_) => {
                        seen.insert(name);
                    }
                    Err(e) => {
                        tracing::error!(name, "failed to ingest delta file: {}", e);
                    }
                }
            }
        }
    })
}

/// Spawn the tombstone clean-up loop. The cutoff trails the highest
/// observed LCT by `retention_lcts` so late-arriving stale mutations keep
/// losing against tombstones inside the retention window.
pub fn spawn_tombstone_gc_task(
    cache: Arc<KeyValueCache>,
    applier: Arc<DeltaApplier>,
    retention_lcts: i64,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cutoff = applier.max_lct_seen() - retention_lcts;
            if cutoff > 0 {
                cache.remove_deleted_below(cutoff);
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
