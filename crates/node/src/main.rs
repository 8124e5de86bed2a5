//! silo-node: entry point for a serving node.
//!
//! Loads config, builds the cache and delta ingestion pipeline, wires the
//! lookup fabric (local or sharded), the UDF client and the request
//! handlers, then serves all gRPC services on the configured listen
//! address.

use silo_cache::KeyValueCache;
use silo_common::ShardingFunction;
use silo_data::{
    BlobStorageClient, ConcurrentReadOptions, DeltaApplier, FileBlobClient, ShardMappingSink,
    UdfCodeSink, UdfConfigRecord,
};
use silo_handler::{LineDelimitedBhttp, SealedOhttp, V1Adapter, V1Handler, V2Handler};
use silo_lookup::sealing::LocalKeyFetcher;
use silo_lookup::{
    ClusterMappingsManager, LocalLookup, Lookup, ShardManager, ShardMap, ShardedLookup,
    StaticInstanceClient,
};
use silo_net::GrpcRemoteLookupClient;
use silo_udf::{CodeConfig, NoopUdfEngine, UdfClient, UdfClientConfig};
use std::sync::Arc;
use tokio::time::Duration;

/// Routes UDF code objects from the delta stream into the client.
struct UdfClientSink {
    client: Arc<UdfClient<NoopUdfEngine>>,
}

#[async_trait::async_trait]
impl UdfCodeSink for UdfClientSink {
    async fn apply_udf_config(&self, record: UdfConfigRecord) -> Result<(), silo_common::Error> {
        self.client
            .set_code_object(CodeConfig {
                udf_handler_name: record.handler_name,
                js: record.source,
                wasm: record.wasm,
                version: record.version,
                logical_commit_time: record.logical_commit_time,
            })
            .await
    }
}

/// Routes shard-mapping records into the shard map snapshot.
struct ShardMapSink {
    shard_map: Arc<ShardMap>,
}

impl ShardMappingSink for ShardMapSink {
    fn apply_shard_mapping(&self, logical_shard: u32, physical_shard: u32) {
        self.shard_map.set(logical_shard, physical_shard);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    silo_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config =
        silo_config::load_from_file(std::path::Path::new(&config_path)).unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            silo_config::load_from_str("listen: \"127.0.0.1:50051\"\n")
                .expect("hardcoded default config must parse")
        });

    let num_shards = config.sharding.num_shards;
    let shard_num = config.sharding.shard_num;
    tracing::info!(
        environment = %config.environment,
        num_shards,
        shard_num,
        "starting silo node on {}",
        config.listen
    );

    // Cache and delta ingestion
    let cache = Arc::new(KeyValueCache::new());
    let blob: Arc<dyn BlobStorageClient> = Arc::new(FileBlobClient::new(&config.data.data_dir)?);

    // UDF client over the configured engine. This build carries the noop
    // engine; deployments with a sandbox wire their own implementation.
    let udf_client = Arc::new(UdfClient::new(
        Arc::new(NoopUdfEngine),
        UdfClientConfig {
            udf_timeout: Duration::from_millis(config.udf.timeout_ms),
            load_timeout: Duration::from_millis(config.udf.load_timeout_ms),
        },
    ));

    let shard_map = Arc::new(ShardMap::identity(num_shards));
    let applier = Arc::new(
        DeltaApplier::new(
            cache.clone(),
            shard_num,
            ConcurrentReadOptions {
                num_workers: config.data.num_worker_threads,
                min_shard_size_bytes: config.data.min_shard_size_bytes,
                ..Default::default()
            },
        )
        .with_udf_sink(Arc::new(UdfClientSink {
            client: udf_client.clone(),
        }))
        .with_shard_mapping_sink(Arc::new(ShardMapSink {
            shard_map: shard_map.clone(),
        })),
    );

    let _delta_watch = silo_data::loader::spawn_delta_watch_task(
        applier.clone(),
        blob.clone(),
        Duration::from_secs(config.data.watch_interval_secs),
    );
    let _tombstone_gc = silo_data::loader::spawn_tombstone_gc_task(
        cache.clone(),
        applier.clone(),
        config.data.tombstone_retention_lcts,
        Duration::from_secs(config.data.cleanup_interval_secs),
    );

    // Shard-to-shard payload sealing, keyed per environment.
    let key_fetcher = Arc::new(LocalKeyFetcher::new(
        "key-1",
        &format!("{}-internal-lookup", config.environment),
    ));

    // Lookup fabric: local only for a single-shard fleet, sharded otherwise.
    let local_lookup = Arc::new(LocalLookup::new(cache.clone()));
    let lookup: Arc<dyn Lookup> = if num_shards > 1 {
        if config.sharding.cluster.is_empty() {
            return Err("sharding.cluster must list replica sets for a multi-shard fleet".into());
        }
        let instance_client = Arc::new(StaticInstanceClient::new(config.sharding.cluster.clone()));
        let mappings_manager = Arc::new(ClusterMappingsManager::new(
            instance_client,
            num_shards,
            Duration::from_secs(config.sharding.mapping_refresh_secs),
        ));
        let shard_manager = Arc::new(ShardManager::create(
            mappings_manager.initial_cluster_mappings().await,
        )?);
        let _mapping_refresh = mappings_manager.spawn_refresh_task(shard_manager.clone());

        let remote = Arc::new(GrpcRemoteLookupClient::new(
            key_fetcher.clone(),
            Duration::from_millis(config.sharding.remote_timeout_ms),
        ));
        Arc::new(ShardedLookup::new(
            local_lookup,
            remote,
            shard_manager,
            shard_map,
            ShardingFunction::default(),
            num_shards,
            shard_num,
        ))
    } else {
        local_lookup
    };

    // Request handlers
    let v2_handler = Arc::new(V2Handler::new(udf_client.clone()));
    let v1_handler = if config.udf.enabled {
        Arc::new(V1Handler::with_udf(V1Adapter::new(v2_handler.clone())))
    } else {
        Arc::new(V1Handler::direct(cache.clone()))
    };

    // Build gRPC server
    let router = silo_net::build_server(
        v1_handler,
        v2_handler,
        lookup,
        key_fetcher.clone(),
        Arc::new(LineDelimitedBhttp),
        Arc::new(SealedOhttp::new(key_fetcher)),
    );

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr: std::net::SocketAddr = format!("0.0.0.0:{}", metrics_port)
            .parse()
            .expect("valid metrics address");
        tokio::spawn(async move {
            if let Err(e) = silo_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // Serve with graceful shutdown on Ctrl+C
    tracing::info!("serving gRPC on {}", config.listen);
    tokio::select! {
        result = router.serve(config.listen) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
