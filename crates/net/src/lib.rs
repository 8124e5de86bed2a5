//! gRPC networking layer for silo.
//!
//! Provides:
//! - `V1Service`: bridges the v1 proto to `V1Handler`
//! - `V2Service`: bridges the v2 proto to `V2Handler` (plain, HTTP-body,
//!   Binary HTTP and Oblivious carriers)
//! - `LookupServiceImpl`: the internal shard-to-shard lookup plane,
//!   including the sealed path
//! - `GrpcRemoteLookupClient`: implements `RemoteLookupClient` over tonic
//!   with a cached channel pool
//! - `build_server`: assembles all services into a tonic `Router`

pub mod client;
pub mod convert;
pub mod server;

pub use client::GrpcRemoteLookupClient;
pub use server::{LookupServiceImpl, V1Service, V2Service};

use silo_handler::{BhttpCodec, OhttpCodec, V1Handler, V2Handler};
use silo_lookup::sealing::KeyFetcherManager;
use silo_lookup::Lookup;
use silo_udf::UdfEngine;
use std::sync::Arc;

/// Build a tonic `Router` with all gRPC services.
pub fn build_server<E: UdfEngine + 'static>(
    v1_handler: Arc<V1Handler<E>>,
    v2_handler: Arc<V2Handler<E>>,
    lookup: Arc<dyn Lookup>,
    key_fetcher: Arc<dyn KeyFetcherManager>,
    bhttp: Arc<dyn BhttpCodec>,
    ohttp: Arc<dyn OhttpCodec>,
) -> tonic::transport::server::Router {
    let v1_svc = V1Service {
        handler: v1_handler,
    };
    let v2_svc = V2Service {
        handler: v2_handler,
        bhttp,
        ohttp,
    };
    let lookup_svc = LookupServiceImpl {
        lookup,
        key_fetcher,
    };

    tonic::transport::Server::builder()
        .add_service(silo_proto::v1::key_value_service_server::KeyValueServiceServer::new(v1_svc))
        .add_service(silo_proto::v2::key_value_service_server::KeyValueServiceServer::new(v2_svc))
        .add_service(silo_proto::lookup::lookup_service_server::LookupServiceServer::new(
            lookup_svc,
        ))
}
