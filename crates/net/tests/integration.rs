//! End-to-end tests over a real tonic server on a loopback port.

use silo_cache::KeyValueCache;
use silo_handler::{LineDelimitedBhttp, SealedOhttp, V1Handler, V2Handler};
use silo_lookup::sealing::LocalKeyFetcher;
use silo_lookup::{LocalLookup, RemoteLookupClient, SingleLookupResult};
use silo_net::{build_server, GrpcRemoteLookupClient};
use silo_proto::v1 as pb_v1;
use silo_proto::v2 as pb_v2;
use silo_udf::{NoopUdfEngine, UdfClient, UdfClientConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

const KEY_SEED: &str = "integration-seed";

async fn start_server() -> String {
    let cache = Arc::new(KeyValueCache::new());
    cache.update_scalar("key1", "value1".into(), 1);
    cache.update_scalar("key2", r#"{"bid": 2.5}"#.into(), 1);
    cache.update_set("setA", vec!["1".into(), "2".into()], 1);
    cache.update_set("setB", vec!["2".into(), "3".into()], 1);

    let lookup = Arc::new(LocalLookup::new(cache.clone()));
    let key_fetcher = Arc::new(LocalKeyFetcher::new("key-1", KEY_SEED));

    let udf_client = Arc::new(UdfClient::new(
        Arc::new(NoopUdfEngine),
        UdfClientConfig::default(),
    ));
    let v2_handler = Arc::new(V2Handler::new(udf_client));
    let v1_handler: Arc<V1Handler<NoopUdfEngine>> = Arc::new(V1Handler::direct(cache));

    let router = build_server(
        v1_handler,
        v2_handler,
        lookup,
        key_fetcher.clone(),
        Arc::new(LineDelimitedBhttp),
        Arc::new(SealedOhttp::new(key_fetcher)),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        router
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    address
}

#[tokio::test]
async fn test_v1_get_values_direct() {
    let address = start_server().await;
    let mut client = pb_v1::key_value_service_client::KeyValueServiceClient::connect(format!(
        "http://{address}"
    ))
    .await
    .unwrap();

    let response = client
        .get_values(pb_v1::GetValuesRequest {
            subkey: "example.com".into(),
            keys: vec!["key1,key2".into()],
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();

    let keys = response.keys.expect("keys struct set");
    match keys.fields["key1"].kind.as_ref().unwrap() {
        prost_types::value::Kind::StringValue(s) => assert_eq!(s, "value1"),
        other => panic!("expected string value, got {other:?}"),
    }
    // JSON values come back structured.
    match keys.fields["key2"].kind.as_ref().unwrap() {
        prost_types::value::Kind::StructValue(s) => {
            assert!(s.fields.contains_key("bid"));
        }
        other => panic!("expected struct value, got {other:?}"),
    }
    assert!(response.render_urls.is_none());
}

#[tokio::test]
async fn test_sealed_internal_lookup() {
    let address = start_server().await;
    let key_fetcher = Arc::new(LocalKeyFetcher::new("key-1", KEY_SEED));
    let client =
        GrpcRemoteLookupClient::new(key_fetcher, std::time::Duration::from_secs(5));

    let response = client
        .get_values(
            &address,
            vec!["key1".into(), "missing".into()],
            false,
            3,
        )
        .await
        .unwrap();

    assert_eq!(
        response.kv_pairs["key1"],
        SingleLookupResult::Value("value1".into())
    );
    assert!(matches!(
        response.kv_pairs["missing"],
        SingleLookupResult::Status(_)
    ));
    // Padding keys never come back.
    assert_eq!(response.kv_pairs.len(), 2);
}

#[tokio::test]
async fn test_sealed_internal_set_lookup_and_query() {
    let address = start_server().await;
    let key_fetcher = Arc::new(LocalKeyFetcher::new("key-1", KEY_SEED));
    let client =
        GrpcRemoteLookupClient::new(key_fetcher, std::time::Duration::from_secs(5));

    let response = client
        .get_values(&address, vec!["setA".into()], true, 0)
        .await
        .unwrap();
    assert_eq!(
        response.kv_pairs["setA"],
        SingleLookupResult::ValueSet(vec!["1".into(), "2".into()])
    );

    let result = client
        .run_query(&address, "setA & setB".into())
        .await
        .unwrap();
    assert_eq!(result.elements, vec!["2".to_string()]);
}

#[tokio::test]
async fn test_wrong_fleet_seed_cannot_lookup() {
    let address = start_server().await;
    let key_fetcher = Arc::new(LocalKeyFetcher::new("key-1", "some-other-seed"));
    let client =
        GrpcRemoteLookupClient::new(key_fetcher, std::time::Duration::from_secs(5));

    let err = client
        .get_values(&address, vec!["key1".into()], false, 0)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 14, "server rejects undecryptable payloads");
}

#[tokio::test]
async fn test_v2_http_body_carrier_without_udf() {
    let address = start_server().await;
    let mut client = pb_v2::key_value_service_client::KeyValueServiceClient::connect(format!(
        "http://{address}"
    ))
    .await
    .unwrap();

    let body = br#"{"partitions": [{"id": 0, "arguments": []}]}"#.to_vec();
    let response = client
        .get_values_http(pb_v2::HttpBodyRequest { raw_body: body })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.content_type, "application/json");
    let parsed: serde_json::Value = serde_json::from_slice(&response.data).unwrap();
    // The noop engine fails executions; the partition carries the status.
    assert_eq!(parsed["singlePartition"]["status"]["code"], 13);
}

#[tokio::test]
async fn test_v2_missing_partitions_is_internal() {
    let address = start_server().await;
    let mut client = pb_v2::key_value_service_client::KeyValueServiceClient::connect(format!(
        "http://{address}"
    ))
    .await
    .unwrap();

    let status = client
        .get_values_http(pb_v2::HttpBodyRequest {
            raw_body: br#"{"metadata": {"hostname": "example.com"}}"#.to_vec(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Internal);
    assert!(status
        .message()
        .contains("response does not have single_partition"));
}

#[tokio::test]
async fn test_v2_binary_http_envelope() {
    let address = start_server().await;
    let mut client = pb_v2::key_value_service_client::KeyValueServiceClient::connect(format!(
        "http://{address}"
    ))
    .await
    .unwrap();

    // Malformed inner body: the failure must surface as a 500 envelope,
    // not an RPC error.
    let mut body = b"POST / HTTP/1.1\r\n\r\n".to_vec();
    body.extend_from_slice(b"{}");
    let response = client
        .binary_http_get_values(pb_v2::HttpBodyRequest { raw_body: body })
        .await
        .unwrap()
        .into_inner();
    assert!(response.data.starts_with(b"500\r\n\r\n"));
}
