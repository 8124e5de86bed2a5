//! v1 flat handler: UDF-backed via the v2 adapter, or direct cache reads.

use crate::v2::V2Handler;
use crate::{GetValuesRequest, RequestPartition};
use serde::{Deserialize, Serialize};
use silo_cache::KeyValueCache;
use silo_common::{Error, KeyNamespace, CUSTOM_TAG, QUERY_ARG_DELIMITER};
use silo_udf::{UdfArgument, UdfEngine};
use std::sync::Arc;

/// The flat v1 request: one key list per namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V1Request {
    pub subkey: String,
    pub keys: Vec<String>,
    pub render_urls: Vec<String>,
    pub ad_component_render_urls: Vec<String>,
    pub kv_internal: Vec<String>,
}

impl V1Request {
    fn list_for(&self, namespace: KeyNamespace) -> &[String] {
        match namespace {
            KeyNamespace::Keys => &self.keys,
            KeyNamespace::RenderUrls => &self.render_urls,
            KeyNamespace::AdComponentRenderUrls => &self.ad_component_render_urls,
            KeyNamespace::KvInternal => &self.kv_internal,
        }
    }
}

/// The v1 response: one JSON object per namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V1Response {
    pub keys: serde_json::Map<String, serde_json::Value>,
    pub render_urls: serde_json::Map<String, serde_json::Value>,
    pub ad_component_render_urls: serde_json::Map<String, serde_json::Value>,
    pub kv_internal: serde_json::Map<String, serde_json::Value>,
}

impl V1Response {
    fn field_mut(
        &mut self,
        namespace: KeyNamespace,
    ) -> &mut serde_json::Map<String, serde_json::Value> {
        match namespace {
            KeyNamespace::Keys => &mut self.keys,
            KeyNamespace::RenderUrls => &mut self.render_urls,
            KeyNamespace::AdComponentRenderUrls => &mut self.ad_component_render_urls,
            KeyNamespace::KvInternal => &mut self.kv_internal,
        }
    }
}

/// Store a looked-up value: parsed JSON when the string parses, the raw
/// string otherwise.
fn insert_parse_else_raw(
    target: &mut serde_json::Map<String, serde_json::Value>,
    key: String,
    value: String,
) {
    match serde_json::from_str::<serde_json::Value>(&value) {
        Ok(parsed) => target.insert(key, parsed),
        Err(_) => target.insert(key, serde_json::Value::String(value)),
    };
}

// ---------------------------------------------------------------------------
// UDF output projection
// ---------------------------------------------------------------------------

/// Shape of a v1-compatible UDF return value.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyGroupOutputs {
    pub key_group_outputs: Vec<KeyGroupOutput>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyGroupOutput {
    pub tags: Vec<String>,
    pub key_values: serde_json::Map<String, serde_json::Value>,
}

/// The namespace tag paired with the `"custom"` tag, or `None` for groups
/// that are not v1-compatible.
fn find_namespace(tags: &[String]) -> Option<KeyNamespace> {
    if tags.len() != 2 {
        return None;
    }
    let mut has_custom = false;
    let mut namespace = None;
    for tag in tags {
        if tag == CUSTOM_TAG {
            has_custom = true;
        } else {
            namespace = KeyNamespace::from_tag(tag);
        }
    }
    if has_custom {
        namespace
    } else {
        None
    }
}

fn process_key_group_output(group: KeyGroupOutput, response: &mut V1Response) {
    // Groups without a valid custom/namespace tag pair are ignored.
    let Some(namespace) = find_namespace(&group.tags) else {
        return;
    };
    let target = response.field_mut(namespace);
    for (key, wrapped) in group.key_values {
        // Each entry is `{"value": <json>}`.
        let value = match wrapped {
            serde_json::Value::Object(mut object) => {
                object.remove("value").unwrap_or(serde_json::Value::Null)
            }
            other => other,
        };
        match value {
            serde_json::Value::String(s) => insert_parse_else_raw(target, key, s),
            other => {
                target.insert(key, other);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter (v1 → v2 → v1)
// ---------------------------------------------------------------------------

/// Converts a v1 request into a single-partition v2 request and projects
/// the UDF's `KeyGroupOutputs` back onto the flat response.
pub struct V1Adapter<E: UdfEngine> {
    v2_handler: Arc<V2Handler<E>>,
}

impl<E: UdfEngine> V1Adapter<E> {
    pub fn new(v2_handler: Arc<V2Handler<E>>) -> Self {
        Self { v2_handler }
    }

    fn build_v2_request(request: &V1Request) -> GetValuesRequest {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "hostname".into(),
            serde_json::Value::String(request.subkey.clone()),
        );

        let mut arguments = Vec::new();
        for namespace in KeyNamespace::ALL {
            let list = request.list_for(namespace);
            if list.is_empty() {
                continue;
            }
            arguments.push(UdfArgument {
                tags: vec![CUSTOM_TAG.to_string(), namespace.tag().to_string()],
                data: serde_json::json!(list),
            });
        }

        GetValuesRequest {
            metadata,
            partitions: vec![RequestPartition {
                id: 0,
                compression_group_id: 0,
                arguments,
            }],
        }
    }

    pub async fn call_v2_handler(&self, request: &V1Request) -> Result<V1Response, Error> {
        let v2_request = Self::build_v2_request(request);
        let v2_response = self.v2_handler.get_values(v2_request).await?;

        // A v1 request always maps to one partition, so the output must
        // have single_partition set.
        let partition = v2_response.single_partition.ok_or_else(|| {
            Error::Internal("response does not have single_partition".into())
        })?;
        if let Some(status) = partition.status {
            return Err(Error::Internal(status.message));
        }
        let string_output = partition.string_output.unwrap_or_default();
        let outputs: KeyGroupOutputs = serde_json::from_str(&string_output).map_err(|e| {
            Error::Internal(format!("UDF output is not a KeyGroupOutputs document: {e}"))
        })?;

        let mut response = V1Response::default();
        for group in outputs.key_group_outputs {
            process_key_group_output(group, &mut response);
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// v1 handler (adapter or direct)
// ---------------------------------------------------------------------------

enum V1Mode<E: UdfEngine> {
    /// UDF dispatch through the v2 adapter.
    Udf(V1Adapter<E>),
    /// Direct cache reads, for deployments without UDF dispatch.
    Direct(Arc<KeyValueCache>),
}

pub struct V1Handler<E: UdfEngine> {
    mode: V1Mode<E>,
}

impl<E: UdfEngine> V1Handler<E> {
    pub fn with_udf(adapter: V1Adapter<E>) -> Self {
        Self {
            mode: V1Mode::Udf(adapter),
        }
    }

    pub fn direct(cache: Arc<KeyValueCache>) -> Self {
        Self {
            mode: V1Mode::Direct(cache),
        }
    }

    pub async fn get_values(&self, request: &V1Request) -> Result<V1Response, Error> {
        match &self.mode {
            V1Mode::Udf(adapter) => adapter.call_v2_handler(request).await,
            V1Mode::Direct(cache) => Ok(direct_get_values(cache, request)),
        }
    }
}

/// Split composite elements on the delimiter before lookup.
fn split_composite_keys(list: &[String]) -> Vec<String> {
    let mut keys = Vec::new();
    for element in list {
        for key in element.split(QUERY_ARG_DELIMITER) {
            if !key.is_empty() {
                keys.push(key.to_string());
            }
        }
    }
    keys
}

fn direct_get_values(cache: &KeyValueCache, request: &V1Request) -> V1Response {
    let mut response = V1Response::default();
    let m = silo_metrics::metrics();
    for namespace in KeyNamespace::ALL {
        let list = request.list_for(namespace);
        if list.is_empty() {
            continue;
        }
        let keys = split_composite_keys(list);
        let kv_pairs = cache.get(&keys);
        if kv_pairs.is_empty() {
            m.cache_key_misses.inc();
        } else {
            m.cache_key_hits.inc();
        }
        let target = response.field_mut(namespace);
        for (key, value) in kv_pairs {
            insert_parse_else_raw(target, key, value);
        }
    }
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use silo_udf::{CodeConfig, CodeObject, Invocation, UdfClient, UdfClientConfig};
    use tokio::sync::oneshot;

    // -----------------------------------------------------------------------
    // Direct mode
    // -----------------------------------------------------------------------

    fn cache_with_data() -> Arc<KeyValueCache> {
        let cache = Arc::new(KeyValueCache::new());
        cache.update_scalar("key1", "value1".into(), 1);
        cache.update_scalar("key2", r#"{"nested": 42}"#.into(), 1);
        cache.update_scalar("url1", "https://example.com/ad".into(), 1);
        cache
    }

    #[tokio::test]
    async fn test_direct_mode_fills_matching_fields() {
        let handler: V1Handler<silo_udf::NoopUdfEngine> = V1Handler::direct(cache_with_data());
        let request = V1Request {
            subkey: "example.com".into(),
            keys: vec!["key1".into()],
            render_urls: vec!["url1".into()],
            ..Default::default()
        };
        let response = handler.get_values(&request).await.unwrap();

        assert_eq!(response.keys["key1"], "value1");
        assert_eq!(response.render_urls["url1"], "https://example.com/ad");
        assert!(response.kv_internal.is_empty());
    }

    #[tokio::test]
    async fn test_direct_mode_parses_json_values() {
        let handler: V1Handler<silo_udf::NoopUdfEngine> = V1Handler::direct(cache_with_data());
        let request = V1Request {
            keys: vec!["key2".into()],
            ..Default::default()
        };
        let response = handler.get_values(&request).await.unwrap();
        assert_eq!(response.keys["key2"]["nested"], 42);
    }

    #[tokio::test]
    async fn test_direct_mode_splits_composite_keys() {
        let handler: V1Handler<silo_udf::NoopUdfEngine> = V1Handler::direct(cache_with_data());
        let request = V1Request {
            keys: vec!["key1,key2".into()],
            ..Default::default()
        };
        let response = handler.get_values(&request).await.unwrap();
        assert!(response.keys.contains_key("key1"));
        assert!(response.keys.contains_key("key2"));
    }

    // -----------------------------------------------------------------------
    // Adapter mode
    // -----------------------------------------------------------------------

    /// Identity-style engine: answers each tagged key-list argument with a
    /// keyGroupOutput mapping every key to the canned store below.
    struct PassthroughEngine {
        store: std::collections::HashMap<String, String>,
    }

    impl UdfEngine for PassthroughEngine {
        fn load(&self, _code: CodeObject, done: oneshot::Sender<Result<(), Error>>) {
            let _ = done.send(Ok(()));
        }

        fn execute(&self, invocation: Invocation, done: oneshot::Sender<Result<String, Error>>) {
            let mut groups = Vec::new();
            for arg_json in invocation.args.iter().skip(1) {
                let argument: UdfArgument = serde_json::from_str(arg_json).unwrap();
                let mut key_values = serde_json::Map::new();
                if let serde_json::Value::Array(keys) = &argument.data {
                    for key in keys {
                        if let serde_json::Value::String(key) = key {
                            if let Some(value) = self.store.get(key) {
                                key_values.insert(
                                    key.clone(),
                                    serde_json::json!({"value": value}),
                                );
                            }
                        }
                    }
                }
                groups.push(serde_json::json!({
                    "tags": argument.tags,
                    "keyValues": key_values,
                }));
            }
            let output = serde_json::json!({"keyGroupOutputs": groups}).to_string();
            let _ = done.send(Ok(output));
        }
    }

    async fn adapter_with_store(
        store: std::collections::HashMap<String, String>,
    ) -> V1Adapter<PassthroughEngine> {
        let client = Arc::new(UdfClient::new(
            Arc::new(PassthroughEngine { store }),
            UdfClientConfig::default(),
        ));
        client
            .set_code_object(CodeConfig {
                udf_handler_name: "HandleRequest".into(),
                js: String::new(),
                wasm: None,
                version: 1,
                logical_commit_time: 1,
            })
            .await
            .unwrap();
        V1Adapter::new(Arc::new(V2Handler::new(client)))
    }

    #[test]
    fn test_build_v2_request_shape() {
        let request = V1Request {
            subkey: "example.com".into(),
            keys: vec!["k1".into(), "k2".into()],
            kv_internal: vec!["i1".into()],
            ..Default::default()
        };
        let v2 = V1Adapter::<PassthroughEngine>::build_v2_request(&request);

        assert_eq!(v2.metadata["hostname"], "example.com");
        assert_eq!(v2.partitions.len(), 1);
        let arguments = &v2.partitions[0].arguments;
        assert_eq!(arguments.len(), 2, "one argument per non-empty list");
        assert_eq!(arguments[0].tags, vec!["custom", "keys"]);
        assert_eq!(arguments[0].data, serde_json::json!(["k1", "k2"]));
        assert_eq!(arguments[1].tags, vec!["custom", "kvInternal"]);
    }

    #[tokio::test]
    async fn test_adapter_routes_namespaces() {
        let store = std::collections::HashMap::from([
            ("key1".to_string(), "value1".to_string()),
            ("url1".to_string(), "https://example.com/ad".to_string()),
        ]);
        let adapter = adapter_with_store(store).await;

        let request = V1Request {
            subkey: "example.com".into(),
            keys: vec!["key1".into()],
            render_urls: vec!["url1".into()],
            ..Default::default()
        };
        let response = adapter.call_v2_handler(&request).await.unwrap();

        assert_eq!(response.keys["key1"], "value1");
        assert_eq!(response.render_urls["url1"], "https://example.com/ad");
        assert!(response.ad_component_render_urls.is_empty());
    }

    #[tokio::test]
    async fn test_adapter_parses_json_values() {
        let store = std::collections::HashMap::from([(
            "key1".to_string(),
            r#"{"bid": 1.5}"#.to_string(),
        )]);
        let adapter = adapter_with_store(store).await;

        let request = V1Request {
            keys: vec!["key1".into()],
            ..Default::default()
        };
        let response = adapter.call_v2_handler(&request).await.unwrap();
        assert_eq!(response.keys["key1"]["bid"], 1.5);
    }

    #[tokio::test]
    async fn test_v1_direct_and_adapter_agree_on_passthrough() {
        // P4: with a passthrough UDF, direct mode and the adapter produce
        // equivalent responses.
        let store = std::collections::HashMap::from([
            ("key1".to_string(), "value1".to_string()),
            ("key2".to_string(), r#"{"nested": 42}"#.to_string()),
        ]);
        let cache = Arc::new(KeyValueCache::new());
        for (key, value) in &store {
            cache.update_scalar(key, value.clone(), 1);
        }

        let request = V1Request {
            subkey: "example.com".into(),
            keys: vec!["key1".into(), "key2".into()],
            ..Default::default()
        };

        let direct: V1Handler<silo_udf::NoopUdfEngine> = V1Handler::direct(cache);
        let direct_response = direct.get_values(&request).await.unwrap();

        let adapter = adapter_with_store(store).await;
        let adapter_response = adapter.call_v2_handler(&request).await.unwrap();

        assert_eq!(direct_response, adapter_response);
    }

    #[test]
    fn test_group_without_custom_tag_is_ignored() {
        let mut response = V1Response::default();
        process_key_group_output(
            KeyGroupOutput {
                tags: vec!["structured".into(), "groupNames".into()],
                key_values: serde_json::Map::from_iter([(
                    "g".to_string(),
                    serde_json::json!({"value": "x"}),
                )]),
            },
            &mut response,
        );
        assert_eq!(response, V1Response::default());
    }

    #[test]
    fn test_find_namespace_requires_exactly_two_tags() {
        assert_eq!(
            find_namespace(&["custom".into(), "keys".into()]),
            Some(KeyNamespace::Keys)
        );
        assert_eq!(
            find_namespace(&["keys".into(), "custom".into()]),
            Some(KeyNamespace::Keys)
        );
        assert_eq!(find_namespace(&["custom".into()]), None);
        assert_eq!(
            find_namespace(&["custom".into(), "keys".into(), "extra".into()]),
            None
        );
        assert_eq!(find_namespace(&["custom".into(), "unknown".into()]), None);
    }

    #[tokio::test]
    async fn test_udf_failure_surfaces_as_error() {
        struct FailingEngine;
        impl UdfEngine for FailingEngine {
            fn load(&self, _code: CodeObject, done: oneshot::Sender<Result<(), Error>>) {
                let _ = done.send(Ok(()));
            }
            fn execute(
                &self,
                _invocation: Invocation,
                done: oneshot::Sender<Result<String, Error>>,
            ) {
                let _ = done.send(Err(Error::Internal("UDF execution error".into())));
            }
        }

        let client = Arc::new(UdfClient::new(
            Arc::new(FailingEngine),
            UdfClientConfig::default(),
        ));
        client
            .set_code_object(CodeConfig {
                udf_handler_name: "HandleRequest".into(),
                js: String::new(),
                wasm: None,
                version: 1,
                logical_commit_time: 1,
            })
            .await
            .unwrap();
        let adapter = V1Adapter::new(Arc::new(V2Handler::new(client)));

        let request = V1Request {
            keys: vec!["key1".into()],
            ..Default::default()
        };
        let err = adapter.call_v2_handler(&request).await.unwrap_err();
        assert_eq!(err.to_string(), "UDF execution error");
    }
}
