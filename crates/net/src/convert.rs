//! Conversions between proto types and the core domain types.

use prost_types::value::Kind;
use silo_common::LookupStatus;
use silo_handler::{GetValuesRequest, GetValuesResponse, ResponsePartition, V1Request, V1Response};
use silo_lookup::{LookupResponse, SingleLookupResult};
use silo_proto::{lookup as pb_lookup, v1 as pb_v1, v2 as pb_v2};
use silo_udf::UdfArgument;

// ---------------------------------------------------------------------------
// JSON <-> google.protobuf.Value
// ---------------------------------------------------------------------------

pub fn json_to_proto_value(value: &serde_json::Value) -> prost_types::Value {
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.iter().map(json_to_proto_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(json_map_to_proto_struct(map)),
    };
    prost_types::Value { kind: Some(kind) }
}

pub fn proto_value_to_json(value: &prost_types::Value) -> serde_json::Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(proto_value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => serde_json::Value::Object(proto_struct_to_json_map(s)),
    }
}

pub fn json_map_to_proto_struct(
    map: &serde_json::Map<String, serde_json::Value>,
) -> prost_types::Struct {
    prost_types::Struct {
        fields: map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
            .collect(),
    }
}

pub fn proto_struct_to_json_map(
    s: &prost_types::Struct,
) -> serde_json::Map<String, serde_json::Value> {
    s.fields
        .iter()
        .map(|(k, v)| (k.clone(), proto_value_to_json(v)))
        .collect()
}

// ---------------------------------------------------------------------------
// v1
// ---------------------------------------------------------------------------

pub fn v1_request_from_proto(proto: pb_v1::GetValuesRequest) -> V1Request {
    V1Request {
        subkey: proto.subkey,
        keys: proto.keys,
        render_urls: proto.render_urls,
        ad_component_render_urls: proto.ad_component_render_urls,
        kv_internal: proto.kv_internal,
    }
}

fn optional_struct(
    map: serde_json::Map<String, serde_json::Value>,
) -> Option<prost_types::Struct> {
    if map.is_empty() {
        None
    } else {
        Some(json_map_to_proto_struct(&map))
    }
}

pub fn v1_response_to_proto(response: V1Response) -> pb_v1::GetValuesResponse {
    pb_v1::GetValuesResponse {
        keys: optional_struct(response.keys),
        render_urls: optional_struct(response.render_urls),
        ad_component_render_urls: optional_struct(response.ad_component_render_urls),
        kv_internal: optional_struct(response.kv_internal),
    }
}

// ---------------------------------------------------------------------------
// v2
// ---------------------------------------------------------------------------

fn udf_argument_from_proto(proto: pb_v2::UdfArgument) -> UdfArgument {
    let tags = proto
        .tags
        .map(|list| {
            list.values
                .iter()
                .filter_map(|v| match &v.kind {
                    Some(Kind::StringValue(s)) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let data = proto
        .data
        .as_ref()
        .map(proto_value_to_json)
        .unwrap_or(serde_json::Value::Null);
    UdfArgument { tags, data }
}

pub fn v2_request_from_proto(proto: pb_v2::GetValuesRequest) -> GetValuesRequest {
    GetValuesRequest {
        metadata: proto
            .metadata
            .as_ref()
            .map(proto_struct_to_json_map)
            .unwrap_or_default(),
        partitions: proto
            .partitions
            .into_iter()
            .map(|p| silo_handler::RequestPartition {
                id: p.id,
                compression_group_id: p.compression_group_id,
                arguments: p.arguments.into_iter().map(udf_argument_from_proto).collect(),
            })
            .collect(),
    }
}

fn response_partition_to_proto(partition: ResponsePartition) -> pb_v2::ResponsePartition {
    let output = match (partition.string_output, partition.status) {
        (Some(output), _) => Some(pb_v2::response_partition::Output::StringOutput(output)),
        (None, Some(status)) => Some(pb_v2::response_partition::Output::Status(pb_v2::Status {
            code: status.code,
            message: status.message,
        })),
        (None, None) => None,
    };
    pb_v2::ResponsePartition {
        id: partition.id,
        output,
    }
}

pub fn v2_response_to_proto(response: GetValuesResponse) -> pb_v2::GetValuesResponse {
    pb_v2::GetValuesResponse {
        single_partition: response.single_partition.map(response_partition_to_proto),
        partitions: response
            .partitions
            .into_iter()
            .map(response_partition_to_proto)
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Internal lookup
// ---------------------------------------------------------------------------

pub fn lookup_response_to_proto(response: LookupResponse) -> pb_lookup::LookupResponse {
    let kv_pairs = response
        .kv_pairs
        .into_iter()
        .map(|(key, result)| {
            let inner = match result {
                SingleLookupResult::Value(v) => {
                    pb_lookup::single_lookup_result::SingleLookupResult::Value(v)
                }
                SingleLookupResult::ValueSet(values) => {
                    pb_lookup::single_lookup_result::SingleLookupResult::ValueSet(
                        pb_lookup::ValueSet { values },
                    )
                }
                SingleLookupResult::Status(status) => {
                    pb_lookup::single_lookup_result::SingleLookupResult::Status(
                        pb_lookup::LookupStatus {
                            code: status.code,
                            message: status.message,
                        },
                    )
                }
            };
            (
                key,
                pb_lookup::SingleLookupResult {
                    single_lookup_result: Some(inner),
                },
            )
        })
        .collect();
    pb_lookup::LookupResponse { kv_pairs }
}

pub fn lookup_response_from_proto(proto: pb_lookup::LookupResponse) -> LookupResponse {
    let kv_pairs = proto
        .kv_pairs
        .into_iter()
        .filter_map(|(key, result)| {
            let inner = match result.single_lookup_result? {
                pb_lookup::single_lookup_result::SingleLookupResult::Value(v) => {
                    SingleLookupResult::Value(v)
                }
                pb_lookup::single_lookup_result::SingleLookupResult::ValueSet(set) => {
                    SingleLookupResult::ValueSet(set.values)
                }
                pb_lookup::single_lookup_result::SingleLookupResult::Status(status) => {
                    SingleLookupResult::Status(LookupStatus {
                        code: status.code,
                        message: status.message,
                    })
                }
            };
            Some((key, inner))
        })
        .collect();
    LookupResponse { kv_pairs }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
