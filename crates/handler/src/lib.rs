//! Request handlers: the v2 partitioned path and the v1 flat path.

pub mod codec;
pub mod v1;
pub mod v2;

pub use codec::{BhttpCodec, LineDelimitedBhttp, OhttpCodec, SealedOhttp};
pub use v1::{V1Adapter, V1Handler, V1Request, V1Response};
pub use v2::V2Handler;

use serde::{Deserialize, Serialize};
use silo_common::LookupStatus;
use silo_udf::UdfArgument;

/// v2 request: shared metadata plus independent partitions, one UDF
/// invocation each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetValuesRequest {
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub partitions: Vec<RequestPartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestPartition {
    pub id: i32,
    pub compression_group_id: i32,
    pub arguments: Vec<UdfArgument>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetValuesResponse {
    /// Populated for single-partition requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_partition: Option<ResponsePartition>,
    /// Populated, in request order, for multi-partition requests.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<ResponsePartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponsePartition {
    pub id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LookupStatus>,
}
