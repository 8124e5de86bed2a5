//! Delta record model.

use serde::{Deserialize, Serialize};

/// Per-file metadata header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeltaFileMetadata {
    /// Shard this file belongs to. `None` means the file applies everywhere.
    pub shard_num: Option<u32>,
    /// Lowest logical commit time carried by any record in the file.
    pub min_logical_commit_time: i64,
    /// Highest logical commit time carried by any record in the file.
    pub max_logical_commit_time: i64,
}

/// A record in a delta file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaRecord {
    KvMutation(KvMutation),
    UdfConfig(UdfConfigRecord),
    ShardMapping(ShardMappingRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    Update,
    Delete,
}

/// The payload of a mutation. The variant also fixes which cache map the
/// mutation addresses; a key is scalar-typed or set-typed for its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationValue {
    Scalar(String),
    Set(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvMutation {
    pub key: String,
    pub op: MutationOp,
    pub value: MutationValue,
    pub logical_commit_time: i64,
}

impl KvMutation {
    pub fn update_scalar(key: impl Into<String>, value: impl Into<String>, lct: i64) -> Self {
        Self {
            key: key.into(),
            op: MutationOp::Update,
            value: MutationValue::Scalar(value.into()),
            logical_commit_time: lct,
        }
    }

    pub fn update_set(key: impl Into<String>, elements: Vec<String>, lct: i64) -> Self {
        Self {
            key: key.into(),
            op: MutationOp::Update,
            value: MutationValue::Set(elements),
            logical_commit_time: lct,
        }
    }

    pub fn delete_scalar(key: impl Into<String>, lct: i64) -> Self {
        Self {
            key: key.into(),
            op: MutationOp::Delete,
            value: MutationValue::Scalar(String::new()),
            logical_commit_time: lct,
        }
    }

    pub fn delete_set(key: impl Into<String>, lct: i64) -> Self {
        Self {
            key: key.into(),
            op: MutationOp::Delete,
            value: MutationValue::Set(Vec::new()),
            logical_commit_time: lct,
        }
    }
}

/// Versioned UDF code object carried in the delta stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdfConfigRecord {
    pub handler_name: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasm: Option<Vec<u8>>,
    pub version: i64,
    pub logical_commit_time: i64,
}

/// Logical→physical shard translation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMappingRecord {
    pub logical_shard: u32,
    pub physical_shard: u32,
}

impl DeltaRecord {
    /// The logical commit time, for records that carry one.
    pub fn logical_commit_time(&self) -> Option<i64> {
        match self {
            DeltaRecord::KvMutation(m) => Some(m.logical_commit_time),
            DeltaRecord::UdfConfig(c) => Some(c.logical_commit_time),
            DeltaRecord::ShardMapping(_) => None,
        }
    }
}
