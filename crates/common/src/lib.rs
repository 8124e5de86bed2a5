//! silo-common: shared types for the silo serving runtime.
//!
//! Provides the caller-facing [`Error`] kinds, the per-key [`LookupStatus`],
//! the consistent [`ShardingFunction`] that assigns keys to logical shards,
//! and the v1 namespace tags.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error kinds surfaced to callers.
///
/// Lookup sub-failures are per-key and travel in-band as a [`LookupStatus`];
/// only transport failures, timeouts and configuration errors become one of
/// these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed request: unknown encoding, missing partitions, bad tag pair.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// External dependency unreachable or transiently failing.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Invariant violation, UDF timeout, corruption past recovery.
    #[error("{0}")]
    Internal(String),

    /// Requested file absent. Key lookups return empty maps, not this.
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Canonical status code for the kind (gRPC numbering).
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 3,
            Error::NotFound(_) => 5,
            Error::Internal(_) => 13,
            Error::Unavailable(_) => 14,
        }
    }

    /// The error message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::InvalidArgument(m)
            | Error::Unavailable(m)
            | Error::Internal(m)
            | Error::NotFound(m) => m,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArgument(m) => tonic::Status::invalid_argument(m),
            Error::Unavailable(m) => tonic::Status::unavailable(m),
            Error::Internal(m) => tonic::Status::internal(m),
            Error::NotFound(m) => tonic::Status::not_found(m),
        }
    }
}

/// Per-key status carried inside a lookup response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupStatus {
    pub code: i32,
    pub message: String,
}

impl LookupStatus {
    pub fn not_found(key: &str) -> Self {
        Self {
            code: 5,
            message: format!("Key not found: {key}"),
        }
    }
}

impl From<&Error> for LookupStatus {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.message().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sharding
// ---------------------------------------------------------------------------

/// Assigns keys to logical shards: `SHA-256(seed || key) mod num_shards`.
///
/// Every node in a fleet must be constructed with the same seed, otherwise
/// cross-shard routing disagrees. The default seed is empty.
#[derive(Debug, Clone, Default)]
pub struct ShardingFunction {
    seed: String,
}

impl ShardingFunction {
    pub fn new(seed: impl Into<String>) -> Self {
        Self { seed: seed.into() }
    }

    /// Logical shard for `key` in a fleet of `num_shards`.
    pub fn shard_for_key(&self, key: &str, num_shards: u32) -> u32 {
        assert!(num_shards > 0, "num_shards must be > 0");
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % u64::from(num_shards)) as u32
    }
}

// ---------------------------------------------------------------------------
// v1 namespaces
// ---------------------------------------------------------------------------

/// Tag that must accompany exactly one namespace tag on v1-compatible
/// arguments.
pub const CUSTOM_TAG: &str = "custom";

/// Delimiter on which composite v1 key list elements are split.
pub const QUERY_ARG_DELIMITER: char = ',';

/// The four v1 key namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyNamespace {
    Keys,
    RenderUrls,
    AdComponentRenderUrls,
    KvInternal,
}

impl KeyNamespace {
    pub const ALL: [KeyNamespace; 4] = [
        KeyNamespace::Keys,
        KeyNamespace::RenderUrls,
        KeyNamespace::AdComponentRenderUrls,
        KeyNamespace::KvInternal,
    ];

    /// The wire tag for this namespace.
    pub fn tag(&self) -> &'static str {
        match self {
            KeyNamespace::Keys => "keys",
            KeyNamespace::RenderUrls => "renderUrls",
            KeyNamespace::AdComponentRenderUrls => "adComponentRenderUrls",
            KeyNamespace::KvInternal => "kvInternal",
        }
    }

    /// Parse a wire tag back into a namespace.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.tag() == tag)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidArgument("x".into()).code(), 3);
        assert_eq!(Error::NotFound("x".into()).code(), 5);
        assert_eq!(Error::Internal("x".into()).code(), 13);
        assert_eq!(Error::Unavailable("x".into()).code(), 14);
    }

    #[test]
    fn test_internal_error_message_is_verbatim() {
        // Timeout messages are matched by callers; the Display form must not
        // add a prefix.
        let err = Error::Internal("Timed out waiting for UDF result.".into());
        assert_eq!(err.to_string(), "Timed out waiting for UDF result.");
    }

    #[test]
    fn test_status_from_error() {
        let err = Error::Unavailable("shard 2 unreachable".into());
        let status = LookupStatus::from(&err);
        assert_eq!(status.code, 14);
        assert_eq!(status.message, "shard 2 unreachable");
    }

    #[test]
    fn test_shard_function_deterministic() {
        let f = ShardingFunction::default();
        for key in ["a", "b", "key-with-long-name", ""] {
            assert_eq!(f.shard_for_key(key, 7), f.shard_for_key(key, 7));
        }
    }

    #[test]
    fn test_shard_function_in_range() {
        let f = ShardingFunction::default();
        for i in 0..1000 {
            let shard = f.shard_for_key(&format!("key{i}"), 5);
            assert!(shard < 5);
        }
    }

    #[test]
    fn test_shard_function_spreads_keys() {
        let f = ShardingFunction::default();
        let shards: HashSet<u32> = (0..1000)
            .map(|i| f.shard_for_key(&format!("key{i}"), 8))
            .collect();
        assert_eq!(shards.len(), 8, "1000 keys should hit all 8 shards");
    }

    #[test]
    fn test_shard_function_seed_changes_placement() {
        let a = ShardingFunction::new("a");
        let b = ShardingFunction::new("b");
        let moved = (0..100)
            .filter(|i| {
                let key = format!("key{i}");
                a.shard_for_key(&key, 16) != b.shard_for_key(&key, 16)
            })
            .count();
        assert!(moved > 0, "different seeds should move at least some keys");
    }

    #[test]
    fn test_single_shard_maps_everything_to_zero() {
        let f = ShardingFunction::default();
        for i in 0..50 {
            assert_eq!(f.shard_for_key(&format!("key{i}"), 1), 0);
        }
    }

    #[test]
    fn test_namespace_tags_round_trip() {
        for ns in KeyNamespace::ALL {
            assert_eq!(KeyNamespace::from_tag(ns.tag()), Some(ns));
        }
        assert_eq!(KeyNamespace::from_tag("structured"), None);
        assert_eq!(KeyNamespace::from_tag("custom"), None);
    }
}
