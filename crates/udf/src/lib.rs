//! UDF execution client and host hooks.
//!
//! The sandbox engine itself is an external collaborator behind the
//! [`UdfEngine`] trait; this crate owns the versioned code-object state
//! machine, invocation marshalling, timeouts, and the host hooks that let
//! sandboxed code re-enter the lookup fabric.

pub mod client;
pub mod engine;
pub mod hooks;

pub use client::{UdfClient, UdfClientConfig};
pub use engine::{CodeObject, Invocation, NoopUdfEngine, UdfEngine};
pub use hooks::{GetValuesHook, HookOutput, HookOutputMode, RunQueryHook};

use serde::{Deserialize, Serialize};

/// One positional UDF argument: optional tags plus a JSON value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UdfArgument {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A versioned UDF code object, as carried by delta files.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodeConfig {
    pub udf_handler_name: String,
    pub js: String,
    pub wasm: Option<Vec<u8>>,
    pub version: i64,
    pub logical_commit_time: i64,
}
