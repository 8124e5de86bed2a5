//! Host hooks exposed to sandboxed UDF code.
//!
//! Hooks are registered with the engine and invoked synchronously from its
//! worker threads; each blocks its worker until the lookup reply arrives.
//! Initialization is two-phase: the engine forks worker processes, and the
//! lookup fabric owns threads that would not survive the fork, so hooks are
//! constructed empty and wired up with `finish_init` afterwards. Lookup
//! errors travel in-band on the hook output; a hook never raises into the
//! sandbox.

use prost::Message;
use silo_common::LookupStatus;
use silo_lookup::{Lookup, LookupResponse, SingleLookupResult};
use silo_proto::hooks as pb;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;

/// Output flavor of a getValues hook instance. `getValuesBinary` is a bytes
/// mode instance under its own registration name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutputMode {
    String,
    Bytes,
}

/// What the hook hands back to the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutput {
    String(String),
    Bytes(Vec<u8>),
    /// List-mode output. The status travels alongside the elements, like
    /// the status field on the other flavors: code 0 on success, the
    /// lookup error otherwise.
    List {
        elements: Vec<String>,
        status: LookupStatus,
    },
}

struct HookState {
    lookup: Arc<dyn Lookup>,
    handle: Handle,
}

// ---------------------------------------------------------------------------
// getValues / getValuesBinary
// ---------------------------------------------------------------------------

pub struct GetValuesHook {
    mode: HookOutputMode,
    state: OnceLock<HookState>,
}

impl GetValuesHook {
    pub fn new(mode: HookOutputMode) -> Self {
        Self {
            mode,
            state: OnceLock::new(),
        }
    }

    /// Attach the lookup after the engine has forked. The first call wins.
    pub fn finish_init(&self, lookup: Arc<dyn Lookup>, handle: Handle) {
        if self.state.set(HookState { lookup, handle }).is_err() {
            tracing::warn!("getValues hook is already initialized");
        }
    }

    /// Synchronous entry point called from sandbox worker threads.
    pub fn call(&self, keys: Vec<String>) -> HookOutput {
        let Some(state) = self.state.get() else {
            tracing::error!("getValues hook is not initialized properly: lookup is missing");
            return self.status_output(13, "getValues has not been initialized yet");
        };

        let result = state
            .handle
            .block_on(state.lookup.get_key_values(keys));
        match result {
            Ok(response) => self.response_output(response),
            Err(e) => self.status_output(e.code(), e.message()),
        }
    }

    fn status_output(&self, code: i32, message: &str) -> HookOutput {
        match self.mode {
            HookOutputMode::String => HookOutput::String(
                serde_json::json!({"code": code, "message": message}).to_string(),
            ),
            HookOutputMode::Bytes => {
                let response = pb::BinaryGetValuesResponse {
                    kv_pairs: Default::default(),
                    status: Some(pb::Status {
                        code,
                        message: message.to_string(),
                    }),
                };
                HookOutput::Bytes(response.encode_length_delimited_to_vec())
            }
        }
    }

    fn response_output(&self, response: LookupResponse) -> HookOutput {
        match self.mode {
            HookOutputMode::String => {
                let mut kv_pairs = serde_json::Map::new();
                for (key, result) in response.kv_pairs {
                    let value = match result {
                        SingleLookupResult::Value(v) => serde_json::json!({"value": v}),
                        SingleLookupResult::ValueSet(elements) => {
                            serde_json::json!({"valueSet": {"values": elements}})
                        }
                        SingleLookupResult::Status(status) => serde_json::json!({
                            "status": {"code": status.code, "message": status.message}
                        }),
                    };
                    kv_pairs.insert(key, value);
                }
                HookOutput::String(
                    serde_json::json!({
                        "kvPairs": kv_pairs,
                        "status": {"code": 0, "message": "ok"},
                    })
                    .to_string(),
                )
            }
            HookOutputMode::Bytes => {
                let mut kv_pairs = std::collections::HashMap::new();
                for (key, result) in response.kv_pairs {
                    let value = match result {
                        SingleLookupResult::Value(v) => pb::BinaryValue {
                            data: v.into_bytes(),
                            status: None,
                        },
                        SingleLookupResult::ValueSet(elements) => pb::BinaryValue {
                            data: elements.join(",").into_bytes(),
                            status: None,
                        },
                        SingleLookupResult::Status(status) => pb::BinaryValue {
                            data: Vec::new(),
                            status: Some(pb::Status {
                                code: status.code,
                                message: status.message,
                            }),
                        },
                    };
                    kv_pairs.insert(key, value);
                }
                let response = pb::BinaryGetValuesResponse {
                    kv_pairs,
                    status: Some(pb::Status {
                        code: 0,
                        message: "ok".to_string(),
                    }),
                };
                HookOutput::Bytes(response.encode_length_delimited_to_vec())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// runQuery
// ---------------------------------------------------------------------------

pub struct RunQueryHook {
    state: OnceLock<HookState>,
}

impl Default for RunQueryHook {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueryHook {
    pub fn new() -> Self {
        Self {
            state: OnceLock::new(),
        }
    }

    pub fn finish_init(&self, lookup: Arc<dyn Lookup>, handle: Handle) {
        if self.state.set(HookState { lookup, handle }).is_err() {
            tracing::warn!("runQuery hook is already initialized");
        }
    }

    /// Returns the matching set elements. Lookup errors come back in-band
    /// as the status on an empty list; the hook never raises.
    pub fn call(&self, query: String) -> HookOutput {
        let Some(state) = self.state.get() else {
            tracing::error!("runQuery hook is not initialized properly: lookup is missing");
            return HookOutput::List {
                elements: Vec::new(),
                status: LookupStatus {
                    code: 13,
                    message: "runQuery has not been initialized yet".to_string(),
                },
            };
        };

        match state.handle.block_on(state.lookup.run_query(query)) {
            Ok(result) => HookOutput::List {
                elements: result.elements,
                status: LookupStatus {
                    code: 0,
                    message: "ok".to_string(),
                },
            },
            Err(e) => {
                tracing::error!("runQuery failed: {}", e);
                HookOutput::List {
                    elements: Vec::new(),
                    status: LookupStatus::from(&e),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
