//! Sandbox engine seam.
//!
//! The real engine runs JavaScript/WebAssembly in a forked worker pool; the
//! serving core only depends on this callback contract. `load` and
//! `execute` must not block: work is queued and the oneshot acknowledgement
//! is the only completion path.

use silo_common::Error;
use tokio::sync::oneshot;

/// Code shipped to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    pub id: String,
    pub version: i64,
    pub js: String,
    pub wasm: Option<Vec<u8>>,
}

/// One UDF invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub id: String,
    pub handler_name: String,
    pub version: i64,
    /// Positional arguments, already serialized to JSON strings.
    pub args: Vec<String>,
}

/// The sandbox boundary. Implementations may complete the acknowledgement
/// from any thread.
pub trait UdfEngine: Send + Sync {
    /// Queue a code object load; ack on `done` when the sandbox has it.
    fn load(&self, code: CodeObject, done: oneshot::Sender<Result<(), Error>>);

    /// Queue an invocation; send the handler's return value on `done`.
    fn execute(&self, invocation: Invocation, done: oneshot::Sender<Result<String, Error>>);
}

/// Engine for deployments that serve without UDF dispatch. Loads are
/// acknowledged (so code objects in the delta stream stay harmless) and
/// executions fail.
#[derive(Debug, Default)]
pub struct NoopUdfEngine;

impl UdfEngine for NoopUdfEngine {
    fn load(&self, code: CodeObject, done: oneshot::Sender<Result<(), Error>>) {
        tracing::debug!(version = code.version, "noop engine acknowledging code object");
        let _ = done.send(Ok(()));
    }

    fn execute(&self, _invocation: Invocation, done: oneshot::Sender<Result<String, Error>>) {
        let _ = done.send(Err(Error::Internal(
            "UDF execution is not supported in this deployment".into(),
        )));
    }
}
