//! UDF client: versioned code-object state and bounded execution.

use crate::engine::{CodeObject, Invocation, UdfEngine};
use crate::{CodeConfig, UdfArgument};
use serde::Serialize;
use silo_common::Error;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Duration;

/// Injected into the metadata argument so handlers can detect the calling
/// convention.
const UDF_INTERFACE_VERSION: i32 = 1;

// The engine requires ids; we do not currently use them, set them to
// constants.
const CODE_OBJECT_ID: &str = "id";
const INVOCATION_ID: &str = "id";

#[derive(Debug, Clone)]
pub struct UdfClientConfig {
    /// Bound on one UDF invocation.
    pub udf_timeout: Duration,
    /// Bound on loading a new code object.
    pub load_timeout: Duration,
}

impl Default for UdfClientConfig {
    fn default() -> Self {
        Self {
            udf_timeout: Duration::from_secs(60),
            load_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveCode {
    handler_name: String,
    version: i64,
    logical_commit_time: i64,
}

/// Owns at most one active code object; updates apply only when the
/// candidate's logical commit time strictly exceeds the active one.
pub struct UdfClient<E: UdfEngine> {
    engine: Arc<E>,
    config: UdfClientConfig,
    active: RwLock<Option<ActiveCode>>,
}

impl<E: UdfEngine> std::fmt::Debug for UdfClient<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdfClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: UdfEngine> UdfClient<E> {
    pub fn new(engine: Arc<E>, config: UdfClientConfig) -> Self {
        Self {
            engine,
            config,
            active: RwLock::new(None),
        }
    }

    /// `(version, logical_commit_time)` of the active code object.
    pub async fn active_version(&self) -> Option<(i64, i64)> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| (a.version, a.logical_commit_time))
    }

    /// Load a new code object into the sandbox. A candidate at or below the
    /// active logical commit time is a no-op.
    pub async fn set_code_object(&self, code_config: CodeConfig) -> Result<(), Error> {
        // The write lock is held across the load so concurrent updates
        // serialize and the monotonicity check stays race-free.
        let mut active = self.active.write().await;
        if let Some(current) = active.as_ref() {
            if code_config.logical_commit_time <= current.logical_commit_time {
                tracing::debug!(
                    candidate = code_config.logical_commit_time,
                    active = current.logical_commit_time,
                    "not updating code object, logical commit time too small"
                );
                return Ok(());
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.engine.load(
            CodeObject {
                id: CODE_OBJECT_ID.to_string(),
                version: code_config.version,
                js: code_config.js,
                wasm: code_config.wasm,
            },
            done_tx,
        );

        match tokio::time::timeout(self.config.load_timeout, done_rx).await {
            Err(_) => {
                return Err(Error::Internal("Timed out setting UDF code object.".into()));
            }
            Ok(Err(_)) => {
                return Err(Error::Internal(
                    "UDF engine dropped the load acknowledgement".into(),
                ));
            }
            Ok(Ok(Err(e))) => {
                tracing::error!("error setting UDF code object: {}", e);
                return Err(e);
            }
            Ok(Ok(Ok(()))) => {}
        }

        *active = Some(ActiveCode {
            handler_name: code_config.udf_handler_name,
            version: code_config.version,
            logical_commit_time: code_config.logical_commit_time,
        });
        silo_metrics::metrics().udf_code_updates.inc();
        Ok(())
    }

    /// Invoke the active handler. The metadata is serialized to JSON (with
    /// the interface version injected) as the first positional argument;
    /// each argument follows as `arg.data` alone when untagged, or the whole
    /// argument when tagged.
    pub async fn execute(
        &self,
        metadata: serde_json::Map<String, serde_json::Value>,
        arguments: &[UdfArgument],
    ) -> Result<String, Error> {
        let (handler_name, version) = {
            let active = self.active.read().await;
            match active.as_ref() {
                Some(active) => (active.handler_name.clone(), active.version),
                None => return Err(Error::Internal("UDF is not loaded".into())),
            }
        };

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ExecutionMetadata<'a> {
            udf_interface_version: i32,
            request_metadata: &'a serde_json::Map<String, serde_json::Value>,
        }

        let mut args = Vec::with_capacity(arguments.len() + 1);
        args.push(
            serde_json::to_string(&ExecutionMetadata {
                udf_interface_version: UDF_INTERFACE_VERSION,
                request_metadata: &metadata,
            })
            .map_err(|e| Error::Internal(format!("failed to serialize UDF metadata: {e}")))?,
        );
        for argument in arguments {
            let json = if argument.tags.is_empty() {
                serde_json::to_string(&argument.data)
            } else {
                serde_json::to_string(argument)
            };
            args.push(
                json.map_err(|e| Error::Internal(format!("failed to serialize UDF argument: {e}")))?,
            );
        }

        let m = silo_metrics::metrics();
        m.udf_executions.inc();

        let (done_tx, done_rx) = oneshot::channel();
        self.engine.execute(
            Invocation {
                id: INVOCATION_ID.to_string(),
                handler_name,
                version,
                args,
            },
            done_tx,
        );

        // The completion callback is the only path that resolves the call.
        let timer = m.udf_latency_secs.with_label_values(&["ok"]).start_timer();
        match tokio::time::timeout(self.config.udf_timeout, done_rx).await {
            Err(_) => {
                timer.stop_and_discard();
                m.udf_timeouts.inc();
                Err(Error::Internal("Timed out waiting for UDF result.".into()))
            }
            Ok(Err(_)) => {
                timer.stop_and_discard();
                Err(Error::Internal(
                    "UDF engine dropped the completion callback".into(),
                ))
            }
            Ok(Ok(Err(e))) => {
                timer.stop_and_discard();
                m.udf_execution_failures.inc();
                tracing::error!("error executing UDF: {}", e);
                Err(e)
            }
            Ok(Ok(Ok(output))) => Ok(output),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Engine that records loads/invocations and answers from a script.
    #[derive(Default)]
    struct MockEngine {
        loads: Mutex<Vec<CodeObject>>,
        invocations: Mutex<Vec<Invocation>>,
        /// When set, loads fail with this error.
        load_error: Option<Error>,
        /// When true, acknowledgements are never sent.
        swallow: bool,
    }

    impl UdfEngine for MockEngine {
        fn load(&self, code: CodeObject, done: oneshot::Sender<Result<(), Error>>) {
            self.loads.lock().unwrap().push(code);
            if self.swallow {
                // Keep the sender alive so the client hits its timeout
                // rather than a closed channel.
                std::mem::forget(done);
                return;
            }
            match &self.load_error {
                Some(e) => {
                    let _ = done.send(Err(e.clone()));
                }
                None => {
                    let _ = done.send(Ok(()));
                }
            }
        }

        fn execute(&self, invocation: Invocation, done: oneshot::Sender<Result<String, Error>>) {
            self.invocations.lock().unwrap().push(invocation.clone());
            if self.swallow {
                std::mem::forget(done);
                return;
            }
            let _ = done.send(Ok(format!("echo:{}", invocation.args.join("|"))));
        }
    }

    fn code(lct: i64, version: i64) -> CodeConfig {
        CodeConfig {
            udf_handler_name: "HandleRequest".into(),
            js: format!("function HandleRequest() {{ return {version}; }}"),
            wasm: None,
            version,
            logical_commit_time: lct,
        }
    }

    #[tokio::test]
    async fn test_set_code_object_loads_and_activates() {
        let engine = Arc::new(MockEngine::default());
        let client = UdfClient::new(engine.clone(), UdfClientConfig::default());

        client.set_code_object(code(10, 1)).await.unwrap();
        assert_eq!(client.active_version().await, Some((1, 10)));
        assert_eq!(engine.loads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_code_object_is_noop() {
        // P6: a candidate at or below the active LCT leaves the active
        // object in place.
        let engine = Arc::new(MockEngine::default());
        let client = UdfClient::new(engine.clone(), UdfClientConfig::default());

        client.set_code_object(code(10, 1)).await.unwrap();
        client.set_code_object(code(10, 2)).await.unwrap();
        client.set_code_object(code(5, 3)).await.unwrap();

        assert_eq!(client.active_version().await, Some((1, 10)));
        assert_eq!(engine.loads.lock().unwrap().len(), 1, "stale loads skipped");
    }

    #[tokio::test]
    async fn test_newer_code_object_replaces() {
        let engine = Arc::new(MockEngine::default());
        let client = UdfClient::new(engine.clone(), UdfClientConfig::default());

        client.set_code_object(code(10, 1)).await.unwrap();
        client.set_code_object(code(11, 2)).await.unwrap();
        assert_eq!(client.active_version().await, Some((2, 11)));
    }

    #[tokio::test]
    async fn test_load_timeout_message() {
        let engine = Arc::new(MockEngine {
            swallow: true,
            ..Default::default()
        });
        let client = UdfClient::new(
            engine,
            UdfClientConfig {
                load_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let err = client.set_code_object(code(10, 1)).await.unwrap_err();
        assert_eq!(err.to_string(), "Timed out setting UDF code object.");
        assert_eq!(client.active_version().await, None);
    }

    #[tokio::test]
    async fn test_load_error_surfaces() {
        let engine = Arc::new(MockEngine {
            load_error: Some(Error::Internal("syntax error in UDF".into())),
            ..Default::default()
        });
        let client = UdfClient::new(engine, UdfClientConfig::default());
        let err = client.set_code_object(code(10, 1)).await.unwrap_err();
        assert!(err.to_string().contains("syntax error"));
        assert_eq!(client.active_version().await, None);
    }

    #[tokio::test]
    async fn test_execute_without_code_fails() {
        let engine = Arc::new(MockEngine::default());
        let client = UdfClient::new(engine, UdfClientConfig::default());
        let err = client
            .execute(serde_json::Map::new(), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not loaded"));
    }

    #[tokio::test]
    async fn test_execute_serializes_metadata_and_arguments() {
        let engine = Arc::new(MockEngine::default());
        let client = UdfClient::new(engine.clone(), UdfClientConfig::default());
        client.set_code_object(code(10, 1)).await.unwrap();

        let mut metadata = serde_json::Map::new();
        metadata.insert("hostname".into(), "example.com".into());

        let arguments = vec![
            UdfArgument {
                tags: vec!["custom".into(), "keys".into()],
                data: serde_json::json!(["key1"]),
            },
            UdfArgument {
                tags: vec![],
                data: serde_json::json!({"plain": true}),
            },
        ];

        client.execute(metadata, &arguments).await.unwrap();

        let invocations = engine.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        let args = &invocations[0].args;
        assert_eq!(args.len(), 3);

        let meta: serde_json::Value = serde_json::from_str(&args[0]).unwrap();
        assert_eq!(meta["udfInterfaceVersion"], 1);
        assert_eq!(meta["requestMetadata"]["hostname"], "example.com");

        // Tagged argument serializes whole; untagged serializes data only.
        let tagged: serde_json::Value = serde_json::from_str(&args[1]).unwrap();
        assert_eq!(tagged["tags"][0], "custom");
        assert_eq!(tagged["data"][0], "key1");
        let untagged: serde_json::Value = serde_json::from_str(&args[2]).unwrap();
        assert_eq!(untagged, serde_json::json!({"plain": true}));

        assert_eq!(invocations[0].handler_name, "HandleRequest");
        assert_eq!(invocations[0].version, 1);
    }

    /// Engine whose executions never complete but whose loads do.
    #[derive(Default)]
    struct HangingExecEngine;

    impl UdfEngine for HangingExecEngine {
        fn load(&self, _code: CodeObject, done: oneshot::Sender<Result<(), Error>>) {
            let _ = done.send(Ok(()));
        }

        fn execute(&self, _invocation: Invocation, done: oneshot::Sender<Result<String, Error>>) {
            std::mem::forget(done);
        }
    }

    #[tokio::test]
    async fn test_execute_timeout_fidelity() {
        // P7: an over-budget UDF returns the exact timeout message.
        let client = UdfClient::new(
            Arc::new(HangingExecEngine),
            UdfClientConfig {
                udf_timeout: Duration::from_millis(20),
                load_timeout: Duration::from_secs(1),
            },
        );
        client.set_code_object(code(1, 1)).await.unwrap();

        let err = client
            .execute(serde_json::Map::new(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Timed out waiting for UDF result.");
    }
}
