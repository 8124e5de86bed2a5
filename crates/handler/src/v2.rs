//! v2 handler: one UDF invocation per partition.

use crate::codec::{BhttpCodec, OhttpCodec};
use crate::{GetValuesRequest, GetValuesResponse, RequestPartition, ResponsePartition};
use silo_common::{Error, LookupStatus};
use silo_udf::{UdfClient, UdfEngine};
use std::sync::Arc;

pub struct V2Handler<E: UdfEngine> {
    udf_client: Arc<UdfClient<E>>,
}

impl<E: UdfEngine> std::fmt::Debug for V2Handler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V2Handler").finish_non_exhaustive()
    }
}

impl<E: UdfEngine> V2Handler<E> {
    pub fn new(udf_client: Arc<UdfClient<E>>) -> Self {
        Self { udf_client }
    }

    async fn process_one_partition(
        &self,
        metadata: &serde_json::Map<String, serde_json::Value>,
        partition: RequestPartition,
    ) -> ResponsePartition {
        match self
            .udf_client
            .execute(metadata.clone(), &partition.arguments)
            .await
        {
            Ok(output) => ResponsePartition {
                id: partition.id,
                string_output: Some(output),
                status: None,
            },
            Err(e) => ResponsePartition {
                id: partition.id,
                string_output: None,
                status: Some(LookupStatus {
                    code: 13,
                    message: e.message().to_string(),
                }),
            },
        }
    }

    /// Run every partition, in request order. A partition failure collapses
    /// to its status field and leaves siblings untouched.
    pub async fn get_values(&self, request: GetValuesRequest) -> Result<GetValuesResponse, Error> {
        if request.partitions.is_empty() {
            return Err(Error::Internal(
                "response does not have single_partition".into(),
            ));
        }

        let single = request.partitions.len() == 1;
        let mut outputs = Vec::with_capacity(request.partitions.len());
        for partition in request.partitions {
            outputs
                .push(self.process_one_partition(&request.metadata, partition).await);
        }

        if single {
            Ok(GetValuesResponse {
                single_partition: outputs.pop(),
                partitions: Vec::new(),
            })
        } else {
            Ok(GetValuesResponse {
                single_partition: None,
                partitions: outputs,
            })
        }
    }

    /// JSON body carrier: parse, dispatch, re-serialize.
    pub async fn get_values_http(&self, body: &[u8]) -> Result<String, Error> {
        let request: GetValuesRequest = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidArgument(format!("malformed v2 request body: {e}")))?;
        let response = self.get_values(request).await?;
        serde_json::to_string(&response)
            .map_err(|e| Error::Internal(format!("failed to serialize v2 response: {e}")))
    }

    /// Binary-HTTP carrier: inner failures become a 500 envelope, never an
    /// RPC error.
    pub async fn binary_http_get_values(
        &self,
        codec: &dyn BhttpCodec,
        body: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let inner = match codec.decode_request(body) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!("failed to decode binary http request: {}", e);
                return codec.encode_response(500, &[]);
            }
        };
        match self.get_values_http(&inner).await {
            Ok(json) => codec.encode_response(200, json.as_bytes()),
            Err(e) => {
                tracing::warn!("binary http get_values failed: {}", e);
                codec.encode_response(500, &[])
            }
        }
    }

    /// Oblivious carrier: decapsulate, run the Binary-HTTP path, seal the
    /// response back to the caller's key.
    pub async fn oblivious_get_values(
        &self,
        ohttp: &dyn OhttpCodec,
        bhttp: &dyn BhttpCodec,
        body: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let (key_id, inner) = ohttp.open_request(body)?;
        let response = self.binary_http_get_values(bhttp, &inner).await?;
        ohttp.seal_response(&key_id, &response)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
