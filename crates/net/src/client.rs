//! gRPC client implementing `RemoteLookupClient`.
//!
//! Maintains a pool of tonic channels to peer nodes, creating new
//! connections on demand. Request payloads are padded and sealed before
//! they leave the node; responses are opened with the same key.

use crate::convert;
use prost::Message;
use silo_common::Error;
use silo_lookup::sealing::{self, Envelope, KeyFetcherManager};
use silo_lookup::{LookupResponse, QueryResult, RemoteLookupClient};
use silo_proto::lookup::lookup_service_client::LookupServiceClient;
use silo_proto::lookup as pb_lookup;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tonic::transport::Channel;

pub struct GrpcRemoteLookupClient {
    key_fetcher: Arc<dyn KeyFetcherManager>,
    channels: Arc<RwLock<HashMap<String, Channel>>>,
    rpc_timeout: Duration,
}

impl std::fmt::Debug for GrpcRemoteLookupClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcRemoteLookupClient")
            .field("rpc_timeout", &self.rpc_timeout)
            .finish_non_exhaustive()
    }
}

impl GrpcRemoteLookupClient {
    pub fn new(key_fetcher: Arc<dyn KeyFetcherManager>, rpc_timeout: Duration) -> Self {
        Self {
            key_fetcher,
            channels: Arc::new(RwLock::new(HashMap::new())),
            rpc_timeout,
        }
    }

    async fn get_channel(&self, address: &str) -> Result<Channel, Error> {
        // Check cache first
        {
            let cache = self.channels.read().await;
            if let Some(channel) = cache.get(address) {
                return Ok(channel.clone());
            }
        }

        // Create new connection
        let endpoint = format!("http://{address}");
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| Error::Internal(format!("invalid endpoint: {e}")))?
            .connect()
            .await
            .map_err(|e| Error::Unavailable(format!("connect to {address} failed: {e}")))?;

        // Cache it
        {
            let mut cache = self.channels.write().await;
            cache.insert(address.to_string(), channel.clone());
        }

        Ok(channel)
    }

    /// Remove a cached channel (e.g., on RPC failure).
    async fn invalidate(&self, address: &str) {
        tracing::debug!("invalidating cached channel to {}", address);
        let mut cache = self.channels.write().await;
        cache.remove(address);
    }
}

#[async_trait::async_trait]
impl RemoteLookupClient for GrpcRemoteLookupClient {
    async fn get_values(
        &self,
        address: &str,
        keys: Vec<String>,
        lookup_sets: bool,
        padding: usize,
    ) -> Result<LookupResponse, Error> {
        let channel = self.get_channel(address).await?;
        let mut client = LookupServiceClient::new(channel);

        let mut padded_keys = keys;
        sealing::pad_keys(&mut padded_keys, padding);
        let lookup_request = pb_lookup::LookupRequest {
            keys: padded_keys,
            lookup_sets,
        };
        let envelope = sealing::seal_with(
            self.key_fetcher.as_ref(),
            &lookup_request.encode_to_vec(),
        )?;
        let key_id = envelope.key_id.clone();

        let mut request = tonic::Request::new(pb_lookup::SecureLookupRequest {
            key_id: envelope.key_id,
            sealed_payload: envelope.ciphertext,
        });
        request.set_timeout(self.rpc_timeout);

        let response = match client.secure_get_values(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                self.invalidate(address).await;
                return Err(Error::Unavailable(format!(
                    "secure lookup RPC to {address} failed: {status}"
                )));
            }
        };

        let serialized_response = sealing::open_with(
            self.key_fetcher.as_ref(),
            &Envelope {
                key_id,
                ciphertext: response.sealed_payload,
            },
        )?;
        let proto = pb_lookup::LookupResponse::decode(serialized_response.as_slice())
            .map_err(|e| Error::Internal(format!("malformed lookup response: {e}")))?;
        Ok(convert::lookup_response_from_proto(proto))
    }

    async fn run_query(&self, address: &str, query: String) -> Result<QueryResult, Error> {
        let channel = self.get_channel(address).await?;
        let mut client = LookupServiceClient::new(channel);

        let mut request = tonic::Request::new(pb_lookup::RunQueryRequest { query });
        request.set_timeout(self.rpc_timeout);

        match client.run_query(request).await {
            Ok(response) => Ok(QueryResult {
                elements: response.into_inner().elements,
            }),
            Err(status) => {
                self.invalidate(address).await;
                Err(Error::Unavailable(format!(
                    "run query RPC to {address} failed: {status}"
                )))
            }
        }
    }
}
