//! Client seam to a peer node's internal lookup service.

use crate::{LookupResponse, QueryResult};
use silo_common::Error;

/// Sends lookup requests to the node at `address`. The gRPC implementation
/// lives in the networking crate; tests substitute mocks.
#[async_trait::async_trait]
pub trait RemoteLookupClient: Send + Sync {
    /// Look up `keys` on the remote node. `lookup_sets` selects the
    /// set-typed map. `padding` extra dummy keys are added before sealing
    /// so per-shard bucket sizes do not leak to observers.
    async fn get_values(
        &self,
        address: &str,
        keys: Vec<String>,
        lookup_sets: bool,
        padding: usize,
    ) -> Result<LookupResponse, Error>;

    /// Evaluate a query entirely on the remote node.
    async fn run_query(&self, address: &str, query: String) -> Result<QueryResult, Error>;
}
