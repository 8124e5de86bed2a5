//! gRPC service implementations.
//!
//! Bridges the tonic-generated service traits to the request handlers and
//! the lookup fabric.

use crate::convert;
use prost::Message;
use silo_handler::{BhttpCodec, OhttpCodec, V1Handler, V2Handler};
use silo_lookup::sealing::{self, Envelope, KeyFetcherManager};
use silo_lookup::Lookup;
use silo_proto::{lookup as pb_lookup, v1 as pb_v1, v2 as pb_v2};
use silo_udf::UdfEngine;
use std::sync::Arc;

const BHTTP_CONTENT_TYPE: &str = "message/bhttp";
const OHTTP_RESPONSE_CONTENT_TYPE: &str = "message/ohttp-res";
const JSON_CONTENT_TYPE: &str = "application/json";

// ---------------------------------------------------------------------------
// v1 service
// ---------------------------------------------------------------------------

pub struct V1Service<E: UdfEngine> {
    pub handler: Arc<V1Handler<E>>,
}

impl<E: UdfEngine> std::fmt::Debug for V1Service<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V1Service").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<E: UdfEngine + 'static> pb_v1::key_value_service_server::KeyValueService for V1Service<E> {
    async fn get_values(
        &self,
        request: tonic::Request<pb_v1::GetValuesRequest>,
    ) -> Result<tonic::Response<pb_v1::GetValuesResponse>, tonic::Status> {
        silo_metrics::count_request("v1_get_values");
        let _timer = silo_metrics::start_api_timer("v1_get_values");

        let core_request = convert::v1_request_from_proto(request.into_inner());
        let response = self
            .handler
            .get_values(&core_request)
            .await
            .map_err(tonic::Status::from)?;
        Ok(tonic::Response::new(convert::v1_response_to_proto(
            response,
        )))
    }
}

// ---------------------------------------------------------------------------
// v2 service
// ---------------------------------------------------------------------------

pub struct V2Service<E: UdfEngine> {
    pub handler: Arc<V2Handler<E>>,
    pub bhttp: Arc<dyn BhttpCodec>,
    pub ohttp: Arc<dyn OhttpCodec>,
}

impl<E: UdfEngine> std::fmt::Debug for V2Service<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V2Service").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<E: UdfEngine + 'static> pb_v2::key_value_service_server::KeyValueService for V2Service<E> {
    async fn get_values(
        &self,
        request: tonic::Request<pb_v2::GetValuesRequest>,
    ) -> Result<tonic::Response<pb_v2::GetValuesResponse>, tonic::Status> {
        silo_metrics::count_request("v2_get_values");
        let _timer = silo_metrics::start_api_timer("v2_get_values");

        let core_request = convert::v2_request_from_proto(request.into_inner());
        let response = self
            .handler
            .get_values(core_request)
            .await
            .map_err(tonic::Status::from)?;
        Ok(tonic::Response::new(convert::v2_response_to_proto(
            response,
        )))
    }

    async fn get_values_http(
        &self,
        request: tonic::Request<pb_v2::HttpBodyRequest>,
    ) -> Result<tonic::Response<pb_v2::HttpBody>, tonic::Status> {
        silo_metrics::count_request("v2_get_values_http");
        let _timer = silo_metrics::start_api_timer("v2_get_values_http");

        let body = request.into_inner().raw_body;
        let json = self
            .handler
            .get_values_http(&body)
            .await
            .map_err(tonic::Status::from)?;
        Ok(tonic::Response::new(pb_v2::HttpBody {
            content_type: JSON_CONTENT_TYPE.to_string(),
            data: json.into_bytes(),
        }))
    }

    async fn binary_http_get_values(
        &self,
        request: tonic::Request<pb_v2::HttpBodyRequest>,
    ) -> Result<tonic::Response<pb_v2::HttpBody>, tonic::Status> {
        silo_metrics::count_request("v2_binary_http_get_values");
        let _timer = silo_metrics::start_api_timer("v2_binary_http_get_values");

        let body = request.into_inner().raw_body;
        let response = self
            .handler
            .binary_http_get_values(self.bhttp.as_ref(), &body)
            .await
            .map_err(tonic::Status::from)?;
        Ok(tonic::Response::new(pb_v2::HttpBody {
            content_type: BHTTP_CONTENT_TYPE.to_string(),
            data: response,
        }))
    }

    async fn oblivious_get_values(
        &self,
        request: tonic::Request<pb_v2::HttpBodyRequest>,
    ) -> Result<tonic::Response<pb_v2::HttpBody>, tonic::Status> {
        silo_metrics::count_request("v2_oblivious_get_values");
        let _timer = silo_metrics::start_api_timer("v2_oblivious_get_values");

        let body = request.into_inner().raw_body;
        let response = self
            .handler
            .oblivious_get_values(self.ohttp.as_ref(), self.bhttp.as_ref(), &body)
            .await
            .map_err(tonic::Status::from)?;
        Ok(tonic::Response::new(pb_v2::HttpBody {
            content_type: OHTTP_RESPONSE_CONTENT_TYPE.to_string(),
            data: response,
        }))
    }
}

// ---------------------------------------------------------------------------
// Internal lookup service
// ---------------------------------------------------------------------------

pub struct LookupServiceImpl {
    pub lookup: Arc<dyn Lookup>,
    pub key_fetcher: Arc<dyn KeyFetcherManager>,
}

impl std::fmt::Debug for LookupServiceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupServiceImpl").finish_non_exhaustive()
    }
}

impl LookupServiceImpl {
    async fn process_lookup(
        &self,
        request: pb_lookup::LookupRequest,
    ) -> Result<pb_lookup::LookupResponse, silo_common::Error> {
        let keys = sealing::strip_padding(request.keys);
        if keys.is_empty() {
            return Ok(pb_lookup::LookupResponse::default());
        }
        let response = if request.lookup_sets {
            self.lookup.get_key_value_set(keys).await?
        } else {
            self.lookup.get_key_values(keys).await?
        };
        Ok(convert::lookup_response_to_proto(response))
    }
}

#[tonic::async_trait]
impl pb_lookup::lookup_service_server::LookupService for LookupServiceImpl {
    async fn secure_get_values(
        &self,
        request: tonic::Request<pb_lookup::SecureLookupRequest>,
    ) -> Result<tonic::Response<pb_lookup::SecureLookupResponse>, tonic::Status> {
        silo_metrics::count_request("internal_secure_get_values");
        let _timer = silo_metrics::start_api_timer("internal_secure_get_values");

        let sealed_request = request.into_inner();
        let envelope = Envelope {
            key_id: sealed_request.key_id,
            ciphertext: sealed_request.sealed_payload,
        };
        let serialized_request = sealing::open_with(self.key_fetcher.as_ref(), &envelope)
            .map_err(|e| tonic::Status::internal(format!("decryption failed: {e}")))?;

        let lookup_request = pb_lookup::LookupRequest::decode(serialized_request.as_slice())
            .map_err(|_| tonic::Status::internal("failed parsing incoming request"))?;

        let response = self
            .process_lookup(lookup_request)
            .await
            .map_err(tonic::Status::from)?;

        let sealed_payload = self
            .key_fetcher
            .sealer(&envelope.key_id)
            .and_then(|sealer| sealer.seal(&response.encode_to_vec()))
            .map_err(|e| tonic::Status::internal(format!("encryption failed: {e}")))?;
        Ok(tonic::Response::new(pb_lookup::SecureLookupResponse {
            sealed_payload,
        }))
    }

    async fn get_values(
        &self,
        request: tonic::Request<pb_lookup::LookupRequest>,
    ) -> Result<tonic::Response<pb_lookup::LookupResponse>, tonic::Status> {
        silo_metrics::count_request("internal_get_values");
        let _timer = silo_metrics::start_api_timer("internal_get_values");

        let response = self
            .process_lookup(request.into_inner())
            .await
            .map_err(tonic::Status::from)?;
        Ok(tonic::Response::new(response))
    }

    async fn run_query(
        &self,
        request: tonic::Request<pb_lookup::RunQueryRequest>,
    ) -> Result<tonic::Response<pb_lookup::RunQueryResponse>, tonic::Status> {
        silo_metrics::count_request("internal_run_query");
        let _timer = silo_metrics::start_api_timer("internal_run_query");

        let result = self
            .lookup
            .run_query(request.into_inner().query)
            .await
            .map_err(tonic::Status::from)?;
        Ok(tonic::Response::new(pb_lookup::RunQueryResponse {
            elements: result.elements,
        }))
    }
}
