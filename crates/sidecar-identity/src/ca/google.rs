//! Client for Google's managed mesh CA.
//!
//! The endpoint is a public TLS service, so the channel always trusts the
//! system store. The bearer token must already be a federated access token;
//! the caller runs the `GoogleTokenExchange` plugin first.

use super::proto::{MeshCertificateRequest, MeshCertificateResponse, MESHCA_CREATE_CERTIFICATE};
use super::{endpoint_host, CaClient};
use crate::{Error, Result};
use async_trait::async_trait;
use http::uri::PathAndQuery;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::info;

/// Endpoint used when none is configured.
pub const DEFAULT_GOOGLE_CA_ENDPOINT: &str = "meshca.googleapis.com:443";

#[derive(Debug, Clone)]
pub struct GoogleCaClient {
    endpoint: String,
    channel: Channel,
}

impl GoogleCaClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = if endpoint.is_empty() {
            DEFAULT_GOOGLE_CA_ENDPOINT
        } else {
            endpoint
        };

        let tls = ClientTlsConfig::new()
            .domain_name(endpoint_host(endpoint))
            .with_native_roots();
        let channel = Endpoint::from_shared(format!("https://{endpoint}"))
            .map_err(|e| Error::CaClient(format!("invalid CA endpoint {endpoint}: {e}")))?
            .tls_config(tls)
            .map_err(|e| Error::CaClient(format!("TLS configuration failed: {e}")))?
            .connect_lazy();

        info!(endpoint = %endpoint, "created GoogleCA client");
        Ok(Self {
            endpoint: endpoint.to_string(),
            channel,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CaClient for GoogleCaClient {
    async fn csr_sign(&self, csr_pem: &str, token: &str, ttl: Duration) -> Result<Vec<String>> {
        let mut request = tonic::Request::new(MeshCertificateRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            csr: csr_pem.to_string(),
            validity: Some(prost_types::Duration {
                seconds: ttl.as_secs() as i64,
                nanos: 0,
            }),
        });
        let bearer: AsciiMetadataValue = format!("Bearer {token}")
            .parse()
            .map_err(|e| Error::CaRequest(format!("invalid token header: {e}")))?;
        request.metadata_mut().insert("authorization", bearer);

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::CaRequest(format!("CA {} unavailable: {e}", self.endpoint)))?;

        let response = grpc
            .unary(
                request,
                PathAndQuery::from_static(MESHCA_CREATE_CERTIFICATE),
                ProstCodec::<MeshCertificateRequest, MeshCertificateResponse>::default(),
            )
            .await
            .map_err(|status| {
                Error::CaRequest(format!(
                    "CreateCertificate failed: {} {}",
                    status.code(),
                    status.message()
                ))
            })?;

        let chain = response.into_inner().cert_chain;
        if chain.is_empty() {
            return Err(Error::EmptyResponse);
        }
        Ok(chain)
    }

    fn provider(&self) -> &'static str {
        "GoogleCA"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_endpoint_uses_default() {
        let client = GoogleCaClient::new("").unwrap();
        assert_eq!(client.endpoint(), DEFAULT_GOOGLE_CA_ENDPOINT);
        assert_eq!(client.provider(), "GoogleCA");
    }

    #[tokio::test]
    async fn test_explicit_endpoint() {
        let client = GoogleCaClient::new("meshca.us-west1.googleapis.com:443").unwrap();
        assert_eq!(client.endpoint(), "meshca.us-west1.googleapis.com:443");
    }
}
