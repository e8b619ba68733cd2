//! Client for the mesh control plane's CA (istiod / Citadel).

use super::proto::{
    cluster_metadata, IstioCertificateRequest, IstioCertificateResponse, ISTIO_CREATE_CERTIFICATE,
};
use super::{endpoint_host, CaClient};
use crate::certificate::TrustBundle;
use crate::{Error, Result};
use async_trait::async_trait;
use http::uri::PathAndQuery;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Certificate as TlsCertificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

/// A [`CaClient`] speaking `IstioCertificateService` over a lazily connected channel.
#[derive(Debug, Clone)]
pub struct CitadelClient {
    endpoint: String,
    cluster_id: String,
    channel: Channel,
}

impl CitadelClient {
    /// Builds the client without dialing.
    ///
    /// With `use_tls`, a supplied `root_cert` is pinned as the only trusted
    /// root and must contain at least one certificate. Without one, the
    /// system store is used.
    pub fn new(
        endpoint: &str,
        use_tls: bool,
        root_cert: Option<&[u8]>,
        cluster_id: &str,
    ) -> Result<Self> {
        let scheme = if use_tls { "https" } else { "http" };
        let mut channel = Endpoint::from_shared(format!("{scheme}://{endpoint}"))
            .map_err(|e| Error::CaClient(format!("invalid CA endpoint {endpoint}: {e}")))?;

        if use_tls {
            let tls = ClientTlsConfig::new().domain_name(endpoint_host(endpoint));
            let tls = match root_cert {
                Some(pem) => {
                    let bundle = TrustBundle::from_pem(pem)?;
                    debug!(roots = bundle.roots().len(), "pinning CA root bundle");
                    tls.ca_certificate(TlsCertificate::from_pem(bundle.to_pem()))
                }
                None => tls.with_native_roots(),
            };
            channel = channel
                .tls_config(tls)
                .map_err(|e| Error::CaClient(format!("TLS configuration failed: {e}")))?;
        }

        info!(
            endpoint = %endpoint,
            tls = use_tls,
            pinned_root = root_cert.is_some(),
            "created Citadel CA client"
        );

        Ok(Self {
            endpoint: endpoint.to_string(),
            cluster_id: cluster_id.to_string(),
            channel: channel.connect_lazy(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(
        &self,
        csr_pem: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<tonic::Request<IstioCertificateRequest>> {
        let mut request = tonic::Request::new(IstioCertificateRequest {
            csr: csr_pem.to_string(),
            validity_duration: ttl.as_secs() as i64,
            metadata: cluster_metadata(&self.cluster_id),
        });

        let bearer: AsciiMetadataValue = format!("Bearer {token}")
            .parse()
            .map_err(|e| Error::CaRequest(format!("invalid token header: {e}")))?;
        request.metadata_mut().insert("authorization", bearer);

        if !self.cluster_id.is_empty() {
            let cluster: AsciiMetadataValue = self
                .cluster_id
                .parse()
                .map_err(|e| Error::CaRequest(format!("invalid cluster id header: {e}")))?;
            request.metadata_mut().insert("clusterid", cluster);
        }
        Ok(request)
    }
}

#[async_trait]
impl CaClient for CitadelClient {
    async fn csr_sign(&self, csr_pem: &str, token: &str, ttl: Duration) -> Result<Vec<String>> {
        let request = self.request(csr_pem, token, ttl)?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::CaRequest(format!("CA {} unavailable: {e}", self.endpoint)))?;

        let response = grpc
            .unary(
                request,
                PathAndQuery::from_static(ISTIO_CREATE_CERTIFICATE),
                ProstCodec::<IstioCertificateRequest, IstioCertificateResponse>::default(),
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
        debug!(chain_len = chain.len(), "received certificate chain");
        Ok(chain)
    }

    fn provider(&self) -> &'static str {
        "Citadel"
    }
}
