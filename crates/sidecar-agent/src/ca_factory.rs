//! CA client selection and construction.
//!
//! The provider is a closed set. Adding a CA means adding a [`CaProvider`]
//! variant and a branch in [`CaClientConfig::build`]; callers only ever see
//! `Arc<dyn CaClient>`.

use crate::error::{Error, Result};
use crate::trust::TrustPolicy;
use sidecar_identity::{
    CaClient, CitadelClient, GoogleCaClient, DEFAULT_GOOGLE_CA_ENDPOINT, GOOGLE_TOKEN_EXCHANGE,
};
use std::sync::Arc;
use tracing::info;

/// Provider name selecting Google's mesh CA.
pub const GOOGLE_CA_PROVIDER: &str = "GoogleCA";

/// Endpoint marker selecting Google's mesh CA regardless of provider name.
pub const GOOGLE_CA_DOMAIN: &str = "googleapis.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaProvider {
    Citadel,
    GoogleCa,
}

impl CaProvider {
    /// `GoogleCa` when the provider is exactly `GoogleCA` or the endpoint
    /// points at `googleapis.com`; `Citadel` otherwise.
    pub fn select(provider_name: &str, endpoint: &str) -> Self {
        if provider_name == GOOGLE_CA_PROVIDER || endpoint.contains(GOOGLE_CA_DOMAIN) {
            CaProvider::GoogleCa
        } else {
            CaProvider::Citadel
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct CaClientConfig {
    pub provider: CaProvider,
    pub endpoint: String,
    pub use_tls: bool,
    pub root_cert: Option<Vec<u8>>,
    pub cluster_id: String,
    /// Token exchange plugins, in application order.
    pub token_exchanger_plugins: Vec<String>,
}

impl std::fmt::Debug for CaClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaClientConfig")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("use_tls", &self.use_tls)
            .field("root_cert_len", &self.root_cert.as_ref().map(Vec::len))
            .field("cluster_id", &self.cluster_id)
            .field("token_exchanger_plugins", &self.token_exchanger_plugins)
            .finish()
    }
}

impl CaClientConfig {
    /// Google's CA: public TLS with system roots and the STS plugin.
    pub fn google(endpoint: &str) -> Self {
        let endpoint = if endpoint.is_empty() {
            DEFAULT_GOOGLE_CA_ENDPOINT
        } else {
            endpoint
        };
        Self {
            provider: CaProvider::GoogleCa,
            endpoint: endpoint.to_string(),
            use_tls: true,
            root_cert: None,
            cluster_id: String::new(),
            token_exchanger_plugins: vec![GOOGLE_TOKEN_EXCHANGE.to_string()],
        }
    }

    /// The mesh CA, configured from a resolved trust policy.
    pub fn citadel(policy: &TrustPolicy, cluster_id: &str) -> Self {
        Self {
            provider: CaProvider::Citadel,
            endpoint: policy.ca_endpoint.clone(),
            use_tls: policy.use_tls,
            root_cert: policy.root_cert.clone(),
            cluster_id: cluster_id.to_string(),
            token_exchanger_plugins: Vec::new(),
        }
    }

    /// Builds the client. Does not dial; the channel connects on first use.
    pub fn build(&self) -> Result<Arc<dyn CaClient>> {
        let client: Arc<dyn CaClient> = match self.provider {
            CaProvider::GoogleCa => {
                Arc::new(GoogleCaClient::new(&self.endpoint).map_err(Error::CaClient)?)
            }
            CaProvider::Citadel => Arc::new(
                CitadelClient::new(
                    &self.endpoint,
                    self.use_tls,
                    self.root_cert.as_deref(),
                    &self.cluster_id,
                )
                .map_err(Error::CaClient)?,
            ),
        };
        info!(
            provider = client.provider(),
            endpoint = %self.endpoint,
            plugins = ?self.token_exchanger_plugins,
            "CA client ready"
        );
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_pem() -> Vec<u8> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let params = rcgen::CertificateParams::new(vec![]).unwrap();
        params.self_signed(&key).unwrap().pem().into_bytes()
    }

    #[test]
    fn test_provider_selection() {
        assert_eq!(
            CaProvider::select("GoogleCA", "istiod.istio-system.svc:15012"),
            CaProvider::GoogleCa
        );
        assert_eq!(
            CaProvider::select("Citadel", "meshca.googleapis.com:443"),
            CaProvider::GoogleCa
        );
        assert_eq!(CaProvider::select("", "meshca.googleapis.com:443"), CaProvider::GoogleCa);
        // Case-sensitive on the provider name.
        assert_eq!(CaProvider::select("googleca", ""), CaProvider::Citadel);
        assert_eq!(CaProvider::select("GOOGLECA", ""), CaProvider::Citadel);
        assert_eq!(CaProvider::select("Citadel", ""), CaProvider::Citadel);
    }

    #[test]
    fn test_google_config_registers_single_plugin() {
        let config = CaClientConfig::google("");
        assert_eq!(config.endpoint, DEFAULT_GOOGLE_CA_ENDPOINT);
        assert!(config.use_tls);
        assert!(config.root_cert.is_none());
        assert_eq!(config.token_exchanger_plugins, vec![GOOGLE_TOKEN_EXCHANGE]);
    }

    #[test]
    fn test_citadel_config_from_policy() {
        let policy = TrustPolicy {
            use_tls: true,
            root_cert: Some(b"root".to_vec()),
            ca_endpoint: "istiod.istio-system.svc:15012".to_string(),
        };
        let config = CaClientConfig::citadel(&policy, "Kubernetes");
        assert_eq!(config.provider, CaProvider::Citadel);
        assert_eq!(config.endpoint, policy.ca_endpoint);
        assert_eq!(config.root_cert, policy.root_cert);
        assert_eq!(config.cluster_id, "Kubernetes");
        assert!(config.token_exchanger_plugins.is_empty());
    }

    #[tokio::test]
    async fn test_build_variants() {
        let google = CaClientConfig::google("").build().unwrap();
        assert_eq!(google.provider(), "GoogleCA");

        let policy = TrustPolicy {
            use_tls: true,
            root_cert: Some(root_pem()),
            ca_endpoint: "istiod.istio-system.svc:15012".to_string(),
        };
        let citadel = CaClientConfig::citadel(&policy, "").build().unwrap();
        assert_eq!(citadel.provider(), "Citadel");
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_root() {
        let policy = TrustPolicy {
            use_tls: true,
            root_cert: Some(b"not a certificate".to_vec()),
            ca_endpoint: "istiod.istio-system.svc:15012".to_string(),
        };
        let err = CaClientConfig::citadel(&policy, "").build().err().unwrap();
        assert!(matches!(err, Error::CaClient(_)));
        assert!(!err.is_fatal());
    }
}
