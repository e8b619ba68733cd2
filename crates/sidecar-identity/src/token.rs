//! Token exchange plugins.
//!
//! Some CAs do not accept the platform JWT directly. A plugin trades it for a
//! credential the CA understands before the CSR is sent. Plugins are chained
//! in the order they were registered.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Registered name of the Google STS plugin.
pub const GOOGLE_TOKEN_EXCHANGE: &str = "GoogleTokenExchange";

const GOOGLE_STS_URL: &str = "https://securetoken.googleapis.com/v1/identitybindingtoken";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Trades a subject token for another credential.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange_token(&self, trust_domain: &str, subject_token: &str) -> Result<String>;

    fn name(&self) -> &'static str;
}

/// Builds the named plugins, in order. Unknown names are logged and skipped.
pub fn new_plugins(names: &[String]) -> Vec<Arc<dyn TokenExchanger>> {
    names
        .iter()
        .filter_map(|name| match name.as_str() {
            GOOGLE_TOKEN_EXCHANGE => {
                Some(Arc::new(GoogleTokenExchange::from_env()) as Arc<dyn TokenExchanger>)
            }
            other => {
                warn!(plugin = %other, "unknown token exchange plugin, skipping");
                None
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FederatedTokenRequest<'a> {
    audience: String,
    grant_type: &'static str,
    requested_token_type: &'static str,
    subject_token_type: &'static str,
    subject_token: &'a str,
    scope: &'static str,
}

#[derive(Debug, Deserialize)]
struct FederatedTokenResponse {
    access_token: String,
}

/// Exchanges a Kubernetes service account JWT for a Google federated token.
#[derive(Debug, Clone)]
pub struct GoogleTokenExchange {
    client: reqwest::Client,
    endpoint: String,
    gke_cluster_url: String,
}

impl GoogleTokenExchange {
    pub fn new(gke_cluster_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: GOOGLE_STS_URL.to_string(),
            gke_cluster_url: gke_cluster_url.into(),
        }
    }

    /// Reads the identity provider from `GKE_CLUSTER_URL`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("GKE_CLUSTER_URL").unwrap_or_default())
    }

    fn request_body<'a>(
        &self,
        trust_domain: &str,
        subject_token: &'a str,
    ) -> FederatedTokenRequest<'a> {
        FederatedTokenRequest {
            audience: format!("identitynamespace:{trust_domain}:{}", self.gke_cluster_url),
            grant_type: "urn:ietf:params:oauth:grant-type:token-exchange",
            requested_token_type: "urn:ietf:params:oauth:token-type:access_token",
            subject_token_type: "urn:ietf:params:oauth:token-type:jwt",
            subject_token,
            scope: CLOUD_PLATFORM_SCOPE,
        }
    }
}

#[async_trait]
impl TokenExchanger for GoogleTokenExchange {
    async fn exchange_token(&self, trust_domain: &str, subject_token: &str) -> Result<String> {
        let body = self.request_body(trust_domain, subject_token);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::TokenExchange(format!("STS request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::TokenExchange(format!("STS returned {status}: {text}")));
        }

        let parsed: FederatedTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid STS response: {e}")))?;
        debug!(audience = %body.audience, "exchanged token");
        Ok(parsed.access_token)
    }

    fn name(&self) -> &'static str {
        GOOGLE_TOKEN_EXCHANGE
    }
}
