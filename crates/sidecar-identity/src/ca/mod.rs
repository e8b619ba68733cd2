//! Certificate Authority (CA) clients.
//!
//! Every CA the agent can talk to exposes one capability: present proof of
//! identity and a certificate request, receive a signed certificate chain.
//!
//! - [`CitadelClient`] - the mesh's own CA (istiod / Citadel)
//! - [`GoogleCaClient`] - Google's managed mesh CA
//!
//! Callers hold an `Arc<dyn CaClient>` and never branch on the concrete
//! variant after construction. Implementations must tolerate concurrent calls
//! from the workload and gateway caches without external locking.

mod citadel;
mod google;
pub(crate) mod proto;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use citadel::CitadelClient;
pub use google::{GoogleCaClient, DEFAULT_GOOGLE_CA_ENDPOINT};

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A client able to exchange an identity proof and a CSR for a certificate chain.
#[async_trait]
pub trait CaClient: Send + Sync {
    /// Requests a certificate for the PEM-encoded `csr_pem`.
    ///
    /// `token` is the bearer credential proving the workload's identity (a
    /// platform JWT, or the result of a token exchange). `ttl` is the
    /// requested validity.
    ///
    /// Returns the PEM chain, leaf first. The last element is the root when
    /// the CA includes it.
    async fn csr_sign(&self, csr_pem: &str, token: &str, ttl: Duration) -> Result<Vec<String>>;

    /// Short name of the variant, for logs.
    fn provider(&self) -> &'static str;
}

/// Splits `host:port` and returns the host part.
pub(crate) fn endpoint_host(endpoint: &str) -> &str {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => endpoint,
    }
}
