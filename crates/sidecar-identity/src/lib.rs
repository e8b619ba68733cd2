//! Workload identity primitives for the sidecar agent.
//!
//! This crate holds everything the agent needs to turn a workload's identity
//! into short-lived certificates:
//!
//! # Components
//!
//! - [`identity`] - SPIFFE identity types and parsing
//! - [`certificate`] - X.509 certificates, private keys and trust bundles
//! - [`csr`] - CSR generation using P-256 ECDSA
//! - [`ca`] - the `CaClient` capability and its Citadel and GoogleCA variants
//! - [`token`] - token exchange plugins for external CAs
//! - [`fetcher`] - secret fetchers (CA-backed or cluster-secret-backed)
//! - [`store`] - gateway secret stores, including the Kubernetes watcher
//! - [`cache`] - the secret cache serving workload and gateway secrets

pub mod ca;
pub mod cache;
pub mod certificate;
pub mod csr;
pub mod fetcher;
pub mod identity;
pub mod store;
pub mod token;

pub use ca::{CaClient, CitadelClient, GoogleCaClient, DEFAULT_GOOGLE_CA_ENDPOINT};
pub use cache::{
    CacheOptions, NotifyFn, SecretCache, SecretItem, CERT_CHAIN_FILE, KEY_FILE, ROOT_CERT_FILE,
    ROOT_RESOURCE, WORKLOAD_RESOURCE,
};
pub use certificate::{Certificate, TrustBundle};
pub use csr::{CertSign, CsrOptions};
pub use fetcher::SecretFetcher;
pub use identity::Identity;
pub use store::{
    ClusterConnector, GatewaySecret, KubeConnector, KubeSecretStore, MemorySecretStore, SecretStore,
};
pub use token::{new_plugins, GoogleTokenExchange, TokenExchanger, GOOGLE_TOKEN_EXCHANGE};

/// Errors that can occur in sidecar-identity operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid SPIFFE URI format.
    #[error("invalid SPIFFE URI: {0}")]
    InvalidSpiffeUri(String),

    /// Certificate parsing error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// CSR generation error.
    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    /// The CA client could not be constructed.
    #[error("CA client configuration failed: {0}")]
    CaClient(String),

    /// The CA rejected the request or could not be reached.
    #[error("CA request failed: {0}")]
    CaRequest(String),

    /// The CA answered with an empty certificate chain.
    #[error("chain returned from CA is empty")]
    EmptyResponse,

    /// Exchanging the platform token for a CA credential failed.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The requested secret is not known to the fetcher.
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// The cluster API could not be reached.
    #[error("cluster client error: {0}")]
    Cluster(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for sidecar-identity operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Resolves once `stop` is raised or its sender is gone.
pub async fn stopped(stop: &mut tokio::sync::watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
