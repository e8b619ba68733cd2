//! Errors raised while bootstrapping the agent.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TLS to the CA was asserted but the root certificate could not be read.
    #[error("invalid config - {endpoint} missing a root certificate {}", path.display())]
    MissingRootCert {
        endpoint: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TLS to the CA was asserted with a provider that has no known root location.
    #[error("invalid config - {endpoint} unknown certificate provider {provider:?}")]
    UnknownCertProvider { endpoint: String, provider: String },

    /// The CA client could not be built.
    #[error("failed to create CA client: {0}")]
    CaClient(#[source] sidecar_identity::Error),

    /// Credentials for the local cluster could not be obtained.
    #[error("failed to connect to the cluster for gateway secrets: {0}")]
    ClusterClient(#[source] sidecar_identity::Error),

    #[error(transparent)]
    Identity(#[from] sidecar_identity::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was called in the wrong lifecycle state.
    #[error("invalid agent state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the process must not continue after this error.
    ///
    /// Misconfiguration of the root of trust and an unreachable cluster
    /// dependency are fatal. Everything else is reported to the caller, which
    /// may still decide to exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingRootCert { .. }
                | Error::UnknownCertProvider { .. }
                | Error::ClusterClient(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
