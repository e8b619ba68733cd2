//! Secret fetcher: the source a secret cache draws from.
//!
//! A workload fetcher signs through a CA client. A gateway fetcher instead
//! reads operator-provisioned secrets from a [`SecretStore`], falling back to
//! a well-known secret name when the requested one does not exist.

use crate::ca::CaClient;
use crate::store::{GatewaySecret, SecretStore};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct SecretFetcher {
    /// Whether certificates are obtained by signing CSRs.
    pub use_ca_client: bool,
    /// Present iff `use_ca_client`.
    pub ca_client: Option<Arc<dyn CaClient>>,
    pub fallback_secret_name: Option<String>,
    namespace: Option<String>,
    store: Option<Arc<dyn SecretStore>>,
}

impl SecretFetcher {
    /// A fetcher with no CA client and no store. Certificates come from
    /// mounted files.
    pub fn new() -> Self {
        Self {
            use_ca_client: false,
            ca_client: None,
            fallback_secret_name: None,
            namespace: None,
            store: None,
        }
    }

    pub fn with_ca_client(ca_client: Arc<dyn CaClient>) -> Self {
        Self {
            use_ca_client: true,
            ca_client: Some(ca_client),
            ..Self::new()
        }
    }

    /// A gateway fetcher bound to `store` for `namespace`.
    pub fn for_gateway(
        store: Arc<dyn SecretStore>,
        namespace: impl Into<String>,
        fallback_secret_name: impl Into<String>,
    ) -> Self {
        Self {
            fallback_secret_name: Some(fallback_secret_name.into()),
            namespace: Some(namespace.into()),
            store: Some(store),
            ..Self::new()
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Spawns the store's watch loop. Returns `None` without a store.
    pub fn run(&self, stop: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let store = self.store.clone()?;
        Some(tokio::spawn(async move { store.run(stop).await }))
    }

    /// Looks up `name`, then the fallback secret.
    pub fn find_gateway_secret(&self, name: &str) -> Option<GatewaySecret> {
        let store = self.store.as_ref()?;
        if let Some(secret) = store.get(name) {
            return Some(secret);
        }
        let fallback = self.fallback_secret_name.as_deref()?;
        let secret = store.get(fallback)?;
        debug!(requested = %name, fallback = %fallback, "using fallback gateway secret");
        Some(secret)
    }
}

impl Default for SecretFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecretFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretFetcher")
            .field("use_ca_client", &self.use_ca_client)
            .field(
                "ca_client",
                &self.ca_client.as_ref().map(|client| client.provider()),
            )
            .field("fallback_secret_name", &self.fallback_secret_name)
            .field("namespace", &self.namespace)
            .finish()
    }
}
