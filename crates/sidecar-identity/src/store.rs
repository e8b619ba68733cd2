//! Gateway secret stores.
//!
//! A gateway serves certificates that operators provision as Kubernetes
//! secrets in the gateway's namespace. The store keeps an in-memory view of
//! those secrets; for Kubernetes it is fed by a watch on `Secret` objects.
//!
//! Accepted data layouts:
//!
//! ```text
//! tls.crt / tls.key [/ ca.crt]     kubernetes.io/tls style
//! cert / key [/ cacert]            generic style
//! ca.crt or cacert only            CA-only secret
//! ```

use crate::{stopped, Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const CERT_KEYS: [&str; 2] = ["tls.crt", "cert"];
const KEY_KEYS: [&str; 2] = ["tls.key", "key"];
const CA_KEYS: [&str; 2] = ["ca.crt", "cacert"];

/// Certificate material of one gateway secret. Absent parts are empty.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct GatewaySecret {
    pub certificate_chain: Vec<u8>,
    pub private_key: Vec<u8>,
    pub ca_cert: Vec<u8>,
}

impl GatewaySecret {
    /// Extracts certificate material, or `None` when the secret carries none.
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| data.get(*k))
                .map(|v| v.0.clone())
                .unwrap_or_default()
        };

        let parsed = Self {
            certificate_chain: first(&CERT_KEYS),
            private_key: first(&KEY_KEYS),
            ca_cert: first(&CA_KEYS),
        };
        let has_server = !parsed.certificate_chain.is_empty() && !parsed.private_key.is_empty();
        if has_server || !parsed.ca_cert.is_empty() {
            Some(parsed)
        } else {
            None
        }
    }

    pub fn has_server_cert(&self) -> bool {
        !self.certificate_chain.is_empty() && !self.private_key.is_empty()
    }
}

impl std::fmt::Debug for GatewaySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySecret")
            .field("certificate_chain_len", &self.certificate_chain.len())
            .field("private_key", &"[REDACTED]")
            .field("ca_cert_len", &self.ca_cert.len())
            .finish()
    }
}

/// A named collection of gateway secrets kept up to date by `run`.
#[async_trait]
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Option<GatewaySecret>;

    /// Keeps the store current until `stop` flips to `true` or its sender is dropped.
    async fn run(&self, stop: watch::Receiver<bool>);
}

/// Opens a [`SecretStore`] for a namespace of the local cluster.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, namespace: &str) -> Result<Arc<dyn SecretStore>>;
}

/// A store whose content is managed by the caller.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, GatewaySecret>>,
    /// Secrets seen since the last `Init`, swapped in at `InitDone`.
    relist: Mutex<Option<HashMap<String, GatewaySecret>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, secret: GatewaySecret) {
        self.secrets.write().insert(name.into(), secret);
    }

    pub fn remove(&self, name: &str) -> Option<GatewaySecret> {
        self.secrets.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }

    /// Applies one watcher event.
    ///
    /// A relist (`Init`, `InitApply`..., `InitDone`) replaces the whole
    /// content, so secrets deleted while the watch was down disappear.
    pub fn apply_event(&self, event: Event<Secret>) {
        match event {
            Event::Apply(secret) => self.apply(&secret),
            Event::Delete(secret) => {
                if let Some(name) = secret.metadata.name.as_deref() {
                    info!(%name, "gateway secret deleted");
                    self.remove(name);
                }
            }
            Event::Init => {
                *self.relist.lock() = Some(HashMap::new());
            }
            Event::InitApply(secret) => {
                let mut relist = self.relist.lock();
                match relist.as_mut() {
                    Some(buffer) => {
                        if let (Some(name), Some(parsed)) = (
                            secret.metadata.name.as_deref(),
                            GatewaySecret::from_secret(&secret),
                        ) {
                            buffer.insert(name.to_string(), parsed);
                        }
                    }
                    None => {
                        drop(relist);
                        self.apply(&secret);
                    }
                }
            }
            Event::InitDone => {
                if let Some(fresh) = self.relist.lock().take() {
                    let dropped = {
                        let mut secrets = self.secrets.write();
                        let dropped = secrets.keys().filter(|k| !fresh.contains_key(*k)).count();
                        *secrets = fresh;
                        dropped
                    };
                    debug!(dropped, "gateway secrets relisted");
                }
            }
        }
    }

    fn apply(&self, secret: &Secret) {
        let Some(name) = secret.metadata.name.as_deref() else {
            return;
        };
        match GatewaySecret::from_secret(secret) {
            Some(parsed) => {
                debug!(%name, "gateway secret updated");
                self.insert(name, parsed);
            }
            None => {
                if self.remove(name).is_some() {
                    debug!(%name, "gateway secret no longer carries certificates");
                }
            }
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Option<GatewaySecret> {
        self.secrets.read().get(name).cloned()
    }

    async fn run(&self, mut stop: watch::Receiver<bool>) {
        stopped(&mut stop).await;
    }
}

/// A store fed by a watch on the namespace's `Secret` objects.
pub struct KubeSecretStore {
    api: Api<Secret>,
    namespace: String,
    secrets: MemorySecretStore,
}

impl KubeSecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            secrets: MemorySecretStore::new(),
        }
    }

    fn handle_event(&self, event: std::result::Result<Event<Secret>, watcher::Error>) {
        match event {
            Ok(event) => self.secrets.apply_event(event),
            Err(e) => {
                warn!(error = %e, namespace = %self.namespace, "secret watcher error, will retry");
            }
        }
    }
}

impl std::fmt::Debug for KubeSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretStore")
            .field("namespace", &self.namespace)
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    fn get(&self, name: &str) -> Option<GatewaySecret> {
        self.secrets.get(name)
    }

    async fn run(&self, mut stop: watch::Receiver<bool>) {
        let stream = watcher::watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);

        info!(namespace = %self.namespace, "gateway secret watcher started");
        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("gateway secret watch ended");
                        break;
                    }
                },
                _ = stopped(&mut stop) => {
                    info!("gateway secret watcher shutting down");
                    break;
                }
            }
        }
    }
}

/// Connects with the in-cluster or kubeconfig credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, namespace: &str) -> Result<Arc<dyn SecretStore>> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Cluster(format!("failed to create Kubernetes client: {e}")))?;
        Ok(Arc::new(KubeSecretStore::new(client, namespace)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(name: &str, entries: &[(&str, &str)]) -> Secret {
        let data: BTreeMap<String, ByteString> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect();
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn test_tls_style_secret() {
        let parsed = GatewaySecret::from_secret(&secret(
            "gw",
            &[("tls.crt", "chain"), ("tls.key", "key"), ("ca.crt", "root")],
        ))
        .unwrap();
        assert_eq!(parsed.certificate_chain, b"chain");
        assert_eq!(parsed.private_key, b"key");
        assert_eq!(parsed.ca_cert, b"root");
        assert!(parsed.has_server_cert());
    }

    #[test]
    fn test_generic_and_ca_only_secrets() {
        let generic =
            GatewaySecret::from_secret(&secret("gw", &[("cert", "c"), ("key", "k")])).unwrap();
        assert!(generic.has_server_cert());
        assert!(generic.ca_cert.is_empty());

        let ca_only = GatewaySecret::from_secret(&secret("gw", &[("cacert", "root")])).unwrap();
        assert!(!ca_only.has_server_cert());

        assert!(GatewaySecret::from_secret(&secret("gw", &[("other", "x")])).is_none());
        assert!(GatewaySecret::from_secret(&secret("gw", &[("tls.crt", "c")])).is_none());
    }

    #[test]
    fn test_memory_store_apply() {
        let store = MemorySecretStore::new();
        store.apply(&secret("gw", &[("tls.crt", "c"), ("tls.key", "k")]));
        assert!(store.get("gw").is_some());

        store.apply(&secret("gw", &[("unrelated", "x")]));
        assert!(store.get("gw").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_relist_drops_secrets_deleted_while_disconnected() {
        let store = MemorySecretStore::new();
        store.apply_event(Event::Apply(secret("stale", &[("tls.crt", "c"), ("tls.key", "k")])));
        store.apply_event(Event::Apply(secret("kept", &[("tls.crt", "old"), ("tls.key", "k")])));

        store.apply_event(Event::Init);
        store.apply_event(Event::InitApply(secret("kept", &[("tls.crt", "new"), ("tls.key", "k")])));
        store.apply_event(Event::InitApply(secret("live", &[("cacert", "root")])));
        // Old content is served until the relist completes.
        assert!(store.get("stale").is_some());
        assert_eq!(store.get("kept").unwrap().certificate_chain, b"old");

        store.apply_event(Event::InitDone);
        assert!(store.get("stale").is_none());
        assert_eq!(store.get("kept").unwrap().certificate_chain, b"new");
        assert!(store.get("live").is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_watch_events_apply_and_delete() {
        let store = MemorySecretStore::new();
        store.apply_event(Event::Apply(secret("gw", &[("cert", "c"), ("key", "k")])));
        assert!(store.get("gw").is_some());
        store.apply_event(Event::Delete(secret("gw", &[])));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_run_returns_on_stop() {
        let store = Arc::new(MemorySecretStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let store = store.clone();
            async move { store.run(rx).await }
        });
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_debug_redacts_key() {
        let parsed =
            GatewaySecret::from_secret(&secret("gw", &[("cert", "c"), ("key", "secret")])).unwrap();
        assert!(!format!("{parsed:?}").contains("secret"));
    }
}
