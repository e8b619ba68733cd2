//! Secret cache serving certificates to the local proxy.
//!
//! Resources are keyed by name:
//!
//! - `default` - the workload's own certificate chain and key
//! - `ROOTCA` - the root bundle used to validate peers
//! - anything else - a gateway secret name; a `-cacert` suffix asks for the
//!   CA part of that secret only
//!
//! Workload and root items are cached until the leaf expires. Gateway items
//! are re-read from the store on every request since the store already
//! follows the cluster. Whenever a cached entry changes, the notify callback
//! is invoked with the resource name so the server can push the update.

use crate::ca::CaClient;
use crate::certificate::Certificate;
use crate::csr::CsrOptions;
use crate::fetcher::SecretFetcher;
use crate::identity::Identity;
use crate::token::TokenExchanger;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Resource name of the workload certificate.
pub const WORKLOAD_RESOURCE: &str = "default";

/// Resource name of the root bundle.
pub const ROOT_RESOURCE: &str = "ROOTCA";

const CA_ONLY_SUFFIX: &str = "-cacert";

/// Called with the resource name whenever a cached secret changes.
pub type NotifyFn = Arc<dyn Fn(&str) + Send + Sync>;

/// File names inside the mounted certificate directory.
pub const CERT_CHAIN_FILE: &str = "cert-chain.pem";
pub const KEY_FILE: &str = "key.pem";
pub const ROOT_CERT_FILE: &str = "root-cert.pem";

#[derive(Clone)]
pub struct CacheOptions {
    pub trust_domain: String,
    pub namespace: String,
    pub service_account: String,
    /// Platform JWT presented to the CA.
    pub jwt_path: PathBuf,
    pub use_local_jwt: bool,
    /// Serve the certificates found in `cert_dir` instead of signing.
    pub file_mounted_certs: bool,
    pub cert_dir: PathBuf,
    pub secret_ttl: Duration,
    /// Applied to the JWT in order before each CSR.
    pub token_exchangers: Vec<Arc<dyn TokenExchanger>>,
    /// Root the CA connection was pinned to, used when the CA omits its root.
    pub root_cert: Option<Vec<u8>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            trust_domain: crate::identity::DEFAULT_TRUST_DOMAIN.to_string(),
            namespace: "default".to_string(),
            service_account: "default".to_string(),
            jwt_path: PathBuf::from("./var/run/secrets/tokens/istio-token"),
            use_local_jwt: true,
            file_mounted_certs: false,
            cert_dir: PathBuf::from("./etc/certs"),
            secret_ttl: Duration::from_secs(24 * 60 * 60),
            token_exchangers: Vec::new(),
            root_cert: None,
        }
    }
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("trust_domain", &self.trust_domain)
            .field("namespace", &self.namespace)
            .field("service_account", &self.service_account)
            .field("jwt_path", &self.jwt_path)
            .field("use_local_jwt", &self.use_local_jwt)
            .field("file_mounted_certs", &self.file_mounted_certs)
            .field("cert_dir", &self.cert_dir)
            .field("secret_ttl", &self.secret_ttl)
            .field(
                "token_exchangers",
                &self
                    .token_exchangers
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>(),
            )
            .field("root_cert", &self.root_cert.as_ref().map(Vec::len))
            .finish()
    }
}

/// One served secret. PEM strings; empty when a part does not apply.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SecretItem {
    pub resource_name: String,
    pub certificate_chain: String,
    pub private_key: String,
    pub root_cert: String,
    pub expire_time: Option<DateTime<Utc>>,
}

impl SecretItem {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.is_some_and(|expiry| expiry <= now)
    }
}

impl std::fmt::Debug for SecretItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretItem")
            .field("resource_name", &self.resource_name)
            .field("certificate_chain_len", &self.certificate_chain.len())
            .field("private_key", &"[REDACTED]")
            .field("root_cert_len", &self.root_cert.len())
            .field("expire_time", &self.expire_time)
            .finish()
    }
}

pub struct SecretCache {
    fetcher: SecretFetcher,
    notify: NotifyFn,
    options: CacheOptions,
    secrets: RwLock<HashMap<String, Arc<SecretItem>>>,
    /// Held while a cacheable item is produced so concurrent requests share one issuance.
    issuing: Mutex<()>,
}

impl SecretCache {
    pub fn new(fetcher: SecretFetcher, notify: NotifyFn, options: CacheOptions) -> Self {
        Self {
            fetcher,
            notify,
            options,
            secrets: RwLock::new(HashMap::new()),
            issuing: Mutex::new(()),
        }
    }

    pub fn fetcher(&self) -> &SecretFetcher {
        &self.fetcher
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Returns the secret for `resource_name`, producing it if absent or expired.
    pub async fn generate_secret(&self, resource_name: &str) -> Result<Arc<SecretItem>> {
        if self.fetcher.has_store() {
            let item = Arc::new(self.produce(resource_name).await?);
            self.store_item(item.clone()).await;
            return Ok(item);
        }

        if let Some(item) = self.cached(resource_name).await {
            return Ok(item);
        }
        let _issuing = self.issuing.lock().await;
        if let Some(item) = self.cached(resource_name).await {
            return Ok(item);
        }
        let item = Arc::new(self.produce(resource_name).await?);
        self.store_item(item.clone()).await;
        Ok(item)
    }

    /// Names of the resources currently cached.
    pub async fn cached_resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.secrets.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn cached(&self, resource_name: &str) -> Option<Arc<SecretItem>> {
        let secrets = self.secrets.read().await;
        secrets
            .get(resource_name)
            .filter(|item| !item.is_expired(Utc::now()))
            .cloned()
    }

    async fn store_item(&self, item: Arc<SecretItem>) {
        let changed = {
            let mut secrets = self.secrets.write().await;
            let previous = secrets.insert(item.resource_name.clone(), item.clone());
            previous.is_some_and(|previous| previous != item)
        };
        if changed {
            debug!(resource = %item.resource_name, "secret changed, notifying");
            (self.notify)(&item.resource_name);
        }
    }

    async fn produce(&self, resource_name: &str) -> Result<SecretItem> {
        if self.options.file_mounted_certs {
            return self.read_mounted(resource_name).await;
        }
        if self.fetcher.use_ca_client {
            match resource_name {
                WORKLOAD_RESOURCE => return self.sign_workload().await,
                ROOT_RESOURCE => return self.root_from_workload().await,
                _ => {}
            }
        }
        if self.fetcher.has_store() {
            return self.gateway_item(resource_name);
        }
        Err(Error::SecretNotFound(resource_name.to_string()))
    }

    async fn read_mounted(&self, resource_name: &str) -> Result<SecretItem> {
        let dir = &self.options.cert_dir;
        let root_cert = match tokio::fs::read_to_string(dir.join(ROOT_CERT_FILE)).await {
            Ok(root) => root,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        match resource_name {
            WORKLOAD_RESOURCE => {
                let certificate_chain = tokio::fs::read_to_string(dir.join(CERT_CHAIN_FILE)).await?;
                let private_key = tokio::fs::read_to_string(dir.join(KEY_FILE)).await?;
                let expire_time = Some(leaf_expiry(&certificate_chain)?);
                info!(dir = %dir.display(), "serving file-mounted workload certificate");
                Ok(SecretItem {
                    resource_name: resource_name.to_string(),
                    certificate_chain,
                    private_key,
                    root_cert,
                    expire_time,
                })
            }
            ROOT_RESOURCE if !root_cert.is_empty() => Ok(SecretItem {
                resource_name: resource_name.to_string(),
                certificate_chain: String::new(),
                private_key: String::new(),
                root_cert,
                expire_time: None,
            }),
            _ => Err(Error::SecretNotFound(resource_name.to_string())),
        }
    }

    async fn sign_workload(&self) -> Result<SecretItem> {
        let ca = self.fetcher.ca_client.as_ref().ok_or_else(|| {
            Error::Internal("fetcher is marked to use a CA client but has none".to_string())
        })?;

        let identity = Identity::new(
            self.options.trust_domain.as_str(),
            self.options.namespace.as_str(),
            self.options.service_account.as_str(),
        )?;
        let cert_sign = CsrOptions::new(identity.to_spiffe_uri()).generate()?;
        let token = self.exchange_token(self.read_token().await?).await?;

        let chain = ca
            .csr_sign(cert_sign.csr(), &token, self.options.secret_ttl)
            .await?;
        self.workload_item(ca.as_ref(), &identity, chain, cert_sign.private_key())
    }

    fn workload_item(
        &self,
        ca: &dyn CaClient,
        identity: &Identity,
        chain: Vec<String>,
        private_key: &str,
    ) -> Result<SecretItem> {
        let leaf = chain.first().ok_or(Error::EmptyResponse)?;
        let expire_time = Certificate::from_pem(leaf)?.not_after()?;

        let root_cert = match chain.as_slice() {
            [_, .., root] => root.clone(),
            _ => self
                .options
                .root_cert
                .as_deref()
                .map(|root| String::from_utf8_lossy(root).into_owned())
                .unwrap_or_default(),
        };

        info!(
            identity = %identity,
            provider = ca.provider(),
            expires = %expire_time,
            "issued workload certificate"
        );

        Ok(SecretItem {
            resource_name: WORKLOAD_RESOURCE.to_string(),
            certificate_chain: concat_pem(&chain),
            private_key: private_key.to_string(),
            root_cert,
            expire_time: Some(expire_time),
        })
    }

    async fn root_from_workload(&self) -> Result<SecretItem> {
        let workload = match self.cached(WORKLOAD_RESOURCE).await {
            Some(item) => item,
            None => {
                let item = Arc::new(self.sign_workload().await?);
                self.store_item(item.clone()).await;
                item
            }
        };
        if workload.root_cert.is_empty() {
            return Err(Error::SecretNotFound(ROOT_RESOURCE.to_string()));
        }
        Ok(SecretItem {
            resource_name: ROOT_RESOURCE.to_string(),
            certificate_chain: String::new(),
            private_key: String::new(),
            root_cert: workload.root_cert.clone(),
            expire_time: workload.expire_time,
        })
    }

    fn gateway_item(&self, resource_name: &str) -> Result<SecretItem> {
        let not_found = || Error::SecretNotFound(resource_name.to_string());

        if let Some(secret_name) = resource_name.strip_suffix(CA_ONLY_SUFFIX) {
            let secret = self
                .fetcher
                .find_gateway_secret(secret_name)
                .filter(|s| !s.ca_cert.is_empty())
                .ok_or_else(not_found)?;
            return Ok(SecretItem {
                resource_name: resource_name.to_string(),
                certificate_chain: String::new(),
                private_key: String::new(),
                root_cert: String::from_utf8_lossy(&secret.ca_cert).into_owned(),
                expire_time: None,
            });
        }

        let secret = self
            .fetcher
            .find_gateway_secret(resource_name)
            .filter(|s| s.has_server_cert())
            .ok_or_else(not_found)?;
        let certificate_chain = String::from_utf8_lossy(&secret.certificate_chain).into_owned();
        Ok(SecretItem {
            resource_name: resource_name.to_string(),
            expire_time: leaf_expiry(&certificate_chain).ok(),
            certificate_chain,
            private_key: String::from_utf8_lossy(&secret.private_key).into_owned(),
            root_cert: String::from_utf8_lossy(&secret.ca_cert).into_owned(),
        })
    }

    async fn read_token(&self) -> Result<String> {
        if !self.options.use_local_jwt {
            return Ok(String::new());
        }
        let token = tokio::fs::read_to_string(&self.options.jwt_path)
            .await
            .map_err(|e| {
                Error::CaRequest(format!(
                    "failed to read JWT {}: {e}",
                    self.options.jwt_path.display()
                ))
            })?;
        Ok(token.trim().to_string())
    }

    async fn exchange_token(&self, mut token: String) -> Result<String> {
        for exchanger in &self.options.token_exchangers {
            token = exchanger
                .exchange_token(&self.options.trust_domain, &token)
                .await?;
            debug!(plugin = exchanger.name(), "token exchanged");
        }
        Ok(token)
    }
}

impl std::fmt::Debug for SecretCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCache")
            .field("fetcher", &self.fetcher)
            .field("options", &self.options)
            .finish()
    }
}

fn leaf_expiry(chain_pem: &str) -> Result<DateTime<Utc>> {
    crate::certificate::parse_cert_chain_pem(chain_pem.as_bytes())?
        .first()
        .ok_or_else(|| Error::Certificate("certificate chain is empty".to_string()))?
        .not_after()
}

fn concat_pem(chain: &[String]) -> String {
    chain.iter().fold(String::new(), |mut out, pem| {
        out.push_str(pem);
        if !pem.ends_with('\n') {
            out.push('\n');
        }
        out
    })
}
