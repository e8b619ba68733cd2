//! Agent bootstrap.
//!
//! The [`Agent`] completes the security options once, builds the secret
//! caches in dependency order and starts the local servers:
//!
//! ```text
//! Configured --start--> Started --stop--> Stopped
//!      \________________stop_______________/
//! ```

use crate::config::{
    AgentConfig, AuthenticationPolicy, ProxyConfig, SecurityOptions, DEFAULT_RECYCLE_INTERVAL,
    LOCAL_SDS,
};
use crate::error::{Error, Result};
use crate::sds::{SdsServer, SecretUpdates};
use crate::secrets::{
    gateway_sds_exists, new_gateway_secret_cache, new_workload_secret_cache, WorkloadSecrets,
};
use crate::trust::{find_root_ca_for_xds, CertProvider, XdsRootInputs};
use crate::xds::XdsProxy;
use sidecar_identity::{CaClient, ClusterConnector, KubeConnector, SecretCache};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Configured,
    Started,
    Stopped,
}

pub struct Agent {
    proxy_config: ProxyConfig,
    agent_config: AgentConfig,
    sec_opts: Arc<SecurityOptions>,
    connector: Arc<dyn ClusterConnector>,
    updates: SecretUpdates,
    workload: Option<WorkloadSecrets>,
    gateway_cache: Option<Arc<SecretCache>>,
    xds_proxy: Option<XdsProxy>,
    state: Lifecycle,
    stop_tx: watch::Sender<bool>,
    gateway_stop_tx: Option<watch::Sender<bool>>,
}

impl Agent {
    /// Completes `sec_opts` from the proxy and agent configuration and
    /// freezes it.
    pub fn new(
        proxy_config: ProxyConfig,
        agent_config: AgentConfig,
        mut sec_opts: SecurityOptions,
    ) -> Self {
        if sec_opts.recycle_interval.is_zero() {
            sec_opts.recycle_interval = DEFAULT_RECYCLE_INTERVAL;
        }
        if sec_opts.workload_uds_path.as_os_str().is_empty() {
            sec_opts.workload_uds_path = PathBuf::from(LOCAL_SDS);
        }
        // The control plane doubles as CA unless one is configured.
        if sec_opts.ca_endpoint.is_empty() {
            sec_opts.ca_endpoint = proxy_config.discovery_address.clone();
        }
        sec_opts.tls_enabled =
            proxy_config.control_plane_auth_policy == AuthenticationPolicy::MutualTls;
        sec_opts.use_local_jwt = !sec_opts.file_mounted_certs;

        let (stop_tx, _) = watch::channel(false);
        Self {
            proxy_config,
            agent_config,
            sec_opts: Arc::new(sec_opts),
            connector: Arc::new(KubeConnector),
            updates: SecretUpdates::new(),
            workload: None,
            gateway_cache: None,
            xds_proxy: None,
            state: Lifecycle::Configured,
            stop_tx,
            gateway_stop_tx: None,
        }
    }

    /// Replaces the cluster connector used for gateway secrets.
    pub fn with_cluster_connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Uses an already built workload cache instead of building one.
    pub fn with_workload_secrets(mut self, secrets: WorkloadSecrets) -> Self {
        self.workload = Some(secrets);
        self
    }

    /// Builds the workload cache unless one exists.
    pub fn ensure_workload_secrets(&mut self) -> Result<&WorkloadSecrets> {
        if self.workload.is_none() {
            let secrets = new_workload_secret_cache(&self.sec_opts, self.updates.notify_fn())?;
            self.workload = Some(secrets);
        }
        self.workload
            .as_ref()
            .ok_or_else(|| Error::InvalidState("workload secrets missing".to_string()))
    }

    /// Builds the caches, starts the SDS server and the discovery relay.
    ///
    /// A gateway cache is built only for non-sidecar deployments whose
    /// gateway socket directory exists.
    pub async fn start(&mut self, is_sidecar: bool, pod_namespace: &str) -> Result<SdsServer> {
        if self.state != Lifecycle::Configured {
            return Err(Error::InvalidState(format!(
                "cannot start an agent in state {:?}",
                self.state
            )));
        }

        let workload = self.ensure_workload_secrets()?.cache.clone();

        if !is_sidecar && gateway_sds_exists(&self.sec_opts.gateway_uds_path) {
            let (gateway_tx, gateway_rx) = watch::channel(false);
            let cache = new_gateway_secret_cache(
                &self.sec_opts,
                pod_namespace,
                self.connector.as_ref(),
                self.updates.notify_fn(),
                gateway_rx,
            )
            .await?;
            self.gateway_stop_tx = Some(gateway_tx);
            self.gateway_cache = Some(cache);
        }

        let server = SdsServer::new(
            &self.sec_opts,
            workload.clone(),
            self.gateway_cache.clone(),
            self.updates.clone(),
        );
        server.start().await?;

        let relay = XdsProxy::start(
            &self.proxy_config,
            &self.agent_config,
            workload,
            self.stop_tx.subscribe(),
        )
        .await;
        let relay = match relay {
            Ok(relay) => relay,
            Err(e) => {
                server.stop();
                return Err(e);
            }
        };
        self.xds_proxy = Some(relay);

        self.state = Lifecycle::Started;
        info!(
            sidecar = is_sidecar,
            gateway = self.gateway_cache.is_some(),
            sds = %self.sec_opts.workload_uds_path.display(),
            "agent started"
        );
        Ok(server)
    }

    /// Signals background tasks to stop. Does not wait for them.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(gateway) = &self.gateway_stop_tx {
            let _ = gateway.send(true);
        }
        self.state = Lifecycle::Stopped;
        info!("agent stopped");
    }

    /// Root CA file for the proxy's connection to the discovery server.
    pub fn find_root_ca_for_xds(&self) -> PathBuf {
        let provider = CertProvider::parse(&self.sec_opts.pilot_cert_provider);
        find_root_ca_for_xds(&XdsRootInputs {
            plain_tls: self.agent_config.plain_tls,
            discovery_address: &self.proxy_config.discovery_address,
            provider: &provider,
            prov_cert: self.sec_opts.prov_cert.as_deref(),
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state
    }

    pub fn security_options(&self) -> &Arc<SecurityOptions> {
        &self.sec_opts
    }

    pub fn proxy_config(&self) -> &ProxyConfig {
        &self.proxy_config
    }

    pub fn workload_cache(&self) -> Option<&Arc<SecretCache>> {
        self.workload.as_ref().map(|w| &w.cache)
    }

    pub fn gateway_cache(&self) -> Option<&Arc<SecretCache>> {
        self.gateway_cache.as_ref()
    }

    pub fn ca_client(&self) -> Option<&Arc<dyn CaClient>> {
        self.workload.as_ref().and_then(|w| w.ca_client.as_ref())
    }

    /// Root the CA connection was pinned to.
    pub fn root_cert(&self) -> Option<&[u8]> {
        self.workload.as_ref().and_then(|w| w.root_cert.as_deref())
    }

    pub fn xds_proxy(&self) -> Option<&XdsProxy> {
        self.xds_proxy.as_ref()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("state", &self.state)
            .field("sec_opts", &self.sec_opts)
            .field("workload", &self.workload)
            .field("gateway", &self.gateway_cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GATEWAY_FALLBACK_SECRET;
    use crate::trust::SYSTEM_CA_BUNDLE;
    use async_trait::async_trait;
    use sidecar_identity::ca::mock::SelfSignedCa;
    use sidecar_identity::{MemorySecretStore, SecretFetcher, SecretStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ClusterConnector for CountingConnector {
        async fn connect(&self, _namespace: &str) -> sidecar_identity::Result<Arc<dyn SecretStore>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MemorySecretStore::new()))
        }
    }

    fn options_in(dir: &TempDir) -> SecurityOptions {
        SecurityOptions {
            workload_uds_path: dir.path().join("proxy/SDS"),
            gateway_uds_path: dir.path().join("ingress_gateway/sds"),
            cert_dir: dir.path().join("certs"),
            ..SecurityOptions::default()
        }
    }

    fn mock_secrets(dir: &TempDir) -> WorkloadSecrets {
        let ca: Arc<dyn CaClient> = Arc::new(SelfSignedCa::new("cluster.local").unwrap());
        let jwt_path = dir.path().join("token");
        std::fs::write(&jwt_path, "jwt").unwrap();
        let cache = SecretCache::new(
            SecretFetcher::with_ca_client(ca.clone()),
            Arc::new(|_: &str| {}),
            sidecar_identity::CacheOptions {
                jwt_path,
                ..Default::default()
            },
        );
        WorkloadSecrets {
            cache: Arc::new(cache),
            ca_client: Some(ca),
            root_cert: None,
        }
    }

    #[test]
    fn test_new_completes_options() {
        let agent = Agent::new(
            ProxyConfig {
                discovery_address: "istiod.istio-system.svc:15012".to_string(),
                control_plane_auth_policy: AuthenticationPolicy::MutualTls,
            },
            AgentConfig::default(),
            SecurityOptions {
                workload_uds_path: PathBuf::new(),
                file_mounted_certs: true,
                ..SecurityOptions::default()
            },
        );
        let opts = agent.security_options();
        assert_eq!(opts.recycle_interval, DEFAULT_RECYCLE_INTERVAL);
        assert_eq!(opts.workload_uds_path, PathBuf::from(LOCAL_SDS));
        assert!(opts.tls_enabled);
        assert!(!opts.use_local_jwt);
        assert_eq!(opts.ca_endpoint, "istiod.istio-system.svc:15012");
        assert_eq!(agent.lifecycle(), Lifecycle::Configured);
    }

    #[test]
    fn test_new_keeps_explicit_recycle_interval() {
        let agent = Agent::new(
            ProxyConfig::default(),
            AgentConfig::default(),
            SecurityOptions {
                recycle_interval: Duration::from_secs(30),
                ..SecurityOptions::default()
            },
        );
        assert_eq!(agent.security_options().recycle_interval, Duration::from_secs(30));
        assert!(!agent.security_options().tls_enabled);
        assert!(agent.security_options().use_local_jwt);
    }

    #[test]
    fn test_ca_endpoint_from_discovery() {
        let agent = Agent::new(
            ProxyConfig {
                discovery_address: "istiod.example:15012".to_string(),
                ..ProxyConfig::default()
            },
            AgentConfig::default(),
            SecurityOptions::default(),
        );
        assert_eq!(agent.security_options().ca_endpoint, "istiod.example:15012");

        let explicit = Agent::new(
            ProxyConfig {
                discovery_address: "istiod.example:15012".to_string(),
                ..ProxyConfig::default()
            },
            AgentConfig::default(),
            SecurityOptions {
                ca_endpoint: "ca.example:15012".to_string(),
                ..SecurityOptions::default()
            },
        );
        assert_eq!(explicit.security_options().ca_endpoint, "ca.example:15012");

        // No discovery address: the default endpoint rule applies.
        let bare = Agent::new(ProxyConfig::default(), AgentConfig::default(), SecurityOptions::default());
        assert!(bare.security_options().ca_endpoint.is_empty());
    }

    #[test]
    fn test_mutual_tls_via_discovery_without_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut agent = Agent::new(
            ProxyConfig {
                discovery_address: "istiod.istio-system.svc:15012".to_string(),
                control_plane_auth_policy: AuthenticationPolicy::MutualTls,
            },
            AgentConfig::default(),
            SecurityOptions {
                trust_paths: crate::trust::TrustPaths {
                    ca_root_dir: dir.path().join("istio"),
                    k8s_ca_path: dir.path().join("k8s/ca.crt"),
                    custom_root_path: dir.path().join("custom/root-cert.pem"),
                },
                ..options_in(&dir)
            },
        );
        let err = agent.ensure_workload_secrets().unwrap_err();
        assert!(matches!(err, Error::MissingRootCert { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_ensure_workload_secrets_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut agent = Agent::new(
            ProxyConfig::default(),
            AgentConfig::default(),
            SecurityOptions {
                file_mounted_certs: true,
                ..options_in(&dir)
            },
        );
        let first = agent.ensure_workload_secrets().unwrap().cache.clone();
        let second = agent.ensure_workload_secrets().unwrap().cache.clone();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(agent.ca_client().is_none());
    }

    #[tokio::test]
    async fn test_injected_workload_secrets_are_kept() {
        let dir = TempDir::new().unwrap();
        let secrets = mock_secrets(&dir);
        let injected = secrets.cache.clone();
        let mut agent = Agent::new(ProxyConfig::default(), AgentConfig::default(), options_in(&dir))
            .with_workload_secrets(secrets);

        let server = agent.start(true, "default").await.unwrap();
        assert!(Arc::ptr_eq(agent.workload_cache().unwrap(), &injected));
        assert_eq!(agent.ca_client().unwrap().provider(), "SelfSigned");
        server.stop();
        agent.stop();
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let dir = TempDir::new().unwrap();
        let mut agent = Agent::new(ProxyConfig::default(), AgentConfig::default(), options_in(&dir))
            .with_workload_secrets(mock_secrets(&dir));

        let server = agent.start(true, "default").await.unwrap();
        assert_eq!(agent.lifecycle(), Lifecycle::Started);
        assert!(matches!(
            agent.start(true, "default").await,
            Err(Error::InvalidState(_))
        ));
        server.stop();
        agent.stop();
        assert_eq!(agent.lifecycle(), Lifecycle::Stopped);
        assert!(matches!(
            agent.start(true, "default").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_gateway_cache_requires_gateway_dir_and_non_sidecar() {
        for (is_sidecar, dir_exists, expect_gateway) in [
            (true, false, false),
            (true, true, false),
            (false, false, false),
            (false, true, true),
        ] {
            let dir = TempDir::new().unwrap();
            let opts = options_in(&dir);
            if dir_exists {
                std::fs::create_dir_all(opts.gateway_uds_path.parent().unwrap()).unwrap();
            }
            let connector = Arc::new(CountingConnector::default());
            let mut agent = Agent::new(ProxyConfig::default(), AgentConfig::default(), opts)
                .with_workload_secrets(mock_secrets(&dir))
                .with_cluster_connector(connector.clone());

            let server = agent.start(is_sidecar, "istio-system").await.unwrap();
            assert_eq!(
                agent.gateway_cache().is_some(),
                expect_gateway,
                "sidecar={is_sidecar} dir={dir_exists}"
            );
            assert_eq!(server.gateway_path().is_some(), expect_gateway);
            assert_eq!(connector.connects.load(Ordering::SeqCst), usize::from(expect_gateway));

            if let Some(gateway) = agent.gateway_cache() {
                assert_eq!(
                    gateway.fetcher().fallback_secret_name.as_deref(),
                    Some(GATEWAY_FALLBACK_SECRET)
                );
                assert!(!gateway.fetcher().use_ca_client);
            }
            server.stop();
            agent.stop();
        }
    }

    #[test]
    fn test_find_root_ca_for_xds_plain_tls() {
        let agent = Agent::new(
            ProxyConfig::default(),
            AgentConfig {
                plain_tls: true,
                ..AgentConfig::default()
            },
            SecurityOptions::default(),
        );
        assert_eq!(agent.find_root_ca_for_xds(), PathBuf::from(SYSTEM_CA_BUNDLE));
    }

    #[test]
    fn test_stop_before_start() {
        let mut agent = Agent::new(ProxyConfig::default(), AgentConfig::default(), SecurityOptions::default());
        agent.stop();
        assert_eq!(agent.lifecycle(), Lifecycle::Stopped);
    }
}
