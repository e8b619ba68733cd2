//! Secret cache wiring.
//!
//! The workload cache is always built. Its CA client is constructed before
//! the fetcher, and the fetcher before the cache, so no cache is ever handed
//! out without a ready client behind it. The gateway cache is optional and
//! reads cluster secrets instead of signing.

use crate::ca_factory::{CaClientConfig, CaProvider};
use crate::config::{SecurityOptions, GATEWAY_FALLBACK_SECRET};
use crate::error::{Error, Result};
use crate::trust::{self, CertProvider, TrustSignals};
use sidecar_identity::{
    new_plugins, CaClient, CacheOptions, ClusterConnector, NotifyFn, SecretCache, SecretFetcher,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// The workload cache with the client and root it was wired to.
pub struct WorkloadSecrets {
    pub cache: Arc<SecretCache>,
    /// `None` in file-mounted mode.
    pub ca_client: Option<Arc<dyn CaClient>>,
    pub root_cert: Option<Vec<u8>>,
}

impl std::fmt::Debug for WorkloadSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadSecrets")
            .field("cache", &self.cache)
            .field("ca_client", &self.ca_client.as_ref().map(|c| c.provider()))
            .field("root_cert_len", &self.root_cert.as_ref().map(Vec::len))
            .finish()
    }
}

/// Trust signals as configured in `opts`.
pub fn trust_signals(opts: &SecurityOptions) -> TrustSignals {
    TrustSignals {
        ca_endpoint: Some(opts.ca_endpoint.clone()),
        provider: CertProvider::parse(&opts.pilot_cert_provider),
        tls_enabled: opts.tls_enabled,
        system_namespace: opts.system_namespace.clone(),
    }
}

fn cache_options(opts: &SecurityOptions) -> CacheOptions {
    CacheOptions {
        trust_domain: opts.trust_domain.clone(),
        namespace: opts.pod_namespace.clone(),
        service_account: opts.service_account.clone(),
        jwt_path: opts.jwt_path.clone(),
        use_local_jwt: opts.use_local_jwt,
        file_mounted_certs: opts.file_mounted_certs,
        cert_dir: opts.cert_dir.clone(),
        secret_ttl: opts.secret_ttl,
        token_exchangers: Vec::new(),
        root_cert: None,
    }
}

/// Builds the workload secret cache.
///
/// In file-mounted mode no CA client is created; certificates are read from
/// the mounted directory. Otherwise the provider is selected, the trust
/// policy resolved (Citadel only) and the client built.
pub fn new_workload_secret_cache(
    opts: &SecurityOptions,
    notify: NotifyFn,
) -> Result<WorkloadSecrets> {
    if opts.file_mounted_certs {
        info!(dir = %opts.cert_dir.display(), "using file-mounted certificates, no CA client");
        let cache = SecretCache::new(SecretFetcher::new(), notify, cache_options(opts));
        return Ok(WorkloadSecrets {
            cache: Arc::new(cache),
            ca_client: None,
            root_cert: None,
        });
    }

    let config = match CaProvider::select(&opts.ca_provider, &opts.ca_endpoint) {
        CaProvider::GoogleCa => CaClientConfig::google(&opts.ca_endpoint),
        CaProvider::Citadel => {
            let paths = opts
                .trust_paths
                .clone()
                .with_provisioning_dir(opts.prov_cert.as_deref(), &opts.cert_dir);
            let policy = trust::resolve(&trust_signals(opts), &paths)?;
            CaClientConfig::citadel(&policy, &opts.cluster_id)
        }
    };
    let ca_client = config.build()?;

    let mut plugins = config.token_exchanger_plugins.clone();
    for name in &opts.token_exchanger_plugins {
        if !plugins.contains(name) {
            plugins.push(name.clone());
        }
    }

    let fetcher = SecretFetcher::with_ca_client(ca_client.clone());
    let options = CacheOptions {
        token_exchangers: new_plugins(&plugins),
        root_cert: config.root_cert.clone(),
        ..cache_options(opts)
    };
    let cache = SecretCache::new(fetcher, notify, options);

    Ok(WorkloadSecrets {
        cache: Arc::new(cache),
        ca_client: Some(ca_client),
        root_cert: config.root_cert,
    })
}

/// Whether a gateway SDS endpoint is expected: the socket's directory exists.
pub fn gateway_sds_exists(uds_path: &Path) -> bool {
    uds_path
        .parent()
        .is_some_and(|dir| !dir.as_os_str().is_empty() && dir.exists())
}

/// Builds the gateway cache backed by the namespace's cluster secrets.
///
/// The store's watch loop is spawned on `stop`, which is independent of the
/// agent's own stop signal. Failing to reach the cluster is fatal.
pub async fn new_gateway_secret_cache(
    opts: &SecurityOptions,
    namespace: &str,
    connector: &dyn ClusterConnector,
    notify: NotifyFn,
    stop: watch::Receiver<bool>,
) -> Result<Arc<SecretCache>> {
    let store = connector.connect(namespace).await.map_err(|e| {
        error!(error = %e, namespace = %namespace, "cannot create cluster client for gateway secrets");
        Error::ClusterClient(e)
    })?;

    let fetcher = SecretFetcher::for_gateway(store, namespace, GATEWAY_FALLBACK_SECRET);
    // The watch task ends on its own once `stop` is raised.
    let _watch = fetcher.run(stop);

    let options = CacheOptions {
        file_mounted_certs: false,
        use_local_jwt: false,
        ..cache_options(opts)
    };
    info!(namespace = %namespace, "gateway secret cache ready");
    Ok(Arc::new(SecretCache::new(fetcher, notify, options)))
}
