//! Agent configuration.
//!
//! Three records come in from the process entry point:
//!
//! - [`ProxyConfig`] - mesh-level settings shared with the proxy
//! - [`AgentConfig`] - knobs of the agent process itself
//! - [`SecurityOptions`] - everything the CA and cache wiring needs
//!
//! `SecurityOptions` is completed once by [`crate::Agent::new`] and frozen
//! behind an `Arc` afterwards.

use crate::trust::TrustPaths;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Workload SDS socket. Must live in a writable directory.
pub const LOCAL_SDS: &str = "./etc/istio/proxy/SDS";

/// Gateway SDS socket. Its parent directory existing signals a gateway.
pub const GATEWAY_SDS_UDS_PATH: &str = "./var/run/ingress_gateway/sds";

/// Secret served when a gateway asks for a name that does not exist.
pub const GATEWAY_FALLBACK_SECRET: &str = "gateway-fallback";

pub const DEFAULT_RECYCLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Mounted workload certificates directory.
pub const DEFAULT_CERT_DIR: &str = "./etc/certs";

pub const DEFAULT_JWT_PATH: &str = "./var/run/secrets/tokens/istio-token";

pub const DEFAULT_SYSTEM_NAMESPACE: &str = "istio-system";

/// How the proxy authenticates to the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthenticationPolicy {
    #[default]
    None,
    MutualTls,
}

impl FromStr for AuthenticationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "" | "NONE" => Ok(Self::None),
            "MUTUAL_TLS" => Ok(Self::MutualTls),
            other => Err(Error::Config(format!(
                "unknown control plane auth policy {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `host:port` of the discovery server.
    pub discovery_address: String,
    pub control_plane_auth_policy: AuthenticationPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Local listener for the discovery relay; disabled when `None`.
    pub local_xds_addr: Option<String>,
    /// The discovery server presents a publicly trusted certificate.
    pub plain_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityOptions {
    /// Explicit CA endpoint; empty selects the default.
    pub ca_endpoint: String,
    /// `Citadel` or `GoogleCA`.
    pub ca_provider: String,
    /// Who issued the control plane's certificate: `istiod`, `kubernetes`, `custom`.
    pub pilot_cert_provider: String,
    /// Provisioning certificate directory.
    pub prov_cert: Option<PathBuf>,
    pub file_mounted_certs: bool,
    pub cluster_id: String,
    pub trust_domain: String,
    pub pod_namespace: String,
    pub service_account: String,
    pub jwt_path: PathBuf,
    pub use_local_jwt: bool,
    /// Derived from the control plane auth policy.
    pub tls_enabled: bool,
    pub system_namespace: String,
    pub secret_ttl: Duration,
    pub recycle_interval: Duration,
    pub workload_uds_path: PathBuf,
    pub gateway_uds_path: PathBuf,
    pub cert_dir: PathBuf,
    pub trust_paths: TrustPaths,
    pub token_exchanger_plugins: Vec<String>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            ca_endpoint: String::new(),
            ca_provider: "Citadel".to_string(),
            pilot_cert_provider: "istiod".to_string(),
            prov_cert: None,
            file_mounted_certs: false,
            cluster_id: String::new(),
            trust_domain: "cluster.local".to_string(),
            pod_namespace: "default".to_string(),
            service_account: "default".to_string(),
            jwt_path: PathBuf::from(DEFAULT_JWT_PATH),
            use_local_jwt: true,
            tls_enabled: false,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            secret_ttl: Duration::from_secs(24 * 60 * 60),
            recycle_interval: Duration::ZERO,
            workload_uds_path: PathBuf::from(LOCAL_SDS),
            gateway_uds_path: PathBuf::from(GATEWAY_SDS_UDS_PATH),
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            trust_paths: TrustPaths::default(),
            token_exchanger_plugins: Vec::new(),
        }
    }
}
