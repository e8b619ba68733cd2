//! Root-of-trust resolution for the CA connection.
//!
//! Given the environment signals, decides whether the connection to the CA
//! uses TLS, which root bundle pins the CA's identity, and which endpoint to
//! dial. The decision is an ordered rule list; the first matching rule wins:
//!
//! | rule                | matches when                      | outcome                                    |
//! |---------------------|-----------------------------------|--------------------------------------------|
//! | `DefaultEndpoint`   | no CA endpoint configured         | `istiod.<ns>.svc:15012` + provider root, else plaintext `:15010` |
//! | `InsecureDebugPort` | endpoint ends with `:15010`       | plaintext, no root                         |
//! | `PublicTlsPort`     | endpoint ends with `:443`         | TLS, system roots                          |
//! | `AssertedTls`       | control plane requires mTLS       | TLS + provider root, failure is fatal      |
//! | `AdHoc`             | anything else                     | TLS + mesh root if present, else system    |
//!
//! Ports 15010, 15012 and 443 are reserved by the mesh and must stay literal.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Plaintext port of the discovery server (debug or IP-secured networks).
pub const INSECURE_DEBUG_PORT: u16 = 15010;
/// TLS port of the discovery server.
pub const SECURE_PORT: u16 = 15012;
/// Public TLS endpoints present a certificate trusted by the system store.
pub const PUBLIC_TLS_PORT: u16 = 443;

/// File name of the mesh root in the CA root directory.
pub const ROOT_CERT_DATA_KEY: &str = "root-cert.pem";

pub const DEFAULT_CA_ROOT_DIR: &str = "./var/run/secrets/istio";
pub const K8S_CA_PATH: &str = "./var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
pub const DEFAULT_CUSTOM_ROOT_PATH: &str = "./etc/certs/custom/root-cert.pem";

/// System trust store handed to the proxy when no mesh root applies.
pub const SYSTEM_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Issuer of the control plane's serving certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertProvider {
    Istiod,
    Kubernetes,
    Custom,
    Other(String),
}

impl CertProvider {
    pub fn parse(name: &str) -> Self {
        match name {
            "istiod" => Self::Istiod,
            "kubernetes" => Self::Kubernetes,
            "custom" => Self::Custom,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Istiod => "istiod",
            Self::Kubernetes => "kubernetes",
            Self::Custom => "custom",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for CertProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known locations of root certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPaths {
    /// Directory holding `root-cert.pem` issued by the mesh.
    pub ca_root_dir: PathBuf,
    pub k8s_ca_path: PathBuf,
    pub custom_root_path: PathBuf,
}

impl Default for TrustPaths {
    fn default() -> Self {
        Self {
            ca_root_dir: PathBuf::from(DEFAULT_CA_ROOT_DIR),
            k8s_ca_path: PathBuf::from(K8S_CA_PATH),
            custom_root_path: PathBuf::from(DEFAULT_CUSTOM_ROOT_PATH),
        }
    }
}

impl TrustPaths {
    /// Switches the CA root directory to the provisioning directory (or
    /// `cert_dir` when none is set) if it holds a `root-cert.pem`.
    pub fn with_provisioning_dir(mut self, prov_cert: Option<&Path>, cert_dir: &Path) -> Self {
        let dir = prov_cert.unwrap_or(cert_dir);
        if dir.join(ROOT_CERT_DATA_KEY).exists() {
            info!(dir = %dir.display(), "using provisioned root certificate directory");
            self.ca_root_dir = dir.to_path_buf();
        }
        self
    }

    pub fn ca_root_cert(&self) -> PathBuf {
        self.ca_root_dir.join(ROOT_CERT_DATA_KEY)
    }

    /// Root location for `provider`, or `None` when the provider has none.
    pub fn provider_root(&self, provider: &CertProvider) -> Option<PathBuf> {
        match provider {
            CertProvider::Istiod => Some(self.ca_root_cert()),
            CertProvider::Kubernetes => Some(self.k8s_ca_path.clone()),
            CertProvider::Custom => Some(self.custom_root_path.clone()),
            CertProvider::Other(_) => None,
        }
    }
}

/// Environment facts the decision is made from.
#[derive(Debug, Clone)]
pub struct TrustSignals {
    /// Explicit CA endpoint; an empty string counts as absent.
    pub ca_endpoint: Option<String>,
    pub provider: CertProvider,
    /// The control plane auth policy asserts mutual TLS.
    pub tls_enabled: bool,
    pub system_namespace: String,
}

impl TrustSignals {
    fn endpoint(&self) -> Option<&str> {
        self.ca_endpoint.as_deref().filter(|ep| !ep.is_empty())
    }
}

/// Resolved CA connection policy.
#[derive(Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    pub use_tls: bool,
    /// PEM bundle pinned for the CA; `None` means the system store.
    pub root_cert: Option<Vec<u8>>,
    pub ca_endpoint: String,
}

impl fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustPolicy")
            .field("use_tls", &self.use_tls)
            .field("root_cert_len", &self.root_cert.as_ref().map(Vec::len))
            .field("ca_endpoint", &self.ca_endpoint)
            .finish()
    }
}

/// One row of the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustRule {
    DefaultEndpoint,
    InsecureDebugPort,
    PublicTlsPort,
    AssertedTls,
    AdHoc,
}

impl TrustRule {
    /// Precedence order.
    pub const ORDER: [TrustRule; 5] = [
        TrustRule::DefaultEndpoint,
        TrustRule::InsecureDebugPort,
        TrustRule::PublicTlsPort,
        TrustRule::AssertedTls,
        TrustRule::AdHoc,
    ];

    pub fn matches(self, signals: &TrustSignals) -> bool {
        let endpoint = signals.endpoint();
        match self {
            TrustRule::DefaultEndpoint => endpoint.is_none(),
            TrustRule::InsecureDebugPort => {
                endpoint.is_some_and(|ep| has_port(ep, INSECURE_DEBUG_PORT))
            }
            TrustRule::PublicTlsPort => endpoint.is_some_and(|ep| has_port(ep, PUBLIC_TLS_PORT)),
            TrustRule::AssertedTls => signals.tls_enabled,
            TrustRule::AdHoc => true,
        }
    }

    /// First rule matching `signals`. `AdHoc` always matches.
    pub fn select(signals: &TrustSignals) -> TrustRule {
        Self::ORDER
            .into_iter()
            .find(|rule| rule.matches(signals))
            .unwrap_or(TrustRule::AdHoc)
    }

    pub fn apply(self, signals: &TrustSignals, paths: &TrustPaths) -> Result<TrustPolicy> {
        let explicit = signals.endpoint().unwrap_or_default().to_string();
        match self {
            TrustRule::DefaultEndpoint => {
                let secure = istiod_endpoint(&signals.system_namespace, SECURE_PORT);
                match lookup_root(&signals.provider, paths) {
                    RootLookup::Found(root) => Ok(TrustPolicy {
                        use_tls: true,
                        root_cert: Some(root),
                        ca_endpoint: secure,
                    }),
                    failed => {
                        let insecure =
                            istiod_endpoint(&signals.system_namespace, INSECURE_DEBUG_PORT);
                        warn!(
                            provider = %signals.provider,
                            reason = %failed.describe(),
                            fallback = %insecure,
                            "root certificate unavailable, falling back to the plaintext CA endpoint"
                        );
                        Ok(TrustPolicy {
                            use_tls: false,
                            root_cert: None,
                            ca_endpoint: insecure,
                        })
                    }
                }
            }
            TrustRule::InsecureDebugPort => {
                warn!(endpoint = %explicit, "plaintext CA endpoint: debug mode or IP-secure network");
                Ok(TrustPolicy {
                    use_tls: false,
                    root_cert: None,
                    ca_endpoint: explicit,
                })
            }
            TrustRule::PublicTlsPort => Ok(TrustPolicy {
                use_tls: true,
                root_cert: None,
                ca_endpoint: explicit,
            }),
            TrustRule::AssertedTls => match lookup_root(&signals.provider, paths) {
                RootLookup::Found(root) => Ok(TrustPolicy {
                    use_tls: true,
                    root_cert: Some(root),
                    ca_endpoint: explicit,
                }),
                RootLookup::Failed { path, source } => Err(Error::MissingRootCert {
                    endpoint: explicit,
                    path,
                    source,
                }),
                RootLookup::UnknownProvider => Err(Error::UnknownCertProvider {
                    endpoint: explicit,
                    provider: signals.provider.to_string(),
                }),
            },
            TrustRule::AdHoc => {
                let path = paths.ca_root_cert();
                let root_cert = match std::fs::read(&path) {
                    Ok(root) => Some(root),
                    Err(_) => {
                        info!(path = %path.display(), "no mesh root found, using system certs");
                        None
                    }
                };
                Ok(TrustPolicy {
                    use_tls: true,
                    root_cert,
                    ca_endpoint: explicit,
                })
            }
        }
    }
}

/// Outcome of a provider-keyed root lookup.
enum RootLookup {
    Found(Vec<u8>),
    Failed { path: PathBuf, source: std::io::Error },
    UnknownProvider,
}

impl RootLookup {
    fn describe(&self) -> String {
        match self {
            RootLookup::Found(_) => "found".to_string(),
            RootLookup::Failed { path, source } => format!("{}: {source}", path.display()),
            RootLookup::UnknownProvider => "unknown certificate provider".to_string(),
        }
    }
}

fn lookup_root(provider: &CertProvider, paths: &TrustPaths) -> RootLookup {
    let Some(path) = paths.provider_root(provider) else {
        return RootLookup::UnknownProvider;
    };
    match std::fs::read(&path) {
        Ok(root) => {
            info!(provider = %provider, path = %path.display(), "loaded CA root certificate");
            RootLookup::Found(root)
        }
        Err(source) => RootLookup::Failed { path, source },
    }
}

fn has_port(endpoint: &str, port: u16) -> bool {
    endpoint.ends_with(&format!(":{port}"))
}

fn istiod_endpoint(namespace: &str, port: u16) -> String {
    format!("istiod.{namespace}.svc:{port}")
}

/// Resolves the CA connection policy.
pub fn resolve(signals: &TrustSignals, paths: &TrustPaths) -> Result<TrustPolicy> {
    let rule = TrustRule::select(signals);
    let policy = rule.apply(signals, paths)?;
    info!(
        rule = ?rule,
        endpoint = %policy.ca_endpoint,
        tls = policy.use_tls,
        pinned_root = policy.root_cert.is_some(),
        "resolved CA trust policy"
    );
    Ok(policy)
}

/// Inputs for locating the root the proxy uses on its discovery connection.
#[derive(Debug, Clone)]
pub struct XdsRootInputs<'a> {
    pub plain_tls: bool,
    pub discovery_address: &'a str,
    pub provider: &'a CertProvider,
    pub prov_cert: Option<&'a Path>,
}

/// Root CA file for the proxy's own connection to the discovery server.
pub fn find_root_ca_for_xds(inputs: &XdsRootInputs<'_>) -> PathBuf {
    if inputs.plain_tls || has_port(inputs.discovery_address, PUBLIC_TLS_PORT) {
        return PathBuf::from(SYSTEM_CA_BUNDLE);
    }
    match (inputs.provider, inputs.prov_cert) {
        (CertProvider::Istiod, _) => Path::new(DEFAULT_CA_ROOT_DIR).join(ROOT_CERT_DATA_KEY),
        (CertProvider::Kubernetes, _) => PathBuf::from(K8S_CA_PATH),
        (_, Some(prov)) => prov.join(ROOT_CERT_DATA_KEY),
        _ => PathBuf::from(SYSTEM_CA_BUNDLE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ROOT: &[u8] = b"-----BEGIN CERTIFICATE-----\nroot\n-----END CERTIFICATE-----\n";

    struct Fixture {
        _dir: TempDir,
        paths: TrustPaths,
    }

    /// Paths inside a temp dir; `with_roots` writes all three provider roots.
    fn fixture(with_roots: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = TrustPaths {
            ca_root_dir: dir.path().join("istio"),
            k8s_ca_path: dir.path().join("k8s/ca.crt"),
            custom_root_path: dir.path().join("custom/root-cert.pem"),
        };
        if with_roots {
            for path in [
                paths.ca_root_cert(),
                paths.k8s_ca_path.clone(),
                paths.custom_root_path.clone(),
            ] {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, ROOT).unwrap();
            }
        }
        Fixture { _dir: dir, paths }
    }

    fn signals(endpoint: &str, provider: &str, tls_enabled: bool) -> TrustSignals {
        TrustSignals {
            ca_endpoint: Some(endpoint.to_string()),
            provider: CertProvider::parse(provider),
            tls_enabled,
            system_namespace: "istio-system".to_string(),
        }
    }

    const PROVIDERS: [&str; 3] = ["istiod", "kubernetes", "custom"];

    #[test]
    fn test_default_endpoint_with_readable_root() {
        let fx = fixture(true);
        for provider in PROVIDERS {
            let policy = resolve(&signals("", provider, false), &fx.paths).unwrap();
            assert!(policy.use_tls, "{provider}");
            assert_eq!(policy.root_cert.as_deref(), Some(ROOT), "{provider}");
            assert_eq!(policy.ca_endpoint, "istiod.istio-system.svc:15012");
        }
    }

    #[test]
    fn test_default_endpoint_with_unreadable_root_degrades() {
        let fx = fixture(false);
        for provider in PROVIDERS {
            let policy = resolve(&signals("", provider, true), &fx.paths).unwrap();
            assert!(!policy.use_tls, "{provider}");
            assert!(policy.root_cert.is_none(), "{provider}");
            assert_eq!(policy.ca_endpoint, "istiod.istio-system.svc:15010");
        }
    }

    #[test]
    fn test_default_endpoint_unknown_provider_degrades() {
        let fx = fixture(true);
        let policy = resolve(&signals("", "vault", false), &fx.paths).unwrap();
        assert!(!policy.use_tls);
        assert!(policy.root_cert.is_none());
        assert_eq!(policy.ca_endpoint, "istiod.istio-system.svc:15010");
    }

    #[test]
    fn test_absent_endpoint_matches_empty_endpoint() {
        let fx = fixture(true);
        let mut absent = signals("", "istiod", false);
        absent.ca_endpoint = None;
        assert_eq!(TrustRule::select(&absent), TrustRule::DefaultEndpoint);
        assert_eq!(
            resolve(&absent, &fx.paths).unwrap(),
            resolve(&signals("", "istiod", false), &fx.paths).unwrap()
        );
    }

    #[test]
    fn test_system_namespace_in_default_endpoint() {
        let fx = fixture(true);
        let mut s = signals("", "istiod", false);
        s.system_namespace = "mesh".to_string();
        assert_eq!(
            resolve(&s, &fx.paths).unwrap().ca_endpoint,
            "istiod.mesh.svc:15012"
        );
    }

    #[test]
    fn test_insecure_debug_port_regardless_of_provider() {
        let fx = fixture(true);
        for provider in ["istiod", "kubernetes", "custom", "vault"] {
            for tls in [false, true] {
                let policy =
                    resolve(&signals("ca.example:15010", provider, tls), &fx.paths).unwrap();
                assert!(!policy.use_tls);
                assert!(policy.root_cert.is_none());
                assert_eq!(policy.ca_endpoint, "ca.example:15010");
            }
        }
    }

    #[test]
    fn test_public_tls_port_uses_system_roots() {
        let fx = fixture(true);
        for tls in [false, true] {
            let policy = resolve(&signals("meshca.example.com:443", "vault", tls), &fx.paths).unwrap();
            assert!(policy.use_tls);
            assert!(policy.root_cert.is_none());
        }
    }

    #[test]
    fn test_asserted_tls_reads_provider_root() {
        let fx = fixture(true);
        for provider in PROVIDERS {
            let policy = resolve(&signals("istiod.example:15012", provider, true), &fx.paths).unwrap();
            assert!(policy.use_tls);
            assert_eq!(policy.root_cert.as_deref(), Some(ROOT));
            assert_eq!(policy.ca_endpoint, "istiod.example:15012");
        }
    }

    #[test]
    fn test_asserted_tls_missing_root_is_fatal() {
        let fx = fixture(false);
        for provider in PROVIDERS {
            let err = resolve(&signals("istiod.example:15012", provider, true), &fx.paths)
                .unwrap_err();
            assert!(matches!(err, Error::MissingRootCert { .. }), "{provider}");
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_asserted_tls_unknown_provider_is_fatal() {
        let fx = fixture(true);
        let err = resolve(&signals("istiod.example:15012", "vault", true), &fx.paths).unwrap_err();
        assert!(matches!(err, Error::UnknownCertProvider { ref provider, .. } if provider == "vault"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_ad_hoc_endpoint_missing_root_uses_system_trust() {
        let fx = fixture(false);
        let policy = resolve(&signals("ca.example:8443", "kubernetes", false), &fx.paths).unwrap();
        assert!(policy.use_tls);
        assert!(policy.root_cert.is_none());
        assert_eq!(policy.ca_endpoint, "ca.example:8443");
    }

    #[test]
    fn test_ad_hoc_endpoint_uses_mesh_root_when_present() {
        let fx = fixture(true);
        let policy = resolve(&signals("ca.example:8443", "kubernetes", false), &fx.paths).unwrap();
        assert_eq!(policy.root_cert.as_deref(), Some(ROOT));
    }

    #[test]
    fn test_rule_precedence() {
        assert_eq!(
            TrustRule::select(&signals("", "istiod", true)),
            TrustRule::DefaultEndpoint
        );
        assert_eq!(
            TrustRule::select(&signals("x:15010", "istiod", true)),
            TrustRule::InsecureDebugPort
        );
        assert_eq!(
            TrustRule::select(&signals("x:443", "istiod", true)),
            TrustRule::PublicTlsPort
        );
        assert_eq!(
            TrustRule::select(&signals("x:15012", "istiod", true)),
            TrustRule::AssertedTls
        );
        assert_eq!(
            TrustRule::select(&signals("x:15012", "istiod", false)),
            TrustRule::AdHoc
        );
        // Port sentinels are suffix matches on the whole port.
        assert_eq!(
            TrustRule::select(&signals("x:115010", "istiod", false)),
            TrustRule::AdHoc
        );
    }

    #[test]
    fn test_provisioning_dir_overrides_root_dir() {
        let fx = fixture(false);
        let prov = TempDir::new().unwrap();
        let unused = TempDir::new().unwrap();

        let unchanged = fx
            .paths
            .clone()
            .with_provisioning_dir(Some(prov.path()), unused.path());
        assert_eq!(unchanged, fx.paths);

        std::fs::write(prov.path().join(ROOT_CERT_DATA_KEY), ROOT).unwrap();
        let switched = fx
            .paths
            .clone()
            .with_provisioning_dir(Some(prov.path()), unused.path());
        assert_eq!(switched.ca_root_dir, prov.path());

        let policy = resolve(&signals("", "istiod", false), &switched).unwrap();
        assert!(policy.use_tls);
    }

    #[test]
    fn test_cert_dir_used_without_provisioning_dir() {
        let fx = fixture(false);
        let cert_dir = TempDir::new().unwrap();
        std::fs::write(cert_dir.path().join(ROOT_CERT_DATA_KEY), ROOT).unwrap();
        let switched = fx.paths.clone().with_provisioning_dir(None, cert_dir.path());
        assert_eq!(switched.ca_root_dir, cert_dir.path());
    }

    #[test]
    fn test_find_root_ca_for_xds() {
        let istiod = CertProvider::Istiod;
        let k8s = CertProvider::Kubernetes;
        let custom = CertProvider::Custom;
        let prov = Path::new("/prov");
        let inputs = |plain_tls, discovery_address, provider, prov_cert| XdsRootInputs {
            plain_tls,
            discovery_address,
            provider,
            prov_cert,
        };

        assert_eq!(
            find_root_ca_for_xds(&inputs(true, "istiod:15012", &istiod, None)),
            PathBuf::from(SYSTEM_CA_BUNDLE)
        );
        assert_eq!(
            find_root_ca_for_xds(&inputs(false, "istiod.example.com:443", &istiod, None)),
            PathBuf::from(SYSTEM_CA_BUNDLE)
        );
        assert_eq!(
            find_root_ca_for_xds(&inputs(false, "istiod:15012", &istiod, Some(prov))),
            PathBuf::from("./var/run/secrets/istio/root-cert.pem")
        );
        assert_eq!(
            find_root_ca_for_xds(&inputs(false, "istiod:15012", &k8s, None)),
            PathBuf::from(K8S_CA_PATH)
        );
        assert_eq!(
            find_root_ca_for_xds(&inputs(false, "istiod:15012", &custom, Some(prov))),
            PathBuf::from("/prov/root-cert.pem")
        );
        assert_eq!(
            find_root_ca_for_xds(&inputs(false, "istiod:15012", &custom, None)),
            PathBuf::from(SYSTEM_CA_BUNDLE)
        );
    }
}
