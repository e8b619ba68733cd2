//! SPIFFE identity of the local workload.
//!
//! The sidecar requests certificates for exactly one identity: the pod's
//! Kubernetes service account inside the mesh trust domain.
//!
//! ```text
//! spiffe://cluster.local/ns/<namespace>/sa/<service-account>
//! ```
//!
//! # Example
//!
//! ```
//! use sidecar_identity::Identity;
//!
//! let id = Identity::new("cluster.local", "default", "productpage").unwrap();
//! assert_eq!(id.to_spiffe_uri(), "spiffe://cluster.local/ns/default/sa/productpage");
//! ```

use crate::{Error, Result};
use std::fmt;

/// Trust domain used when none is configured.
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// A workload identity: trust domain, namespace and service account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    trust_domain: String,
    namespace: String,
    service_account: String,
}

impl Identity {
    /// Creates an identity, validating every component.
    ///
    /// Namespaces and service accounts are Kubernetes object names, so they
    /// are held to the characters SPIFFE allows in a path segment.
    pub fn new(
        trust_domain: impl Into<String>,
        namespace: impl Into<String>,
        service_account: impl Into<String>,
    ) -> Result<Self> {
        let trust_domain = trust_domain.into();
        let namespace = namespace.into();
        let service_account = service_account.into();

        validate_trust_domain(&trust_domain)?;
        validate_segment(&namespace, "namespace")?;
        validate_segment(&service_account, "service account")?;

        Ok(Self {
            trust_domain,
            namespace,
            service_account,
        })
    }

    /// Parses `spiffe://<td>/ns/<ns>/sa/<sa>`.
    pub fn from_spiffe_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("spiffe://")
            .ok_or_else(|| Error::InvalidSpiffeUri(format!("must start with spiffe://: {uri}")))?;

        let (trust_domain, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidSpiffeUri(format!("missing workload path: {uri}")))?;

        match path.split('/').collect::<Vec<_>>().as_slice() {
            ["ns", namespace, "sa", service_account] => {
                Self::new(trust_domain, *namespace, *service_account)
            }
            _ => Err(Error::InvalidSpiffeUri(format!(
                "expected ns/<namespace>/sa/<service-account>, got: {path}"
            ))),
        }
    }

    /// Returns the SPIFFE URI used as the certificate's URI SAN.
    pub fn to_spiffe_uri(&self) -> String {
        format!(
            "spiffe://{}/ns/{}/sa/{}",
            self.trust_domain, self.namespace, self.service_account
        )
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn service_account(&self) -> &str {
        &self.service_account
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_spiffe_uri())
    }
}

impl std::str::FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_spiffe_uri(s)
    }
}

fn validate_trust_domain(trust_domain: &str) -> Result<()> {
    if trust_domain.is_empty() {
        return Err(Error::InvalidSpiffeUri("empty trust domain".to_string()));
    }
    if !trust_domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(Error::InvalidSpiffeUri(format!(
            "invalid trust domain characters: {trust_domain}"
        )));
    }
    Ok(())
}

// SPIFFE path segments: [a-zA-Z0-9.-_], no relative modifiers.
fn validate_segment(value: &str, name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidSpiffeUri(format!("empty {name}")));
    }
    if value == "." || value == ".." {
        return Err(Error::InvalidSpiffeUri(format!(
            "{name} cannot be a relative path modifier: {value}"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_'))
    {
        return Err(Error::InvalidSpiffeUri(format!(
            "{name} contains invalid character {c:?}: {value}"
        )));
    }
    Ok(())
}
