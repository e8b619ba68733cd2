//! Certificate Signing Request (CSR) generation.
//!
//! Every issuance generates a fresh P-256 key pair; the private key never
//! leaves the agent and only the CSR is sent to the CA.
//!
//! # Example
//!
//! ```
//! use sidecar_identity::CsrOptions;
//!
//! let cert_sign = CsrOptions::new("spiffe://cluster.local/ns/default/sa/web")
//!     .generate()
//!     .unwrap();
//! assert!(cert_sign.csr().starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
//! ```

use crate::{Error, Result};
use rcgen::{DistinguishedName, DnType, KeyPair, SanType};

/// Organization written into the CSR subject.
const DEFAULT_ORG: &str = "Istio";

/// Options for generating a Certificate Signing Request.
#[derive(Debug, Clone)]
pub struct CsrOptions {
    /// URI SAN, the workload's SPIFFE ID.
    san: String,
}

impl CsrOptions {
    pub fn new(san: impl Into<String>) -> Self {
        Self { san: san.into() }
    }

    /// Generates a P-256 key pair and a CSR carrying the URI SAN.
    pub fn generate(&self) -> Result<CertSign> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::CsrGeneration(format!("key generation failed: {e}")))?;

        let mut params = rcgen::CertificateParams::new(vec![])
            .map_err(|e| Error::CsrGeneration(format!("failed to create params: {e}")))?;

        let san = rcgen::string::Ia5String::try_from(self.san.clone())
            .map_err(|e| Error::CsrGeneration(format!("invalid SAN URI {}: {e}", self.san)))?;
        params.subject_alt_names = vec![SanType::URI(san)];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, DEFAULT_ORG);
        params.distinguished_name = dn;

        let csr_pem = params
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|e| Error::CsrGeneration(format!("CSR serialization failed: {e}")))?;

        Ok(CertSign {
            csr: csr_pem,
            private_key: key_pair.serialize_pem(),
        })
    }
}

/// A CSR and the private key it was generated with.
#[derive(Clone)]
pub struct CertSign {
    csr: String,
    private_key: String,
}

impl CertSign {
    pub fn csr(&self) -> &str {
        &self.csr
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }
}

impl std::fmt::Debug for CertSign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertSign")
            .field("csr", &self.csr)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}
