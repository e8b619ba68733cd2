//! In-process CA for tests.
//!
//! Signs any CSR with a freshly generated self-signed root and records the
//! bearer tokens it was presented, so tests can check what the caches sent.
//!
//! **Warning:** development and testing only.

use super::CaClient;
use crate::certificate::Certificate;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use time::{Duration as TimeDuration, OffsetDateTime};

/// A self-signed CA implementing [`CaClient`].
pub struct SelfSignedCa {
    root_key: KeyPair,
    root_params: CertificateParams,
    root_certificate: Certificate,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl SelfSignedCa {
    pub fn new(trust_domain: &str) -> Result<Self> {
        let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Internal(format!("root key generation failed: {e}")))?;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::Internal(format!("failed to create params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("Test Root CA - {trust_domain}"));
        dn.push(DnType::OrganizationName, "Istio");
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::minutes(5);
        params.not_after = now + TimeDuration::days(365);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let root_cert = params
            .clone()
            .self_signed(&root_key)
            .map_err(|e| Error::Internal(format!("root cert generation failed: {e}")))?;

        Ok(Self {
            root_key,
            root_params: params,
            root_certificate: Certificate::from_der(root_cert.der().to_vec()),
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn root_cert_pem(&self) -> String {
        self.root_certificate.to_pem().to_string()
    }

    /// Number of `csr_sign` calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bearer tokens presented, in call order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Makes subsequent calls fail with [`Error::CaRequest`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaClient for SelfSignedCa {
    async fn csr_sign(&self, csr_pem: &str, token: &str, ttl: Duration) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(token.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::CaRequest("CA unavailable".to_string()));
        }

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::CaRequest(format!("failed to parse CSR: {e}")))?;

        let now = OffsetDateTime::now_utc();
        csr_params.params.not_before = now - TimeDuration::minutes(1);
        csr_params.params.not_after = now + TimeDuration::seconds(ttl.as_secs() as i64);
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let issuer = rcgen::Issuer::from_params(&self.root_params, &self.root_key);
        let leaf = csr_params
            .signed_by(&issuer)
            .map_err(|e| Error::CaRequest(format!("certificate signing failed: {e}")))?;

        Ok(vec![leaf.pem(), self.root_cert_pem()])
    }

    fn provider(&self) -> &'static str {
        "SelfSigned"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::CsrOptions;

    #[tokio::test]
    async fn test_signs_csr_with_root_last() {
        let ca = SelfSignedCa::new("cluster.local").unwrap();
        let cert_sign = CsrOptions::new("spiffe://cluster.local/ns/default/sa/web")
            .generate()
            .unwrap();

        let chain = ca
            .csr_sign(cert_sign.csr(), "token-a", Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], ca.root_cert_pem());
        let leaf = Certificate::from_pem(&chain[0]).unwrap();
        assert!(leaf.not_after().unwrap() > chrono::Utc::now());
        assert_eq!(ca.tokens(), vec!["token-a".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_switch() {
        let ca = SelfSignedCa::new("cluster.local").unwrap();
        ca.set_failing(true);
        let result = ca.csr_sign("csr", "t", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(Error::CaRequest(_))));
        assert_eq!(ca.calls(), 1);
    }
}
