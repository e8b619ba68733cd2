//! Wire messages for the CA certificate services.
//!
//! Only the two unary `CreateCertificate` calls are used, so the messages are
//! declared by hand instead of generated from the upstream protos.

use prost_types::value::Kind;
use prost_types::{Struct, Value};
use std::collections::BTreeMap;

/// Method path of the mesh CA (`istio.v1.auth.IstioCertificateService`).
pub const ISTIO_CREATE_CERTIFICATE: &str =
    "/istio.v1.auth.IstioCertificateService/CreateCertificate";

/// Method path of Google's mesh CA.
pub const MESHCA_CREATE_CERTIFICATE: &str =
    "/google.security.meshca.v1.MeshCertificateService/CreateCertificate";

#[derive(Clone, PartialEq, prost::Message)]
pub struct IstioCertificateRequest {
    #[prost(string, tag = "1")]
    pub csr: String,
    /// Requested validity in seconds.
    #[prost(int64, tag = "3")]
    pub validity_duration: i64,
    #[prost(message, optional, tag = "4")]
    pub metadata: Option<Struct>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IstioCertificateResponse {
    #[prost(string, repeated, tag = "1")]
    pub cert_chain: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshCertificateRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub csr: String,
    #[prost(message, optional, tag = "3")]
    pub validity: Option<prost_types::Duration>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshCertificateResponse {
    #[prost(string, repeated, tag = "1")]
    pub cert_chain: Vec<String>,
}

/// Builds the `metadata` struct carrying the cluster ID.
pub fn cluster_metadata(cluster_id: &str) -> Option<Struct> {
    if cluster_id.is_empty() {
        return None;
    }
    let mut fields = BTreeMap::new();
    fields.insert(
        "ClusterID".to_string(),
        Value {
            kind: Some(Kind::StringValue(cluster_id.to_string())),
        },
    );
    Some(Struct { fields })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_cluster_metadata() {
        assert!(cluster_metadata("").is_none());
        let metadata = cluster_metadata("Kubernetes").unwrap();
        assert_eq!(
            metadata.fields["ClusterID"].kind,
            Some(Kind::StringValue("Kubernetes".to_string()))
        );
    }

    #[test]
    fn test_istio_request_field_numbers() {
        let request = IstioCertificateRequest {
            csr: "csr".to_string(),
            validity_duration: 60,
            metadata: None,
        };
        let bytes = request.encode_to_vec();
        // csr is field 1 (length-delimited), validity_duration is field 3 (varint).
        assert_eq!(bytes[0], (1 << 3) | 2);
        assert_eq!(bytes[5], 3 << 3);
    }
}
