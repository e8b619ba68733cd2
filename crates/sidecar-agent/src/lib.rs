//! Sidecar security agent.
//!
//! Decides how the workload talks to its certificate authority and wires up
//! the secret caches that serve certificates to the local proxy.
//!
//! - [`trust`] - root-of-trust resolution for the CA connection
//! - [`ca_factory`] - CA provider selection and client construction
//! - [`secrets`] - workload and gateway secret caches
//! - [`agent`] - bootstrap and lifecycle
//! - [`sds`] - local secret discovery server
//! - [`xds`] - local discovery relay

pub mod agent;
pub mod ca_factory;
pub mod config;
pub mod error;
pub mod sds;
pub mod secrets;
pub mod trust;
pub mod xds;

pub use agent::{Agent, Lifecycle};
pub use ca_factory::{CaClientConfig, CaProvider};
pub use config::{AgentConfig, AuthenticationPolicy, ProxyConfig, SecurityOptions};
pub use error::{Error, Result};
pub use sds::{SdsServer, SecretUpdates};
pub use secrets::{
    gateway_sds_exists, new_gateway_secret_cache, new_workload_secret_cache, WorkloadSecrets,
};
pub use trust::{
    find_root_ca_for_xds, resolve, CertProvider, TrustPaths, TrustPolicy, TrustRule, TrustSignals,
    XdsRootInputs,
};
pub use xds::XdsProxy;
