use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sidecar_agent::config::DEFAULT_SYSTEM_NAMESPACE;
use sidecar_agent::{
    Agent, AgentConfig, AuthenticationPolicy, Error, ProxyConfig, SecurityOptions,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sidecar-agent")]
#[command(about = "Security agent bootstrapping workload certificates for the mesh proxy")]
struct Args {
    /// CA endpoint. Empty uses the discovery address, or the in-cluster
    /// default when that is empty too.
    #[arg(long, env = "CA_ADDR", default_value = "")]
    ca_addr: String,
    /// CA provider: `Citadel` or `GoogleCA`.
    #[arg(long, env = "CA_PROVIDER", default_value = "Citadel")]
    ca_provider: String,
    /// Issuer of the control plane certificate: istiod, kubernetes or custom.
    #[arg(long, env = "PILOT_CERT_PROVIDER", default_value = "istiod")]
    pilot_cert_provider: String,
    /// Provisioning certificate directory.
    #[arg(long, env = "PROV_CERT")]
    prov_cert: Option<PathBuf>,
    /// Serve certificates mounted under ./etc/certs instead of signing.
    #[arg(long, env = "FILE_MOUNTED_CERTS", default_value_t = false)]
    file_mounted_certs: bool,
    #[arg(long, env = "CLUSTER_ID", default_value = "")]
    cluster_id: String,
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pod_namespace: String,
    #[arg(long, env = "TRUST_DOMAIN", default_value = "cluster.local")]
    trust_domain: String,
    #[arg(long, env = "SERVICE_ACCOUNT", default_value = "default")]
    service_account: String,
    #[arg(long, env = "JWT_PATH", default_value = sidecar_agent::config::DEFAULT_JWT_PATH)]
    jwt_path: PathBuf,
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    system_namespace: String,
    /// Discovery server address (`host:port`).
    #[arg(long, env = "DISCOVERY_ADDRESS", default_value = "")]
    discovery_address: String,
    /// NONE or MUTUAL_TLS.
    #[arg(long, env = "CONTROL_PLANE_AUTH_POLICY", default_value = "NONE")]
    control_plane_auth_policy: AuthenticationPolicy,
    /// Local address for the discovery relay.
    #[arg(long, env = "XDS_LOCAL")]
    xds_local: Option<String>,
    /// The discovery server presents a publicly trusted certificate.
    #[arg(long, env = "PLAIN_TLS", default_value_t = false)]
    plain_tls: bool,
    #[arg(long, env = "SECRET_TTL_SECS", default_value_t = 24 * 60 * 60)]
    secret_ttl_secs: u64,
    /// Zero selects the default interval.
    #[arg(long, env = "RECYCLE_INTERVAL_SECS", default_value_t = 0)]
    recycle_interval_secs: u64,
    /// Token exchange plugins applied before signing.
    #[arg(long, env = "TOKEN_EXCHANGERS", value_delimiter = ',')]
    token_exchangers: Vec<String>,
    /// Running next to an application proxy rather than as a gateway.
    #[arg(long, env = "SIDECAR", default_value_t = true, action = clap::ArgAction::Set)]
    sidecar: bool,
}

impl Args {
    fn into_configs(self) -> (ProxyConfig, AgentConfig, SecurityOptions, bool, String) {
        let proxy = ProxyConfig {
            discovery_address: self.discovery_address,
            control_plane_auth_policy: self.control_plane_auth_policy,
        };
        let agent = AgentConfig {
            local_xds_addr: self.xds_local,
            plain_tls: self.plain_tls,
        };
        let opts = SecurityOptions {
            ca_endpoint: self.ca_addr,
            ca_provider: self.ca_provider,
            pilot_cert_provider: self.pilot_cert_provider,
            prov_cert: self.prov_cert,
            file_mounted_certs: self.file_mounted_certs,
            cluster_id: self.cluster_id,
            trust_domain: self.trust_domain,
            pod_namespace: self.pod_namespace.clone(),
            service_account: self.service_account,
            jwt_path: self.jwt_path,
            system_namespace: self.system_namespace,
            secret_ttl: Duration::from_secs(self.secret_ttl_secs),
            recycle_interval: Duration::from_secs(self.recycle_interval_secs),
            token_exchanger_plugins: self.token_exchangers,
            ..SecurityOptions::default()
        };
        (proxy, agent, opts, self.sidecar, self.pod_namespace)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!(error = %e, fatal = e.is_fatal(), "sidecar agent failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let (proxy, agent_config, opts, is_sidecar, namespace) = args.into_configs();
    let mut agent = Agent::new(proxy, agent_config, opts);
    info!(
        options = %serde_json::to_string(agent.security_options().as_ref()).unwrap_or_default(),
        xds_root = %agent.find_root_ca_for_xds().display(),
        "starting sidecar agent"
    );

    let server = agent.start(is_sidecar, &namespace).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.stop();
    agent.stop();
    Ok(())
}
