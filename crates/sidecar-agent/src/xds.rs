//! Local discovery relay.
//!
//! Accepts plaintext connections from the proxy on a local TCP address and
//! relays bytes to the discovery server. The relay does not look inside the
//! stream.

use crate::config::{AgentConfig, AuthenticationPolicy, ProxyConfig};
use crate::error::{Error, Result};
use sidecar_identity::{stopped, SecretCache, WORKLOAD_RESOURCE};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct XdsProxy {
    listen_addr: Option<SocketAddr>,
    upstream: String,
    task: Option<JoinHandle<()>>,
}

impl XdsProxy {
    /// Starts the relay when `agent.local_xds_addr` is set.
    ///
    /// Under mutual TLS the workload certificate is requested in the
    /// background so it is ready by the time the proxy connects.
    pub async fn start(
        proxy: &ProxyConfig,
        agent: &AgentConfig,
        workload: Arc<SecretCache>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        if proxy.control_plane_auth_policy == AuthenticationPolicy::MutualTls {
            tokio::spawn(async move {
                match workload.generate_secret(WORKLOAD_RESOURCE).await {
                    Ok(item) => debug!(expires = ?item.expire_time, "workload certificate warmed"),
                    Err(e) => warn!(error = %e, "failed to warm workload certificate"),
                }
            });
        }

        let upstream = proxy.discovery_address.clone();
        let Some(local) = agent.local_xds_addr.as_deref() else {
            info!("discovery relay disabled");
            return Ok(Self {
                listen_addr: None,
                upstream,
                task: None,
            });
        };
        if upstream.is_empty() {
            return Err(Error::Config(
                "discovery relay requires a discovery address".to_string(),
            ));
        }

        let listener = TcpListener::bind(local).await?;
        let listen_addr = listener.local_addr()?;
        info!(listen = %listen_addr, upstream = %upstream, "discovery relay listening");

        let task = tokio::spawn(relay(listener, upstream.clone(), stop));
        Ok(Self {
            listen_addr: Some(listen_addr),
            upstream,
            task: Some(task),
        })
    }

    /// Bound local address; `None` when the relay is disabled.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl std::fmt::Debug for XdsProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsProxy")
            .field("listen_addr", &self.listen_addr)
            .field("upstream", &self.upstream)
            .finish()
    }
}

async fn relay(listener: TcpListener, upstream: String, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => {
                info!("discovery relay shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    let upstream = upstream.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward(inbound, &upstream).await {
                            debug!(peer = %peer, error = %e, "discovery relay connection closed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "discovery relay accept error");
                    break;
                }
            },
        }
    }
}

async fn forward(mut inbound: TcpStream, upstream: &str) -> std::io::Result<()> {
    let mut outbound = TcpStream::connect(upstream).await?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    debug!(sent, received, "discovery relay connection finished");
    Ok(())
}
