//! Local secret discovery server.
//!
//! Serves secrets from the workload cache (and the gateway cache, when one
//! was built) over Unix sockets.
//!
//! # Protocol
//!
//! Newline-delimited commands, newline-delimited JSON responses:
//!
//! - `FETCH [resource]` - the secret for `resource` (`default` when omitted)
//! - `LIST` - names of cached resources
//! - `WATCH` - after acknowledging, pushes `{"updated":"<resource>"}` lines
//!   whenever a cached secret changes
//! - `PING` - liveness
//!
//! Errors are reported as `{"error":"..."}` and leave the connection open.

use crate::config::SecurityOptions;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::json;
use sidecar_identity::{stopped, NotifyFn, SecretCache, WORKLOAD_RESOURCE};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Fan-out of secret change notifications to watching connections.
#[derive(Clone)]
pub struct SecretUpdates {
    tx: broadcast::Sender<String>,
}

impl SecretUpdates {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Callback handed to secret caches.
    pub fn notify_fn(&self) -> NotifyFn {
        let tx = self.tx.clone();
        Arc::new(move |resource: &str| {
            // No receivers just means nobody is watching.
            let _ = tx.send(resource.to_string());
        })
    }

    pub fn push(&self, resource: &str) {
        let _ = self.tx.send(resource.to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for SecretUpdates {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecretUpdates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretUpdates")
            .field("watchers", &self.tx.receiver_count())
            .finish()
    }
}

pub struct SdsServer {
    workload_path: PathBuf,
    gateway_path: PathBuf,
    workload: Arc<SecretCache>,
    gateway: Option<Arc<SecretCache>>,
    updates: SecretUpdates,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SdsServer {
    pub fn new(
        opts: &SecurityOptions,
        workload: Arc<SecretCache>,
        gateway: Option<Arc<SecretCache>>,
        updates: SecretUpdates,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            workload_path: opts.workload_uds_path.clone(),
            gateway_path: opts.gateway_uds_path.clone(),
            workload,
            gateway,
            updates,
            started: AtomicBool::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn workload_path(&self) -> &Path {
        &self.workload_path
    }

    /// The gateway socket, when a gateway cache is served.
    pub fn gateway_path(&self) -> Option<&Path> {
        self.gateway.as_ref().map(|_| self.gateway_path.as_path())
    }

    /// Binds the sockets and spawns the accept loops.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("SDS server already started".to_string()));
        }

        let mut endpoints = vec![(self.workload_path.clone(), self.workload.clone())];
        if let Some(gateway) = &self.gateway {
            endpoints.push((self.gateway_path.clone(), gateway.clone()));
        }

        for (path, cache) in endpoints {
            let listener = bind(&path).await?;
            info!(path = %path.display(), "SDS server listening");
            let task = tokio::spawn(serve(
                listener,
                cache,
                self.updates.clone(),
                self.stop_tx.subscribe(),
            ));
            self.tasks.lock().push(task);
        }
        Ok(())
    }

    /// Stops accepting, closes connections and removes the sockets.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for path in [Some(self.workload_path.as_path()), self.gateway_path()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove SDS socket");
                }
            }
        }
        info!("SDS server stopped");
    }

    /// Tells watching proxies that `resource` changed.
    pub fn notify_proxy(&self, resource: &str) {
        debug!(resource = %resource, "pushing secret update");
        self.updates.push(resource);
    }
}

impl std::fmt::Debug for SdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdsServer")
            .field("workload_path", &self.workload_path)
            .field("gateway_path", &self.gateway_path())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for SdsServer {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    // A socket left behind by a previous run blocks the bind.
    if path.exists() {
        tokio::fs::remove_file(path).await?;
    }
    Ok(UnixListener::bind(path)?)
}

async fn serve(
    listener: UnixListener,
    cache: Arc<SecretCache>,
    updates: SecretUpdates,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let cache = cache.clone();
                    let updates = updates.subscribe();
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, cache, updates, stop).await {
                            debug!(error = %e, "SDS connection closed with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "SDS accept error"),
            },
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    cache: Arc<SecretCache>,
    mut updates: broadcast::Receiver<String>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut watching = false;

    loop {
        let response = tokio::select! {
            _ = stopped(&mut stop) => break,
            update = updates.recv(), if watching => match update {
                Ok(resource) => json!({ "updated": resource }).to_string(),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "SDS watcher lagged behind secret updates");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    watching = false;
                    continue;
                }
            },
            // A cancelled read keeps its partial input in `line`.
            read = reader.read_line(&mut line) => {
                if read? == 0 {
                    break;
                }
                let command = line.trim().to_string();
                line.clear();
                debug!(command = %command, "SDS command");
                match command.split_once(' ').unwrap_or((command.as_str(), "")) {
                    ("WATCH", _) => {
                        watching = true;
                        json!({ "status": "watching" }).to_string()
                    }
                    (cmd, arg) => respond(&cache, cmd, arg.trim()).await,
                }
            }
        };

        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn respond(cache: &SecretCache, command: &str, arg: &str) -> String {
    match command {
        "FETCH" => {
            let resource = if arg.is_empty() { WORKLOAD_RESOURCE } else { arg };
            match cache.generate_secret(resource).await {
                Ok(item) => serde_json::to_string(item.as_ref())
                    .unwrap_or_else(|e| json!({ "error": format!("serialization failed: {e}") }).to_string()),
                Err(e) => {
                    warn!(resource = %resource, error = %e, "failed to generate secret");
                    json!({ "error": e.to_string() }).to_string()
                }
            }
        }
        "LIST" => json!({ "resources": cache.cached_resources().await }).to_string(),
        "PING" => json!({ "status": "ok" }).to_string(),
        other => json!({ "error": format!("unknown command: {other}") }).to_string(),
    }
}
