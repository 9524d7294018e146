//! Tunnel manager: local-to-remote forwarding into a cluster service
//!
//! [`Tunnel::open`] resolves a running pod behind the target service, binds
//! an OS-assigned port on 127.0.0.1 and relays every accepted connection to
//! the pod's remote port through a [`ForwardBackend`]. It returns only once
//! the accept loop is running, so callers can connect immediately.
//!
//! [`Tunnel::close`] is idempotent and waits for the forwarding task to exit,
//! which releases the local port. Dropping an open tunnel stops it as well.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::poll::deadline_after;

/// Default window for finding a running pod and starting the listener
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between pod lookups while no running pod matches
const POD_LOOKUP_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after a failed accept so fd exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Label key used to select the pods backing a service
pub const SELECTOR_LABEL: &str = "app";

/// Service the tunnel forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub namespace: String,
    pub service_name: String,
    /// Value of the [`SELECTOR_LABEL`] label on the backing pods
    pub selector_name: String,
    pub remote_port: u16,
}

impl TunnelTarget {
    pub fn new(
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        selector_name: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service_name: service_name.into(),
            selector_name: selector_name.into(),
            remote_port,
        }
    }

    pub fn label_selector(&self) -> String {
        format!("{}={}", SELECTOR_LABEL, self.selector_name)
    }

    fn setup_failed(&self, reason: impl Into<String>) -> Error {
        Error::TunnelSetupFailed {
            namespace: self.namespace.clone(),
            service: self.service_name.clone(),
            port: self.remote_port,
            reason: reason.into(),
        }
    }

    fn no_pod_within(&self, window: Duration) -> Error {
        self.setup_failed(format!(
            "No running pod matches {} within {:?}",
            self.label_selector(),
            window
        ))
    }
}

/// The cluster forwarding primitive a tunnel is built on.
#[async_trait]
pub trait ForwardBackend: Send + Sync {
    /// Name of a running pod behind `target`, or `None` if none matches yet.
    async fn find_pod(&self, target: &TunnelTarget) -> Result<Option<String>>;

    /// Relay one accepted local connection to `remote_port` on `pod` until
    /// either side closes.
    async fn forward_connection(
        &self,
        namespace: &str,
        pod: &str,
        remote_port: u16,
        local: TcpStream,
    ) -> std::io::Result<()>;
}

/// [`ForwardBackend`] using the Kubernetes pod port-forward subresource
#[derive(Clone)]
pub struct KubeForwardBackend {
    client: Client,
}

impl KubeForwardBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ForwardBackend for KubeForwardBackend {
    async fn find_pod(&self, target: &TunnelTarget) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let label_selector = target.label_selector();

        debug!(label_selector = %label_selector, "Resolving service to pod");

        let pod_list = pods
            .list(&ListParams::default().labels(&label_selector))
            .await
            .map_err(|e| target.setup_failed(format!("Kubernetes API error: {}", e)))?;

        Ok(pod_list
            .items
            .into_iter()
            .filter(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.as_ref())
                    .is_some_and(|phase| phase == "Running")
            })
            .find_map(|p| p.metadata.name))
    }

    async fn forward_connection(
        &self,
        namespace: &str,
        pod: &str,
        remote_port: u16,
        mut local: TcpStream,
    ) -> std::io::Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let mut forwarder = pods
            .portforward(pod, &[remote_port])
            .await
            .map_err(std::io::Error::other)?;

        let mut upstream = forwarder.take_stream(remote_port).ok_or_else(|| {
            std::io::Error::other(format!("no stream for port {} on {}", remote_port, pod))
        })?;

        tokio::io::copy_bidirectional(&mut local, &mut upstream).await?;
        drop(upstream);

        forwarder.join().await.map_err(std::io::Error::other)
    }
}

/// Whether a tunnel still forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Open,
    Closed,
}

/// An open forward from `127.0.0.1:local_port` to the target's remote port.
///
/// A tunnel has a single owner. Concurrent scenarios open their own tunnels,
/// even against the same service.
pub struct Tunnel {
    target: TunnelTarget,
    pod: String,
    local_port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("target", &self.target)
            .field("pod", &self.pod)
            .field("local_port", &self.local_port)
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl Tunnel {
    /// Open a tunnel to `target`.
    ///
    /// Pod lookup and listener startup share one `setup_timeout` window.
    /// Fails with [`Error::TunnelSetupFailed`] if no running pod matches
    /// in time, if the local port cannot be bound, or if the forwarding
    /// task does not come up before the window closes.
    pub async fn open(
        backend: Arc<dyn ForwardBackend>,
        target: &TunnelTarget,
        setup_timeout: Duration,
    ) -> Result<Self> {
        let deadline = deadline_after(Instant::now(), setup_timeout);

        let lookup = wait_for_pod(backend.as_ref(), target, deadline);
        let pod = match tokio::time::timeout_at(deadline, lookup).await {
            Ok(found) => found?,
            Err(_) => return Err(target.no_pod_within(setup_timeout)),
        };

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| target.setup_failed(format!("Failed to bind local port: {}", e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| target.setup_failed(format!("Failed to read local address: {}", e)))?
            .port();

        debug!(
            namespace = %target.namespace,
            pod = %pod,
            local_port = local_port,
            remote_port = target.remote_port,
            "Starting tunnel"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(run_forward_loop(
            listener,
            backend,
            target.namespace.clone(),
            pod.clone(),
            target.remote_port,
            ready_tx,
            shutdown_rx,
        ));

        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                handle.abort();
                return Err(target.setup_failed("Forwarding task did not become ready"));
            }
        }

        info!(
            namespace = %target.namespace,
            service = %target.service_name,
            pod = %pod,
            local_port = local_port,
            "Tunnel established"
        );

        Ok(Self {
            target: target.clone(),
            pod,
            local_port,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            closed: false,
        })
    }

    /// Local port forwarding to the remote target
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Pod the tunnel resolved to
    pub fn pod(&self) -> &str {
        &self.pod
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn liveness(&self) -> Liveness {
        if self.closed {
            Liveness::Closed
        } else {
            Liveness::Open
        }
    }

    /// Stop forwarding and release the local port.
    ///
    /// Safe to call more than once and after the remote side has gone away;
    /// only the first call does anything.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        debug!(local_port = self.local_port, "Stopping tunnel");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, local_port = self.local_port, "Tunnel task ended abnormally");
                }
            }
        }

        info!(local_port = self.local_port, pod = %self.pod, "Tunnel closed");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown_tx.take();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        debug!(local_port = self.local_port, "Tunnel dropped without close");
    }
}

/// Look up a running pod until one appears or the setup window closes
async fn wait_for_pod(
    backend: &dyn ForwardBackend,
    target: &TunnelTarget,
    deadline: Instant,
) -> Result<String> {
    let started = Instant::now();

    loop {
        if let Some(pod) = backend.find_pod(target).await? {
            return Ok(pod);
        }
        if deadline.saturating_duration_since(Instant::now()) < POD_LOOKUP_INTERVAL {
            return Err(target.no_pod_within(started.elapsed()));
        }
        tokio::time::sleep(POD_LOOKUP_INTERVAL).await;
    }
}

/// Accept loop; each connection is relayed on its own task
async fn run_forward_loop(
    listener: TcpListener,
    backend: Arc<dyn ForwardBackend>,
    namespace: String,
    pod: String,
    remote_port: u16,
    ready_tx: oneshot::Sender<()>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    let _ = ready_tx.send(());

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Tunnel shutdown requested");
                break;
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        trace!(client_addr = %addr, "New tunnel connection");

                        let backend = Arc::clone(&backend);
                        let namespace = namespace.clone();
                        let pod = pod.clone();

                        connections.spawn(async move {
                            if let Err(e) = backend
                                .forward_connection(&namespace, &pod, remote_port, stream)
                                .await
                            {
                                warn!(error = %e, pod = %pod, "Tunnel connection error");
                            }
                        });
                    }
                    Err(e) => accept_failed(e).await,
                }
            }
        }
    }

    connections.shutdown().await;
}

/// Log a failed accept and back off before the next one
async fn accept_failed(error: std::io::Error) {
    warn!(error = %error, "Tunnel accept error");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}
