//! Verification scenarios composed from the engine's parts
//!
//! [`Verifier`] owns the three cluster collaborators and exposes the
//! operations a scenario needs: index presence under a poll loop, index
//! cleaner run correlation, and workload readiness. Each call opens its own
//! tunnel and loads its own credentials; nothing is shared between calls.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tracing::info;

use crate::catalog::CatalogQuery;
use crate::credentials::{KubeSecretStore, SecretStore, load_credential_bundle};
use crate::error::Result;
use crate::poll::{PollSpec, poll_until};
use crate::tunnel::{DEFAULT_SETUP_TIMEOUT, ForwardBackend, KubeForwardBackend, Tunnel, TunnelTarget};
use crate::workload::{KubeWorkloadSource, WorkloadStatusSource, WorkloadWatcher, cleaner_job_name};

/// Where the storage service lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub namespace: String,
    pub service_name: String,
    /// Value of the `app` label on the backing pods
    pub selector_name: String,
    pub port: u16,
    /// Secret holding `admin-ca`, `admin-cert` and `admin-key`
    pub secret_name: String,
    /// Mutual TLS required
    pub secure: bool,
}

impl StorageTarget {
    pub fn tunnel_target(&self) -> TunnelTarget {
        TunnelTarget::new(
            &self.namespace,
            &self.service_name,
            &self.selector_name,
            self.port,
        )
    }
}

pub struct Verifier {
    secrets: Arc<dyn SecretStore>,
    forwarder: Arc<dyn ForwardBackend>,
    workloads: WorkloadWatcher,
    tunnel_setup_timeout: Duration,
}

impl Verifier {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        forwarder: Arc<dyn ForwardBackend>,
        workloads: Arc<dyn WorkloadStatusSource>,
    ) -> Self {
        Self {
            secrets,
            forwarder,
            workloads: WorkloadWatcher::new(workloads),
            tunnel_setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    /// Verifier backed by the Kubernetes API
    pub fn from_client(client: Client) -> Self {
        Self::new(
            Arc::new(KubeSecretStore::new(client.clone())),
            Arc::new(KubeForwardBackend::new(client.clone())),
            Arc::new(KubeWorkloadSource::new(client)),
        )
    }

    pub fn with_tunnel_setup_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_setup_timeout = timeout;
        self
    }

    pub fn workloads(&self) -> &WorkloadWatcher {
        &self.workloads
    }

    /// Open a tunnel to the storage service
    pub async fn open_tunnel(&self, storage: &StorageTarget) -> Result<Tunnel> {
        Tunnel::open(
            Arc::clone(&self.forwarder),
            &storage.tunnel_target(),
            self.tunnel_setup_timeout,
        )
        .await
    }

    /// Poll the storage catalog until an index with `prefix` is present
    /// (`spec.expected() == true`) or absent (`false`).
    ///
    /// Credentials are loaded and turned into one TLS client configuration
    /// before the tunnel opens; every poll reuses it. The tunnel is closed
    /// on every exit path once it is open.
    pub async fn index_with_prefix_exists(
        &self,
        storage: &StorageTarget,
        prefix: &str,
        spec: &PollSpec,
    ) -> Result<()> {
        let tls = if storage.secure {
            let bundle = load_credential_bundle(
                self.secrets.as_ref(),
                &storage.namespace,
                &storage.secret_name,
            )
            .await?;
            Some(Arc::new(bundle.client_config()?))
        } else {
            None
        };

        let mut tunnel = self.open_tunnel(storage).await?;

        let condition = format!(
            "index with prefix {:?} in {}/{} to be {}",
            prefix,
            storage.namespace,
            storage.service_name,
            if *spec.expected() { "present" } else { "absent" }
        );

        let query = CatalogQuery::new(tunnel.local_port(), prefix).with_tls(tls);
        let result = poll_until(&condition, spec, || query.has_entry()).await;

        tunnel.close().await;
        result
    }

    /// Wait for the index cleaner of `instance_name` to be scheduled and
    /// for one of its runs to complete.
    ///
    /// The scheduled job gets `extra_timeout` on top of `spec`'s timeout to
    /// cover the first cron tick. A failed run ends the wait immediately.
    pub async fn await_index_cleaner_run(
        &self,
        namespace: &str,
        instance_name: &str,
        spec: &PollSpec,
        extra_timeout: Duration,
    ) -> Result<()> {
        let job_name = cleaner_job_name(instance_name);

        self.workloads
            .wait_for_scheduled_job(namespace, &job_name, &spec.clone().with_extra_timeout(extra_timeout))
            .await?;
        self.workloads
            .wait_for_job_of_owner(namespace, &job_name, spec)
            .await?;

        info!(namespace = namespace, cronjob = %job_name, "Index cleaner run completed");
        Ok(())
    }

    pub async fn await_deployment_ready(&self, namespace: &str, name: &str, spec: &PollSpec) -> Result<()> {
        self.workloads.wait_for_deployment(namespace, name, spec).await
    }

    pub async fn await_statefulset_ready(&self, namespace: &str, name: &str, spec: &PollSpec) -> Result<()> {
        self.workloads.wait_for_statefulset(namespace, name, spec).await
    }
}
