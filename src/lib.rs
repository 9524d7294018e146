//! End-to-end verification of an index-backed tracing deployment
//!
//! The crate polls an Elasticsearch-style catalog through a cluster tunnel
//! until an index prefix is present or absent, and watches the workloads
//! around it (Deployments, StatefulSets, the index cleaner CronJob and the
//! Jobs it triggers). All waiting goes through [`poll::poll_until`].
//!
//! Cluster access sits behind three narrow traits so scenarios run against
//! fakes in tests: [`SecretStore`], [`ForwardBackend`] and
//! [`WorkloadStatusSource`].

pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod poll;
pub mod tunnel;
pub mod verifier;
pub mod workload;

pub use catalog::{CatalogQuery, catalog_contains, has_entry_with_prefix};
pub use config::VerifierConfig;
pub use credentials::{
    CredentialBundle, KubeSecretStore, SecretStore, load_credential_bundle,
};
pub use error::{Error, Result};
pub use poll::{PollSpec, poll_until};
pub use tunnel::{ForwardBackend, KubeForwardBackend, Liveness, Tunnel, TunnelTarget};
pub use verifier::{StorageTarget, Verifier};
pub use workload::{
    JobOutcome, JobWatchTarget, KubeWorkloadSource, ReplicaStatus, WatchState, WorkloadKind,
    WorkloadStatusSource, WorkloadWatcher, cleaner_job_name,
};
