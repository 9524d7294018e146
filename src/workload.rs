//! Job and workload readiness watcher
//!
//! Check functions that inspect workload status, and [`WorkloadWatcher`]
//! which runs them under [`poll_until`]:
//!
//! - Deployment / StatefulSet readiness: ready replicas equal desired.
//! - Scheduled job existence: the CronJob is present.
//! - Triggered job completion: one job owned by the CronJob has the
//!   `Complete` condition. A `Failed` job aborts the watch with
//!   [`Error::WorkloadFailed`] instead of being polled until the deadline.
//!
//! A single watch goes `Pending -> Ready | Failed | TimedOut` and never back.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::ListParams;
use kube::{Api, Client};

use crate::error::{Error, Result};
use crate::poll::{PollSpec, poll_until};

/// Suffix of the index cleaner's scheduled job
pub const INDEX_CLEANER_SUFFIX: &str = "es-index-cleaner";

/// Name of the index cleaner scheduled job for an instance
pub fn cleaner_job_name(instance_name: &str) -> String {
    format!("{}-{}", instance_name, INDEX_CLEANER_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    ScheduledJob,
    TriggeredJob,
    Deployment,
    StatefulSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            WorkloadKind::ScheduledJob => "CronJob",
            WorkloadKind::TriggeredJob => "Job",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
        };
        f.write_str(kind)
    }
}

/// Identity of a watched resource.
///
/// For [`WorkloadKind::TriggeredJob`], `owner_name` is the scheduled job
/// whose jobs are inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWatchTarget {
    pub namespace: String,
    pub owner_name: String,
    pub kind: WorkloadKind,
}

impl JobWatchTarget {
    pub fn new(namespace: impl Into<String>, owner_name: impl Into<String>, kind: WorkloadKind) -> Self {
        Self {
            namespace: namespace.into(),
            owner_name: owner_name.into(),
            kind,
        }
    }

    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(namespace, name, WorkloadKind::Deployment)
    }

    pub fn statefulset(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(namespace, name, WorkloadKind::StatefulSet)
    }

    pub fn scheduled_job(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(namespace, name, WorkloadKind::ScheduledJob)
    }

    pub fn jobs_of(namespace: impl Into<String>, scheduled_job: impl Into<String>) -> Self {
        Self::new(namespace, scheduled_job, WorkloadKind::TriggeredJob)
    }

    fn fetch_error(&self, reason: impl fmt::Display) -> Error {
        Error::WorkloadFetchError {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.owner_name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for JobWatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WorkloadKind::TriggeredJob => {
                write!(f, "jobs of CronJob {}/{}", self.namespace, self.owner_name)
            }
            kind => write!(f, "{} {}/{}", kind, self.namespace, self.owner_name),
        }
    }
}

/// Desired and ready replica counts of a Deployment or StatefulSet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub desired: i32,
    pub ready: i32,
}

impl ReplicaStatus {
    pub fn is_ready(&self) -> bool {
        self.ready == self.desired
    }
}

/// Terminal state of a triggered job, if it has one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Complete,
    Failed { job: String, reason: String },
}

/// Read access to workload status fields.
#[async_trait]
pub trait WorkloadStatusSource: Send + Sync {
    /// Replica counts of a Deployment or StatefulSet; `None` if it does not exist yet.
    async fn replica_status(&self, target: &JobWatchTarget) -> Result<Option<ReplicaStatus>>;

    /// Whether the scheduled job exists.
    async fn scheduled_job_exists(&self, target: &JobWatchTarget) -> Result<bool>;

    /// Outcomes of every job owned by the scheduled job named in `target`.
    async fn owned_job_outcomes(&self, target: &JobWatchTarget) -> Result<Vec<JobOutcome>>;
}

/// [`WorkloadStatusSource`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeWorkloadSource {
    client: Client,
}

impl KubeWorkloadSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadStatusSource for KubeWorkloadSource {
    async fn replica_status(&self, target: &JobWatchTarget) -> Result<Option<ReplicaStatus>> {
        match target.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                let deployment = api
                    .get_opt(&target.owner_name)
                    .await
                    .map_err(|e| target.fetch_error(e))?;
                Ok(deployment.map(|d| deployment_replicas(&d)))
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                let sts = api
                    .get_opt(&target.owner_name)
                    .await
                    .map_err(|e| target.fetch_error(e))?;
                Ok(sts.map(|s| statefulset_replicas(&s)))
            }
            other => Err(target.fetch_error(format!("{} has no replica status", other))),
        }
    }

    async fn scheduled_job_exists(&self, target: &JobWatchTarget) -> Result<bool> {
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), &target.namespace);
        let cronjob = api
            .get_opt(&target.owner_name)
            .await
            .map_err(|e| target.fetch_error(e))?;
        Ok(cronjob.is_some())
    }

    async fn owned_job_outcomes(&self, target: &JobWatchTarget) -> Result<Vec<JobOutcome>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &target.namespace);
        let jobs = api
            .list(&ListParams::default())
            .await
            .map_err(|e| target.fetch_error(e))?;

        Ok(jobs
            .items
            .iter()
            .filter(|job| is_owned_by_cronjob(job, &target.owner_name))
            .map(job_outcome)
            .collect())
    }
}

/// Replica counts of a Deployment (`spec.replicas` defaults to 1)
pub fn deployment_replicas(deployment: &Deployment) -> ReplicaStatus {
    ReplicaStatus {
        desired: deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        ready: deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
    }
}

/// Replica counts of a StatefulSet (`spec.replicas` defaults to 1)
pub fn statefulset_replicas(sts: &StatefulSet) -> ReplicaStatus {
    ReplicaStatus {
        desired: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        ready: sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
    }
}

/// Whether `job` has an owner reference to the CronJob named `owner`
pub fn is_owned_by_cronjob(job: &Job, owner: &str) -> bool {
    job.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "CronJob" && r.name == owner))
}

/// Map a job's conditions to its outcome
pub fn job_outcome(job: &Job) -> JobOutcome {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.as_slice())
        .unwrap_or_default();

    let is_true = |type_: &str| {
        conditions
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
    };

    if is_true("Complete").is_some() {
        return JobOutcome::Complete;
    }
    if let Some(failed) = is_true("Failed") {
        return JobOutcome::Failed {
            job: job.metadata.name.clone().unwrap_or_default(),
            reason: failed
                .reason
                .clone()
                .or_else(|| failed.message.clone())
                .unwrap_or_else(|| "Failed".to_string()),
        };
    }
    JobOutcome::Running
}

/// Readiness check for a Deployment or StatefulSet.
///
/// A resource that does not exist yet is "not ready", not an error; an API
/// failure is a [`Error::WorkloadFetchError`].
pub async fn replicas_ready(source: &dyn WorkloadStatusSource, target: &JobWatchTarget) -> Result<bool> {
    let status = source.replica_status(target).await?;
    tracing::debug!(watch = %target, status = ?status, "Replica status");
    Ok(status.is_some_and(|s| s.is_ready()))
}

/// Existence check for a scheduled job
pub async fn scheduled_job_exists(
    source: &dyn WorkloadStatusSource,
    target: &JobWatchTarget,
) -> Result<bool> {
    source.scheduled_job_exists(target).await
}

/// Completion check for jobs triggered by a scheduled job.
///
/// `Ok(true)` once any owned job is complete. Otherwise a failed job is
/// returned as [`Error::WorkloadFailed`].
pub async fn triggered_job_completed(
    source: &dyn WorkloadStatusSource,
    target: &JobWatchTarget,
) -> Result<bool> {
    let outcomes = source.owned_job_outcomes(target).await?;

    if outcomes.iter().any(|o| *o == JobOutcome::Complete) {
        return Ok(true);
    }

    if let Some(JobOutcome::Failed { job, reason }) = outcomes
        .into_iter()
        .find(|o| matches!(o, JobOutcome::Failed { .. }))
    {
        return Err(Error::WorkloadFailed {
            kind: WorkloadKind::TriggeredJob,
            namespace: target.namespace.clone(),
            name: job,
            reason: format!("{} (owned by CronJob {})", reason, target.owner_name),
        });
    }

    Ok(false)
}

/// Terminal state of a single watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Pending,
    Ready,
    Failed,
    TimedOut,
}

impl WatchState {
    /// State of a finished watch
    pub fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => WatchState::Ready,
            Err(e) if e.is_deadline() => WatchState::TimedOut,
            Err(_) => WatchState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WatchState::Pending)
    }
}

/// Runs workload checks under the poll engine
#[derive(Clone)]
pub struct WorkloadWatcher {
    source: Arc<dyn WorkloadStatusSource>,
}

impl WorkloadWatcher {
    pub fn new(source: Arc<dyn WorkloadStatusSource>) -> Self {
        Self { source }
    }

    /// Wait until a Deployment reports all desired replicas ready
    pub async fn wait_for_deployment(&self, namespace: &str, name: &str, spec: &PollSpec) -> Result<()> {
        self.wait_for_replicas(JobWatchTarget::deployment(namespace, name), spec)
            .await
    }

    /// Wait until a StatefulSet reports all desired replicas ready
    pub async fn wait_for_statefulset(&self, namespace: &str, name: &str, spec: &PollSpec) -> Result<()> {
        self.wait_for_replicas(JobWatchTarget::statefulset(namespace, name), spec)
            .await
    }

    /// Wait until the scheduled job exists
    pub async fn wait_for_scheduled_job(&self, namespace: &str, name: &str, spec: &PollSpec) -> Result<()> {
        let target = JobWatchTarget::scheduled_job(namespace, name);
        let source = self.source.as_ref();
        let target_ref = &target;
        let result = poll_until(&format!("{} to exist", target), spec, move || {
            scheduled_job_exists(source, target_ref)
        })
        .await;
        self.log_outcome(&target, &result);
        result
    }

    /// Wait until a job triggered by the scheduled job completes
    pub async fn wait_for_job_of_owner(&self, namespace: &str, owner: &str, spec: &PollSpec) -> Result<()> {
        let target = JobWatchTarget::jobs_of(namespace, owner);
        let source = self.source.as_ref();
        let target_ref = &target;
        let result = poll_until(&format!("{} to complete", target), spec, move || {
            triggered_job_completed(source, target_ref)
        })
        .await;
        self.log_outcome(&target, &result);
        result
    }

    async fn wait_for_replicas(&self, target: JobWatchTarget, spec: &PollSpec) -> Result<()> {
        let source = self.source.as_ref();
        let target_ref = &target;
        let result = poll_until(&format!("{} to be ready", target), spec, move || {
            replicas_ready(source, target_ref)
        })
        .await;
        self.log_outcome(&target, &result);
        result
    }

    fn log_outcome(&self, target: &JobWatchTarget, result: &Result<()>) {
        match WatchState::from_result(result) {
            WatchState::Ready => tracing::info!(watch = %target, "Watch ready"),
            state => tracing::warn!(watch = %target, state = ?state, "Watch did not succeed"),
        }
    }
}
