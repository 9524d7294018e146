//! Integration tests against a live cluster
//!
//! Tests verify:
//! - Deployment readiness is observed through the workload watcher
//! - Catalog presence and absence through a real pod port-forward
//! - A missing credential secret fails before any tunnel is opened
//! - Index cleaner runs are correlated to their CronJob, and a failing run
//!   is reported as a failure instead of a timeout

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::Service;
use kube::Api;
use kube::api::PostParams;

use index_verifier::{Error, PollSpec, StorageTarget, Verifier};

use crate::{
    CATALOG_PORT, ScratchNamespace, TestCluster, cleaner_cronjob, fake_catalog_deployment,
    fake_catalog_service, sleeper_deployment,
};

/// Pod startup including a busybox pull
const READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Cron jobs tick once a minute
const CRON_EXTRA_TIMEOUT: Duration = Duration::from_secs(90);

struct TestContext {
    client: kube::Client,
    verifier: Verifier,
    _cluster: std::sync::Arc<TestCluster>,
}

async fn setup() -> TestContext {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,kube=warn")
        .with_test_writer()
        .try_init();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cluster = TestCluster::shared().await.expect("Cluster not usable");
    tracing::debug!(server = %cluster.server_version, "Using test cluster");
    let client = cluster.client().await.expect("Failed to create client");

    TestContext {
        verifier: Verifier::from_client(client.clone())
            .with_tunnel_setup_timeout(READY_TIMEOUT),
        client,
        _cluster: cluster,
    }
}

fn spec(expected: bool) -> PollSpec {
    PollSpec::new(Duration::from_secs(2), READY_TIMEOUT, expected).unwrap()
}

fn storage(namespace: &str, name: &str, secure: bool) -> StorageTarget {
    StorageTarget {
        namespace: namespace.to_string(),
        service_name: name.to_string(),
        selector_name: name.to_string(),
        port: CATALOG_PORT,
        secret_name: name.to_string(),
        secure,
    }
}

async fn create_catalog(client: &kube::Client, namespace: &str, name: &str, indices: &[&str]) {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    deployments
        .create(&PostParams::default(), &fake_catalog_deployment(name, namespace, indices))
        .await
        .expect("Failed to create catalog deployment");

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    services
        .create(&PostParams::default(), &fake_catalog_service(name, namespace))
        .await
        .expect("Failed to create catalog service");
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_deployment_ready() {
    let ctx = setup().await;
    let ns = ScratchNamespace::create(ctx.client.clone(), "deploy")
        .await
        .expect("Failed to create namespace");

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), ns.name());
    deployments
        .create(&PostParams::default(), &sleeper_deployment("query", ns.name()))
        .await
        .expect("Failed to create deployment");

    ctx.verifier
        .await_deployment_ready(ns.name(), "query", &spec(true))
        .await
        .expect("Deployment should become ready");

    ns.delete().await.expect("Failed to delete namespace");
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_index_presence_through_port_forward() {
    let ctx = setup().await;
    let ns = ScratchNamespace::create(ctx.client.clone(), "index")
        .await
        .expect("Failed to create namespace");

    create_catalog(&ctx.client, ns.name(), "elasticsearch", &["jaeger-span-2024-01-01"]).await;
    ctx.verifier
        .await_deployment_ready(ns.name(), "elasticsearch", &spec(true))
        .await
        .expect("Catalog deployment should become ready");

    let target = storage(ns.name(), "elasticsearch", false);

    ctx.verifier
        .index_with_prefix_exists(&target, "jaeger-", &spec(true))
        .await
        .expect("jaeger- index should be present");

    ctx.verifier
        .index_with_prefix_exists(&target, "zipkin-", &spec(false))
        .await
        .expect("zipkin- index should be absent");

    ns.delete().await.expect("Failed to delete namespace");
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_missing_secret_fails_fast() {
    let ctx = setup().await;
    let ns = ScratchNamespace::create(ctx.client.clone(), "secret")
        .await
        .expect("Failed to create namespace");

    let err = ctx
        .verifier
        .index_with_prefix_exists(&storage(ns.name(), "elasticsearch", true), "jaeger-", &spec(true))
        .await
        .expect_err("Secure check without a secret must fail");

    assert!(matches!(err, Error::CredentialUnavailable { .. }), "got {err}");

    ns.delete().await.expect("Failed to delete namespace");
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_index_cleaner_run_completes() {
    let ctx = setup().await;
    let ns = ScratchNamespace::create(ctx.client.clone(), "cleaner")
        .await
        .expect("Failed to create namespace");

    let cronjobs: Api<CronJob> = Api::namespaced(ctx.client.clone(), ns.name());
    cronjobs
        .create(&PostParams::default(), &cleaner_cronjob("simple-prod", ns.name(), true))
        .await
        .expect("Failed to create cronjob");

    ctx.verifier
        .await_index_cleaner_run(ns.name(), "simple-prod", &spec(true), CRON_EXTRA_TIMEOUT)
        .await
        .expect("Cleaner run should complete");

    ns.delete().await.expect("Failed to delete namespace");
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_failing_index_cleaner_is_reported() {
    let ctx = setup().await;
    let ns = ScratchNamespace::create(ctx.client.clone(), "cleaner-fail")
        .await
        .expect("Failed to create namespace");

    let cronjobs: Api<CronJob> = Api::namespaced(ctx.client.clone(), ns.name());
    cronjobs
        .create(&PostParams::default(), &cleaner_cronjob("simple-prod", ns.name(), false))
        .await
        .expect("Failed to create cronjob");

    let err = ctx
        .verifier
        .await_index_cleaner_run(
            ns.name(),
            "simple-prod",
            &spec(true).with_extra_timeout(CRON_EXTRA_TIMEOUT),
            CRON_EXTRA_TIMEOUT,
        )
        .await
        .expect_err("Failing cleaner must not succeed");

    assert!(matches!(err, Error::WorkloadFailed { .. }), "got {err}");

    ns.delete().await.expect("Failed to delete namespace");
}
