//! Throwaway namespaces, one per test

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, PostParams, PropagationPolicy};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use uuid::Uuid;

/// Label on every namespace the suite creates, for manual sweeping
pub const SCRATCH_LABEL: &str = "index-verifier.test/scratch";

pub struct ScratchNamespace {
    name: String,
    namespaces: Api<Namespace>,
}

impl ScratchNamespace {
    /// Create `verify-{purpose}-{8 hex chars}`
    pub async fn create(client: Client, purpose: &str) -> kube::Result<Self> {
        let name = format!("verify-{}-{}", purpose, &Uuid::new_v4().simple().to_string()[..8]);
        let namespaces: Api<Namespace> = Api::all(client);

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([
                    (SCRATCH_LABEL.to_string(), "true".to_string()),
                    ("index-verifier.test/purpose".to_string(), purpose.to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces.create(&PostParams::default(), &ns).await?;
        tracing::info!(namespace = %name, "Scratch namespace created");

        Ok(Self { name, namespaces })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delete the namespace in the background; already gone is fine
    pub async fn delete(self) -> kube::Result<()> {
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.namespaces.delete(&self.name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }
}
