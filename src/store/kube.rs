//! # Kubernetes Stores
//!
//! Store implementations backed by the Kubernetes API.
//!
//! API errors are classified by HTTP status code: 404 becomes `NotFound`, 409 becomes
//! `AlreadyExists` on create and `Conflict` on update.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::{self, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{
    ConditionSink, InstanceLister, PolicySource, ResourceMigrator, ResourcePage, SecretStore,
    StoreError,
};
use crate::constants::FIELD_MANAGER;
use crate::crd::{Condition, EncryptionPolicy, EncryptionPolicySpec};
use crate::encryption::{GroupResource, InstancePhase, InstanceStatus};

fn classify(err: kube::Error, what: &str, on_conflict: fn(String) -> StoreError) -> StoreError {
    match err {
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(api_err) if api_err.code == 409 => on_conflict(what.to_string()),
        other => StoreError::Kube(other),
    }
}

/// Secrets through the Kubernetes API
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl std::fmt::Debug for KubeSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretStore").finish_non_exhaustive()
    }
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StoreError> {
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        self.api(namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| classify(e, &format!("secret {namespace}/{name}"), StoreError::AlreadyExists))
    }

    async fn update(&self, namespace: &str, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        self.api(namespace)
            .replace(name, &PostParams::default(), secret)
            .await
            .map_err(|e| classify(e, &format!("secret {namespace}/{name}"), StoreError::Conflict))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, &format!("secret {namespace}/{name}"), StoreError::Conflict))
    }
}

/// Lists API server pods directly from the API server, bypassing any cache
#[derive(Clone)]
pub struct KubeInstanceLister {
    client: Client,
    namespace: String,
    label_selector: String,
    revision_label: String,
}

impl std::fmt::Debug for KubeInstanceLister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeInstanceLister")
            .field("namespace", &self.namespace)
            .field("label_selector", &self.label_selector)
            .field("revision_label", &self.revision_label)
            .finish_non_exhaustive()
    }
}

impl KubeInstanceLister {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        revision_label: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            revision_label: revision_label.into(),
        }
    }
}

#[async_trait]
impl InstanceLister for KubeInstanceLister {
    async fn list_instances(&self) -> Result<Vec<InstanceStatus>, StoreError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&self.label_selector))
            .await?;
        Ok(list
            .items
            .iter()
            .map(|pod| instance_status(pod, &self.revision_label))
            .collect())
    }
}

fn instance_status(pod: &Pod, revision_label: &str) -> InstanceStatus {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    InstanceStatus {
        name: pod.metadata.name.clone().unwrap_or_default(),
        revision: pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(revision_label))
            .filter(|r| !r.is_empty())
            .cloned(),
        phase: InstancePhase::parse(status.and_then(|s| s.phase.as_deref())),
        ready,
    }
}

/// Rewrites arbitrary resources at their preferred API version, discovered on first use
pub struct KubeResourceMigrator {
    client: Client,
    discovered: RwLock<HashMap<GroupResource, (ApiResource, Scope)>>,
}

impl std::fmt::Debug for KubeResourceMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceMigrator").finish_non_exhaustive()
    }
}

impl KubeResourceMigrator {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovered: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, gr: &GroupResource) -> Result<(ApiResource, Scope), StoreError> {
        if let Some(found) = self.discovered.read().await.get(gr) {
            return Ok(found.clone());
        }

        let group = discovery::group(&self.client, &gr.group).await?;
        let (resource, caps) = group
            .recommended_resources()
            .into_iter()
            .find(|(ar, _)| ar.plural == gr.resource)
            .ok_or_else(|| StoreError::UnknownResource(gr.to_string()))?;
        debug!(
            resource = %gr,
            version = %resource.version,
            "Discovered preferred version for migration"
        );

        let resolved = (resource, caps.scope);
        self.discovered
            .write()
            .await
            .insert(gr.clone(), resolved.clone());
        Ok(resolved)
    }
}

#[async_trait]
impl ResourceMigrator for KubeResourceMigrator {
    async fn list_page(
        &self,
        gr: &GroupResource,
        continue_token: Option<&str>,
        limit: u32,
    ) -> Result<ResourcePage, StoreError> {
        let (resource, _) = self.resolve(gr).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let mut params = ListParams::default().limit(limit);
        if let Some(token) = continue_token {
            params = params.continue_token(token);
        }
        let list = api.list(&params).await?;
        Ok(ResourcePage {
            items: list.items,
            continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
        })
    }

    async fn rewrite(&self, gr: &GroupResource, object: &DynamicObject) -> Result<(), StoreError> {
        let (resource, scope) = self.resolve(gr).await?;
        let name = object.metadata.name.as_deref().unwrap_or_default();
        let api: Api<DynamicObject> = match (&scope, object.metadata.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        };
        api.replace(name, &PostParams::default(), object)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, &format!("{gr} {name}"), StoreError::Conflict))
    }
}

/// Reads the cluster-scoped `EncryptionPolicy`
#[derive(Clone)]
pub struct KubePolicySource {
    client: Client,
}

impl std::fmt::Debug for KubePolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePolicySource").finish_non_exhaustive()
    }
}

impl KubePolicySource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PolicySource for KubePolicySource {
    async fn get_policy(&self, name: &str) -> Result<Option<EncryptionPolicySpec>, StoreError> {
        let api: Api<EncryptionPolicy> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.map(|policy| policy.spec))
    }
}

/// Writes controller conditions into the `EncryptionPolicy` status
#[derive(Clone)]
pub struct KubeConditionSink {
    client: Client,
    policy_name: String,
}

impl std::fmt::Debug for KubeConditionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeConditionSink")
            .field("policy_name", &self.policy_name)
            .finish_non_exhaustive()
    }
}

impl KubeConditionSink {
    pub fn new(client: Client, policy_name: impl Into<String>) -> Self {
        Self {
            client,
            policy_name: policy_name.into(),
        }
    }

    async fn try_set(&self, condition: Condition) -> Result<(), kube::Error> {
        let api: Api<EncryptionPolicy> = Api::all(self.client.clone());
        let Some(policy) = api.get_opt(&self.policy_name).await? else {
            debug!(
                policy = %self.policy_name,
                condition = %condition.r#type,
                "EncryptionPolicy not found, dropping condition"
            );
            return Ok(());
        };

        let mut status = policy.status.unwrap_or_default();
        let now = chrono::Utc::now().to_rfc3339();
        if !status.upsert_condition(condition, &now) {
            return Ok(());
        }

        let patch = serde_json::json!({
            "status": status
        });
        api.patch_status(
            &self.policy_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConditionSink for KubeConditionSink {
    async fn set_condition(&self, condition: Condition) {
        let condition_type = condition.r#type.clone();
        if let Err(e) = self.try_set(condition).await {
            warn!(
                policy = %self.policy_name,
                condition = %condition_type,
                error = %e,
                "Failed to update EncryptionPolicy condition"
            );
        }
    }
}
