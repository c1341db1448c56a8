//! # In-Memory Stores
//!
//! Store implementations that keep everything in process memory. They follow the
//! API server semantics the controllers depend on: resource versions with conflict
//! detection, finalizers delaying deletion, and paginated listing.
//!
//! Used by the integration tests; no cluster is needed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::api::{DynamicObject, ObjectMeta};
use kube::runtime::events::EventType;

use super::{
    ConditionSink, EventPublisher, InstanceLister, PolicySource, ResourceMigrator, ResourcePage,
    SecretStore, StoreError,
};
use crate::crd::{Condition, EncryptionPolicySpec, EncryptionPolicyStatus};
use crate::encryption::{GroupResource, InstanceStatus};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Equality-based selector match (`k=v,k2=v2`)
fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            let (key, value) = term.split_once('=').unwrap_or((term, ""));
            meta.labels
                .as_ref()
                .and_then(|l| l.get(key.trim()))
                .is_some_and(|v| v == value.trim())
        })
}

#[derive(Debug, Default)]
struct SecretTable {
    objects: BTreeMap<(String, String), Secret>,
    /// Objects whose deletion waits for finalizers to be removed
    terminating: BTreeSet<(String, String)>,
    version: u64,
}

impl SecretTable {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Secrets held in memory with resource versions and finalizer-aware deletion
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    table: Mutex<SecretTable>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a secret as is, replacing any previous object of that name
    pub fn insert(&self, namespace: &str, mut secret: Secret) {
        let mut table = lock(&self.table);
        let name = secret.metadata.name.clone().unwrap_or_default();
        secret.metadata.namespace = Some(namespace.to_string());
        secret.metadata.resource_version = Some(table.next_version());
        table.objects.insert((namespace.to_string(), name), secret);
    }

    /// Every secret of a namespace, ordered by name
    pub fn all(&self, namespace: &str) -> Vec<Secret> {
        lock(&self.table)
            .objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, secret)| secret.clone())
            .collect()
    }

    /// Whether a delete was requested while finalizers still held the object
    pub fn is_terminating(&self, namespace: &str, name: &str) -> bool {
        lock(&self.table)
            .terminating
            .contains(&(namespace.to_string(), name.to_string()))
    }

    pub fn names(&self, namespace: &str) -> Vec<String> {
        lock(&self.table)
            .objects
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StoreError> {
        Ok(lock(&self.table)
            .objects
            .iter()
            .filter(|((ns, _), secret)| {
                ns == namespace && matches_selector(&secret.metadata, label_selector)
            })
            .map(|(_, secret)| secret.clone())
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(lock(&self.table)
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let mut table = lock(&self.table);
        let key = (namespace.to_string(), name.clone());
        if table.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("secret {namespace}/{name}")));
        }
        let mut stored = secret.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(table.next_version());
        table.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, namespace: &str, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let what = format!("secret {namespace}/{name}");
        let mut table = lock(&self.table);
        let key = (namespace.to_string(), name);
        let Some(current) = table.objects.get(&key) else {
            return Err(StoreError::NotFound(what));
        };
        if secret.metadata.resource_version.is_some()
            && secret.metadata.resource_version != current.metadata.resource_version
        {
            return Err(StoreError::Conflict(what));
        }

        let mut stored = secret.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(table.next_version());

        let finalized = stored
            .metadata
            .finalizers
            .as_ref()
            .is_none_or(|f| f.is_empty());
        if finalized && table.terminating.remove(&key) {
            table.objects.remove(&key);
        } else {
            table.objects.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut table = lock(&self.table);
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = table.objects.get(&key) else {
            return Err(StoreError::NotFound(format!("secret {namespace}/{name}")));
        };
        let guarded = current
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if guarded {
            table.terminating.insert(key);
        } else {
            table.objects.remove(&key);
        }
        Ok(())
    }
}

/// Instance listing that returns whatever was last set
#[derive(Debug, Default)]
pub struct StaticInstanceLister {
    instances: Mutex<Vec<InstanceStatus>>,
}

impl StaticInstanceLister {
    pub fn new(instances: Vec<InstanceStatus>) -> Self {
        Self {
            instances: Mutex::new(instances),
        }
    }

    pub fn set(&self, instances: Vec<InstanceStatus>) {
        *lock(&self.instances) = instances;
    }
}

#[async_trait]
impl InstanceLister for StaticInstanceLister {
    async fn list_instances(&self) -> Result<Vec<InstanceStatus>, StoreError> {
        Ok(lock(&self.instances).clone())
    }
}

/// Failure injected into [`MemoryResourceMigrator::rewrite`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteFailure {
    NotFound,
    Conflict,
    Unavailable,
}

#[derive(Debug, Default)]
struct MigratorState {
    objects: BTreeMap<GroupResource, Vec<DynamicObject>>,
    failures: HashMap<(GroupResource, String), RewriteFailure>,
    rewritten: Vec<(GroupResource, String)>,
    pages_served: usize,
    largest_page: usize,
}

/// Stored objects per resource type, paginated with index-based continue tokens
#[derive(Debug, Default)]
pub struct MemoryResourceMigrator {
    state: Mutex<MigratorState>,
}

impl MemoryResourceMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` objects named `<resource>-<n>` in namespace `default`
    pub fn populate(&self, gr: &GroupResource, count: usize) {
        let mut state = lock(&self.state);
        let objects = state.objects.entry(gr.clone()).or_default();
        for n in 0..count {
            objects.push(DynamicObject {
                types: None,
                metadata: ObjectMeta {
                    name: Some(format!("{}-{n}", gr.resource)),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
                data: serde_json::Value::Null,
            });
        }
    }

    pub fn fail_rewrite(&self, gr: &GroupResource, name: &str, failure: RewriteFailure) {
        lock(&self.state)
            .failures
            .insert((gr.clone(), name.to_string()), failure);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Names of successfully rewritten objects of a resource type, in rewrite order
    pub fn rewritten(&self, gr: &GroupResource) -> Vec<String> {
        lock(&self.state)
            .rewritten
            .iter()
            .filter(|(rewritten_gr, _)| rewritten_gr == gr)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn pages_served(&self) -> usize {
        lock(&self.state).pages_served
    }

    pub fn largest_page(&self) -> usize {
        lock(&self.state).largest_page
    }
}

#[async_trait]
impl ResourceMigrator for MemoryResourceMigrator {
    async fn list_page(
        &self,
        gr: &GroupResource,
        continue_token: Option<&str>,
        limit: u32,
    ) -> Result<ResourcePage, StoreError> {
        let start = match continue_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| StoreError::Other(format!("invalid continue token {token:?}")))?,
            None => 0,
        };
        let mut state = lock(&self.state);
        let all = state.objects.get(gr).cloned().unwrap_or_default();
        let end = all.len().min(start + limit.max(1) as usize);
        let items: Vec<DynamicObject> = all.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        state.pages_served += 1;
        state.largest_page = state.largest_page.max(items.len());
        Ok(ResourcePage {
            items,
            continue_token: (end < all.len()).then(|| end.to_string()),
        })
    }

    async fn rewrite(&self, gr: &GroupResource, object: &DynamicObject) -> Result<(), StoreError> {
        let name = object.metadata.name.clone().unwrap_or_default();
        let mut state = lock(&self.state);
        match state.failures.get(&(gr.clone(), name.clone())) {
            Some(RewriteFailure::NotFound) => Err(StoreError::NotFound(format!("{gr} {name}"))),
            Some(RewriteFailure::Conflict) => Err(StoreError::Conflict(format!("{gr} {name}"))),
            Some(RewriteFailure::Unavailable) => Err(StoreError::Other(format!(
                "storage unavailable while rewriting {gr} {name}"
            ))),
            None => {
                state.rewritten.push((gr.clone(), name));
                Ok(())
            }
        }
    }
}

/// Policy source returning a fixed policy
#[derive(Debug, Default)]
pub struct StaticPolicySource {
    policy: Mutex<Option<EncryptionPolicySpec>>,
}

impl StaticPolicySource {
    pub fn new(policy: Option<EncryptionPolicySpec>) -> Self {
        Self {
            policy: Mutex::new(policy),
        }
    }

    pub fn set(&self, policy: Option<EncryptionPolicySpec>) {
        *lock(&self.policy) = policy;
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn get_policy(&self, _name: &str) -> Result<Option<EncryptionPolicySpec>, StoreError> {
        Ok(lock(&self.policy).clone())
    }
}

/// Keeps conditions the way the status subresource would
#[derive(Debug, Default)]
pub struct RecordingConditionSink {
    status: Mutex<EncryptionPolicyStatus>,
}

impl RecordingConditionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(&self, r#type: &str) -> Option<Condition> {
        lock(&self.status).condition(r#type).cloned()
    }

    pub fn conditions(&self) -> Vec<Condition> {
        lock(&self.status).conditions.clone()
    }
}

#[async_trait]
impl ConditionSink for RecordingConditionSink {
    async fn set_condition(&self, condition: Condition) {
        let now = chrono::Utc::now().to_rfc3339();
        lock(&self.status).upsert_condition(condition, &now);
    }
}

/// A published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// Event publisher that records every event
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, reason: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.reason == reason)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        lock(&self.events).push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn secret(name: &str, labels: &[(&str, &str)], finalizer: bool) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                finalizers: finalizer.then(|| vec!["guard".to_string()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemorySecretStore::new();
        store.create("ns", &secret("a", &[("app", "x")], false)).await.unwrap();
        store.create("ns", &secret("b", &[("app", "y")], false)).await.unwrap();
        store.create("other", &secret("c", &[("app", "x")], false)).await.unwrap();

        let listed = store.list("ns", "app=x").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_create_twice_is_already_exists() {
        let store = MemorySecretStore::new();
        store.create("ns", &secret("a", &[], false)).await.unwrap();
        let err = store.create("ns", &secret("a", &[], false)).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemorySecretStore::new();
        let created = store.create("ns", &secret("a", &[], false)).await.unwrap();
        store.update("ns", &created).await.unwrap();
        let err = store.update("ns", &created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_finalizer_delays_deletion() {
        let store = MemorySecretStore::new();
        store.create("ns", &secret("a", &[], true)).await.unwrap();
        store.delete("ns", "a").await.unwrap();

        let mut pending = store.get("ns", "a").await.unwrap().unwrap();
        assert!(store.is_terminating("ns", "a"));

        pending.metadata.finalizers = Some(Vec::new());
        store.update("ns", &pending).await.unwrap();
        assert!(store.get("ns", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migrator_pages() {
        let migrator = MemoryResourceMigrator::new();
        let gr = GroupResource::core("secrets");
        migrator.populate(&gr, 5);

        let first = migrator.list_page(&gr, None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let second = migrator
            .list_page(&gr, first.continue_token.as_deref(), 2)
            .await
            .unwrap();
        let third = migrator
            .list_page(&gr, second.continue_token.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.continue_token.is_none());
        assert_eq!(migrator.largest_page(), 2);
    }

    #[test]
    fn test_debug_shows_stored_secrets() {
        let store = MemorySecretStore::new();
        store.insert("keys", secret("kube-apiserver-core-secrets-encryption-1", &[], false));
        assert!(format!("{store:?}").contains("kube-apiserver-core-secrets-encryption-1"));
        assert!(format!("{:?}", RecordingEventPublisher::new()).contains("RecordingEventPublisher"));
    }
}
