//! # Stores
//!
//! The capabilities controllers consume from the cluster, as async traits.
//!
//! - `SecretStore` - list/get/create/update/delete Secrets with optimistic concurrency
//! - `InstanceLister` - live listing of API server instances
//! - `ResourceMigrator` - paginated listing and no-op rewrites of arbitrary resources
//! - `PolicySource` - the `EncryptionPolicy` the controllers follow
//! - `ConditionSink` - best-effort status condition reporting
//! - `EventPublisher` - best-effort Kubernetes events
//!
//! `kube` holds the Kubernetes implementations; `memory` holds in-memory ones used
//! by tests, built only with the `test-support` feature.

pub mod events;
pub mod kube;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use ::kube::api::DynamicObject;
use thiserror::Error;

use crate::crd::{Condition, EncryptionPolicySpec};
use crate::encryption::{GroupResource, InstanceStatus};

pub use events::{actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} was modified concurrently")]
    Conflict(String),
    #[error("resource type {0} is not served by the API server")]
    UnknownResource(String),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] ::kube::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// Namespaced Secret storage with optimistic concurrency
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StoreError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;

    /// Fails with `AlreadyExists` when a secret of that name exists
    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret, StoreError>;

    /// Fails with `Conflict` when the secret's resource version is stale
    async fn update(&self, namespace: &str, secret: &Secret) -> Result<Secret, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Uncached listing of API server instances
#[async_trait]
pub trait InstanceLister: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<InstanceStatus>, StoreError>;
}

/// One page of stored objects
#[derive(Debug, Default)]
pub struct ResourcePage {
    pub items: Vec<DynamicObject>,
    /// Token for the next page, `None` on the last page
    pub continue_token: Option<String>,
}

/// Rewrites stored objects so the storage layer re-encrypts them with the current write key
#[async_trait]
pub trait ResourceMigrator: Send + Sync {
    async fn list_page(
        &self,
        gr: &GroupResource,
        continue_token: Option<&str>,
        limit: u32,
    ) -> Result<ResourcePage, StoreError>;

    /// No-op update of a single object
    async fn rewrite(&self, gr: &GroupResource, object: &DynamicObject) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn get_policy(&self, name: &str) -> Result<Option<EncryptionPolicySpec>, StoreError>;
}

/// Fire-and-forget condition reporting; failures are logged, never returned
#[async_trait]
pub trait ConditionSink: Send + Sync {
    async fn set_condition(&self, condition: Condition);
}
