//! # Controller Context
//!
//! Everything a controller reconciles against, shared by all five controllers.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;

use crate::config::SharedControllerConfig;
use crate::store::{
    ConditionSink, EventPublisher, InstanceLister, PolicySource, ResourceMigrator, SecretStore,
};

#[derive(Clone)]
pub struct ControllerContext {
    pub secrets: Arc<dyn SecretStore>,
    pub instances: Arc<dyn InstanceLister>,
    pub migrator: Arc<dyn ResourceMigrator>,
    pub policies: Arc<dyn PolicySource>,
    pub conditions: Arc<dyn ConditionSink>,
    pub events: Arc<dyn EventPublisher>,
    pub config: SharedControllerConfig,
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext").finish_non_exhaustive()
    }
}

impl ControllerContext {
    /// Object events are recorded against
    pub async fn policy_reference(&self) -> ObjectReference {
        let name = self.config.read().await.policy_name.clone();
        ObjectReference {
            api_version: Some("encryption.octopilot.io/v1alpha1".to_string()),
            kind: Some("EncryptionPolicy".to_string()),
            name: Some(name),
            ..Default::default()
        }
    }
}

/// What a successful reconciliation asks of the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Wait for the next trigger
    Done,
    /// Run again after the delay, without counting as an error
    RequeueAfter(Duration),
}
