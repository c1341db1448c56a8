//! Common test utilities for controller integration tests
//!
//! Builds a `ControllerContext` over the in-memory stores and simulates the
//! revision machinery that copies the published configuration to the instances.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use encryption_key_controller::config::ControllerConfig;
use encryption_key_controller::controller::{
    all_controllers, ControllerContext, ControllerError, KeyLifecycleController, ReconcileOutcome,
    StateController,
};
use encryption_key_controller::crd::EncryptionPolicySpec;
use encryption_key_controller::encryption::codec::{self, DecodedKey};
use encryption_key_controller::encryption::config::{
    self as wire, published_secret_name, revisioned_secret_name,
};
use encryption_key_controller::encryption::{
    EncryptionConfiguration, GroupResource, InstancePhase, InstanceStatus, Key, KeyState,
    MigrationState, Mode,
};
use encryption_key_controller::store::memory::{
    MemoryResourceMigrator, MemorySecretStore, RecordingConditionSink, RecordingEventPublisher,
    StaticInstanceLister, StaticPolicySource,
};
use encryption_key_controller::store::SecretStore;
use tokio::sync::RwLock;

pub fn secrets_gr() -> GroupResource {
    GroupResource::core("secrets")
}

pub fn configmaps_gr() -> GroupResource {
    GroupResource::core("configmaps")
}

pub fn policy(mode: Mode) -> EncryptionPolicySpec {
    EncryptionPolicySpec {
        mode,
        ..Default::default()
    }
}

pub fn instances(revision: &str, count: usize) -> Vec<InstanceStatus> {
    (0..count)
        .map(|n| InstanceStatus {
            name: format!("kube-apiserver-{n}"),
            revision: Some(revision.to_string()),
            phase: InstancePhase::Running,
            ready: true,
        })
        .collect()
}

/// Key state as the key controller would mint it
pub fn key_state(key_id: u64, mode: Mode) -> KeyState {
    KeyState {
        key: Key::new(key_id.to_string(), STANDARD.encode(mode.generate_key())),
        mode,
        backed: true,
        migrated: MigrationState::default(),
        read_observed: None,
        write_observed: None,
        internal_reason: String::new(),
        external_reason: String::new(),
    }
}

/// Key state already migrated for `resources` at `at`
pub fn migrated_key_state(
    key_id: u64,
    mode: Mode,
    at: DateTime<Utc>,
    resources: Vec<GroupResource>,
) -> KeyState {
    KeyState {
        migrated: MigrationState {
            timestamp: Some(at),
            resources,
        },
        read_observed: Some(at),
        write_observed: Some(at),
        ..key_state(key_id, mode)
    }
}

pub struct Harness {
    pub secrets: Arc<MemorySecretStore>,
    pub instances: Arc<StaticInstanceLister>,
    pub migrator: Arc<MemoryResourceMigrator>,
    pub policies: Arc<StaticPolicySource>,
    pub conditions: Arc<RecordingConditionSink>,
    pub events: Arc<RecordingEventPublisher>,
    pub ctx: ControllerContext,
    pub config: ControllerConfig,
    revision: AtomicU64,
}

impl Harness {
    /// Three ready instances at revision 1 without any encryption configuration
    pub fn new(policy: Option<EncryptionPolicySpec>) -> Self {
        Self::with_config(policy, ControllerConfig::default())
    }

    pub fn with_config(policy: Option<EncryptionPolicySpec>, config: ControllerConfig) -> Self {
        let secrets = Arc::new(MemorySecretStore::new());
        let instances = Arc::new(StaticInstanceLister::new(instances("1", 3)));
        let migrator = Arc::new(MemoryResourceMigrator::new());
        let policies = Arc::new(StaticPolicySource::new(policy));
        let conditions = Arc::new(RecordingConditionSink::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let ctx = ControllerContext {
            secrets: secrets.clone(),
            instances: instances.clone(),
            migrator: migrator.clone(),
            policies: policies.clone(),
            conditions: conditions.clone(),
            events: events.clone(),
            config: Arc::new(RwLock::new(config.clone())),
        };
        Self {
            secrets,
            instances,
            migrator,
            policies,
            conditions,
            events,
            ctx,
            config,
            revision: AtomicU64::new(1),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Store a key object for `gr`
    pub fn insert_key(&self, gr: &GroupResource, state: &KeyState) {
        let secret = codec::encode(&self.config.component, &self.config.key_namespace, gr, state)
            .expect("encode key");
        self.secrets.insert(&self.config.key_namespace, secret);
    }

    /// Decoded key objects, newest first
    pub fn keys(&self) -> Vec<DecodedKey> {
        let mut keys: Vec<DecodedKey> = self
            .secrets
            .all(&self.config.key_namespace)
            .iter()
            .filter_map(|s| codec::decode(s).ok())
            .collect();
        keys.sort_by(|a, b| b.key_id.cmp(&a.key_id));
        keys
    }

    pub fn key_ids(&self) -> Vec<u64> {
        self.keys().iter().map(|k| k.key_id).collect()
    }

    pub fn published(&self) -> Option<EncryptionConfiguration> {
        self.secrets
            .all(&self.config.key_namespace)
            .iter()
            .find(|s| {
                s.metadata.name.as_deref()
                    == Some(published_secret_name(&self.config.target_namespace).as_str())
            })
            .map(|s| wire::from_secret(s).expect("published config parses"))
    }

    pub fn running(&self) -> Option<EncryptionConfiguration> {
        let name = revisioned_secret_name(&self.revision().to_string());
        self.secrets
            .all(&self.config.target_namespace)
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(name.as_str()))
            .map(|s| wire::from_secret(s).expect("running config parses"))
    }

    /// Copy the published configuration into a new revision all instances run.
    /// Returns whether a rollout happened.
    pub async fn rollout(&self) -> bool {
        let Some(published) = self.published() else {
            return false;
        };
        if self.running().as_ref() == Some(&published) {
            return false;
        }
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let secret = wire::to_secret(
            &self.config.target_namespace,
            &revisioned_secret_name(&revision.to_string()),
            &published,
        )
        .expect("serialize config");
        self.secrets
            .create(&self.config.target_namespace, &secret)
            .await
            .expect("create revisioned config");
        self.instances.set(instances(&revision.to_string(), 3));
        true
    }

    pub async fn run(
        &self,
        controller: &dyn KeyLifecycleController,
    ) -> Result<ReconcileOutcome, ControllerError> {
        controller.reconcile(&self.ctx).await
    }

    /// Publish and roll out until the running configuration matches the desired one
    pub async fn converge_config(&self) {
        for _ in 0..10 {
            self.run(&StateController)
                .await
                .expect("state controller succeeds");
            if !self.rollout().await {
                return;
            }
        }
        panic!("configuration did not converge");
    }

    /// Run every controller followed by a rollout until nothing changes
    pub async fn settle(&self, max_rounds: usize) -> usize {
        let controllers = all_controllers();
        for round in 0..max_rounds {
            let before = (self.secrets.all(&self.config.key_namespace), self.revision());
            for controller in &controllers {
                controller
                    .reconcile(&self.ctx)
                    .await
                    .unwrap_or_else(|e| panic!("{} failed: {e}", controller.name()));
            }
            self.rollout().await;
            let after = (self.secrets.all(&self.config.key_namespace), self.revision());
            if before == after {
                return round;
            }
        }
        panic!("controllers did not settle within {max_rounds} rounds");
    }
}

/// Key names in each resource entry of a configuration, in provider order
pub fn provider_keys(config: &EncryptionConfiguration) -> Vec<Vec<String>> {
    serde_json::to_value(config)
        .expect("serialize config")
        .get("resources")
        .and_then(|r| r.as_array())
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    entry["providers"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|p| p.as_object())
                        .flat_map(|p| p.values())
                        .filter_map(|v| v.get("keys").and_then(|k| k.as_array()))
                        .flatten()
                        .filter_map(|k| k["name"].as_str().map(String::from))
                        .collect()
                })
                .collect()
        })
        .unwrap_or_default()
}
