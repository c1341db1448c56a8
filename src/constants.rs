//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Default delay before re-running a controller whose instances have not converged (seconds)
pub const DEFAULT_UNCONVERGED_REQUEUE_SECS: u64 = 120;

/// Default time-based key rotation interval (one week, in seconds)
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Default number of unused keys kept around for backup decryption
pub const DEFAULT_KEEP_NUMBER_OF_SECRETS: usize = 10;

/// Default page size used when rewriting stored objects during migration
pub const DEFAULT_MIGRATION_PAGE_SIZE: u32 = 500;

/// Default periodic resync interval for every controller (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 60;

/// Default number of attempts for optimistic read-modify-write updates
pub const DEFAULT_CONFLICT_RETRY_ATTEMPTS: u32 = 5;

/// Default component whose storage is being encrypted
pub const DEFAULT_COMPONENT: &str = "kube-apiserver";

/// Default namespace holding key objects and the published configuration
pub const DEFAULT_KEY_NAMESPACE: &str = "encryption-config-managed";

/// Default namespace of the API server instances
pub const DEFAULT_TARGET_NAMESPACE: &str = "kube-apiserver";

/// Default label selector for API server instance pods
pub const DEFAULT_INSTANCE_LABEL_SELECTOR: &str = "apiserver=true";

/// Default pod label carrying the configuration revision an instance runs
pub const DEFAULT_REVISION_LABEL: &str = "revision";

/// Default name of the cluster-scoped `EncryptionPolicy`
pub const DEFAULT_POLICY_NAME: &str = "cluster";

/// Field manager used for status patches and the event reporter
pub const FIELD_MANAGER: &str = "encryption-key-controller";

/// Prefix shared by the published and the revisioned configuration secrets
pub const ENCRYPTION_CONFIG_SECRET_PREFIX: &str = "encryption-config";

/// Data key of the configuration secrets
pub const ENCRYPTION_CONFIG_DATA_KEY: &str = "encryption-config";

/// Data key of key secrets holding the raw key material
pub const KEY_DATA_KEY: &str = "encryption.octopilot.io-key";

/// Label identifying the component a key belongs to
pub const LABEL_COMPONENT: &str = "encryption.octopilot.io/component";

/// Label identifying the API group a key was minted for
pub const LABEL_GROUP: &str = "encryption.octopilot.io/group";

/// Label identifying the resource a key was minted for
pub const LABEL_RESOURCE: &str = "encryption.octopilot.io/resource";

/// Annotation holding the key mode
pub const ANNOTATION_MODE: &str = "encryption.octopilot.io/mode";

/// Set once every instance has observed the key as a read key
pub const ANNOTATION_READ_TIMESTAMP: &str = "encryption.octopilot.io/read-timestamp";

/// Set once every instance has observed the key as the write key
pub const ANNOTATION_WRITE_TIMESTAMP: &str = "encryption.octopilot.io/write-timestamp";

/// Set when a storage migration under this key completed
pub const ANNOTATION_MIGRATED_TIMESTAMP: &str = "encryption.octopilot.io/migrated-timestamp";

/// JSON list of resource types migrated under this key
pub const ANNOTATION_MIGRATED_RESOURCES: &str = "encryption.octopilot.io/migrated-resources";

/// Why the controller minted the key
pub const ANNOTATION_INTERNAL_REASON: &str = "encryption.octopilot.io/internal-reason";

/// Administrator supplied rotation reason at minting time
pub const ANNOTATION_EXTERNAL_REASON: &str = "encryption.octopilot.io/external-reason";

/// Human readable warning placed on every key secret
pub const ANNOTATION_DESCRIPTION: &str = "kubernetes.io/description";

/// Finalizer guarding key secrets against accidental deletion
pub const KEY_FINALIZER: &str = "encryption.octopilot.io/deletion-protection";
