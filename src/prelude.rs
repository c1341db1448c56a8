//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use encryption_key_controller::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Key lifecycle domain types
pub use crate::encryption::{
    compute_desired_state, DesiredState, EncryptionConfiguration, GroupResource,
    GroupResourceState, Key, KeyState, MigrationState, Mode,
};

// Controllers
pub use crate::controller::{
    all_controllers, ControllerContext, ControllerError, KeyLifecycleController,
    ReconcileOutcome,
};

// Store traits
pub use crate::store::{
    ConditionSink, EventPublisher, InstanceLister, PolicySource, ResourceMigrator, SecretStore,
    StoreError,
};

// Config types
pub use crate::config::{
    ControllerConfig, ServerConfig, SharedControllerConfig, SharedServerConfig,
};
