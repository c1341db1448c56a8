//! # Custom Resource Definitions
//!
//! CRD types for the Encryption Key Controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - `EncryptionPolicy` specification and default values
//! - `status.rs` - Status conditions reported by the controllers
//! - `duration.rs` - Kubernetes duration strings used by policy fields

mod duration;
mod spec;
mod status;

pub use duration::parse_kubernetes_duration;
pub use spec::{default_mode, default_resources, EncryptionPolicy, EncryptionPolicySpec};
pub use status::{Condition, EncryptionPolicyStatus};
