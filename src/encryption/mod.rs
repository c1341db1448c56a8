//! # Encryption
//!
//! Pure encryption key lifecycle logic: key objects, encryption configurations,
//! the desired-state calculator and the revision convergence check. Nothing in
//! this module performs I/O.
//!
//! - `mode.rs` - Encryption modes and key generation
//! - `group_resource.rs` - Protected resource type identifiers
//! - `key.rs` - In-memory key lifecycle state
//! - `codec.rs` - Key Secret encoding and decoding
//! - `config.rs` - `EncryptionConfiguration` wire format
//! - `state.rs` - Desired-state calculation
//! - `revision.rs` - Instance revision convergence

pub mod codec;
pub mod config;
pub mod revision;
pub mod state;

mod group_resource;
mod key;
mod mode;

pub use codec::{DecodedKey, KeyDecodeError};
pub use config::EncryptionConfiguration;
pub use group_resource::{default_group_resources, GroupResource};
pub use key::{sort_recent_first, Key, KeyState, MigrationState};
pub use mode::{Mode, UnknownModeError};
pub use revision::{converged_revision, ConvergenceSnapshot, InstancePhase, InstanceStatus};
pub use state::{compute_desired_state, DesiredState, GroupResourceState};
