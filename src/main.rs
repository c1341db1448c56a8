//! # Encryption Key Controller
//!
//! A Kubernetes controller that manages the lifecycle of the keys API servers use
//! to encrypt resources at rest.
//!
//! ## Overview
//!
//! Five cooperating controllers share the cluster as their only coordination point:
//!
//! 1. **Key minting** - creates a new key when none exists, the mode or rotation
//!    reason changed, or the current key is older than the rotation interval
//! 2. **State aggregation** - publishes the encryption configuration the API
//!    servers should run
//! 3. **Migration** - rewrites stored objects once every instance writes with the
//!    new key
//! 4. **Pod-state observation** - records which keys every instance has observed
//! 5. **Prune** - deletes keys no configuration references anymore
//!
//! Policy comes from the cluster-scoped `EncryptionPolicy` resource; controller
//! settings come from environment variables (see `config`).

use anyhow::Result;
use encryption_key_controller::runtime::{self, initialization::initialize};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    runtime::run(init).await
}
