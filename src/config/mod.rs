//! # Configuration
//!
//! Controller and server settings, loaded once from the environment at startup.

mod controller;
mod server;

use std::sync::Arc;
use tokio::sync::RwLock;

pub use controller::ControllerConfig;
pub use server::ServerConfig;

/// Controller configuration shared between controllers and the runtime
pub type SharedControllerConfig = Arc<RwLock<ControllerConfig>>;

/// Server configuration shared with the HTTP server
pub type SharedServerConfig = Arc<RwLock<ServerConfig>>;

/// Create shared configuration from environment variables
pub fn create_shared_config() -> (SharedControllerConfig, SharedServerConfig) {
    (
        Arc::new(RwLock::new(ControllerConfig::from_env())),
        Arc::new(RwLock::new(ServerConfig::from_env())),
    )
}
