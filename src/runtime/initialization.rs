//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, Kubernetes client setup and wiring of the controller context.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kube::Client;
use tracing::{error, info};

use crate::config::{create_shared_config, SharedControllerConfig, SharedServerConfig};
use crate::constants::FIELD_MANAGER;
use crate::controller::ControllerContext;
use crate::observability;
use crate::server::{start_server, ServerState};
use crate::store::kube::{
    KubeConditionSink, KubeInstanceLister, KubePolicySource, KubeResourceMigrator,
    KubeSecretStore,
};
use crate::store::KubeEventPublisher;

/// Everything the runtime needs after startup
pub struct InitializationResult {
    pub client: Client,
    pub context: ControllerContext,
    pub server_state: Arc<ServerState>,
    pub controller_config: SharedControllerConfig,
    pub server_config: SharedServerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.is_ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Controller context wiring
pub async fn initialize() -> Result<InitializationResult> {
    // Must run before anything creates a TLS connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let (controller_config, server_config) = create_shared_config();

    {
        let config = controller_config.read().await;
        observability::logging::init_tracing(&config)?;
    }

    info!("Starting Encryption Key Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let server_port = server_config.read().await.metrics_port;
    let server_state_clone = Arc::clone(&server_state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, server_config.clone()).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let context = {
        let config = controller_config.read().await;
        info!(
            component = %config.component,
            key_namespace = %config.key_namespace,
            target_namespace = %config.target_namespace,
            policy = %config.policy_name,
            "Controller configuration loaded"
        );
        ControllerContext {
            secrets: Arc::new(KubeSecretStore::new(client.clone())),
            instances: Arc::new(KubeInstanceLister::new(
                client.clone(),
                config.target_namespace.clone(),
                config.instance_label_selector.clone(),
                config.revision_label.clone(),
            )),
            migrator: Arc::new(KubeResourceMigrator::new(client.clone())),
            policies: Arc::new(KubePolicySource::new(client.clone())),
            conditions: Arc::new(KubeConditionSink::new(
                client.clone(),
                config.policy_name.clone(),
            )),
            events: Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER)),
            config: controller_config.clone(),
        }
    };

    info!("Controller initialized, starting controllers...");

    Ok(InitializationResult {
        client,
        context,
        server_state,
        controller_config,
        server_config,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: SharedServerConfig,
) -> Result<()> {
    let (startup_timeout, poll_interval) = {
        let config = server_config.read().await;
        (config.startup_timeout(), config.poll_interval())
    };
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow!("HTTP server failed to start"));
        }

        if server_state.is_ready.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}
