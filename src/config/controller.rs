//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Component whose storage is encrypted
    /// Used as key name prefix and component label value
    pub component: String,
    /// Namespace holding key secrets and the published configuration
    pub key_namespace: String,
    /// Namespace of the API server instances and their revisioned configurations
    pub target_namespace: String,
    /// Label selector identifying API server instance pods
    pub instance_label_selector: String,
    /// Pod label carrying the configuration revision an instance runs
    pub revision_label: String,
    /// Name of the cluster-scoped EncryptionPolicy to follow
    pub policy_name: String,
    /// Time-based key rotation interval (seconds)
    /// Overridden by `spec.rotationInterval` of the policy
    pub rotation_interval_secs: u64,
    /// Delay before re-running while instances have not converged (seconds)
    pub unconverged_requeue_secs: u64,
    /// Number of unused keys kept for backup decryption
    pub keep_number_of_secrets: usize,
    /// Page size when rewriting stored objects during migration
    pub migration_page_size: u32,
    /// Periodic resync interval for every controller (seconds)
    pub resync_interval_secs: u64,
    /// Attempts for optimistic read-modify-write updates
    pub conflict_retry_attempts: u32,
    /// Exponential backoff starting value (milliseconds)
    /// Initial delay before retrying after an error
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    /// Maximum delay between retries
    pub backoff_max_ms: u64,
    /// Global log level (error, warn, info, debug, trace)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            component: DEFAULT_COMPONENT.to_string(),
            key_namespace: DEFAULT_KEY_NAMESPACE.to_string(),
            target_namespace: DEFAULT_TARGET_NAMESPACE.to_string(),
            instance_label_selector: DEFAULT_INSTANCE_LABEL_SELECTOR.to_string(),
            revision_label: DEFAULT_REVISION_LABEL.to_string(),
            policy_name: DEFAULT_POLICY_NAME.to_string(),
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL_SECS,
            unconverged_requeue_secs: DEFAULT_UNCONVERGED_REQUEUE_SECS,
            keep_number_of_secrets: DEFAULT_KEEP_NUMBER_OF_SECRETS,
            migration_page_size: DEFAULT_MIGRATION_PAGE_SIZE,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            conflict_retry_attempts: DEFAULT_CONFLICT_RETRY_ATTEMPTS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            component: env_var_or_default_str("COMPONENT", DEFAULT_COMPONENT),
            key_namespace: env_var_or_default_str("KEY_NAMESPACE", DEFAULT_KEY_NAMESPACE),
            target_namespace: env_var_or_default_str("TARGET_NAMESPACE", DEFAULT_TARGET_NAMESPACE),
            instance_label_selector: env_var_or_default_str(
                "INSTANCE_LABEL_SELECTOR",
                DEFAULT_INSTANCE_LABEL_SELECTOR,
            ),
            revision_label: env_var_or_default_str("REVISION_LABEL", DEFAULT_REVISION_LABEL),
            policy_name: env_var_or_default_str("POLICY_NAME", DEFAULT_POLICY_NAME),
            rotation_interval_secs: env_var_or_default(
                "ROTATION_INTERVAL_SECS",
                DEFAULT_ROTATION_INTERVAL_SECS,
            ),
            unconverged_requeue_secs: env_var_or_default(
                "UNCONVERGED_REQUEUE_SECS",
                DEFAULT_UNCONVERGED_REQUEUE_SECS,
            ),
            keep_number_of_secrets: env_var_or_default(
                "KEEP_NUMBER_OF_SECRETS",
                DEFAULT_KEEP_NUMBER_OF_SECRETS,
            ),
            migration_page_size: env_var_or_default(
                "MIGRATION_PAGE_SIZE",
                DEFAULT_MIGRATION_PAGE_SIZE,
            ),
            resync_interval_secs: env_var_or_default(
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_INTERVAL_SECS,
            ),
            conflict_retry_attempts: env_var_or_default(
                "CONFLICT_RETRY_ATTEMPTS",
                DEFAULT_CONFLICT_RETRY_ATTEMPTS,
            ),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            log_level: env_var_or_default_str("LOG_LEVEL", "info"),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
        }
    }

    /// Get rotation interval duration
    pub fn rotation_interval_duration(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    /// Get unconverged requeue duration
    pub fn unconverged_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.unconverged_requeue_secs)
    }

    /// Get resync interval duration
    pub fn resync_interval_duration(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Get backoff start duration
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
pub(crate) fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.keep_number_of_secrets, 10);
        assert_eq!(
            config.rotation_interval_duration(),
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(config.unconverged_requeue_duration(), Duration::from_secs(120));
        assert_eq!(config.component, "kube-apiserver");
    }

    #[test]
    fn test_env_var_or_default_falls_back_on_garbage() {
        // unset variable
        assert_eq!(
            env_var_or_default("ENCRYPTION_KEY_CONTROLLER_TEST_UNSET_VARIABLE", 42u64),
            42
        );
        assert_eq!(
            env_var_or_default_str("ENCRYPTION_KEY_CONTROLLER_TEST_UNSET_VARIABLE", "x"),
            "x"
        );
    }
}
