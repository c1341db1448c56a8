//! # Conflict Retry
//!
//! Read-modify-write of a single secret with optimistic concurrency.

use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use super::error::ControllerError;
use crate::store::{SecretStore, StoreError};

/// Re-read `name`, apply `mutate` and write it back, retrying on conflicts.
///
/// `mutate` returns whether it changed the secret; nothing is written otherwise.
/// Returns whether an update was written.
pub async fn update_with_retry<F>(
    secrets: &dyn SecretStore,
    namespace: &str,
    name: &str,
    attempts: u32,
    mut mutate: F,
) -> Result<bool, ControllerError>
where
    F: FnMut(&mut Secret) -> Result<bool, ControllerError> + Send,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut secret) = secrets.get(namespace, name).await? else {
            return Err(StoreError::NotFound(format!("secret {namespace}/{name}")).into());
        };
        if !mutate(&mut secret)? {
            return Ok(false);
        }
        match secrets.update(namespace, &secret).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(
                    secret = name,
                    attempt,
                    "Conflict updating secret, retrying with a fresh read"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemorySecretStore;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn annotate(secret: &mut Secret, value: &str) -> bool {
        let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert("k".to_string(), value.to_string()) != Some(value.to_string())
    }

    #[tokio::test]
    async fn test_retries_after_conflict() {
        let store = MemorySecretStore::new();
        store.create("ns", &secret()).await.unwrap();

        let mut calls = 0;
        let updated = update_with_retry(&store, "ns", "a", 3, |s| {
            calls += 1;
            if calls == 1 {
                // a concurrent writer bumps the resource version after our read
                let mut concurrent = store.all("ns").remove(0);
                annotate(&mut concurrent, "other");
                store.insert("ns", concurrent);
            }
            Ok(annotate(s, "mine"))
        })
        .await
        .unwrap();

        assert!(updated);
        assert_eq!(calls, 2);
        let stored = store.get("ns", "a").await.unwrap().unwrap();
        assert_eq!(stored.metadata.annotations.unwrap()["k"], "mine");
    }

    #[tokio::test]
    async fn test_unchanged_is_not_written() {
        let store = MemorySecretStore::new();
        store.create("ns", &secret()).await.unwrap();
        let updated = update_with_retry(&store, "ns", "a", 3, |_| Ok(false))
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_found() {
        let store = MemorySecretStore::new();
        let err = update_with_retry(&store, "ns", "a", 3, |_| Ok(true))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Store(ref e) if e.is_not_found()));
    }
}
