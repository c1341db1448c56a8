//! # Triggers
//!
//! Watches the objects the controllers depend on and fans every change out to all
//! controller queues, plus a periodic resync.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error_policy::handle_watch_stream_error;
use super::queue::{Trigger, WorkQueue};
use crate::config::ControllerConfig;
use crate::constants::LABEL_COMPONENT;
use crate::crd::EncryptionPolicy;

/// The queues of every controller
#[derive(Debug, Clone, Default)]
pub struct QueueFanout {
    queues: Vec<Arc<WorkQueue>>,
}

impl QueueFanout {
    pub fn new(queues: Vec<Arc<WorkQueue>>) -> Self {
        Self { queues }
    }

    pub fn add(&self, trigger: Trigger) {
        for queue in &self.queues {
            queue.add(trigger);
        }
    }
}

/// Start every watch and the resync ticker
pub fn spawn_triggers(
    client: Client,
    config: &ControllerConfig,
    fanout: QueueFanout,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let key_secrets: Api<Secret> = Api::namespaced(client.clone(), &config.key_namespace);
    let target_secrets: Api<Secret> = Api::namespaced(client.clone(), &config.target_namespace);
    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.target_namespace);
    let policies: Api<EncryptionPolicy> = Api::all(client);

    let key_selector = format!("{LABEL_COMPONENT}={}", config.component);
    vec![
        spawn_watch(
            "key-secrets",
            key_secrets,
            watcher::Config::default().labels(&key_selector),
            fanout.clone(),
            shutdown.clone(),
        ),
        spawn_watch(
            "target-secrets",
            target_secrets,
            watcher::Config::default(),
            fanout.clone(),
            shutdown.clone(),
        ),
        spawn_watch(
            "instance-pods",
            pods,
            watcher::Config::default().labels(&config.instance_label_selector),
            fanout.clone(),
            shutdown.clone(),
        ),
        spawn_watch(
            "encryption-policies",
            policies,
            watcher::Config::default(),
            fanout.clone(),
            shutdown.clone(),
        ),
        spawn_resync(config.resync_interval_duration(), fanout, shutdown),
    ]
}

fn spawn_watch<K>(
    name: &'static str,
    api: Api<K>,
    watcher_config: watcher::Config,
    fanout: QueueFanout,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut stream = watcher(api, watcher_config).default_backoff().boxed();
        info!(watch = name, "Watch started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = stream.next() => match event {
                    Some(Ok(_)) => {
                        debug!(watch = name, "Watched object changed");
                        fanout.add(Trigger::Watch);
                    }
                    Some(Err(e)) => handle_watch_stream_error(name, &e),
                    None => {
                        warn!(watch = name, "Watch stream ended");
                        break;
                    }
                },
            }
        }
    })
}

fn spawn_resync(
    interval: Duration,
    fanout: QueueFanout,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // a zero period panics in tokio
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => fanout.add(Trigger::Resync),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_reaches_every_queue() {
        let queues: Vec<Arc<WorkQueue>> = (0..3).map(|_| Arc::new(WorkQueue::new())).collect();
        let fanout = QueueFanout::new(queues.clone());

        fanout.add(Trigger::Watch);

        for queue in &queues {
            assert_eq!(queue.take(), Some(Trigger::Watch));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_ticks_until_shutdown() {
        let queue = Arc::new(WorkQueue::new());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_resync(
            Duration::from_secs(60),
            QueueFanout::new(vec![Arc::clone(&queue)]),
            rx,
        );

        // the first tick fires immediately
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(queue.take(), Some(Trigger::Resync));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(queue.take(), Some(Trigger::Resync));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
