//! Prefix Subscriber
//!
//! Keeps a live snapshot of the values registered under one prefix:
//! 1. Seed: one `list` before the subscriber is handed out
//! 2. Maintain: run `watch` and re-list on every signal
//! 3. Recover: when a watch ends while the token is live, wait out an
//!    exponential backoff and watch again
//!
//! The watch sentinel forces a re-list after every (re-)established watch,
//! so changes made while no watch was running are picked up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::client::RegistryClient;
use crate::error::{Error, Result};
use crate::observability::{events, metrics};

/// Delays between a watch ending and the next attempt.
#[derive(Debug, Clone, Copy)]
pub struct ResubscribePolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ResubscribePolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial,
            max_interval: self.max,
            max_elapsed_time: None,
            multiplier: self.multiplier,
            ..Default::default()
        }
    }
}

/// Live view of the endpoints under one prefix. Cheap to clone.
#[derive(Clone)]
pub struct Subscriber {
    prefix: String,
    snapshot: watch::Receiver<Vec<String>>,
}

impl Subscriber {
    /// Seed the snapshot and start maintaining it until `cancel` fires.
    pub async fn start(
        client: Arc<dyn RegistryClient>,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Self::start_with_policy(client, prefix, cancel, ResubscribePolicy::default()).await
    }

    pub async fn start_with_policy(
        client: Arc<dyn RegistryClient>,
        prefix: &str,
        cancel: CancellationToken,
        policy: ResubscribePolicy,
    ) -> Result<Self> {
        let hosts = client.list(prefix).await?;
        events::entries_refreshed(prefix, 0, hosts.len());
        metrics::set_endpoint_count(prefix, hosts.len());

        let (tx, rx) = watch::channel(hosts);
        tokio::spawn(maintain(client, prefix.to_string(), cancel, tx, policy));

        Ok(Self {
            prefix: prefix.to_string(),
            snapshot: rx,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current snapshot.
    pub fn hosts(&self) -> Vec<String> {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every snapshot replacement. Closed once the
    /// subscriber stops.
    pub fn changes(&self) -> watch::Receiver<Vec<String>> {
        self.snapshot.clone()
    }
}

async fn maintain(
    client: Arc<dyn RegistryClient>,
    prefix: String,
    cancel: CancellationToken,
    snapshot: watch::Sender<Vec<String>>,
    policy: ResubscribePolicy,
) {
    let mut backoff = policy.backoff();

    loop {
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        let watch = client.watch(&prefix, &signal_tx);
        tokio::pin!(watch);
        let mut established = false;

        loop {
            tokio::select! {
                biased;
                _ = snapshot.closed() => {
                    debug!(prefix = %prefix, "All subscriber handles dropped");
                    return;
                }
                _ = cancel.cancelled() => break,
                _ = &mut watch => break,
                Some(()) = signal_rx.recv() => {
                    if !established {
                        established = true;
                        backoff.reset();
                    }
                    refresh(client.as_ref(), &prefix, &snapshot).await;
                }
            }
        }

        if cancel.is_cancelled() {
            debug!(prefix = %prefix, "Subscriber stopped");
            return;
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max);
        debug!(prefix = %prefix, delay = ?delay, "Watch ended, watching again after delay");
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(prefix = %prefix, "Subscriber stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn refresh(client: &dyn RegistryClient, prefix: &str, snapshot: &watch::Sender<Vec<String>>) {
    match client.list(prefix).await {
        Ok(hosts) => {
            let previous = snapshot.borrow().len();
            events::entries_refreshed(prefix, previous, hosts.len());
            metrics::set_endpoint_count(prefix, hosts.len());
            snapshot.send_replace(hosts);
        }
        Err(Error::Cancelled) => trace!(prefix = %prefix, "Refresh cancelled"),
        Err(e) => events::refresh_failed(prefix, &e.to_string()),
    }
}

/// Hands out one shared [`Subscriber`] per prefix over a single client.
pub struct SubscriberFactory {
    client: Arc<dyn RegistryClient>,
    cancel: CancellationToken,
    policy: ResubscribePolicy,
    subscribers: Mutex<HashMap<String, Arc<OnceCell<Subscriber>>>>,
}

impl SubscriberFactory {
    pub fn new(client: Arc<dyn RegistryClient>, cancel: CancellationToken) -> Self {
        Self::with_policy(client, cancel, ResubscribePolicy::default())
    }

    pub fn with_policy(
        client: Arc<dyn RegistryClient>,
        cancel: CancellationToken,
        policy: ResubscribePolicy,
    ) -> Self {
        Self {
            client,
            cancel,
            policy,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscriber for `prefix`, started on first request.
    ///
    /// Concurrent first requests for one prefix share a single seeding list;
    /// other prefixes are not held up by it. A failed start is retried by the
    /// next request.
    pub async fn subscriber(&self, prefix: &str) -> Result<Subscriber> {
        let cell = self
            .subscribers
            .lock()
            .await
            .entry(prefix.to_string())
            .or_default()
            .clone();

        let subscriber = cell
            .get_or_try_init(|| {
                Subscriber::start_with_policy(self.client.clone(), prefix, self.cancel.clone(), self.policy)
            })
            .await?;
        Ok(subscriber.clone())
    }
}
