//! etcd v3 Client
//!
//! gRPC KV and Watch services through `etcd_client`. Lists are prefix range
//! reads; watches are prefix watch streams where every response carrying
//! events becomes one signal.

use super::{bounded, deliver, RegistryClient};
use crate::config::Credentials;
use crate::error::{ConfigError, Error, Result};
use crate::observability::{events, metrics};
use crate::transport::{TimeoutPolicy, TransportConfig};
use async_trait::async_trait;
use etcd_client::{Client, GetOptions, WatchOptions};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const VERSION: &str = "v3";

/// Registry client for the v3 gRPC API.
#[derive(Clone)]
pub struct V3Client {
    client: Option<Client>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl V3Client {
    /// Connect to the named machines.
    ///
    /// Machines must be full URLs with a scheme. The channel is established
    /// here, so unreachable machines fail within the dial timeout.
    pub async fn connect(
        cancel: CancellationToken,
        machines: &[String],
        timeouts: TimeoutPolicy,
        credentials: &Credentials,
    ) -> Result<Self> {
        if machines.is_empty() {
            return Err(ConfigError::NoMachines.into());
        }

        let transport = TransportConfig::build(timeouts, credentials)?;
        let connect = Client::connect(machines, Some(transport.connect_options()));
        let client = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            client = connect => client?,
        };
        debug!(machines = ?machines, "Connected to etcd v3");

        events::client_created(VERSION, machines, transport.is_mutual_tls());

        Ok(Self {
            client: Some(client),
            cancel,
            timeout: timeouts.header_timeout,
        })
    }

    /// A client without a connection. `list` fails with
    /// [`Error::NotInitialized`] and `watch` returns at once.
    pub fn uninitialized(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            client: None,
            cancel,
            timeout,
        }
    }

    fn stop_reason(&self) -> &'static str {
        if self.cancel.is_cancelled() {
            "cancelled"
        } else {
            "receiver_closed"
        }
    }

    fn ended(&self, prefix: &str, reason: &str) {
        events::watch_ended(VERSION, prefix, reason);
        metrics::record_watch_ended(VERSION, reason);
    }
}

#[async_trait]
impl RegistryClient for V3Client {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let Some(client) = &self.client else {
            return Err(Error::NotInitialized);
        };

        let mut kv = client.kv_client();
        let outcome = bounded(&self.cancel, self.timeout, async move {
            let resp = kv.get(prefix, Some(GetOptions::new().with_prefix())).await?;
            let kvs = resp.kvs();
            if is_partial_range(resp.count(), kvs.len()) {
                debug!(
                    prefix = %prefix,
                    count = resp.count(),
                    returned = kvs.len(),
                    "Range returned no complete result"
                );
                return Ok(Vec::new());
            }

            Ok::<Vec<String>, Error>(kvs.iter().map(|kv| decode_value(kv.value())).collect())
        })
        .await;

        metrics::record_list(VERSION, outcome.is_ok());
        outcome
    }

    async fn watch(&self, prefix: &str, signals: &mpsc::Sender<()>) {
        let Some(client) = &self.client else {
            return;
        };

        let mut client = client.clone();
        let established = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.ended(prefix, "cancelled");
                return;
            }
            established = client.watch(prefix, Some(WatchOptions::new().with_prefix())) => established,
        };
        // The watcher owns the request half; dropping it ends the watch
        let (_watcher, mut stream) = match established {
            Ok(pair) => pair,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Failed to establish watch");
                self.ended(prefix, "watch_failed");
                return;
            }
        };

        events::watch_established(VERSION, prefix);
        if !deliver(&self.cancel, signals).await {
            self.ended(prefix, self.stop_reason());
            return;
        }
        metrics::record_watch_signal(VERSION);

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.ended(prefix, "cancelled");
                    return;
                }
                message = stream.message() => message,
            };

            match message {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        warn!(prefix = %prefix, reason = %resp.cancel_reason(), "Watch canceled by server");
                        self.ended(prefix, "watch_canceled");
                        return;
                    }
                    // Creation acks and progress notifications carry no events
                    if resp.events().is_empty() {
                        trace!(prefix = %prefix, "Watch response without events");
                        continue;
                    }
                    trace!(prefix = %prefix, events = resp.events().len(), "Change observed");
                    if !deliver(&self.cancel, signals).await {
                        self.ended(prefix, self.stop_reason());
                        return;
                    }
                    metrics::record_watch_signal(VERSION);
                }
                Ok(None) => {
                    self.ended(prefix, "stream_closed");
                    return;
                }
                Err(e) => {
                    warn!(prefix = %prefix, error = %e, "Watch stream failed");
                    self.ended(prefix, "stream_error");
                    return;
                }
            }
        }
    }
}

/// Values are opaque bytes; invalid UTF-8 is replaced rather than failing
/// the whole list.
fn decode_value(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

/// A range read only counts when it returned records and all of them.
fn is_partial_range(count: i64, returned: usize) -> bool {
    returned == 0 || count != returned as i64
}
