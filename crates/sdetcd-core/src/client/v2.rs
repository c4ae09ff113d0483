//! etcd v2 Client
//!
//! Talks to the HTTP/JSON keys API:
//! - reads are `GET /v2/keys/<prefix>?recursive=true`
//! - watches are long polls with `wait=true&recursive=true`, each resumed
//!   from the modified index of the previous answer
//!
//! Requests start at the last endpoint that answered and fail over to the
//! next one on transport errors or 5xx answers.

use super::{bounded, deliver, RegistryClient};
use crate::config::Credentials;
use crate::error::{ConfigError, Error, Result, StoreError};
use crate::observability::{events, metrics};
use crate::transport::{TimeoutPolicy, TransportConfig};
use async_trait::async_trait;
use reqwest::{Response, Url};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const VERSION: &str = "v2";
const INDEX_HEADER: &str = "X-Etcd-Index";

/// Registry client for the v2 keys API.
#[derive(Clone)]
pub struct V2Client {
    cluster: Option<Arc<Cluster>>,
    cancel: CancellationToken,
    timeout: Duration,
}

struct Cluster {
    http: reqwest::Client,
    endpoints: Vec<Url>,
    /// Index of the endpoint that answered last
    pinned: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Node,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    modified_index: u64,
}

/// A successful answer. Long polls may come back with an empty body when the
/// server gives up waiting; those carry no node.
struct Reply {
    body: Option<KeysResponse>,
    etcd_index: Option<u64>,
}

impl V2Client {
    /// Build a client for the named machines.
    ///
    /// Machines must be full URLs with a scheme: `http://localhost:2379`
    /// works, `localhost:2379` does not. No request is made here.
    pub fn new(
        cancel: CancellationToken,
        machines: &[String],
        timeouts: TimeoutPolicy,
        credentials: &Credentials,
    ) -> Result<Self> {
        if machines.is_empty() {
            return Err(ConfigError::NoMachines.into());
        }
        let endpoints = machines
            .iter()
            .map(|machine| parse_endpoint(machine))
            .collect::<Result<Vec<_>>>()?;

        let transport = TransportConfig::build(timeouts, credentials)?;
        let http = transport.http_client()?;

        events::client_created(VERSION, machines, transport.is_mutual_tls());

        Ok(Self {
            cluster: Some(Arc::new(Cluster {
                http,
                endpoints,
                pinned: AtomicUsize::new(0),
            })),
            cancel,
            timeout: timeouts.header_timeout,
        })
    }

    /// A client without a connection. `list` fails with
    /// [`Error::NotInitialized`] and `watch` returns at once.
    pub fn uninitialized(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cluster: None,
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

    /// Current store index, the point a fresh watch resumes from.
    async fn current_index(&self, cluster: &Cluster, prefix: &str) -> Result<u64> {
        match bounded(&self.cancel, self.timeout, cluster.request(prefix, &[])).await {
            Ok(reply) => Ok(reply.etcd_index.unwrap_or_default()),
            // A prefix nobody registered under yet is still watchable
            Err(Error::Store(err)) if err.is_key_not_found() => Ok(err.index),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RegistryClient for V2Client {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let Some(cluster) = &self.cluster else {
            return Err(Error::NotInitialized);
        };

        let query = [("recursive", "true".to_string())];
        let outcome = bounded(&self.cancel, self.timeout, cluster.request(prefix, &query))
            .await
            .and_then(|reply| match reply.body {
                Some(response) => Ok(entries(response.node)),
                None => Err(Error::UnexpectedStatus(204)),
            });

        metrics::record_list(VERSION, outcome.is_ok());
        outcome
    }

    async fn watch(&self, prefix: &str, signals: &mpsc::Sender<()>) {
        let Some(cluster) = &self.cluster else {
            return;
        };

        let mut next_index = match self.current_index(cluster, prefix).await {
            Ok(index) => index + 1,
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
            let query = [
                ("wait", "true".to_string()),
                ("recursive", "true".to_string()),
                ("waitIndex", next_index.to_string()),
            ];

            let reply = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.ended(prefix, "cancelled");
                    return;
                }
                reply = cluster.request(prefix, &query) => reply,
            };

            match reply {
                Ok(Reply { body: Some(response), .. }) => {
                    next_index = response.node.modified_index + 1;
                    trace!(prefix = %prefix, next_index = next_index, "Change observed");
                    if !deliver(&self.cancel, signals).await {
                        self.ended(prefix, self.stop_reason());
                        return;
                    }
                    metrics::record_watch_signal(VERSION);
                }
                Ok(Reply { body: None, .. }) => {
                    trace!(prefix = %prefix, "Long poll expired, waiting again");
                }
                Err(e) => {
                    warn!(prefix = %prefix, error = %e, "Watch failed");
                    self.ended(prefix, "stream_error");
                    return;
                }
            }
        }
    }
}

impl Cluster {
    async fn request(&self, key: &str, query: &[(&str, String)]) -> Result<Reply> {
        let start = self.pinned.load(Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];

            match self.http.get(keys_url(endpoint, key)).query(query).send().await {
                Ok(response) if response.status().is_server_error() => {
                    debug!(endpoint = %endpoint, status = %response.status(), "etcd endpoint failing, trying next");
                    last_error = decode(response).await.err();
                }
                Ok(response) => {
                    self.pinned.store(index, Ordering::Relaxed);
                    return decode(response).await;
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable, trying next");
                    last_error = Some(Error::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or(Error::Config(ConfigError::NoMachines)))
    }
}

async fn decode(response: Response) -> Result<Reply> {
    let status = response.status();
    let etcd_index = response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let body = response.bytes().await?;

    if status.is_success() {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Reply {
                body: None,
                etcd_index,
            });
        }
        return Ok(Reply {
            body: Some(serde_json::from_slice(&body)?),
            etcd_index,
        });
    }

    match serde_json::from_slice::<StoreError>(&body) {
        Ok(err) => Err(Error::Store(err)),
        Err(_) => Err(Error::UnexpectedStatus(status.as_u16())),
    }
}

/// Values under a node: its children's values in store order, or its own
/// value when it is a leaf holding one.
fn entries(node: Node) -> Vec<String> {
    let children = node.nodes.unwrap_or_default();
    if children.is_empty() {
        return node.value.filter(|v| !v.is_empty()).into_iter().collect();
    }
    children
        .into_iter()
        .map(|child| child.value.unwrap_or_default())
        .collect()
}

fn parse_endpoint(machine: &str) -> Result<Url> {
    let url = Url::parse(machine).map_err(|_| Error::InvalidEndpoint(machine.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() || url.host().is_none() {
        return Err(Error::InvalidEndpoint(machine.to_string()));
    }
    Ok(url)
}

fn keys_url(endpoint: &Url, key: &str) -> Url {
    let mut url = endpoint.clone();
    // Endpoints were checked to be base URLs at construction
    if let Ok(mut segments) = url.path_segments_mut() {
        segments
            .pop_if_empty()
            .extend(["v2", "keys"])
            .extend(key.split('/').filter(|s| !s.is_empty()));
    }
    url
}
