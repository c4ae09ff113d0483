//! Registry Clients
//!
//! One capability, two protocol generations:
//! - `v2`: the HTTP/JSON keys API with long-poll watches
//! - `v3`: the gRPC KV and Watch services via `etcd_client`
//!
//! Both are constructed with a [`CancellationToken`] that acts as the
//! client's operating context. Cancelling it ends every in-flight and future
//! operation; there is no separate close call.

mod v2;
mod v3;

pub use v2::V2Client;
pub use v3::V3Client;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Read-only view of the endpoints registered under a key prefix.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Values of every key found, recursively, under `prefix`.
    ///
    /// Always a fresh read from the store. Keys and metadata are dropped;
    /// values come back in the order the store reports them.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Signal on `signals` whenever the set under `prefix` may have changed.
    ///
    /// One signal is sent as soon as the watch is established, before any
    /// store event, so the caller always re-lists at least once. After that
    /// each change batch produces exactly one signal. Callers are expected
    /// to call [`RegistryClient::list`] on every signal.
    ///
    /// Blocks until the operating context is cancelled, the store stream
    /// fails, or the receiver goes away. It never reconnects.
    async fn watch(&self, prefix: &str, signals: &mpsc::Sender<()>);
}

/// Run a single store call under the per-request timeout and the client's
/// operating context.
pub(crate) async fn bounded<T, F>(cancel: &CancellationToken, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        outcome = tokio::time::timeout(timeout, call) => outcome.map_err(|_| Error::Timeout)?,
    }
}

/// Hand one signal to the caller, giving up if the context is cancelled
/// first. Returns `false` when the watch loop should stop.
pub(crate) async fn deliver(cancel: &CancellationToken, signals: &mpsc::Sender<()>) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = signals.send(()) => sent.is_ok(),
    }
}
