//! Error Types
//!
//! Configuration errors are kept apart from the runtime error so callers can
//! tell "fix your gateway file" from "the store misbehaved".

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving the namespaced configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unable to create the etcd client: no config")]
    NoConfig,
    #[error("unable to create the etcd client with the received config: {0}")]
    BadConfig(String),
    #[error("unable to create the etcd client without a set of servers")]
    NoMachines,
}

/// Error document returned by the v2 keys API on a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Error)]
#[error("{code}: {message} ({cause}) [{index}]")]
pub struct StoreError {
    #[serde(rename = "errorCode")]
    pub code: u64,
    pub message: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub index: u64,
}

impl StoreError {
    /// `Key not found` in the v2 error code table.
    pub const KEY_NOT_FOUND: u64 = 100;

    pub fn is_key_not_found(&self) -> bool {
        self.code == Self::KEY_NOT_FOUND
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unable to load client certificate from {}: {reason}", path.display())]
    Certificate { path: PathBuf, reason: String },

    #[error("invalid etcd endpoint {0:?}: expected an http(s) URL")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unexpected HTTP status {0} from etcd")]
    UnexpectedStatus(u16),

    #[error("malformed etcd response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("nil etcd client")]
    NotInitialized,

    #[error("etcd request timed out")]
    Timeout,

    #[error("etcd client context cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn certificate(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Certificate {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
