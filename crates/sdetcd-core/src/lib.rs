//! sdetcd Core Library
//!
//! Dynamic backend discovery against an etcd store, over either the v2
//! HTTP/JSON keys API or the v3 gRPC API, selected from the gateway's
//! extra configuration.

pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod observability;
pub mod subscriber;
pub mod transport;

pub use client::{RegistryClient, V2Client, V3Client};
pub use config::{ClientOptions, ClientVersion, Credentials, EtcdConfig, ExtraConfig, NAMESPACE};
pub use error::{ConfigError, Error, Result, StoreError};
pub use factory::new_client;
pub use subscriber::{ResubscribePolicy, Subscriber, SubscriberFactory};
pub use transport::TimeoutPolicy;
