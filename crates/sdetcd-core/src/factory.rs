//! Client Factory
//!
//! Turns the gateway's untyped extra configuration into a ready registry
//! client for the selected protocol generation.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{RegistryClient, V2Client, V3Client};
use crate::config::{ClientVersion, EtcdConfig, ExtraConfig, DEFAULT_TIMEOUT};
use crate::error::Result;
use crate::transport::TimeoutPolicy;

/// Build a registry client from the gateway's extra configuration.
///
/// The namespaced block is validated before anything touches the network.
/// Every call yields a new, independent client bound to `cancel`.
pub async fn new_client(
    cancel: CancellationToken,
    extra: &ExtraConfig,
) -> Result<Arc<dyn RegistryClient>> {
    let config = EtcdConfig::from_extra(extra)?;
    connect(cancel, &config).await
}

/// Build a registry client from an already validated configuration.
pub async fn connect(
    cancel: CancellationToken,
    config: &EtcdConfig,
) -> Result<Arc<dyn RegistryClient>> {
    let timeouts = TimeoutPolicy::resolve(&config.options, DEFAULT_TIMEOUT);
    debug!(
        version = %config.version,
        machines = config.machines.len(),
        timeouts = ?timeouts,
        "Creating etcd client"
    );

    let credentials = &config.options.credentials;
    let client: Arc<dyn RegistryClient> = match config.version {
        ClientVersion::V2 => Arc::new(V2Client::new(cancel, &config.machines, timeouts, credentials)?),
        ClientVersion::V3 => {
            Arc::new(V3Client::connect(cancel, &config.machines, timeouts, credentials).await?)
        }
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NAMESPACE;
    use crate::error::{ConfigError, Error};
    use serde_json::json;

    fn extra(block: serde_json::Value) -> ExtraConfig {
        ExtraConfig::from([(NAMESPACE.to_string(), block)])
    }

    async fn build(extra: &ExtraConfig) -> Result<Arc<dyn RegistryClient>> {
        new_client(CancellationToken::new(), extra).await
    }

    #[tokio::test]
    async fn test_no_config() {
        let err = build(&ExtraConfig::new()).await.err().unwrap();
        assert!(matches!(err, Error::Config(ConfigError::NoConfig)));

        let mut other = ExtraConfig::new();
        other.insert("github_com/devopsfaith/krakend/proxy".to_string(), json!({}));
        let err = build(&other).await.err().unwrap();
        assert!(matches!(err, Error::Config(ConfigError::NoConfig)));
    }

    #[tokio::test]
    async fn test_no_machines() {
        for block in [
            json!({}),
            json!({ "machines": [] }),
            json!({ "machines": [1, true, null] }),
            json!({ "machines": "http://127.0.0.1:2379" }),
            json!({ "machines": [], "client_version": "v3" }),
        ] {
            let err = build(&extra(block.clone())).await.err().unwrap();
            assert!(
                matches!(err, Error::Config(ConfigError::NoMachines)),
                "{block}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_certificates_for_both_versions() {
        for version in ["v2", "v3"] {
            let block = json!({
                "machines": ["http://irrelevant:12345"],
                "client_version": version,
                "options": {
                    "cert": "blank.crt",
                    "key": "blank.key",
                    "cacert": "blank.cacert",
                    "dial_timeout": "2s"
                }
            });
            let err = build(&extra(block)).await.err().unwrap();
            assert!(matches!(err, Error::Certificate { .. }), "{version}: {err}");
        }
    }

    #[tokio::test]
    async fn test_v2_client_built_without_io() {
        // Unreachable address: v2 construction never dials
        for selector in [json!("v2"), json!("v4"), json!(3), json!(null)] {
            let block = json!({
                "machines": ["http://127.0.0.1:1"],
                "client_version": selector,
                "options": { "dial_timeout": "nonsense", "header_timeout": "0s" }
            });
            assert!(build(&extra(block)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_v2_client_rejects_schemeless_machine() {
        let block = json!({ "machines": ["127.0.0.1:2379"] });
        let err = build(&extra(block)).await.err().unwrap();
        assert!(matches!(err, Error::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn test_bad_config_shape() {
        let err = build(&extra(json!(["http://127.0.0.1:2379"]))).await.err().unwrap();
        assert!(matches!(err, Error::Config(ConfigError::BadConfig(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_v3_connect() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = EtcdConfig {
            machines: vec!["http://127.0.0.1:1".to_string()],
            version: ClientVersion::V3,
            options: Default::default(),
        };
        let err = connect(cancel, &config).await.err().unwrap();
        assert!(matches!(err, Error::Cancelled));
    }
}
