//! Discovery Configuration
//!
//! Typed view of the namespaced block a gateway carries in its extra
//! configuration map. The untyped block is validated once, up front, into an
//! [`EtcdConfig`]; nothing downstream looks at raw JSON again.
//!
//! ```json
//! {
//!   "machines": ["http://10.0.0.1:2379"],
//!   "client_version": "v3",
//!   "options": { "dial_timeout": "2s", "header_timeout": "500ms" }
//! }
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Key of the discovery block inside the gateway's extra configuration.
pub const NAMESPACE: &str = "github_com/devopsfaith/krakend-etcd";

/// Applied to every timeout left unset or zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Untyped extra configuration as handed over by the gateway.
pub type ExtraConfig = HashMap<String, Value>;

/// Store protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientVersion {
    /// HTTP/JSON keys API
    #[default]
    V2,
    /// gRPC KV and Watch services
    V3,
}

impl ClientVersion {
    /// Only an explicit `"v3"` selects v3; everything else falls back to v2.
    pub fn from_selector(selector: Option<&Value>) -> Self {
        match selector.and_then(Value::as_str) {
            Some("v3") => ClientVersion::V3,
            _ => ClientVersion::V2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientVersion::V2 => "v2",
            ClientVersion::V3 => "v3",
        }
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional client certificate, key and CA bundle paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub cacert: Option<PathBuf>,
}

impl Credentials {
    /// Certificate and key paths, when both are configured.
    pub fn identity(&self) -> Option<(&Path, &Path)> {
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Client options as configured. Timeouts stay `None` until resolved against
/// a default by [`crate::transport::TimeoutPolicy::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub credentials: Credentials,
    pub dial_timeout: Option<Duration>,
    pub dial_keepalive: Option<Duration>,
    pub header_timeout: Option<Duration>,
}

/// Validated discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdConfig {
    /// Store node URLs, never empty
    pub machines: Vec<String>,
    pub version: ClientVersion,
    pub options: ClientOptions,
}

#[derive(Deserialize)]
struct RawEtcdConfig {
    #[serde(default)]
    machines: Option<Value>,
    #[serde(default)]
    client_version: Option<Value>,
    #[serde(default)]
    options: Option<RawOptions>,
}

#[derive(Deserialize)]
struct RawOptions {
    #[serde(default)]
    cert: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    cacert: Option<String>,
    #[serde(default)]
    dial_timeout: Option<Value>,
    #[serde(default)]
    dial_keepalive: Option<Value>,
    #[serde(default)]
    header_timeout: Option<Value>,
}

impl EtcdConfig {
    /// Extract and validate the namespaced block from the extra configuration.
    pub fn from_extra(extra: &ExtraConfig) -> Result<Self, ConfigError> {
        let block = extra.get(NAMESPACE).ok_or(ConfigError::NoConfig)?;
        Self::from_value(block)
    }

    /// Validate a discovery block.
    ///
    /// Shape errors (not an object, `options` not an object, non-string
    /// credential paths) surface as [`ConfigError::BadConfig`]. Machines that
    /// are not strings are skipped. Durations that do not parse are ignored.
    pub fn from_value(block: &Value) -> Result<Self, ConfigError> {
        if !block.is_object() {
            return Err(ConfigError::BadConfig(format!(
                "expected an object, got {}",
                kind_of(block)
            )));
        }

        let raw = RawEtcdConfig::deserialize(block)
            .map_err(|e| ConfigError::BadConfig(e.to_string()))?;

        let machines = parse_machines(raw.machines)?;
        let version = ClientVersion::from_selector(raw.client_version.as_ref());
        let options = raw.options.map(RawOptions::into_options).unwrap_or_default();

        Ok(Self {
            machines,
            version,
            options,
        })
    }
}

impl RawOptions {
    fn into_options(self) -> ClientOptions {
        ClientOptions {
            credentials: Credentials {
                cert: non_empty_path(self.cert),
                key: non_empty_path(self.key),
                cacert: non_empty_path(self.cacert),
            },
            dial_timeout: lenient_duration(self.dial_timeout.as_ref()),
            dial_keepalive: lenient_duration(self.dial_keepalive.as_ref()),
            header_timeout: lenient_duration(self.header_timeout.as_ref()),
        }
    }
}

fn parse_machines(machines: Option<Value>) -> Result<Vec<String>, ConfigError> {
    let machines: Vec<String> = match machines {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(machine) => Some(machine),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if machines.is_empty() {
        return Err(ConfigError::NoMachines);
    }
    Ok(machines)
}

fn non_empty_path(value: Option<String>) -> Option<PathBuf> {
    value.filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn lenient_duration(value: Option<&Value>) -> Option<Duration> {
    value
        .and_then(Value::as_str)
        .and_then(|s| parse_duration(s).ok())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse a duration such as `"3s"`, `"250ms"`, `"1m30s"` or `"1.5h"`.
///
/// Accepts a sequence of decimal numbers, each with an optional fraction and
/// a mandatory unit (`ns`, `us`/`µs`, `ms`, `s`, `m`, `h`). A bare `"0"` is
/// zero. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid duration: {input:?}");

    let mut rest = input.strip_prefix('+').unwrap_or(input);
    if rest.starts_with('-') {
        return Err(format!("negative duration: {input:?}"));
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut nanos: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale = unit_nanos(unit).ok_or_else(invalid)?;
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        nanos = whole
            .checked_mul(scale)
            .and_then(|n| nanos.checked_add(n))
            .ok_or_else(invalid)?;

        if !fraction.is_empty() {
            // Digits past nanosecond precision of the largest unit do not matter
            let digits = &fraction[..fraction.len().min(18)];
            let value: u128 = digits.parse().map_err(|_| invalid())?;
            nanos += value * scale / 10u128.pow(digits.len() as u32);
        }

        rest = tail;
    }

    let secs = u64::try_from(nanos / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}
