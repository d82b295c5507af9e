//! Daemon configuration.
//!
//! The configuration file is a flat YAML mapping of dotted keys to scalar
//! values, e.g.
//!
//! ```yaml
//! mqtt.broker: tcp://192.168.1.10:1883
//! mqtt.qos: 1
//! topic.start.with: home/display/
//! browser.start: chromium-browser --kiosk
//! browser.kill: pkill chromium
//! home/display/dashboard.cmd: https://grafana.local/d/home
//! home/display/off.exec: xset dpms force off
//! ```

use crate::daemon::supervisor::BrowserCommands;
use crate::daemon::util::get_machine_id;
use rumqttc::QoS;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Broker address
pub const KEY_BROKER: &str = "mqtt.broker";
/// Quality-of-service level for subscriptions and status publications
pub const KEY_QOS: &str = "mqtt.qos";
/// Topic carrying the "0"/"1" presence flag
pub const KEY_STATUS_TOPIC: &str = "mqtt.statusTopic";
/// Keep-alive interval in seconds
pub const KEY_KEEP_ALIVE: &str = "mqtt.keepAlive";
/// Connection timeout in seconds
pub const KEY_CONNECTION_TIMEOUT: &str = "mqtt.connectionTimeout";
/// Prefix selecting which keys describe subscribed topics
pub const KEY_TOPIC_PREFIX: &str = "topic.start.with";
/// Upper bound on the blocking kill wait, in seconds
pub const KEY_KILL_TIMEOUT: &str = "process.killTimeout";
/// Command prefix used to open web pages
pub const KEY_BROWSER_START: &str = "browser.start";
/// Command used to close the browser again
pub const KEY_BROWSER_KILL: &str = "browser.kill";

/// Environment variable overriding `mqtt.broker`
pub const BROKER_ENV: &str = "MQTT_DMS_BROKER";

pub const DEFAULT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 10;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;
const DEFAULT_KILL_TIMEOUT_SECS: u64 = 30;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Missing config property: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// A single configuration value. Nested mappings and sequences are rejected.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<Scalar> for String {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s,
        }
    }
}

/// Flat key/value configuration store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    /// Load properties from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse properties from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: Option<BTreeMap<String, Option<Scalar>>> = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let entries = raw
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.map(String::from).unwrap_or_default()))
            .collect();

        Ok(Self { entries })
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// All keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Host and port of the MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parse `tcp://host:port`, `mqtt://host:port` or `host[:port]`.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::Invalid {
            key: KEY_BROKER,
            value: uri.to_string(),
        };

        let uri = uri.trim();
        let rest = match uri.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some(_) => return Err(invalid()),
            None => uri,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// Map the configured integer to an MQTT quality-of-service level.
pub fn parse_qos(value: &str) -> Result<QoS, ConfigError> {
    match value.trim() {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::Invalid {
            key: KEY_QOS,
            value: other.to_string(),
        }),
    }
}

fn parse_secs(props: &Properties, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match props.get(key) {
        None => Ok(Duration::from_secs(default)),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid {
                key,
                value: v.to_string(),
            }),
    }
}

/// Resolve the broker URI.
///
/// Resolution order:
/// 1. Explicit `cli` value (if Some)
/// 2. `MQTT_DMS_BROKER` environment variable
/// 3. `mqtt.broker` property
pub fn resolve_broker_uri(cli: Option<&str>, props: &Properties) -> Option<String> {
    cli.map(str::to_string)
        .or_else(|| std::env::var(BROKER_ENV).ok())
        .or_else(|| props.get(KEY_BROKER).map(str::to_string))
        .filter(|s| !s.trim().is_empty())
}

/// Validated daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub broker: BrokerAddress,
    pub qos: QoS,
    pub status_topic: String,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub topic_prefix: String,
    pub kill_timeout: Duration,
    pub browser: BrowserCommands,
}

impl DaemonConfig {
    pub fn from_properties(
        props: &Properties,
        broker_override: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let broker_uri =
            resolve_broker_uri(broker_override, props).ok_or(ConfigError::Missing(KEY_BROKER))?;
        let broker = BrokerAddress::parse(&broker_uri)?;

        let qos = parse_qos(props.get_or(KEY_QOS, "0"))?;

        let status_topic = match props.get(KEY_STATUS_TOPIC).map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => format!("dms/{}/status", get_machine_id()),
        };

        let topic_prefix = props
            .get(KEY_TOPIC_PREFIX)
            .map(str::trim)
            .ok_or(ConfigError::Missing(KEY_TOPIC_PREFIX))?
            .to_string();

        Ok(Self {
            broker,
            qos,
            status_topic,
            keep_alive: parse_secs(props, KEY_KEEP_ALIVE, DEFAULT_KEEP_ALIVE_SECS)?,
            connection_timeout: parse_secs(
                props,
                KEY_CONNECTION_TIMEOUT,
                DEFAULT_CONNECTION_TIMEOUT_SECS,
            )?,
            topic_prefix,
            kill_timeout: parse_secs(props, KEY_KILL_TIMEOUT, DEFAULT_KILL_TIMEOUT_SECS)?,
            browser: BrowserCommands {
                start: props.get_or(KEY_BROWSER_START, "").trim().to_string(),
                kill: props.get_or(KEY_BROWSER_KILL, "").trim().to_string(),
            },
        })
    }
}
