//! MQTT device management service.
//!
//! Starts, stops and executes local programs in response to MQTT messages and
//! reports its own presence on a retained status topic.

pub mod config;
pub mod daemon;

pub use config::{ConfigError, DaemonConfig, Properties};
