//! Publish/subscribe bus abstraction.
//!
//! The connection manager talks to the broker through [`Transport`] and
//! [`Session`]; the production implementation lives in [`crate::daemon::mqtt`].

use async_trait::async_trait;
use rumqttc::QoS;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Events delivered by a session, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    ConnectionLost {
        cause: String,
    },
    DeliveryComplete,
}

/// Message the broker publishes on our behalf if we vanish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub clean_session: bool,
    pub last_will: LastWill,
}

/// Opens sessions to the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and wait for the broker's acknowledgement.
    async fn connect(&self, options: &SessionOptions) -> Result<Box<dyn Session>>;
}

/// One live connection to the broker.
///
/// Dropping a session without calling [`Session::disconnect`] is an
/// ungraceful close; the broker then publishes the last will.
#[async_trait]
pub trait Session: Send + Sync {
    fn client_id(&self) -> &str;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<()>;

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()>;

    /// Next event, or `None` once the session can deliver nothing more.
    async fn next_event(&mut self) -> Option<BusEvent>;

    async fn disconnect(&mut self) -> Result<()>;
}
