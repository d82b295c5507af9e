//! Bus session lifecycle
//!
//! Keeps one session to the broker alive for as long as the daemon runs:
//! connects with a last will of `"0"` on the status topic, subscribes to every
//! configured topic, announces `"1"` and reconnects whenever the session is
//! lost. Connect attempts are retried forever with a linear backoff.

use crate::daemon::bus::{BusError, BusEvent, LastWill, Session, SessionOptions, Transport};
use crate::daemon::dispatcher::Dispatcher;
use crate::daemon::util::new_client_id;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const STATUS_ONLINE: &[u8] = b"1";
pub const STATUS_OFFLINE: &[u8] = b"0";

/// Backoff added per failed connect attempt
pub const RETRY_STEP: Duration = Duration::from_secs(2);

/// Delay before retrying after the `attempt`-th failure (1-based).
pub fn retry_delay(attempt: u32) -> Duration {
    RETRY_STEP * attempt
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Broker label for log messages
    pub broker: String,
    pub qos: QoS,
    pub status_topic: String,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    dispatcher: Dispatcher,
    session: Option<Box<dyn Session>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            transport,
            settings,
            dispatcher,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.session.as_deref().map(|s| s.client_id())
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            client_id: new_client_id(),
            keep_alive: self.settings.keep_alive,
            connection_timeout: self.settings.connection_timeout,
            clean_session: true,
            last_will: LastWill {
                topic: self.settings.status_topic.clone(),
                payload: STATUS_OFFLINE.to_vec(),
                qos: self.settings.qos,
                retain: true,
            },
        }
    }

    /// Connect, subscribe and announce presence. Retries until it succeeds.
    pub async fn connect(&mut self) {
        let mut attempt: u32 = 1;
        loop {
            match self.try_connect().await {
                Ok(session) => {
                    log::info!(
                        "Connection to {} established with client ID {}",
                        self.settings.broker,
                        session.client_id()
                    );
                    self.session = Some(session);
                    return;
                }
                Err(e) => {
                    let delay = retry_delay(attempt);
                    log::info!("Error on connecting to {}: {}", self.settings.broker, e);
                    log::info!("Retry in {} seconds!", delay.as_secs());
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<Box<dyn Session>, BusError> {
        let options = self.session_options();
        let mut session = self.transport.connect(&options).await?;

        log::info!("Subscribe to topics ...");
        for topic in self.dispatcher.subscriptions() {
            session.subscribe(topic, self.settings.qos).await?;
            log::info!("Subscribed to {}", topic);
        }

        session
            .publish(
                &self.settings.status_topic,
                STATUS_ONLINE,
                self.settings.qos,
                true,
            )
            .await?;

        Ok(session)
    }

    /// Announce `"0"` and close the session. No-op without a session.
    pub async fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        log::info!("Disconnect from {}", self.settings.broker);

        if let Err(e) = session
            .publish(
                &self.settings.status_topic,
                STATUS_OFFLINE,
                self.settings.qos,
                true,
            )
            .await
        {
            log::warn!("Failed to publish offline status: {}", e);
        }

        if let Err(e) = session.disconnect().await {
            log::warn!("Exception while disconnect: {}", e);
        }
    }

    pub async fn on_message(&self, topic: &str, payload: &[u8], qos: QoS) -> bool {
        log::info!(
            "Topic: {}; Message: {}; QoS: {:?}",
            topic,
            String::from_utf8_lossy(payload),
            qos
        );
        self.dispatcher.dispatch(topic).await
    }

    /// Drop the dead session (and with it any pending deliveries) and
    /// reconnect. Blocks until the new session is up.
    pub async fn on_connection_lost(&mut self, cause: &str) {
        log::info!(
            "Connection to {} lost! Error: {}",
            self.settings.broker,
            cause
        );
        self.session = None;
        self.connect().await;
    }

    /// Process bus events one at a time, forever.
    pub async fn run(&mut self) {
        loop {
            let event = match self.session.as_mut() {
                Some(session) => session.next_event().await,
                None => {
                    self.connect().await;
                    continue;
                }
            };

            match event {
                Some(BusEvent::Message {
                    topic,
                    payload,
                    qos,
                }) => {
                    self.on_message(&topic, &payload, qos).await;
                }
                Some(BusEvent::ConnectionLost { cause }) => {
                    self.on_connection_lost(&cause).await;
                }
                Some(BusEvent::DeliveryComplete) => {
                    log::trace!("Delivery complete");
                }
                None => {
                    self.on_connection_lost("event stream closed").await;
                }
            }
        }
    }

    /// Connect and process events until `shutdown` fires, then disconnect.
    ///
    /// Shutdown also interrupts a connect loop that is still retrying.
    pub async fn serve(&mut self, mut shutdown: watch::Receiver<()>) {
        tokio::select! {
            _ = async {
                if !self.is_connected() {
                    self.connect().await;
                }
                self.run().await
            } => {}
            _ = shutdown.changed() => {
                log::info!("Shutdown requested");
            }
        }

        self.disconnect().await;
    }
}
