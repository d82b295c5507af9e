//! MQTT transport backed by rumqttc.

use crate::config::BrokerAddress;
use crate::daemon::bus::{BusError, BusEvent, Result, Session, SessionOptions, Transport};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the client request channel
const REQUEST_CAPACITY: usize = 64;

/// How long a graceful disconnect may take to flush
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// [`Transport`] connecting to a single MQTT broker
pub struct MqttTransport {
    broker: BrokerAddress,
}

impl MqttTransport {
    pub fn new(broker: BrokerAddress) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &SessionOptions) -> Result<Box<dyn Session>> {
        let mut mqtt_options =
            MqttOptions::new(&options.client_id, &self.broker.host, self.broker.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(options.clean_session)
            .set_last_will(LastWill::new(
                &options.last_will.topic,
                options.last_will.payload.clone(),
                options.last_will.qos,
                options.last_will.retain,
            ));

        log::info!("Connecting to broker: {}", self.broker);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        tokio::time::timeout(options.connection_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| BusError::Timeout(options.connection_timeout))??;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(eventloop, event_tx));

        Ok(Box::new(MqttSession {
            client,
            client_id: options.client_id.clone(),
            events: event_rx,
            pump: Some(pump),
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BusError::Connect(format!("connection refused: {:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(BusError::Connect(e.to_string())),
        }
    }
}

/// Drive the event loop and forward what the daemon cares about.
///
/// Ends after a graceful disconnect, on the first connection error, or when
/// the session is dropped.
async fn pump_events(mut eventloop: EventLoop, tx: mpsc::UnboundedSender<BusEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => BusEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
                qos: publish.qos,
            },
            Ok(Event::Incoming(Packet::PubAck(_) | Packet::PubComp(_))) => {
                BusEvent::DeliveryComplete
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::debug!("Disconnect sent, stopping event pump");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = tx.send(BusEvent::ConnectionLost {
                    cause: e.to_string(),
                });
                break;
            }
        };

        if tx.send(event).is_err() {
            break;
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    client_id: String,
    events: mpsc::UnboundedReceiver<BusEvent>,
    pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl Session for MqttSession {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<()> {
        self.client.subscribe(topic, qos).await?;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        self.client
            .publish(topic, qos, retain, payload.to_vec())
            .await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.client.disconnect().await?;

        if let Some(mut pump) = self.pump.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
                log::warn!("Event pump did not stop within {:?}", DISCONNECT_GRACE);
                pump.abort();
            }
        }
        Ok(())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
