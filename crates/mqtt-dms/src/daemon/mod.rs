//! MQTT device management daemon
//!
//! Turns MQTT messages into local process actions.
//!
//! # Features
//!
//! - Subscribes to every topic that has a `.cmd`, `.killCmd` or `.exec` entry
//! - Keeps at most one long-running program alive, killing the previous one
//!   before starting the next
//! - Opens web pages in a kiosk browser with a cache buster
//! - Publishes `"1"`/`"0"` on a retained status topic, backed by a last will
//! - Reconnects forever when the broker goes away

pub mod bus;
pub mod connection;
pub mod dispatcher;
pub mod mqtt;
pub mod process;
pub mod resolver;
pub mod supervisor;
pub mod util;

pub use connection::{ConnectionManager, ConnectionSettings};
pub use dispatcher::Dispatcher;
pub use resolver::CommandResolver;
pub use supervisor::{ActionSpec, ProcessState, ProcessSupervisor};

use crate::config::{DaemonConfig, Properties};
use self::mqtt::MqttTransport;
use std::sync::Arc;

/// Run the daemon with the given configuration.
///
/// Returns once a shutdown signal (Ctrl+C / SIGTERM) has been handled.
pub async fn run(props: Properties, config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    use tokio::sync::watch;

    log::info!("Start ...");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, shutting down gracefully...");
        shutdown_tx.send(()).ok();
    })?;

    let resolver = CommandResolver::new(props, &config.topic_prefix);
    if resolver.subscriptions().is_empty() {
        log::warn!(
            "No topics found with prefix '{}', nothing will be subscribed",
            config.topic_prefix
        );
    }

    let supervisor = Arc::new(ProcessSupervisor::with_shell(
        config.browser.clone(),
        config.kill_timeout,
    ));
    let dispatcher = Dispatcher::new(resolver, supervisor.clone());

    let settings = ConnectionSettings {
        broker: config.broker.to_string(),
        qos: config.qos,
        status_topic: config.status_topic.clone(),
        keep_alive: config.keep_alive,
        connection_timeout: config.connection_timeout,
    };
    log::info!("  Broker: {}", settings.broker);
    log::info!("  Status topic: {}", settings.status_topic);

    let transport = Arc::new(MqttTransport::new(config.broker.clone()));
    let mut connection = ConnectionManager::new(transport, settings, dispatcher);

    // Blocks until shutdown; publishes "0" and closes the session on the way out
    connection.serve(shutdown_rx).await;

    supervisor.shutdown().await;

    log::info!("Shutdown ... done");
    log::info!("BYE BYE from mqtt-dms");
    Ok(())
}
