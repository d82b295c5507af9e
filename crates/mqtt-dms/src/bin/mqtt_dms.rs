//! mqtt-dms - MQTT device management service
//!
//! Usage:
//!   mqtt-dms                         # Run with ./dms.yaml
//!   mqtt-dms -c /etc/mqtt-dms.yaml   # Run with a specific config file
//!   mqtt-dms -b tcp://broker:1883    # Override the broker address
//!   mqtt-dms --list-topics           # Print subscribed topics and exit

use argh::FromArgs;
use mqtt_dms::daemon::{ActionSpec, CommandResolver};
use mqtt_dms::{DaemonConfig, Properties};

/// MQTT device management service
#[derive(FromArgs)]
struct Args {
    /// show version information
    #[argh(switch, short = 'V')]
    version: bool,

    /// path to YAML configuration file (default: dms.yaml)
    #[argh(option, short = 'c', default = "String::from(\"dms.yaml\")")]
    config: String,

    /// broker address, overrides MQTT_DMS_BROKER and mqtt.broker
    #[argh(option, short = 'b')]
    broker: Option<String>,

    /// print the resolved topics and their commands, then exit
    #[argh(switch)]
    list_topics: bool,
}

fn describe(spec: &ActionSpec) -> String {
    let mut parts = Vec::new();
    if !spec.start_command.is_empty() {
        parts.push(format!("start: {}", spec.start_command));
    }
    if !spec.kill_command.is_empty() {
        parts.push(format!("kill: {}", spec.kill_command));
    }
    if !spec.exec_command.is_empty() {
        parts.push(format!("exec: {}", spec.exec_command));
    }
    parts.join(", ")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Args = argh::from_env();

    if args.version {
        println!("mqtt-dms {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    log::info!("Loading config from: {}", args.config);
    let props = Properties::from_file(&args.config)?;
    log::debug!("Loaded {} properties", props.len());
    let config = DaemonConfig::from_properties(&props, args.broker.as_deref())?;

    if args.list_topics {
        let resolver = CommandResolver::new(props, &config.topic_prefix);
        println!("Broker:       {}", config.broker);
        println!("Status topic: {}", config.status_topic);
        println!("Topics:");
        for topic in resolver.subscriptions() {
            let spec = resolver.lookup(resolver.action_key(topic));
            println!("  {}  ({})", topic, describe(&spec));
        }
        return Ok(());
    }

    mqtt_dms::daemon::run(props, config).await
}
