//! Test helpers: an in-memory broker and a recording launcher

#![allow(dead_code)]

use async_trait::async_trait;
use mqtt_dms::config::Properties;
use mqtt_dms::daemon::bus::{BusError, BusEvent, LastWill, Session, SessionOptions, Transport};
use mqtt_dms::daemon::process::{Launcher, Liveness, ProcessHandle, ProcessId};
use mqtt_dms::daemon::supervisor::BrowserCommands;
use mqtt_dms::daemon::{
    CommandResolver, ConnectionManager, ConnectionSettings, Dispatcher, ProcessSupervisor,
};
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const STATUS_TOPIC: &str = "dms/test/status";

/// What the broker saw, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Connect(String),
    Subscribe(String),
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    Disconnect,
    /// Session dropped without disconnect; the will was published
    Will(String),
}

#[derive(Default)]
struct BrokerState {
    failures_remaining: usize,
    connect_attempts: usize,
    wills: Vec<LastWill>,
    client_ids: Vec<String>,
    records: Vec<Record>,
    retained: HashMap<String, Vec<u8>>,
    senders: Vec<mpsc::UnboundedSender<BusEvent>>,
}

/// In-memory stand-in for an MQTT broker
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that refuses the first `n` connect attempts
    pub fn failing(n: usize) -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().failures_remaining = n;
        broker
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            state: self.state.clone(),
        })
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn sessions(&self) -> usize {
        self.state.lock().unwrap().senders.len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().client_ids.clone()
    }

    pub fn wills(&self) -> Vec<LastWill> {
        self.state.lock().unwrap().wills.clone()
    }

    pub fn records(&self) -> Vec<Record> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn retained(&self, topic: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .retained
            .get(topic)
            .map(|p| String::from_utf8_lossy(p).to_string())
    }

    /// Deliver an event to the most recent session
    pub fn send(&self, event: BusEvent) {
        let state = self.state.lock().unwrap();
        let tx = state.senders.last().expect("no session");
        tx.send(event).expect("session gone");
    }

    /// Drop the most recent session's event stream, as a dead pump would
    pub fn close_stream(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.senders.last_mut() {
            *tx = mpsc::unbounded_channel().0;
        }
    }

    pub fn publish(&self, topic: &str, payload: &str) {
        self.send(BusEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            qos: QoS::AtMostOnce,
        });
    }
}

struct FakeTransport {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, options: &SessionOptions) -> Result<Box<dyn Session>, BusError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        state.client_ids.push(options.client_id.clone());
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(BusError::Connect("broker unreachable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.senders.push(tx);
        state.wills.push(options.last_will.clone());
        state
            .records
            .push(Record::Connect(options.client_id.clone()));

        Ok(Box::new(FakeSession {
            state: self.state.clone(),
            client_id: options.client_id.clone(),
            will: options.last_will.clone(),
            events: rx,
            closed: false,
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<BrokerState>>,
    client_id: String,
    will: LastWill,
    events: mpsc::UnboundedReceiver<BusEvent>,
    closed: bool,
}

#[async_trait]
impl Session for FakeSession {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), BusError> {
        self.state
            .lock()
            .unwrap()
            .records
            .push(Record::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _qos: QoS,
        retain: bool,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        state.records.push(Record::Publish {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).to_string(),
            retain,
        });
        if retain {
            state.retained.insert(topic.to_string(), payload.to_vec());
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        self.closed = true;
        self.state.lock().unwrap().records.push(Record::Disconnect);
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.records.push(Record::Will(self.will.topic.clone()));
        if self.will.retain {
            state
                .retained
                .insert(self.will.topic.clone(), self.will.payload.clone());
        }
    }
}

/// Launcher recording every spawn and kill-command run
#[derive(Default)]
pub struct RecordingLauncher {
    events: Arc<Mutex<Vec<String>>>,
    alive: Mutex<Vec<Arc<AtomicBool>>>,
}

impl RecordingLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn spawned(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("spawn:").map(str::to_string))
            .collect()
    }

    /// Simulate the most recently spawned process dying
    pub fn crash_last(&self) {
        if let Some(flag) = self.alive.lock().unwrap().last() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

struct RecordingHandle {
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessHandle for RecordingHandle {
    fn pid(&self) -> Option<ProcessId> {
        None
    }

    fn probe(&mut self) -> Liveness {
        if self.alive.load(Ordering::SeqCst) {
            Liveness::Alive
        } else {
            Liveness::Exited(None)
        }
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Launcher for RecordingLauncher {
    fn spawn(&self, command: &str) -> std::io::Result<Box<dyn ProcessHandle>> {
        self.events.lock().unwrap().push(format!("spawn:{command}"));
        let alive = Arc::new(AtomicBool::new(true));
        self.alive.lock().unwrap().push(alive.clone());
        Ok(Box::new(RecordingHandle { alive }))
    }

    async fn run(&self, command: &str) -> std::io::Result<Option<i32>> {
        self.events.lock().unwrap().push(format!("run:{command}"));
        // Kill commands stop the managed process
        for flag in self.alive.lock().unwrap().iter() {
            flag.store(false, Ordering::SeqCst);
        }
        Ok(Some(0))
    }
}

pub fn settings(qos: QoS) -> ConnectionSettings {
    ConnectionSettings {
        broker: "tcp://fake:1883".to_string(),
        qos,
        status_topic: STATUS_TOPIC.to_string(),
        keep_alive: Duration::from_secs(10),
        connection_timeout: Duration::from_secs(10),
    }
}

/// Everything needed to drive a daemon against fakes
pub struct Harness {
    pub broker: FakeBroker,
    pub launcher: Arc<RecordingLauncher>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub manager: ConnectionManager,
}

pub fn harness(broker: FakeBroker, props: Properties, prefix: &str) -> Harness {
    let launcher = RecordingLauncher::new();
    let supervisor = Arc::new(ProcessSupervisor::new(
        launcher.clone(),
        BrowserCommands {
            start: "chromium --kiosk".to_string(),
            kill: "pkill chromium".to_string(),
        },
        Duration::from_secs(5),
    ));
    let dispatcher = Dispatcher::new(CommandResolver::new(props, prefix), supervisor.clone());
    let manager = ConnectionManager::new(broker.transport(), settings(QoS::AtLeastOnce), dispatcher);
    Harness {
        broker,
        launcher,
        supervisor,
        manager,
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
