//! The broker: the rendezvous point between callers and the agent fleet.
//!
//! One frontend listener accepts callers, one backend listener accepts
//! agents, a heartbeat publisher advertises liveness, and a periodic clean
//! pass probes busy agents. All state lives in the [`router::Router`] loop.

pub mod ctrl;
pub mod observer;
pub mod router;
pub mod store;


use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, ControlError, TransportError};
use crate::transport::client::{Client, ClientOptions};
use crate::transport::heartbeat::{DEFAULT_REGISTER_EVERY, Heartbeat};
use crate::transport::message::{Command, Envelope};
use crate::transport::wire::{read_frame, send_frame};

use self::ctrl::BrokerController;
use self::observer::LogObserver;
use self::router::{Endpoints, LoopEvent, Router, parse_agent_record};
use self::store::MemoryStore;

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_millis(2_500);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 1_024;
const CONN_CHANNEL_CAPACITY: usize = 64;
const VERIFY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub frontend: String,
    pub backend: String,
    pub heartbeat: String,
    pub agent_timeout: Duration,
    pub evict_stale: bool,
    pub clean_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frontend: "127.0.0.1:7780".to_owned(),
            backend: "127.0.0.1:7781".to_owned(),
            heartbeat: "127.0.0.1:7782".to_owned(),
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            evict_stale: false,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// A bound but not yet running broker. Binding is separate from running so
/// callers can bind port 0 and read the allocated addresses first.
pub struct Broker {
    config: BrokerConfig,
    endpoints: Endpoints,
    frontend: TcpListener,
    backend: TcpListener,
    heartbeat: Heartbeat,
    events: mpsc::Sender<LoopEvent>,
    events_rx: mpsc::Receiver<LoopEvent>,
}

impl Broker {
    /// Verifies no broker already answers on the frontend, then binds all
    /// three listeners.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateBroker` when another broker holds the frontend,
    /// and bind errors otherwise.
    pub async fn bind(config: BrokerConfig) -> AppResult<Self> {
        if let Some(pid) = probe_running_broker(&config.frontend).await {
            return Err(AppError::control(ControlError::DuplicateBroker { pid }));
        }

        let frontend = bind(&config.frontend).await?;
        let backend = bind(&config.backend).await?;
        let mut heartbeat = Heartbeat::new(
            &config.heartbeat,
            config.heartbeat_interval,
            DEFAULT_REGISTER_EVERY,
        );
        heartbeat.start().await?;

        let endpoints = Endpoints {
            frontend: local_addr(&frontend, &config.frontend),
            backend: local_addr(&backend, &config.backend),
            heartbeat: heartbeat
                .local_addr()
                .map_or_else(|| config.heartbeat.clone(), |addr| addr.to_string()),
        };
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            endpoints,
            frontend,
            backend,
            heartbeat,
            events,
            events_rx,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// A handle for injecting a `Shutdown` event from outside the loop.
    pub fn shutdown_handle(&self) -> mpsc::Sender<LoopEvent> {
        self.events.clone()
    }

    /// Runs the broker until shutdown.
    pub async fn run(self) -> AppResult<()> {
        let mut controller = BrokerController::new(
            self.config.agent_timeout,
            self.config.evict_stale,
            Box::new(MemoryStore::new()),
        );
        controller.add_observer(Box::new(LogObserver));
        let router = Router::new(self.endpoints.clone(), controller, self.events.clone());

        let front_accept = tokio::spawn(accept_fronts(self.frontend, self.events.clone()));
        let back_accept = tokio::spawn(accept_agents(self.backend, self.events.clone()));
        let cleaner = tokio::spawn(clean_ticker(self.config.clean_interval, self.events.clone()));

        info!(
            "Broker up, frontend {} backend {} heartbeat {}",
            self.endpoints.frontend, self.endpoints.backend, self.endpoints.heartbeat
        );
        router.run(self.events_rx).await;

        front_accept.abort();
        back_accept.abort();
        cleaner.abort();
        let mut heartbeat = self.heartbeat;
        heartbeat.stop();
        Ok(())
    }
}

async fn bind(addr: &str) -> AppResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|err| {
        AppError::transport(TransportError::Bind {
            addr: addr.to_owned(),
            source: err,
        })
    })
}

fn local_addr(listener: &TcpListener, fallback: &str) -> String {
    listener
        .local_addr()
        .map_or_else(|_| fallback.to_owned(), |addr| addr.to_string())
}

/// A short ping against the frontend; answers the running broker's pid.
async fn probe_running_broker(frontend: &str) -> Option<u32> {
    let client = Client::connect(frontend, ClientOptions::default())
        .await
        .ok()?;
    let reply = client.ping(Some(VERIFY_TIMEOUT)).await.ok()?;
    reply
        .get("pid")
        .and_then(serde_json::Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
        .or(Some(0))
}

async fn accept_fronts(listener: TcpListener, events: mpsc::Sender<LoopEvent>) {
    let mut next_conn: u64 = 0;
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            break;
        };
        next_conn = next_conn.wrapping_add(1);
        let conn_id = format!("front-{next_conn}");
        debug!("Caller {} connected from {}", conn_id, peer);
        tokio::spawn(front_session(conn_id, stream, events.clone()));
    }
}

async fn front_session(conn_id: String, stream: TcpStream, events: mpsc::Sender<LoopEvent>) {
    let (read_half, write_half) = stream.into_split();
    let (sink, sink_rx) = mpsc::channel(CONN_CHANNEL_CAPACITY);
    if events
        .send(LoopEvent::FrontConnected {
            conn_id: conn_id.clone(),
            sink,
        })
        .await
        .is_err()
    {
        return;
    }
    let writer = tokio::spawn(write_loop(write_half, sink_rx));

    let mut reader = BufReader::new(read_half);
    loop {
        match read_frame::<Envelope>(&mut reader).await {
            Ok(envelope) => {
                if events
                    .send(LoopEvent::FrontRequest {
                        conn_id: conn_id.clone(),
                        envelope,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                if !err.is_disconnect() {
                    warn!("Caller {} read failed: {}", conn_id, err);
                }
                break;
            }
        }
    }
    writer.abort();
    let _unused = events.send(LoopEvent::FrontGone { conn_id }).await;
}

async fn accept_agents(listener: TcpListener, events: mpsc::Sender<LoopEvent>) {
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            break;
        };
        debug!("Agent connection from {}", peer);
        tokio::spawn(agent_session(stream, events.clone()));
    }
}

/// The first frame of a backend session must announce the agent. Anything
/// else is dropped with the connection.
async fn agent_session(stream: TcpStream, events: mpsc::Sender<LoopEvent>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let record = match read_frame::<Envelope>(&mut reader).await {
        Ok(envelope) if envelope.data.command() == Some(Command::Register) => {
            match parse_agent_record(&envelope.data) {
                Some(record) => record,
                None => {
                    warn!("Agent announced itself with an incomplete record");
                    return;
                }
            }
        }
        Ok(_) => {
            warn!("Agent connection opened without a REGISTER frame");
            return;
        }
        Err(_) => return,
    };
    let agent_id = record.agent_id.clone();

    let (sink, sink_rx) = mpsc::channel(CONN_CHANNEL_CAPACITY);
    if events
        .send(LoopEvent::AgentConnected { record, sink })
        .await
        .is_err()
    {
        return;
    }
    let writer = tokio::spawn(write_loop(write_half, sink_rx));

    loop {
        match read_frame::<Envelope>(&mut reader).await {
            Ok(envelope) => {
                if events
                    .send(LoopEvent::AgentFrame {
                        agent_id: agent_id.clone(),
                        envelope,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                if !err.is_disconnect() {
                    warn!("Agent {} read failed: {}", agent_id, err);
                }
                break;
            }
        }
    }
    writer.abort();
    let _unused = events.send(LoopEvent::AgentGone { agent_id }).await;
}

async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut frames: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = frames.recv().await {
        if send_frame(&mut write_half, &envelope).await.is_err() {
            break;
        }
    }
}

async fn clean_ticker(interval: Duration, events: mpsc::Sender<LoopEvent>) {
    let start = tokio::time::Instant::now().checked_add(interval);
    let mut ticker = match start {
        Some(start) => tokio::time::interval_at(start, interval),
        None => tokio::time::interval(interval),
    };
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if events.send(LoopEvent::CleanTick).await.is_err() {
            break;
        }
    }
}
