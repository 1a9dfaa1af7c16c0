//! Liveness broadcast over a one-to-many channel.
//!
//! `Heartbeat` publishes `BEAT` lines to every connected subscriber at a
//! fixed interval, broadcasting a `REGISTER` marker every Nth tick so that
//! freshly (re)started subscribers can re-announce themselves. No
//! acknowledgement is ever read back.
//!
//! `Stethoscope` subscribes to such an endpoint and arms a watchdog: every
//! received beat resets a failure counter, and `retries` consecutive empty
//! periods fire `onbeatlost`. Loss is only observable through that
//! callback, never as an error.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::{AppError, AppResult, TransportError};

pub const DEFAULT_REGISTER_EVERY: u64 = 5;

const BEAT_MARKER: &str = "BEAT";
const REGISTER_MARKER: &str = "REGISTER";

type BeatFn = Box<dyn FnMut() + Send>;
type BeatLostFn = Box<dyn FnMut() -> bool + Send>;
type SharedBeatFn = Arc<Mutex<BeatFn>>;
type SharedBeatLostFn = Arc<Mutex<BeatLostFn>>;

fn fire(callback: Option<&SharedBeatFn>) {
    if let Some(callback) = callback
        && let Ok(mut callback) = callback.lock()
    {
        callback();
    }
}

/// The publishing side of the liveness channel.
pub struct Heartbeat {
    endpoint: String,
    interval: Duration,
    register_every: u64,
    onregister: Option<SharedBeatFn>,
    bound: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(endpoint: &str, interval: Duration, register_every: u64) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            interval,
            register_every: register_every.max(1),
            onregister: None,
            bound: None,
            task: None,
        }
    }

    /// Called just before each REGISTER broadcast.
    pub fn on_register<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.onregister = Some(Arc::new(Mutex::new(Box::new(callback))));
    }

    /// Binds the endpoint and begins ticking.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be bound.
    pub async fn start(&mut self) -> AppResult<()> {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                return Ok(());
            }
            self.task = None;
        }

        let listener = TcpListener::bind(&self.endpoint).await.map_err(|err| {
            AppError::transport(TransportError::Bind {
                addr: self.endpoint.clone(),
                source: err,
            })
        })?;
        self.bound = listener.local_addr().ok();
        debug!("Heartbeat publishing on {}", self.endpoint);

        let interval = self.interval;
        let register_every = self.register_every;
        let onregister = self.onregister.clone();
        self.task = Some(tokio::spawn(async move {
            publish_loop(listener, interval, register_every, onregister).await;
        }));
        Ok(())
    }

    /// The bound address, once started. Useful when binding port 0.
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    /// Stops ticking. Safe to call when not started.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.bound = None;
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn publish_loop(
    listener: TcpListener,
    interval: Duration,
    register_every: u64,
    onregister: Option<SharedBeatFn>,
) {
    let mut subscribers: Vec<tokio::net::tcp::OwnedWriteHalf> = Vec::new();
    let start = tokio::time::Instant::now().checked_add(interval);
    let mut ticker = match start {
        Some(start) => tokio::time::interval_at(start, interval),
        None => tokio::time::interval(interval),
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut current: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                if let Ok((stream, peer)) = accepted {
                    debug!("Heartbeat subscriber connected from {}", peer);
                    let (_read, write) = stream.into_split();
                    subscribers.push(write);
                }
            }
            _ = ticker.tick() => {
                let marker = if current == 0 {
                    fire(onregister.as_ref());
                    REGISTER_MARKER
                } else {
                    BEAT_MARKER
                };
                broadcast(&mut subscribers, marker).await;
                current = current.saturating_add(1);
                if current == register_every {
                    current = 0;
                }
            }
        }
    }
}

async fn broadcast(subscribers: &mut Vec<tokio::net::tcp::OwnedWriteHalf>, marker: &str) {
    let mut line = marker.to_owned();
    line.push('\n');
    let mut alive = Vec::with_capacity(subscribers.len());
    for mut subscriber in subscribers.drain(..) {
        // A dead subscriber is dropped silently; delivery is best-effort.
        if subscriber.write_all(line.as_bytes()).await.is_ok() {
            alive.push(subscriber);
        }
    }
    *subscribers = alive;
}

/// The subscribing side: detects a silent publisher through a watchdog.
///
/// Stopping disconnects the subscription and resets the failure counter;
/// calling `start()` again fully re-initializes the connection and timers.
pub struct Stethoscope {
    endpoint: String,
    warmup_delay: Duration,
    delay: Duration,
    retries: u32,
    onbeat: Option<SharedBeatFn>,
    onregister: Option<SharedBeatFn>,
    onbeatlost: Option<SharedBeatLostFn>,
    task: Option<JoinHandle<()>>,
}

impl Stethoscope {
    pub fn new(endpoint: &str, warmup_delay: Duration, delay: Duration, retries: u32) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            warmup_delay,
            delay,
            retries: retries.max(1),
            onbeat: None,
            onregister: None,
            onbeatlost: None,
            task: None,
        }
    }

    pub fn on_beat<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.onbeat = Some(Arc::new(Mutex::new(Box::new(callback))));
    }

    pub fn on_register<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.onregister = Some(Arc::new(Mutex::new(Box::new(callback))));
    }

    /// Called after `retries` consecutive silent periods. Returning true
    /// stops the stethoscope; with no callback set, loss always stops it.
    pub fn on_beat_lost<F>(&mut self, callback: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.onbeatlost = Some(Arc::new(Mutex::new(Box::new(callback))));
    }

    /// Subscribes to the endpoint and arms the watchdog after the warmup
    /// delay.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be connected.
    pub async fn start(&mut self) -> AppResult<()> {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                return Ok(());
            }
            self.task = None;
        }

        let stream = TcpStream::connect(&self.endpoint).await.map_err(|err| {
            AppError::transport(TransportError::Connection {
                addr: self.endpoint.clone(),
                source: err,
            })
        })?;
        debug!("Subscribed to {}", self.endpoint);

        let warmup_delay = self.warmup_delay;
        let delay = self.delay;
        let retries = self.retries;
        let onbeat = self.onbeat.clone();
        let onregister = self.onregister.clone();
        let onbeatlost = self.onbeatlost.clone();
        self.task = Some(tokio::spawn(async move {
            watch_loop(
                stream, warmup_delay, delay, retries, onbeat, onregister, onbeatlost,
            )
            .await;
        }));
        Ok(())
    }

    /// Disconnects and resets internal counters. Safe when not started.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Stethoscope {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch_loop(
    stream: TcpStream,
    warmup_delay: Duration,
    delay: Duration,
    retries: u32,
    onbeat: Option<SharedBeatFn>,
    onregister: Option<SharedBeatFn>,
    onbeatlost: Option<SharedBeatLostFn>,
) {
    tokio::time::sleep(warmup_delay).await;

    // The write half is kept so the publisher sees the connection as open.
    let (read_half, _write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let start = tokio::time::Instant::now().checked_add(delay);
    let mut ticker = match start {
        Some(start) => tokio::time::interval_at(start, delay),
        None => tokio::time::interval(delay),
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut tries: u32 = 0;
    let mut open = true;

    loop {
        if open {
            tokio::select! {
                _ = ticker.tick() => {
                    if watchdog(&mut tries, retries, onbeatlost.as_ref()) {
                        return;
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(marker)) => {
                            tries = 0;
                            if marker == BEAT_MARKER {
                                fire(onbeat.as_ref());
                            } else if marker == REGISTER_MARKER {
                                fire(onregister.as_ref());
                            }
                            debug!("{}", marker);
                        }
                        Ok(None) | Err(_) => {
                            // Publisher went away; keep counting down.
                            open = false;
                        }
                    }
                }
            }
        } else {
            ticker.tick().await;
            if watchdog(&mut tries, retries, onbeatlost.as_ref()) {
                return;
            }
        }
    }
}

fn watchdog(tries: &mut u32, retries: u32, onbeatlost: Option<&SharedBeatLostFn>) -> bool {
    *tries = tries.saturating_add(1);
    if *tries < retries {
        return false;
    }
    debug!("Nothing came back");
    match onbeatlost {
        Some(callback) => callback.lock().map(|mut callback| callback()).unwrap_or(true),
        None => true,
    }
}
