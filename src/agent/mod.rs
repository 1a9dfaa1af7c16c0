//! The agent process: announces itself to a broker backend, executes the
//! commands relayed to it, and listens to the broker's heartbeat.
//!
//! Losing the broker never kills the agent or its jobs; the session ends,
//! running jobs keep going, and the agent goes back to a standby loop that
//! reconnects and re-announces. Only QUIT and age-based retirement end the
//! process for good.

pub mod engine;

#[cfg(test)]
mod tests;

use std::time::Duration;

use rand::Rng;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, TransportError};
use crate::transport::heartbeat::Stethoscope;
use crate::transport::message::{Command, Envelope, Message};
use crate::transport::wire::{read_frame, send_frame};
use crate::util::{build_agent_id, local_hostname};

use self::engine::AgentEngine;

pub const DEFAULT_RUNNER: &str = "loadherd-runner";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REAP_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_WARMUP: Duration = Duration::from_millis(300);
const HEARTBEAT_DELAY: Duration = Duration::from_secs(3);
const HEARTBEAT_RETRIES: u32 = 3;
const SESSION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker backend the agent announces itself on.
    pub backend: String,
    /// Broker heartbeat endpoint to subscribe to.
    pub heartbeat: String,
    /// Broker frontend, handed to runner processes for result reporting.
    pub frontend: String,
    /// Default runner command line for runs that do not ship their own.
    pub runner: String,
    /// Retire after roughly this long, plus a random slice of `max_age_delta`
    /// so a fleet started together does not retire all at once.
    pub max_age: Option<Duration>,
    pub max_age_delta: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: "127.0.0.1:7781".to_owned(),
            heartbeat: "127.0.0.1:7782".to_owned(),
            frontend: "127.0.0.1:7780".to_owned(),
            runner: DEFAULT_RUNNER.to_owned(),
            max_age: None,
            max_age_delta: Duration::ZERO,
        }
    }
}

enum SessionEnd {
    /// QUIT or retirement; the process exits.
    Quit,
    /// Broker unreachable or silent; back to standby.
    Lost,
}

enum SessionEvent {
    Frame(Envelope),
    Lost,
    ReRegister,
    BeatLost,
}

/// Runs the agent until it is told to quit or retires.
///
/// # Errors
///
/// Infallible in the standby loop itself; session-level errors trigger a
/// reconnect instead of propagating.
pub async fn run(config: AgentConfig) -> AppResult<()> {
    let agent_id = build_agent_id();
    let retire_at = retirement_deadline(&config);
    info!("Agent {} starting against {}", agent_id, config.backend);

    // The engine outlives every session so running jobs survive a broker
    // outage and the reconnect that follows.
    let mut engine = AgentEngine::new(&agent_id, &config.frontend, &config.runner);
    loop {
        match session(&config, &agent_id, retire_at, &mut engine).await {
            Ok(SessionEnd::Quit) => break,
            Ok(SessionEnd::Lost) => {
                warn!("Broker lost, standing by");
            }
            Err(err) => {
                debug!("No broker yet: {}", err);
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
    info!("Agent {} done", agent_id);
    Ok(())
}

fn retirement_deadline(config: &AgentConfig) -> Option<tokio::time::Instant> {
    let max_age = config.max_age?;
    let delta_ms = crate::util::duration_ms(config.max_age_delta);
    let jitter = if delta_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=delta_ms))
    };
    tokio::time::Instant::now()
        .checked_add(max_age)?
        .checked_add(jitter)
}

async fn session(
    config: &AgentConfig,
    agent_id: &str,
    retire_at: Option<tokio::time::Instant>,
    engine: &mut AgentEngine,
) -> AppResult<SessionEnd> {
    let stream = TcpStream::connect(&config.backend).await.map_err(|err| {
        AppError::transport(TransportError::Connection {
            addr: config.backend.clone(),
            source: err,
        })
    })?;
    let (read_half, mut write_half) = stream.into_split();

    // The first frame of a backend session announces the agent.
    send_frame(&mut write_half, &Envelope::new(register_message(agent_id))).await?;
    info!("Agent {} registered", agent_id);

    let (events, mut events_rx) = mpsc::channel::<SessionEvent>(SESSION_CHANNEL_CAPACITY);

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            match read_frame::<Envelope>(&mut reader).await {
                Ok(envelope) => {
                    if reader_events
                        .send(SessionEvent::Frame(envelope))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => {
                    let _unused = reader_events.send(SessionEvent::Lost).await;
                    break;
                }
            }
        }
    });

    let mut stethoscope = Stethoscope::new(
        &config.heartbeat,
        HEARTBEAT_WARMUP,
        HEARTBEAT_DELAY,
        HEARTBEAT_RETRIES,
    );
    let register_events = events.clone();
    stethoscope.on_register(move || {
        // The broker just (re)started its publisher; announce again.
        let _unused = register_events.try_send(SessionEvent::ReRegister);
    });
    let lost_events = events.clone();
    stethoscope.on_beat_lost(move || {
        let _unused = lost_events.try_send(SessionEvent::BeatLost);
        true
    });
    // A busy agent keeps the subscription paused; reconnecting mid-run must
    // not re-arm the watchdog under it.
    if engine.job_count() == 0 {
        stethoscope.start().await?;
    }

    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut retiring = false;

    let end = loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    None | Some(SessionEvent::Lost | SessionEvent::BeatLost) => {
                        break SessionEnd::Lost;
                    }
                    Some(SessionEvent::ReRegister) => {
                        if send_frame(&mut write_half, &Envelope::new(register_message(agent_id)))
                            .await
                            .is_err()
                        {
                            break SessionEnd::Lost;
                        }
                    }
                    Some(SessionEvent::Frame(envelope)) => {
                        let outcome = engine.handle(&envelope.data).await;
                        let reply = envelope.reply(outcome.reply);
                        if send_frame(&mut write_half, &reply).await.is_err() {
                            break SessionEnd::Lost;
                        }
                        if outcome.exit {
                            let _unused = send_frame(
                                &mut write_half,
                                &Envelope::new(unregister_message(agent_id)),
                            )
                            .await;
                            break SessionEnd::Quit;
                        }
                        sync_stethoscope(&mut stethoscope, engine.job_count() > 0).await;
                    }
                }
            }
            _ = ticker.tick() => {
                engine.reap();
                sync_stethoscope(&mut stethoscope, engine.job_count() > 0).await;
                if let Some(retire_at) = retire_at
                    && tokio::time::Instant::now() >= retire_at
                {
                    retiring = true;
                }
                if retiring && engine.job_count() == 0 {
                    info!("Agent {} reached its maximum age, retiring", agent_id);
                    let _unused = send_frame(
                        &mut write_half,
                        &Envelope::new(unregister_message(agent_id)),
                    )
                    .await;
                    break SessionEnd::Quit;
                }
            }
        }
    };

    reader.abort();
    stethoscope.stop();
    Ok(end)
}

/// Heartbeat loss during a run must not kill the run, so the subscription
/// is paused while jobs are tracked and resumed once the agent is idle.
async fn sync_stethoscope(stethoscope: &mut Stethoscope, busy: bool) {
    if busy {
        stethoscope.stop();
    } else if !stethoscope.is_running()
        && let Err(err) = stethoscope.start().await
    {
        debug!("Heartbeat unavailable: {}", err);
    }
}

fn register_message(agent_id: &str) -> Message {
    let mut message = Message::with_command(Command::Register);
    message.insert("agent_id", serde_json::Value::String(agent_id.to_owned()));
    message.insert("pid", serde_json::Value::from(std::process::id()));
    message.insert(
        "hostname",
        serde_json::Value::String(local_hostname()),
    );
    message
}

fn unregister_message(agent_id: &str) -> Message {
    let mut message = Message::with_command(Command::Unregister);
    message.insert("agent_id", serde_json::Value::String(agent_id.to_owned()));
    message
}
