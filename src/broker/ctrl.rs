//! Scheduling policy and run bookkeeping, layered on top of the raw
//! routing primitive.
//!
//! All state here is owned by the single broker loop task; every mutation
//! happens via messages processed on that loop.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, ControlError};
use crate::transport::message::{Command, Message};
use crate::util::{local_hostname, pid_exists};

use super::observer::RunObserver;
use super::store::Store;

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub pid: u32,
    pub hostname: String,
    pub registered_at: DateTime<Utc>,
}

/// Round-trip timer: when the agent was last sent a request, and when it
/// last replied. A dispatch with no reply yet is the staleness signal.
#[derive(Debug, Clone, Copy)]
struct DispatchTimer {
    dispatched: Instant,
    replied: Option<Instant>,
}

#[derive(Debug, Clone)]
struct RunAssociation {
    run_id: String,
    started_at: DateTime<Utc>,
}

/// The two liveness signals, kept distinct: OS-level process existence and
/// round-trip staleness. Collapsing them can falsely evict a slow-but-alive
/// agent under load, so eviction on staleness is a policy knob.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    /// None when the agent runs on another host and cannot be probed.
    pub process_alive: Option<bool>,
    pub stale: bool,
}

impl Liveness {
    pub const fn is_valid(self, evict_stale: bool) -> bool {
        if let Some(false) = self.process_alive {
            return false;
        }
        !(evict_stale && self.stale)
    }
}

/// The result of a controller command: an optional synchronous reply plus
/// messages to dispatch to agents. The router owns the sockets, so the
/// controller never sends directly.
#[derive(Debug, Default)]
pub struct CtrlOutcome {
    pub reply: Option<Message>,
    pub dispatches: Vec<(String, Message)>,
}

impl CtrlOutcome {
    fn reply(message: Message) -> Self {
        Self {
            reply: Some(message),
            dispatches: Vec::new(),
        }
    }
}

pub struct BrokerController {
    agents: HashMap<String, AgentRecord>,
    timers: HashMap<String, DispatchTimer>,
    runs: HashMap<String, RunAssociation>,
    agent_timeout: Duration,
    evict_stale: bool,
    local_hostname: String,
    store: Box<dyn Store>,
    observers: Vec<Box<dyn RunObserver>>,
}

impl BrokerController {
    pub fn new(agent_timeout: Duration, evict_stale: bool, store: Box<dyn Store>) -> Self {
        Self {
            agents: HashMap::new(),
            timers: HashMap::new(),
            runs: HashMap::new(),
            agent_timeout,
            evict_stale,
            local_hostname: local_hostname(),
            store,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn RunObserver>) {
        self.observers.push(observer);
    }

    /// Idempotent registration.
    pub fn register_agent(&mut self, record: AgentRecord) {
        if !self.agents.contains_key(&record.agent_id) {
            debug!("{} registered", record.agent_id);
        }
        self.agents.insert(record.agent_id.clone(), record);
    }

    /// Idempotent; releases any run association held by the agent. An
    /// unregistered id is immediately unselectable for new reservations.
    pub fn unregister_agent(&mut self, agent_id: &str) {
        if self.agents.remove(agent_id).is_some() {
            debug!("{} removed", agent_id);
        }
        self.timers.remove(agent_id);
        self.runs.remove(agent_id);
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn record_dispatch(&mut self, agent_id: &str) {
        self.timers.insert(
            agent_id.to_owned(),
            DispatchTimer {
                dispatched: Instant::now(),
                replied: None,
            },
        );
    }

    pub fn record_reply(&mut self, agent_id: &str) {
        let now = Instant::now();
        self.timers
            .entry(agent_id.to_owned())
            .and_modify(|timer| timer.replied = Some(now))
            .or_insert(DispatchTimer {
                dispatched: now,
                replied: Some(now),
            });
    }

    /// Assesses both liveness signals for one agent.
    pub fn check_agent(&self, agent_id: &str) -> Liveness {
        let process_alive = self.agents.get(agent_id).and_then(|record| {
            (record.hostname == self.local_hostname).then(|| pid_exists(record.pid))
        });
        let stale = self.timers.get(agent_id).is_some_and(|timer| {
            timer.replied.is_none() && timer.dispatched.elapsed() > self.agent_timeout
        });
        Liveness {
            process_alive,
            stale,
        }
    }

    pub fn is_valid_candidate(&self, agent_id: &str) -> bool {
        self.check_agent(agent_id).is_valid(self.evict_stale)
    }

    /// Reserves `n` idle, liveness-validated agents for `run_id`.
    ///
    /// The association is atomic from the caller's point of view: on any
    /// failure the registry and run table are left unchanged.
    ///
    /// # Errors
    ///
    /// Returns `NotEnoughWorkers` when fewer than `n` valid idle candidates
    /// exist.
    pub fn reserve_agents(&mut self, n: usize, run_id: &str) -> AppResult<Vec<String>> {
        let mut candidates: Vec<String> = self
            .agents
            .keys()
            .filter(|agent_id| !self.runs.contains_key(*agent_id))
            .filter(|agent_id| self.is_valid_candidate(agent_id))
            .cloned()
            .collect();

        if candidates.len() < n {
            return Err(AppError::control(ControlError::NotEnoughWorkers {
                asked: n,
                available: candidates.len(),
            }));
        }

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(n);

        let started_at = Utc::now();
        for agent_id in &candidates {
            self.runs.insert(
                agent_id.clone(),
                RunAssociation {
                    run_id: run_id.to_owned(),
                    started_at,
                },
            );
        }
        Ok(candidates)
    }

    /// Status probes for every agent currently associated with a run.
    pub fn clean(&mut self) -> Vec<(String, Message)> {
        self.runs
            .iter()
            .map(|(agent_id, association)| {
                let mut probe = Message::with_command(Command::InternalStatus);
                probe.insert("run_id", Value::String(association.run_id.clone()));
                (agent_id.clone(), probe)
            })
            .collect()
    }

    /// Updates bookkeeping from an agent's reported process statuses.
    /// Returns the run id when the agent was the last one associated with
    /// its run, i.e. the run just ended.
    pub fn update_status(&mut self, agent_id: &str, statuses: &[String]) -> Option<String> {
        if statuses.iter().any(|status| status == "running") {
            // Not over; refresh the reply side of the timer.
            self.record_reply(agent_id);
            return None;
        }

        self.timers.remove(agent_id);
        let association = self.runs.remove(agent_id)?;
        let run_id = association.run_id;
        let remaining = self
            .runs
            .values()
            .filter(|other| other.run_id == run_id)
            .count();
        (remaining == 0).then_some(run_id)
    }

    pub fn list_runs(&self) -> Map<String, Value> {
        let mut runs: Map<String, Value> = Map::new();
        for (agent_id, association) in &self.runs {
            let entry = runs
                .entry(association.run_id.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(agents) = entry {
                agents.push(Value::Array(vec![
                    Value::String(agent_id.clone()),
                    Value::String(association.started_at.to_rfc3339()),
                ]));
            }
        }
        runs
    }

    pub fn agents_for_run(&self, run_id: &str) -> Vec<String> {
        self.runs
            .iter()
            .filter(|(_, association)| association.run_id == run_id)
            .map(|(agent_id, _)| agent_id.clone())
            .collect()
    }

    /// Handles a RUN command: allocates a run id, reserves agents, persists
    /// run metadata and produces the per-agent dispatches.
    ///
    /// # Errors
    ///
    /// Returns `NotEnoughWorkers` when the reservation fails; the whole
    /// call fails and nothing is dispatched.
    pub fn start_run(&mut self, request: &Message) -> AppResult<CtrlOutcome> {
        let asked = request
            .get_u64("agents")
            .and_then(|value| usize::try_from(value).ok())
            .ok_or_else(|| {
                AppError::control(ControlError::MissingField {
                    command: "RUN",
                    field: "agents",
                })
            })?;
        let args = request.get("args").cloned().unwrap_or(Value::Null);

        let run_id = Uuid::new_v4().to_string();
        let reserved = self.reserve_agents(asked, &run_id)?;

        let mut metadata = Map::new();
        metadata.insert("started".to_owned(), Value::String(Utc::now().to_rfc3339()));
        metadata.insert("active".to_owned(), Value::Bool(true));
        metadata.insert("args".to_owned(), args.clone());
        self.store.save_metadata(&run_id, metadata);
        self.store.flush();

        let mut dispatches = Vec::with_capacity(reserved.len());
        for agent_id in &reserved {
            let mut command = Message::with_command(Command::Run);
            command.insert("run_id", Value::String(run_id.clone()));
            command.insert("args", args.clone());
            if let Some(files) = request.get("files") {
                command.insert("files", files.clone());
            }
            dispatches.push((agent_id.clone(), command));
        }

        let mut result = Map::new();
        result.insert("run_id".to_owned(), Value::String(run_id));
        result.insert(
            "agents".to_owned(),
            Value::Array(reserved.into_iter().map(Value::String).collect()),
        );
        Ok(CtrlOutcome {
            reply: Some(Message::result(Value::Object(result))),
            dispatches,
        })
    }

    /// STOP to every agent associated with the run, then one clean pass.
    pub fn stop_run(&mut self, run_id: &str) -> CtrlOutcome {
        let agents = self.agents_for_run(run_id);
        let mut dispatches: Vec<(String, Message)> = agents
            .iter()
            .map(|agent_id| (agent_id.clone(), Message::with_command(Command::Stop)))
            .collect();
        dispatches.extend(self.clean());

        let reply = Message::result(Value::Array(
            agents.into_iter().map(Value::String).collect(),
        ));
        CtrlOutcome {
            reply: Some(reply),
            dispatches,
        }
    }

    /// Marks the run ended in the store and notifies every observer with
    /// the aggregate view. Observer failures are logged, never propagated.
    pub fn test_ended(&mut self, run_id: &str) {
        let mut fields = Map::new();
        fields.insert("active".to_owned(), Value::Bool(false));
        fields.insert("ended".to_owned(), Value::String(Utc::now().to_rfc3339()));
        self.store.update_metadata(run_id, fields);
        self.store.flush();

        let metadata = self.store.get_metadata(run_id);
        let args = metadata.get("args").cloned().unwrap_or(Value::Null);
        let mut aggregate = Map::new();
        aggregate.insert("run_id".to_owned(), Value::String(run_id.to_owned()));
        aggregate.insert(
            "counts".to_owned(),
            Value::Object(self.store.get_counts(run_id)),
        );
        aggregate.insert("metadata".to_owned(), Value::Object(metadata));

        for observer in &self.observers {
            if let Err(err) = observer.run_ended(&aggregate, &args) {
                warn!("Observer {} failed: {}", observer.name(), err);
            }
        }
    }

    /// Stores a data record that already carries its own run id, as pushed
    /// by a runner process reporting directly.
    pub fn save_raw(&mut self, data: Map<String, Value>) {
        self.store.add(data);
    }

    /// Stores a data record pushed by an agent, annotated with the agent's
    /// current run association.
    pub fn save_data(&mut self, agent_id: &str, mut data: Map<String, Value>) {
        if let Some(association) = self.runs.get(agent_id) {
            data.insert("run_id".to_owned(), Value::String(association.run_id.clone()));
            data.insert(
                "started".to_owned(),
                Value::String(association.started_at.to_rfc3339()),
            );
        }
        self.store.add(data);
    }

    /// Dispatches one controller-scoped command.
    ///
    /// # Errors
    ///
    /// Command errors (missing fields, failed reservations) surface here
    /// and are converted to error envelopes by the router.
    pub fn run_command(&mut self, command: Command, request: &Message) -> AppResult<CtrlOutcome> {
        match command {
            Command::Run => self.start_run(request),
            Command::StopRun => {
                let run_id = request.get_str("run_id").ok_or_else(|| {
                    AppError::control(ControlError::MissingField {
                        command: "STOPRUN",
                        field: "run_id",
                    })
                })?;
                Ok(self.stop_run(run_id))
            }
            Command::List => Ok(CtrlOutcome::reply(Message::result(Value::Array(
                self.agent_ids().into_iter().map(Value::String).collect(),
            )))),
            Command::ListRuns => Ok(CtrlOutcome::reply(Message::result(Value::Object(
                self.list_runs(),
            )))),
            Command::GetData => {
                let run_id = required_run_id(request, "GET_DATA")?;
                // Force visibility of buffered writes before the read.
                self.store.flush();
                Ok(CtrlOutcome::reply(Message::result(Value::Array(
                    self.store.get_data(&run_id),
                ))))
            }
            Command::GetCounts => {
                let run_id = required_run_id(request, "GET_COUNTS")?;
                self.store.flush();
                Ok(CtrlOutcome::reply(Message::result(Value::Object(
                    self.store.get_counts(&run_id),
                ))))
            }
            Command::GetMetadata => {
                let run_id = required_run_id(request, "GET_METADATA")?;
                self.store.flush();
                Ok(CtrlOutcome::reply(Message::result(Value::Object(
                    self.store.get_metadata(&run_id),
                ))))
            }
            Command::Ping
            | Command::Status
            | Command::InternalStatus
            | Command::Stop
            | Command::Quit
            | Command::Register
            | Command::Unregister => Err(AppError::control(ControlError::UnknownCommand {
                command: command.as_str().to_owned(),
            })),
        }
    }
}

fn required_run_id(request: &Message, command: &'static str) -> AppResult<String> {
    request
        .get_str("run_id")
        .map(str::to_owned)
        .ok_or_else(|| {
            AppError::control(ControlError::MissingField {
                command,
                field: "run_id",
            })
        })
}
