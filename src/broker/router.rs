//! The broker event loop.
//!
//! Every socket gets a reader task and a writer task; both ends funnel into
//! one mpsc channel consumed here. The loop owns all routing state and the
//! controller, so no routing decision ever races another.

use std::collections::HashMap;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::ctrl::{AgentRecord, BrokerController};
use crate::transport::message::{Command, Envelope, Message};

/// Relay attempts before a request is answered with a no-worker error.
pub const MAX_DISPATCH_ATTEMPTS: u32 = 3;
/// Base delay between relay attempts; grows linearly per attempt.
pub const DISPATCH_RETRY_BASE: Duration = Duration::from_millis(500);

/// Addresses a running broker answers PING with.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub frontend: String,
    pub backend: String,
    pub heartbeat: String,
}

/// Everything the broker loop reacts to.
pub enum LoopEvent {
    FrontConnected {
        conn_id: String,
        sink: mpsc::Sender<Envelope>,
    },
    FrontRequest {
        conn_id: String,
        envelope: Envelope,
    },
    FrontGone {
        conn_id: String,
    },
    AgentConnected {
        record: AgentRecord,
        sink: mpsc::Sender<Envelope>,
    },
    AgentFrame {
        agent_id: String,
        envelope: Envelope,
    },
    AgentGone {
        agent_id: String,
    },
    /// A deferred relay attempt; the originating caller is already on the
    /// envelope's route.
    Dispatch {
        envelope: Envelope,
        attempt: u32,
    },
    CleanTick,
    Shutdown,
}

pub struct Router {
    pid: u32,
    endpoints: Endpoints,
    controller: BrokerController,
    fronts: HashMap<String, mpsc::Sender<Envelope>>,
    agent_sinks: HashMap<String, mpsc::Sender<Envelope>>,
    events: mpsc::Sender<LoopEvent>,
}

impl Router {
    pub fn new(
        endpoints: Endpoints,
        controller: BrokerController,
        events: mpsc::Sender<LoopEvent>,
    ) -> Self {
        Self {
            pid: std::process::id(),
            endpoints,
            controller,
            fronts: HashMap::new(),
            agent_sinks: HashMap::new(),
            events,
        }
    }

    /// Consumes events until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<LoopEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        debug!("Broker loop ended");
    }

    async fn handle_event(&mut self, event: LoopEvent) -> bool {
        match event {
            LoopEvent::FrontConnected { conn_id, sink } => {
                self.fronts.insert(conn_id, sink);
            }
            LoopEvent::FrontRequest { conn_id, envelope } => {
                self.handle_front_request(conn_id, envelope).await;
            }
            LoopEvent::FrontGone { conn_id } => {
                self.fronts.remove(&conn_id);
            }
            LoopEvent::AgentConnected { record, sink } => {
                self.agent_sinks.insert(record.agent_id.clone(), sink);
                self.controller.register_agent(record);
            }
            LoopEvent::AgentFrame { agent_id, envelope } => {
                self.handle_agent_frame(&agent_id, envelope).await;
            }
            LoopEvent::AgentGone { agent_id } => {
                self.agent_sinks.remove(&agent_id);
                self.controller.unregister_agent(&agent_id);
            }
            LoopEvent::Dispatch { envelope, attempt } => {
                self.relay(envelope, attempt).await;
            }
            LoopEvent::CleanTick => {
                self.clean().await;
            }
            LoopEvent::Shutdown => return false,
        }
        true
    }

    async fn handle_front_request(&mut self, conn_id: String, envelope: Envelope) {
        // Runner processes report results straight to the frontend. Pushes
        // are fire and forget and carry their own run id.
        if envelope.data.command().is_none() && envelope.data.contains("data_type") {
            self.controller.save_raw(envelope.data.into_inner());
            return;
        }
        match envelope.data.command() {
            Some(Command::Ping) => {
                self.reply_to(&conn_id, self.ping_reply()).await;
            }
            Some(
                Command::Run
                | Command::StopRun
                | Command::List
                | Command::ListRuns
                | Command::GetData
                | Command::GetCounts
                | Command::GetMetadata,
            ) => {
                self.handle_controller_command(&conn_id, &envelope).await;
            }
            Some(Command::Status | Command::Stop | Command::Quit) => {
                self.handle_targeted(conn_id, envelope).await;
            }
            // Agent-originated vocabulary and anything unparsed is relayed
            // opaquely; the receiving agent answers unknown commands with
            // an error envelope.
            Some(Command::InternalStatus | Command::Register | Command::Unregister) | None => {
                let mut envelope = envelope;
                envelope.route.push(conn_id);
                self.relay(envelope, 0).await;
            }
        }
    }

    async fn handle_controller_command(&mut self, conn_id: &str, envelope: &Envelope) {
        let Some(command) = envelope.data.command() else {
            return;
        };
        match self.controller.run_command(command, &envelope.data) {
            Ok(outcome) => {
                for (agent_id, message) in outcome.dispatches {
                    self.dispatch_to_agent(&agent_id, message).await;
                }
                if let Some(reply) = outcome.reply {
                    self.reply_to(conn_id, reply).await;
                }
            }
            Err(err) => {
                self.reply_to(conn_id, Message::error(&err.to_string(), Some("broker")))
                    .await;
            }
        }
    }

    /// STATUS, STOP and QUIT name their agent explicitly; the reply routes
    /// back through us, so the caller's id rides on the envelope.
    async fn handle_targeted(&mut self, conn_id: String, mut envelope: Envelope) {
        let Some(agent_id) = envelope.data.get_str("worker_id").map(str::to_owned) else {
            self.reply_to(&conn_id, Message::error("missing worker_id", Some("broker")))
                .await;
            return;
        };
        if !self.controller.has_agent(&agent_id) {
            self.reply_to(
                &conn_id,
                Message::error(&format!("unknown agent {agent_id}"), Some("broker")),
            )
            .await;
            return;
        }
        envelope.route.push(conn_id);
        self.dispatch_envelope(&agent_id, envelope).await;
    }

    /// Relays a command to a randomly chosen registered agent. A candidate
    /// that fails its liveness check or its send is deregistered and
    /// another is drawn; with no candidate left the attempt is deferred
    /// with a growing backoff.
    async fn relay(&mut self, envelope: Envelope, attempt: u32) {
        loop {
            let connected: Vec<String> = self
                .controller
                .agent_ids()
                .into_iter()
                .filter(|agent_id| self.agent_sinks.contains_key(agent_id))
                .collect();
            let Some(agent_id) = connected.choose(&mut rand::thread_rng()).cloned() else {
                self.defer(envelope, attempt).await;
                return;
            };
            if !self.controller.is_valid_candidate(&agent_id) {
                warn!("{} failed its liveness check, evicting", agent_id);
                self.agent_sinks.remove(&agent_id);
                self.controller.unregister_agent(&agent_id);
                continue;
            }
            if self.dispatch_envelope(&agent_id, envelope.clone()).await {
                return;
            }
        }
    }

    async fn defer(&mut self, envelope: Envelope, attempt: u32) {
        let next = attempt.saturating_add(1);
        if next >= MAX_DISPATCH_ATTEMPTS {
            self.reply_no_worker(envelope).await;
            return;
        }
        let delay = DISPATCH_RETRY_BASE.saturating_mul(next);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _unused = events
                .send(LoopEvent::Dispatch {
                    envelope,
                    attempt: next,
                })
                .await;
        });
    }

    async fn reply_no_worker(&mut self, envelope: Envelope) {
        let mut reply = Message::error("no worker", Some("broker"));
        reply.insert("pid", Value::from(self.pid));
        let mut route = envelope.route;
        if let Some(conn_id) = route.pop() {
            self.send_front(&conn_id, Envelope::routed(route, reply))
                .await;
        }
    }

    async fn handle_agent_frame(&mut self, agent_id: &str, envelope: Envelope) {
        // Any frame proves the agent is responsive.
        self.controller.record_reply(agent_id);

        match envelope.data.command() {
            Some(Command::Register) => {
                if let Some(record) = parse_agent_record(&envelope.data) {
                    self.controller.register_agent(record);
                }
                return;
            }
            Some(Command::Unregister) => {
                self.agent_sinks.remove(agent_id);
                self.controller.unregister_agent(agent_id);
                return;
            }
            Some(
                Command::Ping
                | Command::Run
                | Command::Status
                | Command::InternalStatus
                | Command::Stop
                | Command::StopRun
                | Command::Quit
                | Command::List
                | Command::ListRuns
                | Command::GetData
                | Command::GetCounts
                | Command::GetMetadata,
            )
            | None => {}
        }

        // Status reports feed run bookkeeping whether solicited by a client
        // or by our own probes.
        if let Some(statuses) = parse_statuses(&envelope.data) {
            if let Some(ended) = self.controller.update_status(agent_id, &statuses) {
                self.controller.test_ended(&ended);
            }
        }

        // Routeless frames carrying a data_type are run results pushed by
        // the agent.
        if envelope.route.is_empty() {
            if envelope.data.contains("data_type") {
                self.controller
                    .save_data(agent_id, envelope.data.into_inner());
            }
            return;
        }

        let mut route = envelope.route;
        let Some(conn_id) = route.pop() else {
            return;
        };
        self.send_front(&conn_id, Envelope::routed(route, envelope.data))
            .await;
    }

    /// Evicts agents that fail their liveness check, then probes every
    /// agent still associated with a run.
    async fn clean(&mut self) {
        let stale: Vec<String> = self
            .controller
            .agent_ids()
            .into_iter()
            .filter(|agent_id| !self.controller.is_valid_candidate(agent_id))
            .collect();
        for agent_id in stale {
            warn!("{} failed its liveness check, evicting", agent_id);
            self.agent_sinks.remove(&agent_id);
            self.controller.unregister_agent(&agent_id);
        }

        for (agent_id, probe) in self.controller.clean() {
            self.dispatch_to_agent(&agent_id, probe).await;
        }
    }

    async fn dispatch_to_agent(&mut self, agent_id: &str, message: Message) {
        // Broker-initiated sends travel with an empty route; the agent's
        // reply terminates here instead of being forwarded.
        self.dispatch_envelope(agent_id, Envelope::new(message))
            .await;
    }

    async fn dispatch_envelope(&mut self, agent_id: &str, envelope: Envelope) -> bool {
        let Some(sink) = self.agent_sinks.get(agent_id) else {
            debug!("{} has no live connection, dropping dispatch", agent_id);
            return false;
        };
        if sink.send(envelope).await.is_err() {
            self.agent_sinks.remove(agent_id);
            self.controller.unregister_agent(agent_id);
            return false;
        }
        self.controller.record_dispatch(agent_id);
        true
    }

    async fn reply_to(&mut self, conn_id: &str, reply: Message) {
        self.send_front(conn_id, Envelope::new(reply)).await;
    }

    async fn send_front(&mut self, conn_id: &str, envelope: Envelope) {
        let Some(sink) = self.fronts.get(conn_id) else {
            debug!("Caller {} is gone, dropping reply", conn_id);
            return;
        };
        if sink.send(envelope).await.is_err() {
            self.fronts.remove(conn_id);
        }
    }

    fn ping_reply(&self) -> Message {
        let mut endpoints = Map::new();
        endpoints.insert(
            "frontend".to_owned(),
            Value::String(self.endpoints.frontend.clone()),
        );
        endpoints.insert(
            "backend".to_owned(),
            Value::String(self.endpoints.backend.clone()),
        );
        endpoints.insert(
            "heartbeat".to_owned(),
            Value::String(self.endpoints.heartbeat.clone()),
        );

        let mut result = Map::new();
        result.insert("pid".to_owned(), Value::from(self.pid));
        result.insert("endpoints".to_owned(), Value::Object(endpoints));
        result.insert(
            "agents".to_owned(),
            Value::Array(
                self.controller
                    .agent_ids()
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
        );
        Message::result(Value::Object(result))
    }
}

pub fn parse_agent_record(message: &Message) -> Option<AgentRecord> {
    let agent_id = message.get_str("agent_id")?.to_owned();
    let pid = message.get_u64("pid").and_then(|pid| u32::try_from(pid).ok())?;
    let hostname = message.get_str("hostname")?.to_owned();
    Some(AgentRecord {
        agent_id,
        pid,
        hostname,
        registered_at: chrono::Utc::now(),
    })
}

fn parse_statuses(message: &Message) -> Option<Vec<String>> {
    let statuses = message.get("statuses")?.as_array()?;
    Some(
        statuses
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
    )
}
