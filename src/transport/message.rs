use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult, TransportError};

/// Command vocabulary understood by the control plane.
///
/// Anything that does not parse into a variant is relayed opaquely to an
/// agent, which answers unknown commands with an error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Run,
    Status,
    InternalStatus,
    Stop,
    StopRun,
    Quit,
    List,
    ListRuns,
    GetData,
    GetCounts,
    GetMetadata,
    Register,
    Unregister,
}

impl Command {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PING" => Some(Self::Ping),
            "RUN" => Some(Self::Run),
            "STATUS" => Some(Self::Status),
            "_STATUS" => Some(Self::InternalStatus),
            "STOP" => Some(Self::Stop),
            "STOPRUN" => Some(Self::StopRun),
            "QUIT" => Some(Self::Quit),
            "LIST" => Some(Self::List),
            "LISTRUNS" => Some(Self::ListRuns),
            "GET_DATA" => Some(Self::GetData),
            "GET_COUNTS" => Some(Self::GetCounts),
            "GET_METADATA" => Some(Self::GetMetadata),
            "REGISTER" => Some(Self::Register),
            "UNREGISTER" => Some(Self::Unregister),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Run => "RUN",
            Self::Status => "STATUS",
            Self::InternalStatus => "_STATUS",
            Self::Stop => "STOP",
            Self::StopRun => "STOPRUN",
            Self::Quit => "QUIT",
            Self::List => "LIST",
            Self::ListRuns => "LISTRUNS",
            Self::GetData => "GET_DATA",
            Self::GetCounts => "GET_COUNTS",
            Self::GetMetadata => "GET_METADATA",
            Self::Register => "REGISTER",
            Self::Unregister => "UNREGISTER",
        }
    }
}

/// An opaque command/result record: a JSON object exchanged between all
/// parties. Requests carry a `command` field; replies carry `result` or
/// `error`. Round-trips losslessly through serialize/deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with_command(command: Command) -> Self {
        let mut map = Map::new();
        map.insert(
            "command".to_owned(),
            Value::String(command.as_str().to_owned()),
        );
        Self(map)
    }

    /// A reply envelope: `{"result": value}`.
    pub fn result(value: Value) -> Self {
        let mut map = Map::new();
        map.insert("result".to_owned(), value);
        Self(map)
    }

    /// An error envelope: `{"error": text}`, optionally tagged with the
    /// identity of the party that produced it.
    pub fn error(text: &str, origin: Option<&str>) -> Self {
        let mut map = Map::new();
        map.insert("error".to_owned(), Value::String(text.to_owned()));
        if let Some(origin) = origin {
            map.insert("origin".to_owned(), Value::String(origin.to_owned()));
        }
        Self(map)
    }

    pub fn insert(&mut self, key: &str, value: Value) -> &mut Self {
        self.0.insert(key.to_owned(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn command_name(&self) -> Option<&str> {
        self.get_str("command")
    }

    pub fn command(&self) -> Option<Command> {
        self.command_name().and_then(Command::parse)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded as JSON.
    pub fn serialize(&self) -> AppResult<String> {
        serde_json::to_string(self).map_err(|err| {
            AppError::transport(TransportError::Serialize {
                context: "message",
                source: err,
            })
        })
    }

    /// # Errors
    ///
    /// Returns an error if the input is not a JSON object.
    pub fn parse(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw).map_err(|err| {
            AppError::transport(TransportError::Deserialize {
                context: "message",
                source: err,
            })
        })
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A message in flight, carrying the reverse-address chain needed to return
/// a reply to the exact originating caller through intermediary routers.
/// Each router pushes its hop id when forwarding toward an agent and pops
/// it when relaying the reply back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub route: Vec<String>,
    pub data: Message,
}

impl Envelope {
    pub fn new(data: Message) -> Self {
        Self {
            route: Vec::new(),
            data,
        }
    }

    pub fn routed(route: Vec<String>, data: Message) -> Self {
        Self { route, data }
    }

    /// A reply that travels back along the route of `self`.
    pub fn reply(&self, data: Message) -> Self {
        Self {
            route: self.route.clone(),
            data,
        }
    }
}
