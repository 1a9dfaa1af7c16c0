//! Synchronous request/reply semantics over the asynchronous transport.
//!
//! A `Client` owns one connection to the broker frontend and serializes its
//! calls; `Pool` provides concurrency by checking out distinct clients from
//! a bounded set, replacing any connection that raised an error.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{AppError, AppResult, ControlError, TransportError};
use crate::transport::bundle::pack_files;
use crate::util::duration_ms;
use crate::transport::message::{Command, Envelope, Message};
use crate::transport::wire::{read_frame, send_frame};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT_MAX_OVERFLOW: Duration = Duration::from_millis(7_500);
pub const DEFAULT_TIMEOUT_OVERFLOWS: u32 = 1;

/// Timeout policy for a client.
///
/// The nominal `timeout` is shorter than `timeout_max_overflow`: a call may
/// finish after the nominal bound but under the ceiling up to
/// `timeout_overflows` times in a row per worker before slowness is treated
/// as a hard timeout. An on-time reply resets the worker's counter.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub timeout_max_overflow: Duration,
    pub timeout_overflows: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            timeout_max_overflow: DEFAULT_TIMEOUT_MAX_OVERFLOW,
            timeout_overflows: DEFAULT_TIMEOUT_OVERFLOWS,
        }
    }
}

/// Arguments for dispatching a run to the fleet.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub agents: usize,
    pub args: Map<String, Value>,
    /// Test files to materialize on each agent, `(relative path, contents)`.
    pub files: Vec<(String, Vec<u8>)>,
}

struct Conn {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

async fn open(frontend: &str) -> AppResult<Conn> {
    let stream = TcpStream::connect(frontend).await.map_err(|err| {
        AppError::transport(TransportError::Connection {
            addr: frontend.to_owned(),
            source: err,
        })
    })?;
    debug!("Client connected to {}", frontend);
    let (read_half, write_half) = stream.into_split();
    Ok(Conn {
        reader: BufReader::new(read_half),
        writer: write_half,
    })
}

pub struct Client {
    frontend: String,
    options: ClientOptions,
    // None after a failed exchange; the next call reconnects. A late reply
    // on an abandoned connection must never answer a newer request.
    conn: Mutex<Option<Conn>>,
    // Consecutive slow-call counters, keyed by the replying worker.
    overflow_counters: Mutex<HashMap<String, u32>>,
}

impl Client {
    /// # Errors
    ///
    /// Returns an error when the frontend endpoint cannot be connected.
    pub async fn connect(frontend: &str, options: ClientOptions) -> AppResult<Self> {
        let conn = open(frontend).await?;
        Ok(Self {
            frontend: frontend.to_owned(),
            options,
            conn: Mutex::new(Some(conn)),
            overflow_counters: Mutex::new(HashMap::new()),
        })
    }

    /// Sends the request and blocks on the reply, using the default
    /// max-overflow ceiling as the bound.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when no reply arrives within the bound, and
    /// converts an `error` key in the reply into a remote error.
    pub async fn execute(&self, request: Message) -> AppResult<Value> {
        self.execute_with_timeout(request, None).await
    }

    /// # Errors
    ///
    /// Same as [`Client::execute`], with an explicit bound.
    pub async fn execute_with_timeout(
        &self,
        request: Message,
        timeout: Option<Duration>,
    ) -> AppResult<Value> {
        let bound = timeout.unwrap_or(self.options.timeout_max_overflow);
        let started = tokio::time::Instant::now();

        let reply = {
            let mut guard = self.conn.lock().await;
            let mut conn = match guard.take() {
                Some(conn) => conn,
                None => open(&self.frontend).await?,
            };
            send_frame(&mut conn.writer, &Envelope::new(request)).await?;
            match tokio::time::timeout(bound, read_frame::<Envelope>(&mut conn.reader)).await {
                Ok(read) => {
                    let reply = read?;
                    *guard = Some(conn);
                    reply
                }
                Err(_elapsed) => {
                    // The reply may still arrive on this stream; dropping the
                    // connection keeps it from pairing with the next request.
                    debug!("No reply from {} within the bound", self.frontend);
                    return Err(AppError::transport(TransportError::Timeout {
                        timeout_ms: duration_ms(bound),
                    }));
                }
            }
        };

        let elapsed = started.elapsed();
        self.account_overflow(&reply.data, elapsed, bound).await?;
        extract_result(reply.data)
    }

    /// Applies the overflow-tolerance policy to a completed call.
    async fn account_overflow(
        &self,
        reply: &Message,
        elapsed: Duration,
        bound: Duration,
    ) -> AppResult<()> {
        let worker = reply
            .get_str("agent_id")
            .unwrap_or("broker")
            .to_owned();
        let mut counters = self.overflow_counters.lock().await;
        if elapsed > self.options.timeout {
            let count = counters.entry(worker).or_insert(0);
            *count = count.saturating_add(1);
            if *count > self.options.timeout_overflows {
                return Err(AppError::transport(TransportError::Timeout {
                    timeout_ms: duration_ms(bound),
                }));
            }
        } else {
            counters.insert(worker, 0);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn ping(&self, timeout: Option<Duration>) -> AppResult<Value> {
        self.execute_with_timeout(Message::with_command(Command::Ping), timeout)
            .await
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn list(&self) -> AppResult<Vec<String>> {
        let result = self.execute(Message::with_command(Command::List)).await?;
        Ok(parse_agent_list(&result))
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn list_runs(&self) -> AppResult<Value> {
        self.execute(Message::with_command(Command::ListRuns)).await
    }

    /// Dispatches a run, first verifying that enough agents are registered
    /// for the requested concurrency.
    ///
    /// # Errors
    ///
    /// Returns `NotEnoughWorkers` when the fleet is too small, and
    /// propagates transport errors.
    pub async fn run(&self, request: RunRequest) -> AppResult<Value> {
        let registered = self.list().await?;
        if registered.len() < request.agents {
            return Err(AppError::control(ControlError::NotEnoughWorkers {
                asked: request.agents,
                available: registered.len(),
            }));
        }
        self.execute(build_run_message(&request)?).await
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn status(&self, agent_id: &str) -> AppResult<Value> {
        let mut message = Message::with_command(Command::Status);
        message.insert("worker_id", Value::String(agent_id.to_owned()));
        self.execute(message).await
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn stop(&self, agent_id: &str) -> AppResult<Value> {
        let mut message = Message::with_command(Command::Stop);
        message.insert("worker_id", Value::String(agent_id.to_owned()));
        self.execute(message).await
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn stop_run(&self, run_id: &str) -> AppResult<Value> {
        let mut message = Message::with_command(Command::StopRun);
        message.insert("run_id", Value::String(run_id.to_owned()));
        self.execute(message).await
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn quit(&self, agent_id: &str, force: bool) -> AppResult<Value> {
        let mut message = Message::with_command(Command::Quit);
        message.insert("worker_id", Value::String(agent_id.to_owned()));
        message.insert("force", Value::Bool(force));
        self.execute(message).await
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn get_data(&self, run_id: &str) -> AppResult<Value> {
        self.get(Command::GetData, run_id).await
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn get_counts(&self, run_id: &str) -> AppResult<Value> {
        self.get(Command::GetCounts, run_id).await
    }

    /// # Errors
    ///
    /// Propagates transport errors from the underlying `execute`.
    pub async fn get_metadata(&self, run_id: &str) -> AppResult<Value> {
        self.get(Command::GetMetadata, run_id).await
    }

    async fn get(&self, command: Command, run_id: &str) -> AppResult<Value> {
        let mut message = Message::with_command(command);
        message.insert("run_id", Value::String(run_id.to_owned()));
        self.execute(message).await
    }
}

/// Unwraps a reply: an `error` key raises, a `result` key is the value.
fn extract_result(reply: Message) -> AppResult<Value> {
    if let Some(error) = reply.get_str("error") {
        if error == "no worker" {
            let broker_pid = reply.get_u64("pid").and_then(|pid| u32::try_from(pid).ok());
            return Err(AppError::transport(TransportError::NoWorker {
                broker_pid: broker_pid.unwrap_or(0),
            }));
        }
        return Err(AppError::transport(TransportError::Remote {
            message: error.to_owned(),
        }));
    }
    let mut map = reply.into_inner();
    map.remove("result")
        .ok_or_else(|| AppError::transport(TransportError::MissingResult))
}

fn parse_agent_list(result: &Value) -> Vec<String> {
    result
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// # Errors
///
/// Returns an error when file payload compression fails.
fn build_run_message(request: &RunRequest) -> AppResult<Message> {
    let mut message = Message::with_command(Command::Run);
    message.insert("agents", Value::from(request.agents));
    message.insert("args", Value::Object(request.args.clone()));
    if !request.files.is_empty() {
        message.insert("files", Value::Object(pack_files(&request.files)?));
    }
    Ok(message)
}

enum Slot {
    Ready(Box<Client>),
    Vacant,
}

/// A fixed set of reusable clients behind a blocking checkout queue.
///
/// A client that raised an error is not returned to the pool; its slot is
/// refilled with a fresh connection on the next checkout.
pub struct Pool {
    frontend: String,
    options: ClientOptions,
    slots: Mutex<mpsc::Receiver<Slot>>,
    returns: mpsc::Sender<Slot>,
}

impl Pool {
    /// # Errors
    ///
    /// Returns an error when the initial connections cannot be established.
    pub async fn connect(frontend: &str, size: usize, options: ClientOptions) -> AppResult<Self> {
        let capacity = size.max(1);
        let (returns, slots) = mpsc::channel(capacity);
        for _ in 0..capacity {
            let client = Client::connect(frontend, options.clone()).await?;
            if returns.send(Slot::Ready(Box::new(client))).await.is_err() {
                return Err(AppError::transport(TransportError::PoolClosed));
            }
        }
        Ok(Self {
            frontend: frontend.to_owned(),
            options,
            slots: Mutex::new(slots),
            returns,
        })
    }

    /// Checks out a client, runs the call, and returns the client to the
    /// pool, or replaces it when the call errored.
    ///
    /// # Errors
    ///
    /// Propagates the client's execute errors, and connection errors when a
    /// vacant slot cannot be refilled.
    pub async fn execute(&self, request: Message, timeout: Option<Duration>) -> AppResult<Value> {
        let client = self.checkout().await?;
        match client.execute_with_timeout(request, timeout).await {
            Ok(value) => {
                self.checkin(Slot::Ready(client));
                Ok(value)
            }
            Err(err) => {
                // Fail-fast recycling: the connection may be desynced.
                self.checkin(Slot::Vacant);
                Err(err)
            }
        }
    }

    async fn checkout(&self) -> AppResult<Box<Client>> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .recv()
                .await
                .ok_or_else(|| AppError::transport(TransportError::PoolClosed))?
        };
        match slot {
            Slot::Ready(client) => Ok(client),
            Slot::Vacant => match Client::connect(&self.frontend, self.options.clone()).await {
                Ok(client) => Ok(Box::new(client)),
                Err(err) => {
                    self.checkin(Slot::Vacant);
                    Err(err)
                }
            },
        }
    }

    fn checkin(&self, slot: Slot) {
        // The channel capacity equals the pool size, so this cannot fill up.
        if self.returns.try_send(slot).is_err() {
            debug!("Pool closed while returning a connection");
        }
    }

    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn ping(&self, timeout: Option<Duration>) -> AppResult<Value> {
        self.execute(Message::with_command(Command::Ping), timeout)
            .await
    }

    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn list(&self) -> AppResult<Vec<String>> {
        let result = self
            .execute(Message::with_command(Command::List), None)
            .await?;
        Ok(parse_agent_list(&result))
    }

    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn list_runs(&self) -> AppResult<Value> {
        self.execute(Message::with_command(Command::ListRuns), None)
            .await
    }

    /// # Errors
    ///
    /// Returns `NotEnoughWorkers` when the fleet is too small, and
    /// propagates transport errors.
    pub async fn run(&self, request: RunRequest) -> AppResult<Value> {
        let registered = self.list().await?;
        if registered.len() < request.agents {
            return Err(AppError::control(ControlError::NotEnoughWorkers {
                asked: request.agents,
                available: registered.len(),
            }));
        }
        self.execute(build_run_message(&request)?, None).await
    }

    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn stop_run(&self, run_id: &str) -> AppResult<Value> {
        let mut message = Message::with_command(Command::StopRun);
        message.insert("run_id", Value::String(run_id.to_owned()));
        self.execute(message, None).await
    }

    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn get_data(&self, run_id: &str) -> AppResult<Value> {
        let mut message = Message::with_command(Command::GetData);
        message.insert("run_id", Value::String(run_id.to_owned()));
        self.execute(message, None).await
    }
}
