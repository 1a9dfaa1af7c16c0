//! Job execution on an agent.
//!
//! The engine owns every child process it spawned and answers the command
//! vocabulary the broker relays: RUN starts a runner, STATUS and the
//! broker's own probes inspect it, STOP terminates with a grace period,
//! QUIT retires the agent unless it is busy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::error::{AgentError, AppError, AppResult};
use crate::transport::bundle::unpack_file;
use crate::transport::message::{Command, Message};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// What the session loop does with a handled command.
pub struct HandleOutcome {
    pub reply: Message,
    pub exit: bool,
}

impl HandleOutcome {
    fn reply(reply: Message) -> Self {
        Self { reply, exit: false }
    }
}

enum Workdir {
    /// Removed when the job is reaped.
    Temp(TempDir),
    Fixed(PathBuf),
}

impl Workdir {
    fn path(&self) -> &Path {
        match self {
            Self::Temp(dir) => dir.path(),
            Self::Fixed(path) => path.as_path(),
        }
    }
}

struct JobProcess {
    run_id: String,
    child: Child,
    workdir: Workdir,
}

pub struct AgentEngine {
    agent_id: String,
    /// Endpoint runner processes report their results to.
    receiver: String,
    runner: String,
    processes: HashMap<u32, JobProcess>,
}

impl AgentEngine {
    pub fn new(agent_id: &str, receiver: &str, runner: &str) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            receiver: receiver.to_owned(),
            runner: runner.to_owned(),
            processes: HashMap::new(),
        }
    }

    pub fn job_count(&self) -> usize {
        self.processes.len()
    }

    /// Handles one relayed command, producing the reply to route back.
    pub async fn handle(&mut self, message: &Message) -> HandleOutcome {
        let reply = match message.command() {
            Some(Command::Run) => self.start_run(message).await,
            Some(Command::Status | Command::InternalStatus) => Ok(self.status(message)),
            Some(Command::Stop) => Ok(self.stop_all()),
            Some(Command::Quit) => return self.quit(message),
            Some(Command::Ping) => Ok(self.pong()),
            Some(
                Command::StopRun
                | Command::List
                | Command::ListRuns
                | Command::GetData
                | Command::GetCounts
                | Command::GetMetadata
                | Command::Register
                | Command::Unregister,
            )
            | None => Err(AppError::agent(AgentError::Unimplemented {
                command: message.command_name().unwrap_or("?").to_owned(),
            })),
        };
        let reply = reply.unwrap_or_else(|err| self.error_reply(&err.to_string()));
        HandleOutcome::reply(reply)
    }

    async fn start_run(&mut self, message: &Message) -> AppResult<Message> {
        let run_id = message
            .get_str("run_id")
            .ok_or(AppError::agent(AgentError::MissingRunField {
                field: "run_id",
            }))?
            .to_owned();
        let args = message
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let workdir = self.prepare_workdir(&args)?;
        if let Some(files) = message.get("files").and_then(Value::as_object) {
            materialize_files(workdir.path(), files).await?;
        }

        let template = args
            .get("test_runner")
            .and_then(Value::as_str)
            .unwrap_or(&self.runner);
        let mut parts = template.split_whitespace();
        let program = parts
            .next()
            .ok_or(AppError::agent(AgentError::NoRunner))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(parts)
            .current_dir(workdir.path())
            .env("LOADHERD_AGENT_ID", &self.agent_id)
            .env("LOADHERD_RECEIVER", &self.receiver)
            .env("LOADHERD_RUN_ID", &run_id);
        if let Some(users) = args.get("users") {
            command.env("LOADHERD_USERS", scalar_to_string(users));
        }
        if let Some(hits) = args.get("hits") {
            command.env("LOADHERD_HITS", scalar_to_string(hits));
        } else if let Some(duration) = args.get("duration") {
            command.env("LOADHERD_DURATION", scalar_to_string(duration));
        }

        let child = command.spawn().map_err(|err| {
            AppError::agent(AgentError::Execution {
                message: format!("could not spawn {program}: {err}"),
            })
        })?;
        let pid = child.id().ok_or(AppError::agent(AgentError::Execution {
            message: "runner exited before it could be tracked".to_owned(),
        }))?;
        debug!("Started runner pid {} for run {}", pid, run_id);

        self.processes.insert(
            pid,
            JobProcess {
                run_id: run_id.clone(),
                child,
                workdir,
            },
        );

        let mut result = Map::new();
        result.insert("run_id".to_owned(), Value::String(run_id));
        result.insert("pids".to_owned(), Value::Array(vec![Value::from(pid)]));
        Ok(self.tagged(Message::result(Value::Object(result))))
    }

    fn prepare_workdir(&self, args: &Map<String, Value>) -> AppResult<Workdir> {
        match args.get("test_dir").and_then(Value::as_str) {
            Some(test_dir) => {
                // Suffixed per agent so fleets sharing a filesystem do not
                // trample each other.
                let path = PathBuf::from(format!("{test_dir}-{}", self.agent_id));
                std::fs::create_dir_all(&path).map_err(|err| {
                    AppError::agent(AgentError::Workdir {
                        path: path.clone(),
                        source: err,
                    })
                })?;
                Ok(Workdir::Fixed(path))
            }
            None => {
                let dir = TempDir::new().map_err(|err| {
                    AppError::agent(AgentError::Workdir {
                        path: std::env::temp_dir(),
                        source: err,
                    })
                })?;
                Ok(Workdir::Temp(dir))
            }
        }
    }

    /// Reports the state of tracked jobs, reaping any that finished. The
    /// optional `run_id` narrows the report to one run.
    fn status(&mut self, message: &Message) -> Message {
        let filter = message.get_str("run_id").map(str::to_owned);
        self.reap();

        let mut detail = Map::new();
        let mut statuses = Vec::new();
        for (pid, job) in &mut self.processes {
            if let Some(filter) = &filter
                && job.run_id != *filter
            {
                continue;
            }
            let state = match job.child.try_wait() {
                Ok(None) => "running",
                Ok(Some(_)) | Err(_) => "terminated",
            };
            detail.insert(pid.to_string(), Value::String(state.to_owned()));
            statuses.push(Value::String(state.to_owned()));
        }

        let mut reply = self.tagged(Message::result(Value::Object(detail)));
        reply.insert("statuses", Value::Array(statuses));
        reply
    }

    /// Terminates every job. The reply already reports them terminated;
    /// the grace tasks own the children from here on.
    fn stop_all(&mut self) -> Message {
        let stopped: Vec<u32> = self.processes.keys().copied().collect();
        for (pid, job) in self.processes.drain() {
            debug!("Stopping runner pid {} of run {}", pid, job.run_id);
            terminate(pid, job);
        }

        let mut reply = self.tagged(Message::result(Value::Array(
            stopped.iter().map(|pid| Value::from(*pid)).collect(),
        )));
        reply.insert(
            "statuses",
            Value::Array(
                stopped
                    .iter()
                    .map(|_| Value::String("terminated".to_owned()))
                    .collect(),
            ),
        );
        reply
    }

    /// Refuses while jobs are running unless forced; a refusal reports the
    /// current status so the caller can decide to force.
    fn quit(&mut self, message: &Message) -> HandleOutcome {
        self.reap();
        let force = message.get_bool("force").unwrap_or(false);
        if !self.processes.is_empty() && !force {
            let mut reply = self.error_reply("agent is busy");
            reply.insert(
                "statuses",
                Value::Array(
                    self.processes
                        .values()
                        .map(|_| Value::String("running".to_owned()))
                        .collect(),
                ),
            );
            return HandleOutcome::reply(reply);
        }
        let reply = self.stop_all();
        HandleOutcome { reply, exit: true }
    }

    fn pong(&self) -> Message {
        let mut result = Map::new();
        result.insert("pid".to_owned(), Value::from(std::process::id()));
        result.insert(
            "agent_id".to_owned(),
            Value::String(self.agent_id.clone()),
        );
        self.tagged(Message::result(Value::Object(result)))
    }

    /// Drops jobs whose runner already exited.
    pub fn reap(&mut self) {
        self.processes.retain(|pid, job| match job.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Runner pid {} exited with {}", pid, status);
                false
            }
            Err(err) => {
                warn!("Could not poll runner pid {}: {}", pid, err);
                false
            }
        });
    }

    fn tagged(&self, mut reply: Message) -> Message {
        reply.insert("agent_id", Value::String(self.agent_id.clone()));
        reply
    }

    fn error_reply(&self, text: &str) -> Message {
        self.tagged(Message::error(text, Some(&self.agent_id)))
    }
}

/// SIGTERM now, SIGKILL after the grace period. The spawned task owns the
/// child and its working directory until the process is gone.
fn terminate(pid: u32, mut job: JobProcess) {
    if let Ok(raw) = i32::try_from(pid) {
        // SAFETY: raw is the pid of a child this process spawned and still
        // tracks; at worst the signal races its exit.
        unsafe {
            libc::kill(raw, libc::SIGTERM);
        }
    }
    tokio::spawn(async move {
        if tokio::time::timeout(STOP_GRACE, job.child.wait())
            .await
            .is_err()
        {
            warn!("Runner pid {} ignored SIGTERM, killing", pid);
            let _unused = job.child.start_kill();
            let _unused = job.child.wait().await;
        }
        drop(job.workdir);
    });
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

async fn materialize_files(workdir: &Path, files: &Map<String, Value>) -> AppResult<()> {
    for (name, payload) in files {
        let payload = payload.as_str().ok_or_else(|| {
            AppError::agent(AgentError::BadFilePayload {
                name: name.clone(),
                message: "payload is not a string".to_owned(),
            })
        })?;
        let contents = unpack_file(name, payload)?;
        let target = sanitize_relative(workdir, name)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                AppError::agent(AgentError::Workdir {
                    path: parent.to_path_buf(),
                    source: err,
                })
            })?;
        }
        tokio::fs::write(&target, contents).await.map_err(|err| {
            AppError::agent(AgentError::Workdir {
                path: target.clone(),
                source: err,
            })
        })?;
    }
    Ok(())
}

/// Rejects absolute paths and parent traversal in shipped file names.
fn sanitize_relative(workdir: &Path, name: &str) -> AppResult<PathBuf> {
    let relative = Path::new(name);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|part| matches!(part, std::path::Component::ParentDir));
    if escapes {
        return Err(AppError::agent(AgentError::BadFilePayload {
            name: name.to_owned(),
            message: "path escapes the working directory".to_owned(),
        }));
    }
    Ok(workdir.join(relative))
}
