use std::time::Duration;

use serde_json::{Map, Value};

use crate::broker::router::LoopEvent;
use crate::broker::{Broker, BrokerConfig};
use crate::transport::bundle::pack_files;
use crate::transport::client::{Client, ClientOptions, RunRequest};
use crate::transport::message::{Command, Message};
use crate::util::{build_agent_id, pid_exists};

use super::engine::AgentEngine;
use super::{AgentConfig, run};

fn run_async_test<F>(future: F) -> Result<(), String>
where
    F: std::future::Future<Output = Result<(), String>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("Failed to build runtime: {}", err))?;
    runtime.block_on(future)
}

fn engine(runner: &str) -> AgentEngine {
    AgentEngine::new("7@testhost", "127.0.0.1:7780", runner)
}

fn run_message(run_id: &str) -> Message {
    let mut message = Message::with_command(Command::Run);
    message.insert("run_id", Value::String(run_id.to_owned()));
    message.insert("args", Value::Object(Map::new()));
    message
}

fn statuses_of(reply: &Message) -> Vec<String> {
    reply
        .get("statuses")
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn run_status_stop_lifecycle() -> Result<(), String> {
    run_async_test(async {
        let mut engine = engine("sleep 30");

        let outcome = engine.handle(&run_message("r1")).await;
        if let Some(error) = outcome.reply.get_str("error") {
            return Err(format!("RUN failed: {}", error));
        }
        if engine.job_count() != 1 {
            return Err("RUN did not track a job".to_owned());
        }

        let outcome = engine.handle(&Message::with_command(Command::Status)).await;
        let statuses = statuses_of(&outcome.reply);
        if statuses != vec!["running".to_owned()] {
            return Err(format!("Unexpected statuses: {:?}", statuses));
        }

        let outcome = engine.handle(&Message::with_command(Command::Stop)).await;
        let statuses = statuses_of(&outcome.reply);
        if statuses != vec!["terminated".to_owned()] {
            return Err(format!("Unexpected statuses after STOP: {:?}", statuses));
        }
        if engine.job_count() != 0 {
            return Err("STOP left a tracked job behind".to_owned());
        }
        Ok(())
    })
}

#[test]
fn finished_jobs_are_reaped() -> Result<(), String> {
    run_async_test(async {
        let mut engine = engine("true");
        let outcome = engine.handle(&run_message("r1")).await;
        if let Some(error) = outcome.reply.get_str("error") {
            return Err(format!("RUN failed: {}", error));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.reap();
        if engine.job_count() != 0 {
            return Err("Exited runner was not reaped".to_owned());
        }
        Ok(())
    })
}

#[test]
fn quit_refuses_while_busy_unless_forced() -> Result<(), String> {
    run_async_test(async {
        let mut engine = engine("sleep 30");
        let outcome = engine.handle(&run_message("r1")).await;
        if let Some(error) = outcome.reply.get_str("error") {
            return Err(format!("RUN failed: {}", error));
        }

        let outcome = engine.handle(&Message::with_command(Command::Quit)).await;
        if outcome.exit {
            return Err("QUIT must not exit while busy".to_owned());
        }
        if outcome.reply.get_str("error").is_none() {
            return Err("Busy QUIT refusal should be an error envelope".to_owned());
        }

        let mut forced = Message::with_command(Command::Quit);
        forced.insert("force", Value::Bool(true));
        let outcome = engine.handle(&forced).await;
        if !outcome.exit {
            return Err("Forced QUIT should exit".to_owned());
        }
        if engine.job_count() != 0 {
            return Err("Forced QUIT left a tracked job behind".to_owned());
        }
        Ok(())
    })
}

#[test]
fn dropping_the_engine_does_not_kill_runners() -> Result<(), String> {
    run_async_test(async {
        let mut engine = engine("sleep 30");
        let outcome = engine.handle(&run_message("r1")).await;
        let pid = outcome
            .reply
            .get("result")
            .and_then(|result| result.get("pids"))
            .and_then(Value::as_array)
            .and_then(|pids| pids.first())
            .and_then(Value::as_u64)
            .ok_or("RUN reply carries no pid")?;
        drop(engine);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pid = u32::try_from(pid).map_err(|err| format!("Bad pid: {}", err))?;
        let alive = pid_exists(pid);
        if let Ok(raw) = i32::try_from(pid) {
            // The runner is ours to clean up.
            unsafe {
                libc::kill(raw, libc::SIGTERM);
            }
        }
        if !alive {
            return Err("Runner died with its engine".to_owned());
        }
        Ok(())
    })
}

#[test]
fn runners_receive_the_env_contract() -> Result<(), String> {
    run_async_test(async {
        let scratch = tempfile::tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
        let test_dir = scratch.path().join("work").to_string_lossy().into_owned();

        let mut engine = engine("sh -c env>env.txt");
        let mut args = Map::new();
        args.insert("test_dir".to_owned(), Value::String(test_dir.clone()));
        args.insert("users".to_owned(), Value::from(1));
        args.insert("hits".to_owned(), Value::from(2));
        let mut message = Message::with_command(Command::Run);
        message.insert("run_id", Value::String("r1".to_owned()));
        message.insert("args", Value::Object(args));

        let outcome = engine.handle(&message).await;
        if let Some(error) = outcome.reply.get_str("error") {
            return Err(format!("RUN failed: {}", error));
        }

        let env_file =
            std::path::PathBuf::from(format!("{}-7@testhost", test_dir)).join("env.txt");
        let mut dumped = String::new();
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine.reap();
            if engine.job_count() == 0
                && let Ok(contents) = std::fs::read_to_string(&env_file)
            {
                dumped = contents;
                break;
            }
        }
        if dumped.is_empty() {
            return Err("Runner never wrote its environment".to_owned());
        }

        for expected in [
            "LOADHERD_RUN_ID=r1",
            "LOADHERD_AGENT_ID=7@testhost",
            "LOADHERD_RECEIVER=127.0.0.1:7780",
            "LOADHERD_USERS=1",
            "LOADHERD_HITS=2",
        ] {
            if !dumped.lines().any(|line| line == expected) {
                return Err(format!("Missing {} in the runner environment", expected));
            }
        }
        if dumped.contains("LOADHERD_DURATION") {
            return Err("hits and duration must not both be set".to_owned());
        }
        Ok(())
    })
}

#[test]
fn bad_commands_become_error_envelopes() -> Result<(), String> {
    run_async_test(async {
        let mut engine = engine("true");

        // RUN without a run id.
        let outcome = engine.handle(&Message::with_command(Command::Run)).await;
        match outcome.reply.get_str("error") {
            Some(error) if error.contains("run_id") => {}
            Some(error) => return Err(format!("Wrong error: {}", error)),
            None => return Err("Expected an error envelope".to_owned()),
        }

        // A command agents do not implement.
        let outcome = engine.handle(&Message::with_command(Command::GetData)).await;
        if outcome.reply.get_str("error").is_none() {
            return Err("Unimplemented command should be an error envelope".to_owned());
        }
        if outcome.reply.get_str("agent_id") != Some("7@testhost") {
            return Err("Error envelope is not tagged with the agent id".to_owned());
        }
        Ok(())
    })
}

#[test]
fn shipped_files_cannot_escape_the_workdir() -> Result<(), String> {
    run_async_test(async {
        let mut engine = engine("true");
        let files = pack_files(&[("../evil.txt".to_owned(), b"boo".to_vec())])
            .map_err(|err| format!("pack_files failed: {}", err))?;

        let mut message = run_message("r1");
        message.insert("files", Value::Object(files));
        let outcome = engine.handle(&message).await;
        match outcome.reply.get_str("error") {
            Some(error) if error.contains("escapes") => Ok(()),
            Some(error) => Err(format!("Wrong error: {}", error)),
            None => Err("Escaping file path was accepted".to_owned()),
        }
    })
}

#[test]
fn running_jobs_survive_a_broker_restart() -> Result<(), String> {
    run_async_test(async {
        let broker = Broker::bind(BrokerConfig {
            frontend: "127.0.0.1:0".to_owned(),
            backend: "127.0.0.1:0".to_owned(),
            heartbeat: "127.0.0.1:0".to_owned(),
            agent_timeout: Duration::from_secs(10),
            evict_stale: false,
            clean_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(200),
        })
        .await
        .map_err(|err| format!("Broker bind failed: {}", err))?;
        let endpoints = broker.endpoints().clone();
        let shutdown = broker.shutdown_handle();
        tokio::spawn(broker.run());

        let agent_task = tokio::spawn(run(AgentConfig {
            backend: endpoints.backend.clone(),
            heartbeat: endpoints.heartbeat.clone(),
            frontend: endpoints.frontend.clone(),
            runner: "sleep 30".to_owned(),
            max_age: None,
            max_age_delta: Duration::ZERO,
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let agent_id = build_agent_id();
        let client = Client::connect(&endpoints.frontend, ClientOptions::default())
            .await
            .map_err(|err| format!("Connect failed: {}", err))?;
        client
            .run(RunRequest {
                agents: 1,
                args: Map::new(),
                files: Vec::new(),
            })
            .await
            .map_err(|err| format!("Run failed: {}", err))?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Take the broker down mid-run.
        shutdown
            .send(LoopEvent::Shutdown)
            .await
            .map_err(|_| "Shutdown send failed".to_owned())?;
        drop(client);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // A replacement broker on the same endpoints; the agent reconnects
        // and its job must still be running.
        let replacement = Broker::bind(BrokerConfig {
            frontend: endpoints.frontend.clone(),
            backend: endpoints.backend.clone(),
            heartbeat: endpoints.heartbeat.clone(),
            agent_timeout: Duration::from_secs(10),
            evict_stale: false,
            clean_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(200),
        })
        .await
        .map_err(|err| format!("Replacement bind failed: {}", err))?;
        tokio::spawn(replacement.run());

        let client = Client::connect(&endpoints.frontend, ClientOptions::default())
            .await
            .map_err(|err| format!("Reconnect failed: {}", err))?;
        let mut registered = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let agents = client
                .list()
                .await
                .map_err(|err| format!("List failed: {}", err))?;
            if agents.contains(&agent_id) {
                registered = true;
                break;
            }
        }
        if !registered {
            return Err("Agent did not re-register".to_owned());
        }

        let status = client
            .status(&agent_id)
            .await
            .map_err(|err| format!("Status failed: {}", err))?;
        let running = status
            .as_object()
            .is_some_and(|detail| detail.values().any(|state| state.as_str() == Some("running")));
        if !running {
            return Err(format!("Job did not survive the restart: {}", status));
        }

        client
            .quit(&agent_id, true)
            .await
            .map_err(|err| format!("Quit failed: {}", err))?;
        match tokio::time::timeout(Duration::from_secs(2), agent_task).await {
            Ok(joined) => joined
                .map_err(|err| format!("Agent task join failed: {}", err))?
                .map_err(|err| format!("Agent errored: {}", err))?,
            Err(_elapsed) => return Err("Agent did not exit after QUIT".to_owned()),
        }
        Ok(())
    })
}

#[test]
fn agent_registers_and_quits_over_a_real_broker() -> Result<(), String> {
    run_async_test(async {
        let broker = Broker::bind(BrokerConfig {
            frontend: "127.0.0.1:0".to_owned(),
            backend: "127.0.0.1:0".to_owned(),
            heartbeat: "127.0.0.1:0".to_owned(),
            agent_timeout: Duration::from_secs(10),
            evict_stale: false,
            clean_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(200),
        })
        .await
        .map_err(|err| format!("Broker bind failed: {}", err))?;
        let endpoints = broker.endpoints().clone();
        tokio::spawn(broker.run());

        let agent_task = tokio::spawn(run(AgentConfig {
            backend: endpoints.backend.clone(),
            heartbeat: endpoints.heartbeat.clone(),
            frontend: endpoints.frontend.clone(),
            runner: "true".to_owned(),
            max_age: None,
            max_age_delta: Duration::ZERO,
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client = Client::connect(&endpoints.frontend, ClientOptions::default())
            .await
            .map_err(|err| format!("Connect failed: {}", err))?;
        let agents = client
            .list()
            .await
            .map_err(|err| format!("List failed: {}", err))?;
        let expected = build_agent_id();
        if agents != vec![expected.clone()] {
            return Err(format!("Unexpected agent list: {:?}", agents));
        }

        client
            .quit(&expected, true)
            .await
            .map_err(|err| format!("Quit failed: {}", err))?;

        match tokio::time::timeout(Duration::from_secs(2), agent_task).await {
            Ok(joined) => joined
                .map_err(|err| format!("Agent task join failed: {}", err))?
                .map_err(|err| format!("Agent errored: {}", err))?,
            Err(_elapsed) => return Err("Agent did not exit after QUIT".to_owned()),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let agents = client
            .list()
            .await
            .map_err(|err| format!("List after quit failed: {}", err))?;
        if !agents.is_empty() {
            return Err(format!("Agent still registered: {:?}", agents));
        }
        Ok(())
    })
}
