use std::time::Duration;

use clap::Parser;
use serde_json::Value;

use crate::agent::{self, AgentConfig};
use crate::args::{AgentArgs, BrokerArgs, Command, CtlArgs, StopRunArgs, TargetArgs};
use crate::broker::router::LoopEvent;
use crate::broker::{Broker, BrokerConfig};
use crate::config::{ClientSection, FileConfig};
use crate::error::AppResult;
use crate::transport::client::{Client, ClientOptions};

pub(crate) fn run() -> AppResult<()> {
    let args = CtlArgs::parse();
    crate::logger::init_logging(args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_async(args))
}

async fn run_async(args: CtlArgs) -> AppResult<()> {
    let file = crate::config::load(args.config.as_deref())?;
    match args.command {
        Command::Broker(broker_args) => run_broker(broker_args, &file).await,
        Command::Agent(agent_args) => run_agent(agent_args, &file).await,
        Command::Ping(target) => {
            let reply = client(&target, &file).await?.ping(None).await?;
            print_value(&reply)
        }
        Command::List(target) => {
            let agents = client(&target, &file).await?.list().await?;
            print_value(&Value::Array(
                agents.into_iter().map(Value::String).collect(),
            ))
        }
        Command::ListRuns(target) => {
            let runs = client(&target, &file).await?.list_runs().await?;
            print_value(&runs)
        }
        Command::StopRun(stop_args) => run_stop_run(stop_args, &file).await,
    }
}

async fn run_broker(args: BrokerArgs, file: &FileConfig) -> AppResult<()> {
    let defaults = BrokerConfig::default();
    let config = BrokerConfig {
        frontend: pick(args.frontend, file.broker.frontend.clone(), defaults.frontend),
        backend: pick(args.backend, file.broker.backend.clone(), defaults.backend),
        heartbeat: pick(
            args.heartbeat,
            file.broker.heartbeat.clone(),
            defaults.heartbeat,
        ),
        agent_timeout: args
            .agent_timeout
            .or(file.broker.agent_timeout)
            .map_or(defaults.agent_timeout, Duration::from_secs),
        evict_stale: args.evict_stale || file.broker.evict_stale.unwrap_or(false),
        clean_interval: defaults.clean_interval,
        heartbeat_interval: defaults.heartbeat_interval,
    };

    let broker = Broker::bind(config).await?;
    let shutdown = broker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            let _unused = shutdown.send(LoopEvent::Shutdown).await;
        }
    });
    broker.run().await
}

async fn run_agent(args: AgentArgs, file: &FileConfig) -> AppResult<()> {
    let defaults = AgentConfig::default();
    // The CLI default of -1 defers to the config file; any non-negative
    // CLI value wins.
    let max_age_secs = if args.max_age >= 0 {
        Some(args.max_age)
    } else {
        file.agent.max_age.filter(|secs| *secs >= 0)
    };
    let max_age_delta = if args.max_age_delta > 0 {
        args.max_age_delta
    } else {
        file.agent.max_age_delta.unwrap_or(0)
    };
    let config = AgentConfig {
        backend: pick(args.backend, file.agent.backend.clone(), defaults.backend),
        heartbeat: pick(
            args.heartbeat,
            file.agent.heartbeat.clone(),
            defaults.heartbeat,
        ),
        frontend: pick(args.frontend, file.agent.frontend.clone(), defaults.frontend),
        runner: pick(args.runner, file.agent.runner.clone(), defaults.runner),
        max_age: max_age_secs
            .and_then(|secs| u64::try_from(secs).ok())
            .map(Duration::from_secs),
        max_age_delta: Duration::from_secs(max_age_delta),
    };

    tokio::select! {
        result = agent::run(config) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    }
}

async fn run_stop_run(args: StopRunArgs, file: &FileConfig) -> AppResult<()> {
    let stopped = client(&args.target, file)
        .await?
        .stop_run(&args.run_id)
        .await?;
    print_value(&stopped)
}

async fn client(target: &TargetArgs, file: &FileConfig) -> AppResult<Client> {
    let frontend = target
        .broker
        .clone()
        .or_else(|| file.broker.frontend.clone())
        .unwrap_or_else(|| BrokerConfig::default().frontend);
    Client::connect(&frontend, client_options(&file.client)).await
}

fn client_options(section: &ClientSection) -> ClientOptions {
    let defaults = ClientOptions::default();
    ClientOptions {
        timeout: section
            .timeout_ms
            .map_or(defaults.timeout, Duration::from_millis),
        timeout_max_overflow: section
            .timeout_max_overflow_ms
            .map_or(defaults.timeout_max_overflow, Duration::from_millis),
        timeout_overflows: section.timeout_overflows.unwrap_or(defaults.timeout_overflows),
    }
}

fn pick(cli: Option<String>, file: Option<String>, default: String) -> String {
    cli.or(file).unwrap_or(default)
}

fn print_value(value: &Value) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
