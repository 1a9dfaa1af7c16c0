//! CLI argument types.

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[clap(
    name = "loadherd",
    version,
    about = "Distributed load-test control plane - broker, agents, heartbeat liveness, and a retriable request/reply client for fleet-scale runs."
)]
pub struct CtlArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose logging (debug level unless LOADHERD_LOG/RUST_LOG is set)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// TOML config file applying defaults under CLI values
    #[arg(long, global = true, env = "LOADHERD_CONFIG")]
    pub config: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the broker
    Broker(BrokerArgs),
    /// Start an agent
    Agent(AgentArgs),
    /// Ping the broker and print its identity
    Ping(TargetArgs),
    /// List registered agents
    List(TargetArgs),
    /// List active runs
    ListRuns(TargetArgs),
    /// Stop every agent of a run
    StopRun(StopRunArgs),
}

#[derive(Debug, Args)]
pub struct BrokerArgs {
    /// Frontend endpoint callers connect to
    #[arg(long)]
    pub frontend: Option<String>,

    /// Backend endpoint agents connect to
    #[arg(long)]
    pub backend: Option<String>,

    /// Heartbeat publish endpoint
    #[arg(long)]
    pub heartbeat: Option<String>,

    /// Seconds an agent may sit on a dispatch without replying
    #[arg(long = "agent-timeout")]
    pub agent_timeout: Option<u64>,

    /// Also evict agents on round-trip staleness, not only on process death
    #[arg(long = "evict-stale")]
    pub evict_stale: bool,
}

#[derive(Debug, Args)]
pub struct AgentArgs {
    /// Broker backend endpoint to announce on
    #[arg(long, env = "LOADHERD_BACKEND")]
    pub backend: Option<String>,

    /// Broker heartbeat endpoint to subscribe to
    #[arg(long)]
    pub heartbeat: Option<String>,

    /// Broker frontend endpoint handed to runner processes
    #[arg(long)]
    pub frontend: Option<String>,

    /// Default runner command line for runs that do not ship their own
    #[arg(long)]
    pub runner: Option<String>,

    /// Retire after this many seconds; negative disables
    #[arg(long = "max-age", default_value_t = -1, allow_hyphen_values = true)]
    pub max_age: i64,

    /// Random extra seconds added to --max-age so fleets do not retire at once
    #[arg(long = "max-age-delta", default_value_t = 0)]
    pub max_age_delta: u64,
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Broker frontend endpoint
    #[arg(long, env = "LOADHERD_BROKER")]
    pub broker: Option<String>,
}

#[derive(Debug, Args)]
pub struct StopRunArgs {
    /// Run to stop
    pub run_id: String,

    #[command(flatten)]
    pub target: TargetArgs,
}
