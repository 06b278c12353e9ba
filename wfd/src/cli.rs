//! CLI command definitions. Grounded on `src/cli.rs`'s `Cli`/`Command`
//! `clap::Parser`/`Subcommand` pair, generalized from a loop-orchestrator
//! surface to the scheduler's `validate`/`play`/`stop`/... verbs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wfd", about = "Cycling workflow scheduler", version)]
pub struct Cli {
    /// Path to the workflow's flow.yaml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate the workflow configuration without running it
    Validate { workflow: String },

    /// Start or restart the scheduler
    Play {
        workflow: String,
        #[arg(long)]
        foreground: bool,
    },

    /// Alias for `play` against an existing run directory
    Restart { workflow: String },

    /// Stop a running scheduler
    Stop {
        workflow: String,
        #[arg(value_enum, default_value_t = StopMode::Clean)]
        mode: StopMode,
    },

    /// Hold one or more task proxies
    Hold { workflow: String, tasks: Vec<String> },

    /// Release held task proxies
    Release { workflow: String, tasks: Vec<String> },

    /// Force a proxy to become ready regardless of prerequisites
    Trigger { workflow: String, task: String },

    /// Force a poll of a proxy's job status
    Poll { workflow: String, task: String },

    /// Kill a submitted or running job
    Kill { workflow: String, task: String },

    /// Remove a proxy from the pool
    Remove { workflow: String, task: String },

    /// Insert a proxy outside its normal spawn path
    Insert { workflow: String, namespace: String, cycle: String },

    /// Broadcast namespace/cycle overrides
    Broadcast {
        #[command(subcommand)]
        action: BroadcastAction,
    },

    /// Snapshot the store to a labeled checkpoint
    Checkpoint { workflow: String, label: String },

    /// Called by jobs to report status (the network RPC path's CLI form)
    Message {
        workflow: String,
        task_id: String,
        submit_number: u32,
        text: Vec<String>,
    },

    /// Query workflow or task state (suite-state polling path)
    SuiteState { workflow: String, task: Option<String>, cycle: Option<String> },

    /// Show a job's log, local or via remote-init'd host
    CatLog { workflow: String, task: String, #[arg(long)] remote: bool },

    /// Push the service package to a new (host, user) pair
    RemoteInit { host: String, #[arg(long)] user: Option<String> },

    /// Remove a previously installed service package
    RemoteTidy { host: String, #[arg(long)] user: Option<String> },
}

#[derive(Subcommand)]
pub enum BroadcastAction {
    Set { workflow: String, namespace: String, cycle: String, key: String, value: String },
    Clear { workflow: String, namespace: String, cycle: String, keys: Vec<String> },
    Expire { workflow: String, before_cycle: String },
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
pub enum StopMode {
    #[default]
    Clean,
    Now,
    NowNow,
    Kill,
}

/// Exit codes distinguishing validation failure and stalled-on-shutdown
/// from a generic error, per the external-interfaces contract.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC_FAILURE: i32 = 1;
    pub const VALIDATION_FAILURE: i32 = 2;
    pub const STALLED_ON_SHUTDOWN: i32 = 3;
}
