//! CLI command definitions.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the pipeline definition and every workflow graph
    Validate,

    /// Handle a push event
    Push {
        /// Branch that was pushed
        #[arg(short, long)]
        branch: String,

        /// Commit SHA
        #[arg(short, long)]
        commit: Option<String>,
    },

    /// Handle a schedule tick
    Tick {
        /// Only consider this workflow
        #[arg(short, long)]
        workflow: Option<String>,

        /// Tick time (RFC 3339), defaults to now
        #[arg(short, long)]
        time: Option<String>,
    },

    /// Run a workflow regardless of its triggers
    Run {
        /// Workflow name
        workflow: String,

        /// Branch to build, defaults to the configured default branch
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Show cron schedules and their next fire times
    Schedule,

    /// Fire scheduled workflows until interrupted
    Daemon,

    /// Manage the cache store
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Print the JSON schema of the pipeline definition
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cache entries
    List {
        /// Cache key prefix
        prefix: Option<String>,
    },

    /// Apply the retention policy now
    Prune,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
}
