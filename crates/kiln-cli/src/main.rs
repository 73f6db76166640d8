//! Kiln CLI entrypoint.

use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod engine;
mod handlers;

use commands::{CacheCommands, Commands, ConfigCommands};
use config::EngineConfig;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Declarative CI pipeline engine", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pipeline definition file
    #[arg(long, global = true)]
    pipeline: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_env("KILN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(pipeline) = cli.pipeline {
        config.pipeline = pipeline;
    }

    match cli.command {
        Commands::Validate => handlers::validate(&config),
        Commands::Push { branch, commit } => handlers::push(&config, branch, commit).await,
        Commands::Tick { workflow, time } => handlers::tick(&config, workflow, time).await,
        Commands::Run { workflow, branch } => handlers::run_workflow(&config, workflow, branch).await,
        Commands::Schedule => handlers::schedule(&config).await,
        Commands::Daemon => handlers::daemon(&config).await,
        Commands::Cache { command } => match command {
            CacheCommands::List { prefix } => handlers::list_cache(&config, prefix).await,
            CacheCommands::Prune => handlers::prune_cache(&config).await,
        },
        Commands::Schema => handlers::schema(),
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config),
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match dispatch(cli).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("{} {:#}", style("✗").red(), e);
            ExitCode::FAILURE
        }
    }
}
