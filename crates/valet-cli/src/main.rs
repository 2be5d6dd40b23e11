mod agent;
mod onboard;
mod skills;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use valet_agent::provider::ProviderRuntime;
use valet_agent::AgentRuntime;
use valet_config::Config;
use valet_gateway::{Gateway, RuntimeFactory};

#[derive(Parser)]
#[command(name = "valet", about = "valet - personal AI assistant gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the full gateway (channels + scheduler + heartbeat + RPC)
    Gateway,
    /// Run the agent once (-m) or as a REPL
    Agent {
        /// Single message to send
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Initialize or reset workspace files (config.toml, AGENTS.md, SOUL.md)
    Onboard,
    /// Show gateway status
    Status,
    /// Manage skills
    Skills {
        #[command(subcommand)]
        command: skills::SkillsCommand,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = valet_config::load_config()?;

    match cli.command {
        Commands::Gateway => run_gateway(cfg).await,
        Commands::Agent { message } => {
            init_console_logging();
            agent::run(&cfg, message).await
        }
        Commands::Onboard => {
            init_console_logging();
            onboard::run(&cfg)
        }
        Commands::Status => status(),
        Commands::Skills { command } => skills::run(&cfg, command),
    }
}

async fn run_gateway(cfg: Config) -> Result<()> {
    let workspace = cfg.workspace_dir();
    std::fs::create_dir_all(&workspace).context("create workspace directory")?;
    let _log_guard = init_logging(&workspace)?;

    let config_dir = valet_config::ensure_config_dir()?;
    let gateway = Gateway::new(cfg, config_dir, default_runtime_factory()).await?;
    Arc::new(gateway).run().await
}

fn default_runtime_factory() -> RuntimeFactory {
    Box::new(|cfg, system_prompt| {
        let runtime = ProviderRuntime::new(
            cfg.provider.api_key.clone(),
            cfg.provider.base_url.as_deref(),
            cfg.agent.model.clone(),
            cfg.agent.max_tokens,
            system_prompt,
        )?;
        Ok(Arc::new(runtime) as Arc<dyn AgentRuntime>)
    })
}

/// Daily-rolling file logs under `<workspace>/logs`, plus stdout unless
/// VALET_DAEMON=1. The returned guard must stay alive for the process.
fn init_logging(workspace: &std::path::Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = workspace.join("logs");
    std::fs::create_dir_all(&log_dir).context("create log directory")?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "valet.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let daemon = std::env::var("VALET_DAEMON").map(|v| v == "1").unwrap_or(false);
    if daemon {
        tracing_subscriber::registry().with(filter).with(file_layer).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(guard)
}

fn init_console_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn status() -> Result<()> {
    let config_dir = valet_config::config_dir()?;
    let pid_file = config_dir.join("valet.pid");

    match std::fs::read_to_string(&pid_file) {
        Ok(pid_raw) => {
            let pid = pid_raw.trim();
            let alive = std::process::Command::new("ps")
                .args(["-p", pid])
                .output()
                .map(|out| out.status.success())
                .unwrap_or(false);
            if alive {
                println!("gateway: running (pid {pid})");
            } else {
                println!("gateway: not running (stale pid file, pid {pid})");
            }
        }
        Err(_) => println!("gateway: not running"),
    }

    let config_file = config_dir.join("config.toml");
    if config_file.exists() {
        println!("config:  {}", config_file.display());
    } else {
        println!("config:  not found (run `valet onboard`)");
    }
    Ok(())
}
