use anyhow::Result;
use clap::Parser;
use parley_agent::server::{AgentServer, AppState};
use parley_agent::{Settings, ToolServerRegistry};

mod tracing;

use tracing::setup_logging;

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Multi-session conversational agent runtime")]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<String>,

    /// Bind address, overriding the configuration.
    #[arg(short, long)]
    bind: Option<String>,

    /// SQLite database path, overriding the configuration.
    #[arg(long)]
    db: Option<String>,

    /// Mint a bearer token for this user id at startup and print it.
    /// Intended for development; production fronts its own identity layer.
    #[arg(long, value_name = "USER_ID")]
    dev_token: Option<String>,
}

async fn load_settings(args: &CliArgs) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path).await?,
        None => Settings::default(),
    };
    if let Some(bind) = &args.bind {
        settings.server.bind_addr = bind.clone();
    }
    if let Some(db) = &args.db {
        settings.history.db_path = db.clone();
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let args = CliArgs::parse();

    let settings = load_settings(&args).await?;
    let bind_addr = settings.server.bind_addr.clone();
    let state = AppState::build(settings)?;

    if let Some(user_id) = &args.dev_token {
        let token = state.issue_token(user_id).await?;
        println!("dev token for {}: {}", user_id, token);
    }

    log_registered_servers(&state.registry);
    AgentServer::new(state).run(&bind_addr).await
}

fn log_registered_servers(registry: &ToolServerRegistry) {
    let servers = registry.list();
    if servers.is_empty() {
        log::info!("no tool servers registered; register via POST /tool-servers");
        return;
    }
    for server in servers {
        log::info!(
            "tool server '{}' ({}) exposes {} tools",
            server.id,
            server.mode,
            server.tools.len()
        );
    }
}
