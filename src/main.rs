//! Agent Vault CLI
//!
//! Operator commands for the custodial wallet control plane.

use agent_vault::{AppConfig, AppContext, Result, TenantId};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How often the policy file is checked for changes
const POLICY_RELOAD_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "agent-vault")]
#[command(about = "Custodial wallet control plane for autonomous agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration (secrets reduced to flags)
    Config,

    /// Check RPC connectivity and current fees
    Status,

    /// Run due strategies until interrupted
    RunStrategies {
        /// Tenant whose strategies are driven (defaults to AGENTVAULT_TENANT)
        #[arg(long)]
        tenant: Option<String>,

        /// Seconds between scheduler passes
        #[arg(long, default_value_t = 15)]
        poll_secs: u64,
    },

    /// Show the most recent audit events
    Events {
        #[arg(long)]
        tenant: Option<String>,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
}

fn init_tracing(verbose: bool, json_logs: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
        })
    };
    let json = json_logs
        || std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let config = AppConfig::from_env();

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.summary())?);
        }
        Commands::Status => {
            let ctx = AppContext::from_config(&config).await?;
            let status = ctx.tools.provider_status(&ctx.default_tenant).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::RunStrategies { tenant, poll_secs } => {
            let ctx = AppContext::from_config(&config).await?;
            let tenant = tenant.map(TenantId::new).unwrap_or(ctx.default_tenant.clone());
            run_strategies(ctx, tenant, Duration::from_secs(poll_secs.max(1))).await?;
        }
        Commands::Events { tenant, limit } => {
            let ctx = AppContext::from_config(&config).await?;
            let tenant = tenant.map(TenantId::new).unwrap_or(ctx.default_tenant.clone());
            let events = ctx.tools.recent_events(&tenant, limit).await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
    }

    Ok(())
}

async fn run_strategies(ctx: AppContext, tenant: TenantId, poll_interval: Duration) -> Result<()> {
    ctx.chain.ensure_connection().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = ctx.scheduler(tenant.clone(), poll_interval).spawn(shutdown_rx.clone());
    let reloader = ctx
        .policy
        .clone()
        .spawn_reloader(POLICY_RELOAD_INTERVAL, shutdown_rx);

    tracing::info!(tenant = %tenant, "Running strategies, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "Scheduler task panicked");
    }
    if let Some(reloader) = reloader {
        if let Err(e) = reloader.await {
            tracing::error!(error = %e, "Policy reloader task panicked");
        }
    }
    Ok(())
}
