//! # TaskPilot — HubSpot Task-Automation Backend
//!
//! Runs the dashboard gateway and the automation sweeps: follow-up task
//! triggers, working-hours scheduling, stuck-run reconciliation, exit and
//! engagement reactors, and the full cache resync.
//!
//! Usage:
//!   taskpilot serve                 # Start the gateway (default port 8420)
//!   taskpilot reconcile             # Retry stuck runs once
//!   taskpilot sweep-exits           # React to list exits once
//!   taskpilot sync                  # Full cache resync
//!   taskpilot init                  # Write a default config file

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use taskpilot_core::config::TaskPilotConfig;
use taskpilot_crm::CrmClient;
use taskpilot_db::CacheDb;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taskpilot",
    version,
    about = "🧭 TaskPilot — HubSpot task-automation backend"
)]
struct Cli {
    /// Config file path (default: ~/.taskpilot/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one stuck-run reconciliation sweep
    Reconcile,
    /// Run one list-exit sweep
    SweepExits,
    /// Run a full cache resync from HubSpot
    Sync,
    /// Write a default config file and exit
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "taskpilot=debug,tower_http=debug"
    } else {
        "taskpilot=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => TaskPilotConfig::load_from(Path::new(path))?,
        None => TaskPilotConfig::load()?,
    };

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            taskpilot_gateway::start(config).await
        }
        Commands::Reconcile => {
            let (db, crm) = open_backend(&config)?;
            let report =
                taskpilot_automation::reconcile::sweep(&db, crm.as_ref(), &config.sync).await?;
            println!(
                "🔁 Reconcile: {} selected, {} created, {} failed, {} skipped",
                report.selected, report.created, report.failed, report.skipped
            );
            Ok(())
        }
        Commands::SweepExits => {
            let (db, crm) = open_backend(&config)?;
            let report = taskpilot_automation::exits::sweep_exited(&db, crm.as_ref()).await?;
            println!(
                "🚪 Exits: {} contact(s), {} task(s) completed, {} run(s) blocked, {} failure(s)",
                report.contacts_exited, report.tasks_completed, report.runs_blocked, report.failures
            );
            Ok(())
        }
        Commands::Sync => {
            let (db, crm) = open_backend(&config)?;
            let report =
                taskpilot_automation::sync::full_resync(&db, crm.as_ref(), &config.sync).await?;
            println!(
                "🔄 Sync {:?}: {} task(s), {} contact(s), {} membership(s)",
                report.outcome, report.tasks, report.contacts, report.memberships
            );
            Ok(())
        }
        Commands::Init => {
            let path = match &cli.config {
                Some(p) => Path::new(p).to_path_buf(),
                None => TaskPilotConfig::default_path(),
            };
            if path.exists() {
                println!("⚠️  Config already exists at {}", path.display());
                return Ok(());
            }
            TaskPilotConfig::default().save_to(&path)?;
            println!("✅ Default config written to {}", path.display());
            println!("   Set hubspot.access_token (or HUBSPOT_TOKEN) before serving.");
            Ok(())
        }
    }
}

fn open_backend(config: &TaskPilotConfig) -> Result<(CacheDb, Arc<CrmClient>)> {
    let db_path = shellexpand::tilde(&config.database.path).to_string();
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = CacheDb::open(Path::new(&db_path)).map_err(anyhow::Error::msg)?;
    let crm = CrmClient::new(&config.hubspot.base_url, &config.hubspot.resolve_token());
    Ok((db, Arc::new(crm)))
}
