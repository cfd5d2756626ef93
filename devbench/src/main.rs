use anyhow::{bail, Context, Result};
use clap::Parser;
use devbench_logging::LogSettings;
use devbench_orchestrator::db::{backup_database, create_pool, run_migrations};
use devbench_orchestrator::{DevbenchService, OrchestratorConfig, SqliteStore};
use std::sync::Arc;
use tracing::{debug, info};

mod cli;
mod commands;

use cli::{Args, Command};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut settings = LogSettings::from_env();
    if args.debug {
        settings.level = "debug".to_string();
    } else if std::env::var("LOG_LEVEL").is_err() {
        // Keep the terminal for command output unless asked otherwise.
        settings.level = "warn".to_string();
    }
    let _log_guard = devbench_logging::init_with(settings);

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let config = OrchestratorConfig::from_env();
            config.validate()?;
            config
        }
    };
    debug!("Configuration loaded: {:?}", config);

    let db_path = config.db_path.clone();
    if matches!(args.command, Command::Backup) {
        if !db_path.exists() {
            bail!("No database at {}", db_path.display());
        }
        let backup_path = backup_database(&db_path)?;
        println!("Database backed up to: {}", backup_path.display());
        return Ok(());
    }

    let pool = create_pool(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    run_migrations(&pool).await?;
    info!("Database ready at {}", db_path.display());

    let store = Arc::new(SqliteStore::new(pool));
    let service = DevbenchService::new(store, Arc::new(config));

    commands::execute_command(&service, &args).await
}
