//! chscope - inspect ClickHouse servers and profile queries.

mod cli;

use ch_scope::config::{Config, ConnectionProfile};
use ch_scope::db::Deadline;
use ch_scope::error::{Result, ScopeError};
use ch_scope::inspector::Inspector;
use ch_scope::logging;
use ch_scope::output::CommandOutput;
use cli::{Cli, Command};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    let log_path = cli.log_path();
    match &log_path {
        Some(path) => logging::init_file_logging(path),
        None => logging::init_stderr_logging(),
    }

    if let Err(e) = run(&cli).await {
        error!("{}: {}", e.category(), e);
        if log_path.is_some() {
            eprintln!("{}: {}", e.category(), e);
        }
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;

    let profile = resolve_connection(cli, &config)?;
    info!("Connection: {}", profile.display_string());

    let deadline = Deadline::after(cli.timeout(&config.settings));
    let inspector = Inspector::new();

    let output = match &cli.command {
        Command::Status => CommandOutput::Status {
            address: profile.address(),
            status: inspector.status(&profile, deadline).await,
        },
        Command::Version => CommandOutput::Version(inspector.server_info(&profile, deadline).await?),
        Command::Databases => CommandOutput::Databases(inspector.databases(&profile, deadline).await?),
        Command::Tables { database } => {
            let tables = inspector
                .tables(&profile, database.as_deref(), deadline)
                .await?;
            CommandOutput::Tables {
                database: profile
                    .scoped_to(database.as_deref())
                    .effective_database()
                    .to_string(),
                tables,
            }
        }
        Command::Schema { table, database } => CommandOutput::Schema(
            inspector
                .schema(&profile, table, database.as_deref(), deadline)
                .await?,
        ),
        Command::Query { sql } => {
            CommandOutput::Query(inspector.execute_query(&profile, sql, deadline).await?)
        }
        Command::Stats { sql } => {
            CommandOutput::Stats(inspector.execute_with_stats(&profile, sql, deadline).await?)
        }
        Command::Compare { sql1, sql2 } => {
            CommandOutput::Compare(inspector.compare(&profile, sql1, sql2, deadline).await?)
        }
    };

    println!("{}", output.render(cli.format)?);
    Ok(())
}

/// Resolves the connection profile from CLI args, config file, and environment.
///
/// Precedence:
/// 1. CLI arguments (highest)
/// 2. Named connection from config
/// 3. Default connection from config
/// 4. Environment variables fill whatever is still unset
fn resolve_connection(cli: &Cli, config: &Config) -> Result<ConnectionProfile> {
    let mut profile = cli.to_connection_profile()?;

    if profile.is_none() {
        if let Some(name) = cli.connection_name() {
            profile = Some(config.get_connection(Some(name)).cloned().ok_or_else(|| {
                ScopeError::config(format!("Connection '{}' not found in config file", name))
            })?);
        }
    }

    if profile.is_none() {
        profile = config.get_connection(None).cloned();
    }

    let mut profile = profile.unwrap_or_default();
    profile.apply_env_defaults();
    Ok(profile)
}
