//! Operator CLI for a Gringotts inventory database.
//!
//! # Responsibility
//! - Migrate a database file and report its schema version.
//! - Run searches, point lookups and snapshot loads against it.
//!
//! # Invariants
//! - Every command except `version` migrates the database before use;
//!   `version` never creates a missing database file.
//! - Migration and connectivity failures exit non-zero.

use anyhow::Context;
use clap::{Parser, Subcommand};
use gringotts_core::db::{bootstrap_db_with, open_existing_db_with};
use gringotts_core::{
    core_version, init_logging_from_config, CancelToken, InventoryRepository, InventoryService,
    InventorySnapshot, Item, SchemaMigrator, SqliteInventoryRepository, StoreConfig,
};
use log::info;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gringotts")]
#[command(version)]
#[command(about = "Inventory storage tool for the Gringotts bot")]
#[command(long_about = r#"
Manages the SQLite database behind the Gringotts inventory bot.

Example usage:
  gringotts migrate
  gringotts search "linen" --limit 5
  gringotts load ./exports/Bankalt.json
"#)]
struct Cli {
    /// Path to the database file
    #[arg(short, long, global = true, env = "DB_PATH")]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Directory for rotating log files; logging is off when unset
    #[arg(long, global = true, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Per-command time limit in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Show tool and schema versions
    Version,

    /// Search items by name fragment
    Search {
        /// Name fragment, ASCII case-insensitive
        pattern: String,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<u32>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one owner's count for one item
    Count {
        owner: String,
        item_id: String,
    },

    /// Show the catalog name of one item
    Name { item_id: String },

    /// Load an exported inventory snapshot (JSON)
    Load { snapshot: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = StoreConfig::from_env().context("invalid environment configuration")?;
    if let Some(database) = cli.database {
        config.db_path = database;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(log_dir) = cli.log_dir {
        config.log_dir = Some(log_dir);
    }
    init_logging_from_config(&config).context("cannot start logging")?;

    let cancel = match cli.timeout_ms {
        Some(ms) => CancelToken::with_timeout(Duration::from_millis(ms)),
        None => CancelToken::none(),
    };

    match cli.command {
        Commands::Version => {
            println!("gringotts {}", core_version());
            let conn = open_existing_db_with(&config.db_path, &config.connect)
                .with_context(|| format!("cannot open {}", config.db_path.display()))?;
            let migrator = SchemaMigrator::with_default_migrations();
            let schema = migrator
                .current_version(&conn)?
                .map_or_else(|| "none".to_string(), |version| version.to_string());
            println!("schema {schema} (latest supported {})", migrator.latest_version());
        }
        Commands::Migrate => {
            let conn = bootstrap_db_with(&config.db_path, &config.connect)
                .with_context(|| format!("cannot migrate {}", config.db_path.display()))?;
            let version = SchemaMigrator::with_default_migrations().current_version(&conn)?;
            println!(
                "{} is at schema version {}",
                config.db_path.display(),
                version.unwrap_or(0)
            );
        }
        command => {
            let service = InventoryService::new(open_repository(&config)?);
            run_inventory_command(&service, command, &cancel)?;
        }
    }

    Ok(())
}

fn run_inventory_command(
    service: &InventoryService<SqliteInventoryRepository>,
    command: Commands,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    match command {
        Commands::Search {
            pattern,
            limit,
            json,
        } => {
            let matches = service.find_items(&pattern, limit, cancel)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&matches)?);
            } else if matches.is_empty() {
                println!("no items match");
            } else {
                for item in &matches {
                    println!("{:>8}  {:>6}  {}", item.id, item.total_count, item.name);
                }
            }
        }
        Commands::Count { owner, item_id } => {
            match service.repository().get_count(&owner, &item_id, cancel)? {
                Some(count) => println!("{count}"),
                None => anyhow::bail!("no count recorded for item {item_id}"),
            }
        }
        Commands::Name { item_id } => {
            let Some(name) = service.repository().get_name(&item_id, cancel)? else {
                anyhow::bail!("item {item_id} is not in the catalog");
            };
            println!("{}", serde_json::to_string(&Item { id: item_id, name })?);
        }
        Commands::Load { snapshot } => {
            let raw = std::fs::read_to_string(&snapshot)
                .with_context(|| format!("cannot read {}", snapshot.display()))?;
            let parsed: InventorySnapshot = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not an inventory export", snapshot.display()))?;
            let summary = service.load_snapshot(&parsed, cancel)?;
            info!(
                "event=cli_load module=cli status=ok counted_items={} catalog_entries={}",
                summary.counted_items, summary.catalog_entries
            );
            println!(
                "loaded {} counts and {} catalog entries for {}",
                summary.counted_items, summary.catalog_entries, summary.owner
            );
        }
        Commands::Migrate | Commands::Version => {}
    }
    Ok(())
}

fn open_repository(config: &StoreConfig) -> anyhow::Result<SqliteInventoryRepository> {
    let conn = bootstrap_db_with(&config.db_path, &config.connect)
        .with_context(|| format!("cannot open {}", config.db_path.display()))?;
    Ok(SqliteInventoryRepository::try_new(conn)?)
}
