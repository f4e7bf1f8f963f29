// gencache operator CLI

#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use gencache::{
    config::CacheConfig, metrics, telemetry, AuthenticationEvent, CacheCoordinator, CoordinatorSettings,
    JsonLinesWarehouse, MigrationManager, MigrationSettings, MokaKeyValueStore, SqliteDurableStore,
};

#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "gencache", about = "Operate the generation cache and its migration ledger", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Debug, Subcommand)]
enum Command {
    /// Row counts, the open metrics bucket and process counters
    Stats,
    /// Move a guest's conversations to an authenticated account
    ///
    /// This process starts with an empty hot tier of its own, so only the
    /// guest's durable conversations move. Turns still held in a serving
    /// process's guest working set are not imported from here.
    MigrateGuest {
        #[arg(long)]
        guest_id: String,
        #[arg(long)]
        user_id: String,
    },
    /// Rerun a migration whose last attempt failed
    RetryMigration {
        #[arg(long)]
        guest_id: String,
        #[arg(long)]
        user_id: String,
    },
    /// Export rows older than the given age into the warehouse directory
    Export {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
    /// Delete expired conversations and idle prompt entries
    Sweep,
    /// Show the most recent migration ledger entries
    Ledger {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    metrics::init_metrics()?;

    let cli = Cli::parse();
    let cfg = CacheConfig::from_env()?;

    // The hot tier is process-local, so the CLI starts from an empty one.
    let hot = Arc::new(MokaKeyValueStore::new(cfg.hot_capacity));
    let durable = Arc::new(SqliteDurableStore::open(&cfg.db_path, cfg.db_pool_size)?);
    let coordinator = CacheCoordinator::new(hot.clone(), durable.clone(), CoordinatorSettings::from(&cfg));
    let manager = MigrationManager::new(
        hot,
        durable,
        Arc::new(JsonLinesWarehouse::new(cfg.warehouse_dir.clone())),
        MigrationSettings::from(&cfg),
    );

    match cli.command {
        Command::Stats => {
            let stats = coordinator.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            match coordinator.metrics().await {
                Some(bucket) => println!(
                    "current bucket: {} hits / {} misses, hit rate {:.3}, avg latency {:.2} ms",
                    bucket.hits,
                    bucket.misses,
                    bucket.hit_rate(),
                    bucket.avg_latency_ms
                ),
                None => println!("current bucket: none opened in the last hour"),
            }
            print!("{}", metrics::gather_text()?);
        }
        Command::MigrateGuest { guest_id, user_id } => {
            let report = manager.on_authenticated(AuthenticationEvent::new(guest_id, user_id)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::RetryMigration { guest_id, user_id } => {
            let report = manager.retry_failed(AuthenticationEvent::new(guest_id, user_id)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Export { older_than_days } => {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days);
            let report = manager.export_to_warehouse(cutoff).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Sweep => {
            let report = coordinator.sweep_retention().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Ledger { limit } => {
            for entry in manager.ledger(limit).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
