//! kv-migrate: copy every key from one Redis-compatible store to another
//!
//! ```text
//! kv-migrate --source redis://old:6379 --destination redis://new:6379 run
//! kv-migrate --source ... --destination ... --checkpoint run.json run
//! kv-migrate --source ... --destination ... resume run.json
//! kv-migrate --source ... dry-run --match 'user:*'
//! ```
//!
//! Exit codes: 0 all keys copied, 1 some keys failed, 2 aborted.
//!
//! ## Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | RUST_LOG | Log filter (default: info) |
//! | KV_MIGRATE_CONCURRENCY | Worker count |
//! | KV_MIGRATE_QUEUE_CAPACITY | Work queue capacity |
//! | KV_MIGRATE_MAX_ATTEMPTS | Attempts per key |
//! | KV_MIGRATE_CHECKPOINT | Checkpoint file |
//! | KV_MIGRATE_MATCH | Key glob |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kv_migrate::migration::{MigrationOrchestrator, RunOutcome, EXIT_ABORTED};
use kv_migrate::observability::{init_tracing, LogFormat};
use kv_migrate::{DestinationStore, InMemoryStore, MigrationConfig, SourceStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kv-migrate")]
#[command(about = "Resumable, concurrent migration between Redis-compatible stores")]
#[command(version)]
struct Cli {
    /// Source store URL
    #[arg(long, global = true)]
    source: Option<String>,

    /// Destination store URL
    #[arg(long, global = true)]
    destination: Option<String>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Attempts per key before it is marked failed
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Only migrate keys matching this glob
    #[arg(long = "match", global = true)]
    pattern: Option<String>,

    /// Write checkpoints to this file
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,

    /// Log output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a fresh migration
    Run,
    /// Continue a migration from its checkpoint file
    Resume {
        checkpoint: PathBuf,
        /// Attempt keys that failed in earlier runs again
        #[arg(long)]
        retry_failed: bool,
    },
    /// Enumerate and classify keys without writing anything
    DryRun,
}

impl Cli {
    fn load_config(&self) -> Result<MigrationConfig> {
        let mut config = match &self.config {
            Some(path) => MigrationConfig::from_toml_file(path)?,
            None => MigrationConfig::default(),
        };
        config.apply_env_overrides()?;

        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(pattern) = &self.pattern {
            config.scan.pattern = Some(pattern.clone());
        }
        if let Some(path) = &self.checkpoint {
            config.checkpoint.path = Some(path.clone());
        }
        match &self.command {
            Command::Run => {}
            Command::Resume {
                checkpoint,
                retry_failed,
            } => {
                config.resume_from_checkpoint = Some(checkpoint.clone());
                config.retry_failed_on_resume |= *retry_failed;
            }
            Command::DryRun => config.dry_run = true,
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let code = match execute(cli).await {
        Ok(outcome) => {
            println!("{}", outcome.summary);
            outcome.exit_code()
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Migration could not start");
            EXIT_ABORTED
        }
    };
    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<RunOutcome> {
    let config = cli.load_config()?;
    let source_url = cli.source.as_deref().context("--source is required")?;
    let source = Arc::new(connect(source_url).await?);

    if config.dry_run {
        info!(source = source_url, "Starting dry run");
        // Never written to in a dry run
        let destination = Arc::new(InMemoryStore::new());
        return migrate(source, destination, config).await;
    }

    let destination_url = cli
        .destination
        .as_deref()
        .context("--destination is required")?;
    let destination = Arc::new(connect(destination_url).await?);
    info!(
        source = source_url,
        destination = destination_url,
        concurrency = config.concurrency,
        "Starting migration"
    );
    migrate(source, destination, config).await
}

async fn migrate<S, D>(source: Arc<S>, destination: Arc<D>, config: MigrationConfig) -> Result<RunOutcome>
where
    S: SourceStore,
    D: DestinationStore,
{
    let orchestrator = MigrationOrchestrator::new(source, destination, config);

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight keys and writing checkpoint");
            cancel.cancel();
        }
    });

    Ok(orchestrator.run().await?)
}

#[cfg(feature = "redis-backend")]
async fn connect(url: &str) -> Result<kv_migrate::store::RedisStore> {
    kv_migrate::store::RedisStore::connect(url)
        .await
        .with_context(|| format!("cannot connect to {}", url))
}

#[cfg(not(feature = "redis-backend"))]
async fn connect(url: &str) -> Result<InMemoryStore> {
    anyhow::bail!("cannot connect to {}: built without the redis-backend feature", url)
}
