//! MBA Ingest - file upload and CSV load tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mba_common::logging::{init_logging, LogConfig, LogLevel};
use mba_ingest::config::{parse_delimiter, IngestConfig};
use mba_ingest::db::{create_pool, health_check, run_migrations};
use mba_ingest::etl::{
    triggers_from_event, AuditLog, CsvLoader, LoadDispatcher, LoadTrigger, MemoryAuditLog,
    MemoryWarehouse, PgAuditLog, PgWarehouse,
};
use mba_ingest::ingest::{
    duplicate_report, find_similar_objects, similar_report, DuplicateIndex, ExtensionFilter,
    JobQueue, Producer, RunSummary, Scope, WorkerPool,
};
use mba_ingest::storage::{MemoryStore, ObjectStore, S3Store};
use serde::Serialize;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mba-ingest")]
#[command(author, version, about = "Upload files to object storage and load CSVs into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a directory tree, skipping content already stored
    Upload {
        /// Directory to ingest
        #[arg(short, long)]
        input: PathBuf,

        /// Scope for every file, overriding path-based detection
        #[arg(short, long)]
        scope: Option<String>,

        /// Only these extensions, e.g. "pdf,csv"
        #[arg(long, env = "INGEST_INCLUDE")]
        include: Option<String>,

        /// Skip these extensions
        #[arg(long, env = "INGEST_EXCLUDE")]
        exclude: Option<String>,

        /// Number of concurrent upload workers
        #[arg(short, long, env = "INGEST_WORKERS")]
        workers: Option<usize>,

        /// Trust the local duplicate cache without confirming in the bucket
        #[arg(long)]
        no_remote_check: bool,

        /// Fingerprint files during discovery instead of in the workers
        #[arg(long)]
        eager: bool,

        /// Duplicate cache location
        #[arg(long, env = "INGEST_CACHE_FILE")]
        cache_file: Option<PathBuf>,

        /// Load uploaded CSVs into PostgreSQL after the run
        #[arg(long)]
        load: bool,

        /// Use an in-memory bucket (and database) instead of the real ones
        #[arg(long)]
        dry_run: bool,
    },

    /// Load one stored CSV object
    Load {
        /// Object key, e.g. "mba/tabular/members.csv"
        #[arg(short, long)]
        key: String,

        /// Target table; defaults to the file name
        #[arg(short, long)]
        table: Option<String>,

        /// Bucket; defaults to the configured one
        #[arg(long)]
        source: Option<String>,

        /// Rows per insert transaction
        #[arg(long, env = "ETL_BATCH_SIZE")]
        batch_size: Option<usize>,

        /// Field delimiter instead of detection ("," ";" "|" or "tab")
        #[arg(long)]
        delimiter: Option<String>,
    },

    /// Process a trigger document or S3 event notification
    Trigger {
        /// JSON file, or "-" for stdin
        #[arg(short, long)]
        event: PathBuf,
    },

    /// Report duplicate files under a directory
    Scan {
        /// Directory to scan
        #[arg(short, long)]
        input: PathBuf,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Duplicate cache location
        #[arg(long, env = "INGEST_CACHE_FILE")]
        cache_file: Option<PathBuf>,

        /// Also list stored objects under this key prefix that share a name or size
        #[arg(long, value_name = "PREFIX")]
        similar_in: Option<String>,
    },

    /// Fail audit records abandoned by a stopped loader
    Reconcile {
        /// Age in seconds after which a started load counts as abandoned
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Show the most recent loads
    Audits {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("mba-ingest".to_string())
        .build();

    // Merge with environment variables (they take precedence)
    let log_config = log_config.merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;

    match cli.command {
        Command::Upload {
            input,
            scope,
            include,
            exclude,
            workers,
            no_remote_check,
            eager,
            cache_file,
            load,
            dry_run,
        } => {
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if no_remote_check {
                config.remote_check = false;
            }
            if let Some(cache_file) = cache_file {
                config.cache_file = cache_file;
            }
            config.include_extensions = include.or(config.include_extensions);
            config.exclude_extensions = exclude.or(config.exclude_extensions);
            config.validate()?;

            let scope = scope.map(Scope::new).transpose().context("invalid --scope")?;
            upload(&config, &input, scope, eager, load, dry_run).await?;
        },
        Command::Load {
            key,
            table,
            source,
            batch_size,
            delimiter,
        } => {
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(delimiter) = delimiter {
                config.delimiter = Some(parse_delimiter(&delimiter)?);
            }
            config.validate()?;

            let mut trigger =
                LoadTrigger::new(source.unwrap_or_else(|| config.storage.bucket.clone()), key);
            trigger.table = table;

            let store = s3_store(&config).await?;
            let loader = pg_loader(&config, store).await?;
            let outcome = loader.load(&trigger).await?;
            print_json(&outcome)?;
        },
        Command::Trigger { event } => {
            let document = read_event(&event).await?;
            let triggers = triggers_from_event(&document)?;
            if triggers.is_empty() {
                info!("No loadable objects in event");
                return Ok(());
            }

            let store = s3_store(&config).await?;
            let loader = pg_loader(&config, store).await?;
            let summary = LoadDispatcher::new(&loader).dispatch(&triggers).await;
            print_json(&summary)?;
            if summary.failed() > 0 {
                anyhow::bail!("{} of {} loads failed", summary.failed(), summary.entries.len());
            }
        },
        Command::Scan {
            input,
            output,
            cache_file,
            similar_in,
        } => {
            let cache_file = cache_file.unwrap_or_else(|| config.cache_file.clone());
            let index = DuplicateIndex::open(cache_file).await?;
            let scan = index.scan_directory(&input).await?;
            let mut report = duplicate_report(&scan, Some(&input));

            if let Some(prefix) = similar_in {
                let store = s3_store(&config).await?;
                let similar =
                    find_similar_objects(store.as_ref(), &prefix, scan.files(), config.retry_policy())
                        .await?;
                report.push('\n');
                report.push_str(&similar_report(&similar, Some(&input)));
            }

            match output {
                Some(path) => {
                    tokio::fs::write(&path, report)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "Duplicate report written");
                },
                None => println!("{report}"),
            }
        },
        Command::Reconcile { older_than_secs } => {
            let older_than = older_than_secs
                .map(Duration::from_secs)
                .unwrap_or(config.dangling_after);
            let pool = connect_db(&config).await?;
            let reconciled = PgAuditLog::new(pool).reconcile_dangling(older_than).await?;
            info!(reconciled, "Reconciliation complete");
        },
        Command::Audits { limit } => {
            let pool = connect_db(&config).await?;
            let records = PgAuditLog::new(pool).recent(limit).await?;
            print_json(&records)?;
        },
    }

    Ok(())
}

async fn upload(
    config: &IngestConfig,
    input: &Path,
    scope: Option<Scope>,
    eager: bool,
    load: bool,
    dry_run: bool,
) -> Result<()> {
    let store: Arc<dyn ObjectStore> = if dry_run {
        info!(bucket = %config.storage.bucket, "Dry run: uploading to an in-memory bucket");
        Arc::new(MemoryStore::new(config.storage.bucket.clone()))
    } else {
        s3_store(config).await?
    };
    let index = if dry_run {
        DuplicateIndex::in_memory()
    } else {
        DuplicateIndex::open(config.cache_file.clone()).await?
    };

    let queue = Arc::new(JobQueue::new());
    let filter = ExtensionFilter::new(
        config.include_extensions.as_deref(),
        config.exclude_extensions.as_deref(),
    );
    let producer = Producer::new(input, filter, config.scope_rules())
        .with_scope_hint(scope)
        .eager(eager);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            signal.cancel();
        }
    });

    let pool = WorkerPool::new(queue.clone(), store.clone(), Arc::new(index), config.worker_config());
    let producing = {
        let queue = queue.clone();
        async move {
            let report = producer.run(&queue).await;
            queue.close();
            report
        }
    };

    let (report, summary) = tokio::join!(producing, pool.run(shutdown));
    let report = report?;
    let summary = summary?;
    info!(
        discovered = report.discovered,
        enqueued = report.enqueued,
        "Discovery finished"
    );

    print_summary(&summary)?;

    if load && !summary.load_triggers.is_empty() {
        let loader = if dry_run {
            CsvLoader::new(
                store,
                Arc::new(MemoryWarehouse::new()),
                Arc::new(MemoryAuditLog::new()),
                config.loader_config(),
            )
        } else {
            pg_loader(config, store).await?
        };
        let dispatched = LoadDispatcher::new(&loader)
            .dispatch(&summary.load_triggers)
            .await;
        info!(
            loaded = dispatched.loaded(),
            failed = dispatched.failed(),
            rows = dispatched.rows_inserted(),
            "Loads finished"
        );
        print_json(&dispatched)?;
    }

    if summary.has_failures() {
        anyhow::bail!("{} file(s) failed to upload", summary.failures.len());
    }
    Ok(())
}

async fn s3_store(config: &IngestConfig) -> Result<Arc<dyn ObjectStore>> {
    let store = S3Store::new(config.storage.clone()).await?;
    Ok(Arc::new(store))
}

/// Pool that answered a health check, with migrations applied
async fn connect_db(config: &IngestConfig) -> Result<PgPool> {
    let pool = create_pool(&config.db_config()?).await?;
    health_check(&pool).await.context("database health check failed")?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// PostgreSQL-backed loader; reconciles abandoned loads first
async fn pg_loader(config: &IngestConfig, store: Arc<dyn ObjectStore>) -> Result<CsvLoader> {
    let pool = connect_db(config).await?;

    let audit = PgAuditLog::new(pool.clone());
    match audit.reconcile_dangling(config.dangling_after).await {
        Ok(0) => {},
        Ok(reconciled) => warn!(reconciled, "Abandoned loads marked failed"),
        Err(e) => error!(error = %e, "Could not reconcile abandoned loads"),
    }

    Ok(CsvLoader::new(
        store,
        Arc::new(PgWarehouse::new(pool)),
        Arc::new(audit),
        config.loader_config(),
    ))
}

async fn read_event(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        use tokio::io::AsyncReadExt;
        let mut document = String::new();
        tokio::io::stdin().read_to_string(&mut document).await?;
        return Ok(document);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    for failure in &summary.failures {
        error!(
            path = %failure.source_path.display(),
            attempts = failure.attempts,
            error = %failure.error,
            "Upload failed"
        );
    }
    print_json(summary)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
