mod config;
mod dlq_cmd;
mod pool_cmd;
mod reaper_cmd;
mod serve_cmd;
mod worker_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};

use kiln_core::config::KilnConfig;
use kiln_core::controller::Controller;
use kiln_core::dlq::DeadLetterQueue;
use kiln_core::events::EventPublisher;
use kiln_core::pool::ExecutorPool;
use kiln_core::queue::TaskQueues;
use kiln_core::running::RunningIndex;
use kiln_db::pool;
use kiln_db::queries::evaluations as eval_db;

use config::KilnCliConfig;

#[derive(Parser)]
#[command(name = "kiln", about = "Multi-tenant code evaluation platform")]
struct Cli {
    /// Database URL (overrides KILN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Broker URL (overrides KILN_REDIS_URL env var)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a kiln config file (no services required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/kiln")]
        db_url: String,
        /// Redis connection URL
        #[arg(long, default_value = "redis://localhost:6379/0")]
        broker_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the kiln database and run migrations
    DbInit,
    /// Run the HTTP API server
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run the dispatcher fleet
    Worker {
        /// Initialize the executor pool from config before starting
        #[arg(long)]
        init_pool: bool,
    },
    /// Run the pod reaper
    Reaper,
    /// Executor pool administration
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },
    /// Dead-letter queue administration
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Show platform status (queues, pool, evaluation counts)
    Status,
}

#[derive(Subcommand)]
enum PoolCommands {
    /// Initialize the pool from the configured executor set
    Init,
    /// Show pool status
    Status,
    /// Reconcile the pool against the configured executor set
    Recover,
    /// Probe executor health endpoints
    Health,
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List parked tasks
    List {
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Filter by evaluation ID
        #[arg(long)]
        eval_id: Option<String>,
    },
    /// Show DLQ statistics
    Stats,
    /// Show one parked task in full
    Show { task_id: String },
    /// Resubmit a parked task
    Retry { task_id: String },
    /// Permanently remove a parked task
    Remove { task_id: String },
}

/// Execute the `kiln init` command: write the config file.
fn cmd_init(db_url: &str, broker_url: &str, force: bool) -> Result<()> {
    if config::ConfigFile::path().exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            config::ConfigFile::path().display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::Endpoint {
            url: db_url.to_string(),
        },
        broker: config::Endpoint {
            url: broker_url.to_string(),
        },
    };
    let path = cfg.write()?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  broker.url = {broker_url}");
    println!();
    println!("Next: run `kiln db-init` to create and migrate the database.");
    Ok(())
}

/// Execute the `kiln db-init` command: create database and run migrations.
async fn cmd_db_init(resolved: &KilnCliConfig) -> Result<()> {
    println!("Initializing kiln database...");

    let created = pool::create_database_if_missing(&resolved.db_config).await?;
    if !created {
        println!("Database already exists; applying pending migrations only.");
    }

    let db_pool = pool::connect(&resolved.db_config).await?;
    pool::apply_migrations(&db_pool).await?;

    let counts = pool::row_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("kiln db-init complete.");
    Ok(())
}

/// Build the API server state from resolved config.
async fn build_app_state(resolved: &KilnCliConfig) -> Result<serve_cmd::AppState> {
    let pg = pool::connect(&resolved.db_config).await?;
    let conn = resolved.broker_config.connect().await?;

    let queues = TaskQueues::new(conn.clone());
    let executor_pool = ExecutorPool::new(conn.clone());
    let dlq = DeadLetterQueue::new(conn.clone());
    let index = RunningIndex::new(conn.clone());
    let publisher = EventPublisher::new(conn.clone(), pg.clone());
    let controller = Controller::new(
        pg.clone(),
        conn.clone(),
        queues.clone(),
        publisher,
        index,
    );

    Ok(serve_cmd::AppState {
        pg,
        conn,
        controller,
        queues,
        pool: executor_pool,
        dlq,
    })
}

/// Execute the `kiln status` command.
async fn cmd_status(resolved: &KilnCliConfig) -> Result<()> {
    let pg = pool::connect(&resolved.db_config).await?;
    let conn = resolved.broker_config.connect().await?;

    let stats = eval_db::statistics(&pg).await?;
    println!("Evaluations: {} total", stats.total);
    println!(
        "  queued={} provisioning={} running={} completed={} failed={} cancelled={} timeout={}",
        stats.queued,
        stats.provisioning,
        stats.running,
        stats.completed,
        stats.failed,
        stats.cancelled,
        stats.timeout,
    );
    if let Some(avg) = stats.avg_runtime_ms {
        println!("  avg runtime of completed: {avg:.0} ms");
    }

    let queues = TaskQueues::new(conn.clone());
    println!("Queues:");
    for (queue, depth) in queues.depths().await? {
        println!("  {queue}: {depth}");
    }

    let executor_pool = ExecutorPool::new(conn);
    let status = executor_pool.status().await?;
    println!(
        "Pool: {} available, {} busy, {} total",
        status.available, status.busy, status.total
    );

    pg.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let kiln_config = KilnConfig::from_env();

    match cli.command {
        Commands::Init {
            db_url,
            broker_url,
            force,
        } => {
            cmd_init(&db_url, &broker_url, force)?;
        }
        Commands::DbInit => {
            let resolved =
                KilnCliConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            cmd_db_init(&resolved).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved =
                KilnCliConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let state = build_app_state(&resolved).await?;
            let pg = state.pg.clone();
            let result = serve_cmd::run_serve(state, &bind, port).await;
            pg.close().await;
            result?;
        }
        Commands::Worker { init_pool } => {
            let resolved =
                KilnCliConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let pg = pool::connect(&resolved.db_config).await?;
            let result =
                worker_cmd::run_worker(pg.clone(), &resolved.broker_config, &kiln_config, init_pool)
                    .await;
            pg.close().await;
            result?;
        }
        Commands::Reaper => {
            reaper_cmd::run_reaper(&kiln_config).await?;
        }
        Commands::Pool { command } => {
            let resolved =
                KilnCliConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            match command {
                PoolCommands::Init => {
                    pool_cmd::run_pool_init(&resolved.broker_config, &kiln_config).await?
                }
                PoolCommands::Status => pool_cmd::run_pool_status(&resolved.broker_config).await?,
                PoolCommands::Recover => {
                    pool_cmd::run_pool_recover(&resolved.broker_config, &kiln_config).await?
                }
                PoolCommands::Health => pool_cmd::run_pool_health(&kiln_config).await?,
            }
        }
        Commands::Dlq { command } => {
            let resolved =
                KilnCliConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            match command {
                DlqCommands::List {
                    limit,
                    offset,
                    eval_id,
                } => {
                    dlq_cmd::run_dlq_list(
                        &resolved.broker_config,
                        limit,
                        offset,
                        eval_id.as_deref(),
                    )
                    .await?
                }
                DlqCommands::Stats => dlq_cmd::run_dlq_stats(&resolved.broker_config).await?,
                DlqCommands::Show { task_id } => {
                    dlq_cmd::run_dlq_show(&resolved.broker_config, &task_id).await?
                }
                DlqCommands::Retry { task_id } => {
                    dlq_cmd::run_dlq_retry(&resolved.broker_config, &task_id).await?
                }
                DlqCommands::Remove { task_id } => {
                    dlq_cmd::run_dlq_remove(&resolved.broker_config, &task_id).await?
                }
            }
        }
        Commands::Status => {
            let resolved =
                KilnCliConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            cmd_status(&resolved).await?;
        }
    }

    Ok(())
}
