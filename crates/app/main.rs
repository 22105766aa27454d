//! courier - run workers and the beat for the demonstration tasks.
//!
//! Usage:
//!   courier worker [--concurrency N] [--pool-id ID]
//!   courier beat
//!   courier send <task> [--args JSON] [--countdown SECS]
//!   courier inspect [--queue dlq] [--limit N]
//!   courier result <job-id>

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use courier_app::{beat_schedule, registry, Settings, NAMESPACE};
use courier_core::{Beat, Client, JobId, WorkerPool};
use courier_redis::RedisBackend;
use courier_sqlite::SqliteScheduleStore;
use serde_json::Value;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// courier - distributed task queue worker and beat
#[derive(Parser)]
#[command(name = "courier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker pool processing every registered task
    Worker {
        /// Number of concurrent workers
        #[arg(short, long, default_value = "4")]
        concurrency: usize,

        /// Fixed pool ID (generated when omitted)
        #[arg(long)]
        pool_id: Option<String>,
    },

    /// Run the periodic dispatcher
    Beat,

    /// Send a task
    Send {
        /// Registered task name, e.g. tasks.simple_task
        #[arg(value_name = "TASK")]
        task: String,

        /// Keyword arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Delay before the task may run, in seconds
        #[arg(long)]
        countdown: Option<u64>,
    },

    /// Show queue lengths and dead-lettered jobs
    Inspect {
        /// Dead-letter queue to list
        #[arg(short, long, default_value = "dlq")]
        queue: String,

        /// Maximum number of dead jobs to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the stored result of a job
    Result {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Worker {
            concurrency,
            pool_id,
        } => run_worker(&settings, concurrency, pool_id).await,
        Commands::Beat => run_beat(&settings).await,
        Commands::Send {
            task,
            args,
            countdown,
        } => send(&settings, &task, &args, countdown).await,
        Commands::Inspect { queue, limit } => inspect(&settings, &queue, limit).await,
        Commands::Result { job_id } => show_result(&settings, &job_id).await,
    }
}

async fn run_worker(
    settings: &Settings,
    concurrency: usize,
    pool_id: Option<String>,
) -> anyhow::Result<()> {
    let broker = RedisBackend::new(&settings.broker_url)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", settings.broker_url))?;
    let results = RedisBackend::new(&settings.result_backend_url)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to result store at {}",
                settings.result_backend_url
            )
        })?;

    let mut builder = WorkerPool::builder()
        .config(settings.worker_config(concurrency))
        .registry(registry(settings))
        .backend(broker)
        .results(results);
    if let Some(pool_id) = pool_id {
        builder = builder.pool_id(pool_id);
    }

    let pool = builder.build()?;
    for name in pool.registry().names() {
        tracing::info!(task = %name, "Registered task");
    }

    pool.run().await?;
    Ok(())
}

async fn run_beat(settings: &Settings) -> anyhow::Result<()> {
    let broker = RedisBackend::new(&settings.broker_url)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", settings.broker_url))?;
    let store = SqliteScheduleStore::open(&settings.beat_schedule_filename)
        .await
        .with_context(|| {
            format!(
                "Failed to open beat schedule {}",
                settings.beat_schedule_filename.display()
            )
        })?;

    let mut beat = Beat::new(Client::new(broker, NAMESPACE), beat_schedule(), store);
    beat.run().await?;
    Ok(())
}

async fn client(settings: &Settings) -> anyhow::Result<Client> {
    let broker = RedisBackend::new(&settings.broker_url)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", settings.broker_url))?;
    let results = RedisBackend::new(&settings.result_backend_url)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to result store at {}",
                settings.result_backend_url
            )
        })?;
    Ok(Client::new(broker, NAMESPACE).with_results(results))
}

async fn send(
    settings: &Settings,
    task: &str,
    args: &str,
    countdown: Option<u64>,
) -> anyhow::Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    if !args.is_object() {
        bail!("--args must be a JSON object");
    }

    let client = client(settings).await?;
    let job_id = match countdown {
        Some(secs) => {
            client
                .send_task_in(task, args, Duration::from_secs(secs))
                .await?
        }
        None => client.send_task(task, args).await?,
    };

    println!("{}", job_id);
    Ok(())
}

async fn inspect(settings: &Settings, queue: &str, limit: usize) -> anyhow::Result<()> {
    let client = client(settings).await?;

    println!("namespace: {}", client.namespace());
    println!("  ready:     {}", client.queue_len().await?);
    println!("  scheduled: {}", client.schedule_len().await?);
    println!("  retrying:  {}", client.retry_len().await?);
    println!("  dead ({}): {}", queue, client.dead_len(queue).await?);

    for job in client.list_dead(queue, limit, 0).await? {
        println!(
            "    {} {} retries={} error={}",
            job.id,
            job.name,
            job.retries,
            job.last_error.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

async fn show_result(settings: &Settings, job_id: &str) -> anyhow::Result<()> {
    let Some(id) = JobId::parse(job_id) else {
        bail!("Invalid job ID: {}", job_id);
    };

    let client = client(settings).await?;
    match client.result(&id).await? {
        Some(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
        None => println!("No result stored for {}", id),
    }
    Ok(())
}
