//! worq - demo worker and client
//!
//! ```text
//! worq worker --concurrency 4
//! worq client --count 10 --args '{"x": 2, "y": 10}'
//! ```

mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use worq_amqp::{AmqpBroker, AmqpConfig};
use worq_core::app::{DEFAULT_CONCURRENCY, DEFAULT_QUEUE};
use worq_core::ports::Broker;
use worq_core::{App, AppBuilder, Context, Handler, Signature, Task, WorqError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "worq", version, about = "Task-queue worker and client")]
struct Cli {
    /// AMQP URL; falls back to the AMQP config defaults.
    #[arg(long, env = "WORQ_AMQP_URL", global = true)]
    url: Option<String>,

    #[arg(long, env = "WORQ_QUEUE", default_value = DEFAULT_QUEUE, global = true)]
    queue: String,

    /// Log as JSON lines.
    #[arg(long, env = "WORQ_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume the queue and run `tasks.add`.
    Worker {
        #[arg(long, env = "WORQ_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
    /// Enqueue tasks.
    Client {
        #[arg(long, default_value = Add::NAME)]
        task: String,

        /// JSON arguments: an array for positional, an object for keyword args.
        #[arg(long, default_value = r#"{"x": 2, "y": 10}"#)]
        args: String,

        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Add {
    x: i64,
    y: i64,
}

impl Task for Add {
    const NAME: &'static str = "tasks.add";
}

struct AddHandler;

#[async_trait]
impl Handler<Add> for AddHandler {
    async fn handle(&self, ctx: Context, task: Add) -> Result<(), WorqError> {
        let sum = task.x.checked_add(task.y).ok_or_else(|| ctx.reject(false))?;
        info!(x = task.x, y = task.y, sum, "added");
        Ok(())
    }
}

fn broker(cli: &Cli) -> Arc<AmqpBroker> {
    let mut config = AmqpConfig::from_env();
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    Arc::new(AmqpBroker::new(config))
}

fn app(cli: &Cli, broker: Arc<AmqpBroker>, concurrency: usize) -> Result<App, BoxError> {
    let app = AppBuilder::new()
        .broker(broker)
        .default_queue(cli.queue.clone())
        .concurrency(concurrency)
        .register_task::<Add, _>(AddHandler)?
        .expect_tasks(&[Add::NAME])
        .build()?;
    Ok(app)
}

async fn run_worker(cli: &Cli, concurrency: usize) -> Result<(), BoxError> {
    let broker = broker(cli);
    let app = app(cli, broker.clone(), concurrency)?;

    let stopper = app.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, draining workers");
                stopper.shutdown("interrupted");
            }
            Err(err) => warn!(error = %err, "cannot listen for interrupt"),
        }
    });

    let result = app.start().await;
    broker.close().await?;
    Ok(result?)
}

async fn run_client(cli: &Cli, task: &str, args: &str, count: usize) -> Result<(), BoxError> {
    let args: serde_json::Value = serde_json::from_str(args)?;
    let broker = broker(cli);
    let app = app(cli, broker.clone(), 1)?;

    let signature = Signature::new(task, args);
    for _ in 0..count {
        let result = app.enqueue(&signature).await?;
        info!(id = %result.id, task, queue = %cli.queue, "enqueued");
    }
    broker.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let result = match &cli.command {
        Command::Worker { concurrency } => run_worker(&cli, *concurrency).await,
        Command::Client { task, args, count } => run_client(&cli, task, args, *count).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "worq exited with an error");
            ExitCode::FAILURE
        }
    }
}
