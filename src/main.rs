//! agent-relay entry point.
//!
//! Two process roles share one binary: `gateway` serves the OpenAI-compatible
//! facade, `worker` consumes jobs (and hosts the stale-job watchdog).

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use agent_relay::bot::BotServiceClient;
use agent_relay::broker::{Broker, RedisBroker};
use agent_relay::config::Config;
use agent_relay::gateway::{self, GatewayState};
use agent_relay::queue::{TaskQueue, Watchdog};
use agent_relay::worker::WorkerRuntime;

#[derive(Parser, Debug)]
#[command(name = "agent-relay")]
#[command(about = "Job dispatch and event streaming for agent chat completions")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the OpenAI-compatible HTTP facade.
    Gateway,
    /// Consume jobs from the queue and execute them against the bot service.
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent_relay=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.broker.redis_url).await?);
    let queue = TaskQueue::new(broker, config.queue.clone());

    match args.command {
        Command::Gateway => run_gateway(config, queue).await,
        Command::Worker => run_worker(config, queue).await,
    }
}

async fn run_gateway(config: Config, queue: TaskQueue) -> anyhow::Result<()> {
    let bot = Arc::new(BotServiceClient::new(&config.bot)?);
    if let Err(err) = bot.refresh_agents().await {
        tracing::warn!(error = %err, "could not prefetch agent registry; will retry on demand");
    }

    let state = Arc::new(GatewayState {
        queue,
        bot,
        default_user_id: config.gateway.default_user_id.clone(),
        default_user_role: config.gateway.default_user_role.clone(),
    });

    gateway::start_server(config.gateway.listen_addr, state).await?;
    shutdown_signal().await;
    tracing::info!("gateway shutting down");
    Ok(())
}

async fn run_worker(config: Config, queue: TaskQueue) -> anyhow::Result<()> {
    let bot = Arc::new(BotServiceClient::new(&config.bot)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested; draining in-flight jobs");
        let _ = shutdown_tx.send(true);
    });

    let watchdog = tokio::spawn(Watchdog::new(queue.clone()).run(shutdown_rx.clone()));

    tracing::info!(
        queue_key = %queue.config().queue_key,
        concurrency = config.worker.concurrency,
        "worker started; awaiting jobs"
    );
    WorkerRuntime::new(queue, bot, config.worker.clone())
        .run(shutdown_rx)
        .await;

    let _ = watchdog.await;
    tracing::info!("worker shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
