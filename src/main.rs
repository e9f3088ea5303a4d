mod broker;
mod commands;
mod config;
mod db;
mod error;
mod feed;
mod models;
mod shutdown;
mod tasks;

use broker::NatsBroker;
use config::{Config, RunMode};
use db::Database;
use error::FeedError;
use feed::connection::{ConnectionManager, HttpDialer};
use feed::credentials::BearerToken;
use feed::reader::{spawn_refresh, StreamReader};
use log::{error, info, warn};
use shutdown::{wait_for_signal, ShutdownCoordinator, StopFlag};
use std::env;
use std::process;
use std::sync::Arc;
use tasks::aggregator::VoteAggregator;
use tasks::publisher::VotePublisher;
use tokio::sync::mpsc;
use url::Url;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize logging
    env_logger::init();

    // Poll admin commands skip the pipeline entirely
    let args: Vec<String> = env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("polls") {
        process::exit(run_poll_command(&args[1..]).await);
    }

    // Pick which half of the pipeline to run
    let mode = match args.first().map(String::as_str).unwrap_or("all").parse::<RunMode>() {
        Ok(mode) => mode,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    // Load configuration from environment variables
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(2);
        }
    };

    // Initialize database
    let database = match Database::new(&config.database_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to connect to poll store: {}", e);
            process::exit(1);
        }
    };

    let result = run(mode, &config, Arc::clone(&database)).await;

    // Released on every exit path
    database.close().await;

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run_poll_command(args: &[String]) -> i32 {
    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| config::DEFAULT_DATABASE_URL.to_string());
    let database = match Database::new(&database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to connect to poll store: {}", e);
            return 1;
        }
    };

    // Run the command and report its output
    let result = commands::poll::handle_poll_command(&database, args).await;
    database.close().await;

    match result {
        Ok(output) => {
            println!("{}", output);
            0
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}

async fn run(mode: RunMode, config: &Config, database: Arc<Database>) -> Result<(), BoxError> {
    // Connect to the broker
    let broker = NatsBroker::connect(&config.nats_url).await?;
    info!("Running in {:?} mode", mode);

    match mode {
        RunMode::Stream => {
            let coordinator = start_stream(config, database, &broker)?;
            coordinator.run_until_signal().await;
        }
        RunMode::Count => {
            // SIGHUP also stops the counter
            let stop = StopFlag::new();
            let watcher = stop.clone();
            tokio::spawn(async move {
                if let Err(e) = wait_for_signal(true).await {
                    warn!("Failed to install signal handlers, stopping: {}", e);
                }
                watcher.request();
            });

            let votes = broker.subscribe_votes(&config.votes_topic, &config.counter_group).await?;
            // Count until a signal, then drain what is still in flight
            VoteAggregator::new(database, config.flush_interval)
                .with_drain_window(config.drain_window)
                .run(votes, stop)
                .await;
        }
        RunMode::All => {
            let votes = broker.subscribe_votes(&config.votes_topic, &config.counter_group).await?;
            let counter_stop = StopFlag::new();
            let counter = tokio::spawn(
                VoteAggregator::new(database.clone(), config.flush_interval)
                    .with_drain_window(config.drain_window)
                    .run(votes, counter_stop.clone()),
            );

            let coordinator = start_stream(config, database, &broker)?;
            coordinator.run_until_signal().await;

            // Publisher has flushed; the counter drains the broker round trip before its last flush
            counter_stop.request();
            counter.await?;
        }
    }

    info!("Stopped");
    Ok(())
}

/// Wires reader, publisher and refresh loop together and hands back the
/// coordinator that owns their shutdown.
fn start_stream(
    config: &Config,
    database: Arc<Database>,
    broker: &NatsBroker,
) -> Result<ShutdownCoordinator, BoxError> {
    // Feed connection
    let feed_url = Url::parse(&config.feed_url).map_err(|e| FeedError::InvalidUrl(e.to_string()))?;
    let dialer = HttpDialer::new(config.connect_timeout)?;
    let connections = Arc::new(ConnectionManager::new(Arc::new(dialer), config.connect_timeout));
    let stop = StopFlag::new();

    // Vote channel and publisher
    let (votes_tx, votes_rx) = mpsc::channel(config.vote_channel_capacity);
    let publisher = VotePublisher::new(Arc::new(broker.clone()), config.votes_topic.clone()).start(votes_rx);

    // Reader, plus the refresh loop that makes it reload options
    let reader = StreamReader::new(
        database,
        Arc::new(BearerToken::from_env(config.feed_token_var.clone())),
        Arc::clone(&connections),
        feed_url,
        config.reconnect_backoff,
        stop.clone(),
    )
    .start(votes_tx.clone());

    let refresh = spawn_refresh(Arc::clone(&connections), stop.clone(), config.refresh_interval);

    Ok(ShutdownCoordinator::new(stop, connections, reader, publisher, votes_tx, refresh))
}
