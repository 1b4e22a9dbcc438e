//! CLI for retrysub
//!
//! Subcommands:
//! - `publish`: publish one JSON message
//! - `listen`: consume a routing key and log every message (useful for smoke tests)

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use retrysub::config::load_config;
use retrysub::delivery::message::{Headers, RETRY_COUNT_HEADER, RETRY_DELAY_HEADER};
use retrysub::utils::logging::{self, TracingLogger};
use retrysub::{Completion, Connection, ConnectionOptions, Message, Subscription, handler_fn};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "retrysub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a JSON message to the main exchange
    Publish {
        #[arg(long)]
        routing_key: String,
        /// JSON body, e.g. '{"a":1}'
        #[arg(long)]
        body: String,
        #[arg(long)]
        retry_count: Option<u64>,
        #[arg(long)]
        retry_delay_ms: Option<u64>,
    },
    /// Consume a routing key and log each message
    Listen {
        #[arg(long)]
        routing_key: String,
        #[arg(long)]
        consumer: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Fail every message to exercise the retry and dead-letter path
        #[arg(long)]
        fail: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    logging::init(&settings.logging.level);

    let options = ConnectionOptions::new(settings).with_logger(Arc::new(TracingLogger));
    let connection = match Connection::open(options).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Connection failed: {}", e);
            return;
        }
    };

    let result = match cli.command {
        Command::Publish {
            routing_key,
            body,
            retry_count,
            retry_delay_ms,
        } => run_publish(&connection, &routing_key, &body, retry_count, retry_delay_ms).await,
        Command::Listen {
            routing_key,
            consumer,
            timeout_ms,
            fail,
        } => run_listen(&connection, routing_key, consumer, timeout_ms, fail).await,
    };
    if let Err(e) = result {
        error!("{}", e);
    }

    if let Err(e) = connection.close().await {
        error!("Failed to close connection: {}", e);
    }
}

async fn run_publish(
    connection: &Connection,
    routing_key: &str,
    body: &str,
    retry_count: Option<u64>,
    retry_delay_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let body: serde_json::Value = serde_json::from_str(body)?;

    let mut headers = Headers::new();
    if let Some(count) = retry_count {
        headers.insert(RETRY_COUNT_HEADER.to_string(), count.into());
    }
    if let Some(delay) = retry_delay_ms {
        headers.insert(RETRY_DELAY_HEADER.to_string(), delay.into());
    }

    connection.publish(routing_key, &body, Some(headers)).await?;
    info!("Published to {}", routing_key);
    Ok(())
}

async fn run_listen(
    connection: &Connection,
    routing_key: String,
    consumer: String,
    timeout_ms: Option<u64>,
    fail: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let handler = handler_fn(move |message: Message, done: Completion| async move {
        info!(
            routing_key = %message.routing_key,
            headers = ?message.headers,
            "Received {}",
            message.body
        );
        if fail {
            done.fail("listener configured to fail");
        } else {
            done.ok();
        }
    });

    let mut subscription = Subscription::new(routing_key.clone(), consumer, handler);
    if let Some(ms) = timeout_ms {
        subscription = subscription.with_timeout(Duration::from_millis(ms));
    }
    connection.subscribe(subscription).await?;
    info!("Listening on {}. Press Ctrl-C to stop.", routing_key);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    Ok(())
}
