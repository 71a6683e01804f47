//! CLI for StompSub
//!
//! Subcommands:
//! - `produce`: send a message (or every line of stdin) to a destination
//! - `consume`: print every message from every broker behind the address

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use uuid::Uuid;

use stompsub::config::{Settings, load_config, load_config_from};
use stompsub::utils::logging;
use stompsub::{AckMode, Consumer, Message, Producer, SendParams};

#[derive(Parser)]
#[command(name = "stompsub", version, about = "Resilient STOMP producer and consumer")]
struct Cli {
    /// Configuration file (defaults to config/default.* when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Broker address, host:port
    #[arg(long, global = true)]
    connect: Option<String>,
    #[arg(long, global = true)]
    login: Option<String>,
    #[arg(long, global = true)]
    passcode: Option<String>,
    /// Connect over TLS
    #[arg(long, global = true)]
    tls: bool,
    /// Do not verify the broker certificate
    #[arg(long, global = true)]
    insecure: bool,
    /// Directory of CA certificates
    #[arg(long, global = true)]
    capath: Option<PathBuf>,
    /// CA bundle
    #[arg(long, global = true)]
    cacert: Option<PathBuf>,
    /// Client certificate
    #[arg(long, global = true)]
    cert: Option<PathBuf>,
    /// Client key (defaults to --cert)
    #[arg(long, global = true)]
    key: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message
    Produce {
        destination: String,
        #[arg(long)]
        persist: bool,
        #[arg(long)]
        content_type: Option<String>,
        /// Message body; stdin is sent line by line when omitted
        #[arg(long, short)]
        message: Option<String>,
    },
    /// Consume and print messages as JSON lines
    Consume {
        destination: String,
        /// auto, client-individual or client
        #[arg(long, default_value = "auto")]
        ack: AckMode,
        /// Subscription id (random when omitted)
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Serialize)]
struct PrintedMessage<'a> {
    endpoint: String,
    received_at: String,
    headers: BTreeMap<&'a str, &'a str>,
    body: Cow<'a, str>,
}

impl<'a> From<&'a Message> for PrintedMessage<'a> {
    fn from(message: &'a Message) -> Self {
        let mut headers = BTreeMap::new();
        for (key, value) in message.headers().iter() {
            headers.entry(key).or_insert(value);
        }
        Self {
            endpoint: message.endpoint().to_string(),
            received_at: message.received_at().to_rfc3339(),
            headers,
            body: message.body_text(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.level);

    let result = match cli.command {
        Command::Produce {
            destination,
            persist,
            content_type,
            message,
        } => {
            let params = SendParams {
                persist,
                content_type,
            };
            produce(&settings, &destination, &params, message).await
        }
        Command::Consume {
            destination,
            ack,
            id,
        } => consume(&settings, &destination, ack, id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Configuration with command-line overrides applied.
fn settings(cli: &Cli) -> Result<Settings, config::ConfigError> {
    let mut settings = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    if let Some(address) = &cli.connect {
        settings.broker.address = address.clone();
    }
    if cli.login.is_some() {
        settings.broker.login = cli.login.clone();
    }
    if cli.passcode.is_some() {
        settings.broker.passcode = cli.passcode.clone();
    }
    settings.tls.enabled |= cli.tls;
    settings.tls.insecure |= cli.insecure;
    if cli.capath.is_some() {
        settings.tls.ca_path = cli.capath.clone();
    }
    if cli.cacert.is_some() {
        settings.tls.ca_bundle = cli.cacert.clone();
    }
    if cli.cert.is_some() {
        settings.tls.cert = cli.cert.clone();
    }
    if cli.key.is_some() {
        settings.tls.key = cli.key.clone();
    }
    if cli.debug {
        settings.logging.level = "debug".to_string();
    }
    Ok(settings)
}

async fn produce(
    settings: &Settings,
    destination: &str,
    params: &SendParams,
    message: Option<String>,
) -> stompsub::Result<()> {
    let producer = Producer::connect(settings.connection_parameters()).await?;

    let result = match message {
        Some(body) => producer.send(destination, body, params).await,
        None => send_lines(&producer, destination, params).await,
    };
    producer.close().await;
    result
}

async fn send_lines(
    producer: &Producer,
    destination: &str,
    params: &SendParams,
) -> stompsub::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        producer.send(destination, line, params).await?;
        sent += 1;
    }
    info!(destination, sent, "finished sending");
    Ok(())
}

async fn consume(
    settings: &Settings,
    destination: &str,
    ack: AckMode,
    id: Option<String>,
) -> stompsub::Result<()> {
    let consumer = Consumer::connect(settings.connection_parameters()).await?;
    let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut subscription = consumer.subscribe(destination, &id, ack).await?;
    info!(destination, subscription = %id, brokers = consumer.sessions().len(), "subscribed");

    let mut errors_open = true;
    loop {
        tokio::select! {
            message = subscription.messages.recv() => {
                let Some(message) = message else { break };
                match serde_json::to_string(&PrintedMessage::from(&message)) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "failed to serialize message"),
                }
                if ack.requires_ack() {
                    if let Err(e) = message.ack().await {
                        warn!(error = %e, "failed to acknowledge message");
                    }
                }
            }
            err = subscription.errors.recv(), if errors_open => match err {
                Some(e) => error!(error = %e, "broker stream failed"),
                None => errors_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }

    consumer.close().await;
    Ok(())
}
