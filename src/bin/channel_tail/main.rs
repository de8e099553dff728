//! Command line tail for a channel stream
//!
//! Connects to a WebSocket endpoint, subscribes the given channels and prints
//! every pushed message on its own line.
//! Run with: `cargo run --bin channel-tail --features cli -- --url wss://... --subscribe key=command`

use std::time::Duration;

use async_trait::async_trait;
use channel_stream::websocket::{ClientEvent, DispatchMode, MessageDisposition, MessageHandler};
use channel_stream::{ClientConfig, Error, StreamClient};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "channel-tail", version, about = "Print messages pushed on WebSocket channels")]
struct Args {
    /// WebSocket endpoint (ws:// or wss://)
    #[arg(long)]
    url: String,

    /// Channel to subscribe, as `key=command`; may be repeated
    #[arg(long = "subscribe", value_parser = parse_subscription)]
    subscriptions: Vec<(String, String)>,

    /// Do not replay subscriptions after the connection closes
    #[arg(long)]
    no_reconnect: bool,

    /// Seconds between heartbeat pings, 0 to disable
    #[arg(long, default_value_t = 30)]
    keep_alive_secs: u64,

    /// Log every frame sent and received
    #[arg(short, long)]
    verbose: bool,

    /// Run the message handler on the receive path
    #[arg(long)]
    inline: bool,
}

fn parse_subscription(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, command)) if !key.is_empty() && !command.is_empty() => {
            Ok((key.to_string(), command.to_string()))
        }
        _ => Err(format!("expected key=command, got '{raw}'")),
    }
}

struct Printer;

#[async_trait]
impl MessageHandler for Printer {
    async fn handle_message(&self, text: String) -> MessageDisposition {
        println!("{text}");
        MessageDisposition::Handled
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "channel_stream=info,channel_tail=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "channel-tail stopped");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let keep_alive = (args.keep_alive_secs > 0).then(|| Duration::from_secs(args.keep_alive_secs));
    let mode = if args.inline {
        DispatchMode::Inline
    } else {
        DispatchMode::Background
    };
    let config = ClientConfig::new(args.url)
        .with_keep_alive(keep_alive)
        .with_verbose(args.verbose)
        .with_dispatch_mode(mode);

    let client = StreamClient::new(config, Printer)?;
    if !client.connect().await? {
        return Err(Error::NotOpen(client.state()));
    }
    tracing::info!(channels = args.subscriptions.len(), "connected");

    for (key, command) in args.subscriptions {
        client.subscribe(key, command, !args.no_reconnect).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                client.dispose();
                return Ok(());
            }
            event = client.recv() => match event {
                Some(ClientEvent::Reconnected { replayed }) => {
                    tracing::info!(replayed, "reconnected");
                }
                Some(ClientEvent::ConnectionClosed(None)) => {
                    tracing::info!("connection closed");
                    return Ok(());
                }
                Some(ClientEvent::ConnectionClosed(Some(e))) | Some(ClientEvent::ConnectionError(e)) => {
                    return Err(e);
                }
                None => return Ok(()),
            },
        }
    }
}
