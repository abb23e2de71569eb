use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::protocol::{SetupAction, ViewerRequest};

#[derive(Parser, Debug)]
#[command(name = "boardwalk")]
#[command(about = "Boardwalk terminal-sharing relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port (overrides BOARDWALK_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Listen host (overrides BOARDWALK_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Redis URL for the room store (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Attach to a terminal as a read-only mirror and stream its output
    Watch {
        /// Relay URL (e.g. ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Session id to attach to
        #[arg(short, long)]
        session: String,

        /// Terminal name within the session
        #[arg(short, long)]
        terminal: String,
    },
}

/// Minimal mirror client used for poking at a running relay.
pub async fn run_watch_client(url: String, session: String, terminal: String) -> Result<()> {
    let ws_url = format!("{}/ws/terminal/{}", url.trim_end_matches('/'), session);
    debug!(url = %ws_url, "connecting to relay");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let setup = ViewerRequest::Setup {
        action: SetupAction::Mirror,
        name: terminal,
        cols: None,
        rows: None,
        created_by: None,
    };
    write
        .send(Message::Text(serde_json::to_string(&setup)?))
        .await?;

    let mut stdout = tokio::io::stdout();
    while let Some(frame) = read.next().await {
        match frame? {
            Message::Binary(bytes) => {
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
            Message::Text(text) => {
                // Control JSON: setup response, exit, disconnect.
                eprintln!("{}", text);
                if text.contains("\"disconnect\"") || text.contains("\"exit\"") {
                    break;
                }
            }
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    eprintln!("closed: {} {}", u16::from(frame.code), frame.reason);
                }
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
