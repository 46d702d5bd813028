use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use shared::domain::SessionId;
use sync_core::{load_settings, ProgressSnapshot, Settings, StreamConnector, TransportKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Follow one menu processing session and print every new progress snapshot.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    session_id: String,
    /// HTTP base of the pipeline API, e.g. http://127.0.0.1:8000/api/v1
    #[arg(long)]
    base_url: Option<String>,
    /// Progress channel: `sse` (default) or `websocket`.
    #[arg(long)]
    transport: Option<TransportKind>,
    #[arg(long)]
    stale_after_secs: Option<u64>,
    #[arg(long)]
    ack_timeout_ms: Option<u64>,
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
    /// Open the channel without consulting the upstream health check.
    #[arg(long)]
    skip_health_check: bool,
    /// One compact JSON document per line instead of pretty output.
    #[arg(long)]
    compact: bool,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.base_url {
            settings.base_url = v.clone();
        }
        if let Some(v) = self.transport {
            settings.transport = v;
        }
        if let Some(v) = self.stale_after_secs {
            settings.stale_after = Duration::from_secs(v);
        }
        if let Some(v) = self.ack_timeout_ms {
            settings.ack_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.reconnect_delay_ms {
            settings.reconnect_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.max_reconnect_attempts {
            settings.max_reconnect_attempts = v;
        }
    }
}

fn print_snapshot(snapshot: &ProgressSnapshot, compact: bool) -> Result<()> {
    let rendered = if compact {
        serde_json::to_string(snapshot)?
    } else {
        serde_json::to_string_pretty(snapshot)?
    };
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    args.apply(&mut settings);
    info!(base_url = %settings.base_url, transport = %settings.transport, session_id = %args.session_id, "starting menu watch");

    let connector = StreamConnector::new(settings);
    let session_id = SessionId::new(args.session_id.clone());
    let handle = if args.skip_health_check {
        connector.open(session_id)?
    } else {
        let upstream = connector.check_upstream().await?;
        info!(services = ?upstream.services, "upstream healthy");
        connector.open(session_id)?
    };

    let mut updates = handle.updates();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; closing session");
                break;
            }
            next = updates.next() => match next {
                Some(snapshot) => {
                    print_snapshot(&snapshot, args.compact)?;
                    if snapshot.content.status.is_terminal() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let health = handle.health();
    let state = handle.close().await?;
    info!(
        status = ?state.status,
        items = state.item_count(),
        messages = health.messages_received,
        errors = health.errors,
        pongs = health.pongs_sent,
        "session closed"
    );
    Ok(())
}
