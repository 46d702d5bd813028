use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::{
    domain::SessionId,
    error::SyncError,
    protocol::{InboundMessage, ProgressEvent},
};
use sync_core::{ConnectionHealth, Reconciler, SnapshotContent, SnapshotPublisher};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a recorded JSON-lines event log offline through the merge engine.
    Replay {
        path: PathBuf,
        #[arg(long, default_value = "replay")]
        session_id: String,
        /// Print every published snapshot, not just the final one.
        #[arg(long)]
        every: bool,
        #[arg(long)]
        compact: bool,
    },
    /// Print the normalized events of one raw message.
    Inspect { message: String },
}

fn render<T: serde::Serialize>(value: &T, compact: bool) -> Result<String> {
    Ok(if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    })
}

fn replay(path: &Path, session_id: SessionId, every: bool, compact: bool) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read event log {}", path.display()))?;

    let mut reconciler = Reconciler::new(session_id);
    let mut health = ConnectionHealth::default();
    let mut publisher = SnapshotPublisher::new(
        SnapshotContent::project(reconciler.state(), &health),
        Utc::now(),
    );

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let now = Utc::now();
        health.record_message(now);
        match InboundMessage::parse(line) {
            Ok(InboundMessage::Ping(ping)) => health.record_ping(&ping, now),
            Ok(InboundMessage::Progress(events)) => {
                for event in &events {
                    if let ProgressEvent::Unknown { kind } = event {
                        let kind = kind.clone().unwrap_or_else(|| "<untyped>".to_string());
                        health.record_unrecognized(&SyncError::Protocol(kind), now);
                    }
                }
                reconciler.apply_all(&events, now);
            }
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping malformed line");
                health.record_error(&err, now);
            }
        }

        let published = publisher.publish(SnapshotContent::project(reconciler.state(), &health), now);
        if every && published.is_some() {
            println!("{}", render(&*publisher.current(), compact)?);
        }
    }

    if !every {
        println!("{}", render(&*publisher.current(), compact)?);
    }
    eprintln!(
        "replayed {} messages: {} versions, {} errors, {} unrecognized, {} pings",
        health.messages_received,
        publisher.version(),
        health.errors,
        health.unrecognized,
        health.pings_received
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            path,
            session_id,
            every,
            compact,
        } => replay(&path, SessionId::new(session_id), every, compact)?,
        Command::Inspect { message } => {
            let parsed = InboundMessage::parse(&message).context("message did not parse")?;
            println!("{}", render(&parsed, false)?);
        }
    }

    Ok(())
}
