use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::domain::{PipelineStatus, SessionId, Stage};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    health::ConnectionHealth,
    progress::{CategoryCounts, ProgressSummary},
    reconciler::{ItemView, SessionState},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryView {
    pub name: String,
    pub translated_name: Option<String>,
    pub items: Vec<ItemView>,
    pub counts: CategoryCounts,
    pub percent: u8,
}

/// The slice of connection health worth a new snapshot version. Raw traffic
/// counters are only on the connector's health channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub stale: bool,
    pub errors: u64,
    pub reconnect_attempts: u32,
}

impl From<&ConnectionHealth> for ConnectionStatus {
    fn from(health: &ConnectionHealth) -> Self {
        Self {
            connected: health.connected,
            stale: health.stale,
            errors: health.errors,
            reconnect_attempts: health.reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotContent {
    pub session_id: SessionId,
    pub stage: Stage,
    pub pipeline_ordinal: u64,
    pub status: PipelineStatus,
    pub categories: Vec<CategoryView>,
    pub progress: ProgressSummary,
    pub connection: ConnectionStatus,
}

impl SnapshotContent {
    pub fn project(state: &SessionState, health: &ConnectionHealth) -> Self {
        Self {
            session_id: state.session_id.clone(),
            stage: state.stage,
            pipeline_ordinal: state.pipeline_ordinal,
            status: state.status.clone(),
            categories: state
                .categories
                .iter()
                .map(|category| CategoryView {
                    name: category.name.clone(),
                    translated_name: category.translated_name.clone(),
                    items: category.items.iter().map(|item| item.view()).collect(),
                    counts: *category.counts(),
                    percent: category.percent(),
                })
                .collect(),
            progress: state.progress.clone(),
            connection: ConnectionStatus::from(health),
        }
    }

    pub fn category(&self, name: &str) -> Option<&CategoryView> {
        self.categories.iter().find(|category| category.name == name)
    }
}

/// Immutable, versioned read projection handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub version: u64,
    pub published_at: DateTime<Utc>,
    pub content: SnapshotContent,
}

pub struct SnapshotPublisher {
    version: u64,
    last_serialized: Vec<u8>,
    tx: watch::Sender<Arc<ProgressSnapshot>>,
}

impl SnapshotPublisher {
    /// Starts at version 0 with `initial` as the baseline content.
    pub fn new(initial: SnapshotContent, at: DateTime<Utc>) -> Self {
        let last_serialized = serde_json::to_vec(&initial).unwrap_or_default();
        let (tx, _) = watch::channel(Arc::new(ProgressSnapshot {
            version: 0,
            published_at: at,
            content: initial,
        }));
        Self {
            version: 0,
            last_serialized,
            tx,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn current(&self) -> Arc<ProgressSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ProgressSnapshot>> {
        self.tx.subscribe()
    }

    /// Publishes `content` as a new version if its serialized form differs from the
    /// last publication. Returns the new version, or `None` when nothing changed.
    pub fn publish(&mut self, content: SnapshotContent, at: DateTime<Utc>) -> Option<u64> {
        let serialized = match serde_json::to_vec(&content) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(error = %err, "failed to serialize snapshot content");
                return None;
            }
        };
        if serialized == self.last_serialized {
            return None;
        }

        self.version += 1;
        self.last_serialized = serialized;
        self.tx.send_replace(Arc::new(ProgressSnapshot {
            version: self.version,
            published_at: at,
            content,
        }));
        debug!(version = self.version, "published progress snapshot");
        Some(self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::Reconciler;
    use shared::protocol::{InboundMessage, ProgressEvent};

    fn events(raw: &str) -> Vec<ProgressEvent> {
        match InboundMessage::parse(raw).expect("parse") {
            InboundMessage::Progress(events) => events,
            other => panic!("unexpected message {other:?}"),
        }
    }

    fn now() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().expect("timestamp")
    }

    #[test]
    fn publishes_only_on_content_change() {
        let mut reconciler = Reconciler::new(SessionId::from("s-1"));
        let health = ConnectionHealth::default();
        let mut publisher =
            SnapshotPublisher::new(SnapshotContent::project(reconciler.state(), &health), now());
        let mut rx = publisher.subscribe();

        assert_eq!(
            publisher.publish(SnapshotContent::project(reconciler.state(), &health), now()),
            None
        );
        assert!(!rx.has_changed().expect("sender alive"));

        let structured = events(r#"{"categories":{"Appetizers":[{"name":"焼き鳥"}]}}"#);
        reconciler.apply_all(&structured, now());
        assert_eq!(
            publisher.publish(SnapshotContent::project(reconciler.state(), &health), now()),
            Some(1)
        );
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().version, 1);

        reconciler.apply_all(&structured, now());
        assert_eq!(
            publisher.publish(SnapshotContent::project(reconciler.state(), &health), now()),
            None
        );
        assert_eq!(publisher.version(), 1);
        assert!(!rx.has_changed().expect("sender alive"));
    }

    #[test]
    fn traffic_counters_alone_do_not_bump_version() {
        let reconciler = Reconciler::new(SessionId::from("s-1"));
        let mut health = ConnectionHealth::default();
        let mut publisher =
            SnapshotPublisher::new(SnapshotContent::project(reconciler.state(), &health), now());

        health.record_message(now());
        health.record_pong(now());
        assert_eq!(
            publisher.publish(SnapshotContent::project(reconciler.state(), &health), now()),
            None
        );

        health.mark_connected(now());
        assert_eq!(
            publisher.publish(SnapshotContent::project(reconciler.state(), &health), now()),
            Some(1)
        );
    }

    #[test]
    fn consumers_keep_their_snapshot_after_new_versions() {
        let mut reconciler = Reconciler::new(SessionId::from("s-1"));
        let health = ConnectionHealth::default();
        let mut publisher =
            SnapshotPublisher::new(SnapshotContent::project(reconciler.state(), &health), now());
        let held = publisher.current();

        reconciler.apply_all(
            &events(r#"{"categories":{"Drinks":[{"name":"ビール"}]}}"#),
            now(),
        );
        publisher.publish(SnapshotContent::project(reconciler.state(), &health), now());

        assert_eq!(held.version, 0);
        assert!(held.content.categories.is_empty());
        assert_eq!(publisher.current().content.categories.len(), 1);
    }
}
