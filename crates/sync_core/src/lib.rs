//! Live progress reconciliation for menu processing sessions.
//!
//! A [`connector::StreamConnector`] owns one event channel per session and feeds a
//! [`reconciler::Reconciler`]; consumers read versioned [`snapshot::ProgressSnapshot`]s.

pub mod config;
pub mod connector;
pub mod event_stream;
pub mod health;
pub mod identity;
pub mod progress;
pub mod reconciler;
pub mod snapshot;

pub use config::{load_settings, Settings, TransportKind};
pub use connector::{
    Acknowledger, EventStreamTransport, FrameStream, HealthCheck, OpenError, ProgressTransport,
    SessionHandle, StreamConnector, WebSocketTransport,
};
pub use health::ConnectionHealth;
pub use reconciler::{reduce, Reconciler, SessionState};
pub use snapshot::{ProgressSnapshot, SnapshotContent, SnapshotPublisher};
