use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use shared::{
    error::{ErrorRecord, SyncError},
    protocol::PingFrame,
};

/// Liveness and traffic counters for one session's channel. Every absorbed error
/// shows up here as data.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub connected: bool,
    /// No traffic of any kind within the liveness window.
    pub stale: bool,
    pub messages_received: u64,
    pub errors: u64,
    pub unrecognized: u64,
    pub pings_received: u64,
    pub pongs_sent: u64,
    pub ack_failures: u64,
    /// Consecutive failed or dropped connections since the last successful open.
    pub reconnect_attempts: u32,
    /// Producer timestamp carried on the latest ping.
    pub last_ping: Option<f64>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_pong_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorRecord>,
}

impl ConnectionHealth {
    pub fn mark_connected(&mut self, at: DateTime<Utc>) {
        self.connected = true;
        self.stale = false;
        self.connected_since = Some(at);
        self.reconnect_attempts = 0;
    }

    pub fn mark_disconnected(&mut self, err: &SyncError, at: DateTime<Utc>) {
        self.connected = false;
        self.connected_since = None;
        self.record_error(err, at);
    }

    pub fn mark_closed(&mut self) {
        self.connected = false;
        self.connected_since = None;
    }

    pub fn record_message(&mut self, at: DateTime<Utc>) {
        self.messages_received += 1;
        self.last_message_at = Some(at);
        self.stale = false;
    }

    pub fn record_error(&mut self, err: &SyncError, at: DateTime<Utc>) {
        self.errors += 1;
        self.last_error = Some(err.record(at));
    }

    /// Kept as the last error without counting as a failure.
    pub fn record_unrecognized(&mut self, err: &SyncError, at: DateTime<Utc>) {
        self.unrecognized += 1;
        self.last_error = Some(err.record(at));
    }

    pub fn record_ping(&mut self, ping: &PingFrame, at: DateTime<Utc>) {
        self.pings_received += 1;
        self.last_ping = ping
            .timestamp
            .or_else(|| Some(at.timestamp_millis() as f64 / 1000.0));
        self.last_ping_at = Some(at);
    }

    pub fn record_pong(&mut self, at: DateTime<Utc>) {
        self.pongs_sent += 1;
        self.last_pong_at = Some(at);
    }

    pub fn record_ack_failure(&mut self, err: &SyncError, at: DateTime<Utc>) {
        self.ack_failures += 1;
        self.record_error(err, at);
    }

    pub fn mark_stale(&mut self, err: &SyncError, at: DateTime<Utc>) {
        self.stale = true;
        self.record_error(err, at);
    }

    pub fn connection_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.connected_since.map(|since| now - since)
    }

    pub fn since_last_message(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_message_at.map(|at| now - at)
    }

    pub fn since_last_ping(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_ping_at.map(|at| now - at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::error::ErrorKind;

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().expect("timestamp")
    }

    #[test]
    fn ping_records_producer_timestamp() {
        let mut health = ConnectionHealth::default();
        health.record_ping(
            &PingFrame {
                timestamp: Some(1700.25),
            },
            at("2024-01-01T00:00:00Z"),
        );
        assert_eq!(health.pings_received, 1);
        assert_eq!(health.last_ping, Some(1700.25));
    }

    #[test]
    fn ping_without_timestamp_uses_receipt_time() {
        let mut health = ConnectionHealth::default();
        health.record_ping(&PingFrame { timestamp: None }, at("1970-01-01T00:00:10Z"));
        assert_eq!(health.last_ping, Some(10.0));
    }

    #[test]
    fn traffic_clears_staleness() {
        let mut health = ConnectionHealth::default();
        let now = at("2024-01-01T00:00:00Z");
        health.mark_stale(
            &SyncError::LivenessTimeout(std::time::Duration::from_secs(30)),
            now,
        );
        assert!(health.stale);
        assert_eq!(
            health.last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::LivenessTimeout)
        );

        health.record_message(now);
        assert!(!health.stale);
        assert_eq!(health.errors, 1);
    }

    #[test]
    fn unrecognized_events_leave_a_protocol_record_without_counting_errors() {
        let mut health = ConnectionHealth::default();
        health.record_unrecognized(
            &SyncError::Protocol("image_generated".into()),
            at("2024-01-01T00:00:00Z"),
        );
        assert_eq!(health.unrecognized, 1);
        assert_eq!(health.errors, 0);
        let record = health.last_error.expect("record");
        assert_eq!(record.kind, ErrorKind::Protocol);
        assert!(record.message.contains("image_generated"));
    }

    #[test]
    fn durations_are_measured_from_recorded_times() {
        let mut health = ConnectionHealth::default();
        health.mark_connected(at("2024-01-01T00:00:00Z"));
        health.record_message(at("2024-01-01T00:00:30Z"));
        let now = at("2024-01-01T00:01:00Z");
        assert_eq!(health.connection_duration(now), Some(Duration::seconds(60)));
        assert_eq!(health.since_last_message(now), Some(Duration::seconds(30)));
        assert_eq!(health.since_last_ping(now), None);
    }
}
