use std::{collections::HashMap, fmt, fs, path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};
use shared::domain::SessionId;
use url::Url;

pub const SETTINGS_FILE: &str = "menu_sync.toml";

/// How the progress channel is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Server-sent events over a long-lived HTTP GET.
    #[default]
    EventStream,
    WebSocket,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sse" | "event-stream" | "eventstream" => Ok(TransportKind::EventStream),
            "ws" | "websocket" => Ok(TransportKind::WebSocket),
            other => Err(anyhow!("unknown transport {other:?}, expected sse or websocket")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::EventStream => "sse",
            TransportKind::WebSocket => "websocket",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// HTTP base of the pipeline API, e.g. `http://127.0.0.1:8000/api/v1`.
    pub base_url: String,
    pub transport: TransportKind,
    pub stale_after: Duration,
    pub ack_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api/v1".into(),
            transport: TransportKind::default(),
            stale_after: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(10),
            max_reconnect_attempts: 5,
        }
    }
}

impl Settings {
    /// `{base}/progress/{session}`. The websocket transport swaps the scheme itself.
    pub fn progress_url(&self, session_id: &SessionId) -> anyhow::Result<Url> {
        self.endpoint(&["progress", session_id.as_str()])
    }

    pub fn pong_url(&self, session_id: &SessionId) -> anyhow::Result<Url> {
        self.endpoint(&["pong", session_id.as_str()])
    }

    pub fn health_url(&self) -> anyhow::Result<Url> {
        self.endpoint(&["health"])
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = Url::parse(self.base_url.trim())
            .with_context(|| format!("invalid base_url: {}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("base_url must be http or https, got {}", url.scheme()));
        }
        url.path_segments_mut()
            .map_err(|_| anyhow!("base_url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Linear backoff for the given 1-based attempt, capped at `reconnect_delay_max`.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        self.reconnect_delay
            .saturating_mul(attempt.max(1))
            .min(self.reconnect_delay_max)
    }
}

/// Same endpoint with `http`/`https` mapped to `ws`/`wss`.
pub fn websocket_url(url: &Url) -> anyhow::Result<Url> {
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(anyhow!("cannot open a websocket over {other}")),
    };
    let mut url = url.clone();
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {url} to {scheme}"))?;
    Ok(url)
}

/// Defaults, then `menu_sync.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Some(file_cfg) = read_settings_file(Path::new(SETTINGS_FILE)) {
        apply_file(&mut settings, &file_cfg);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn read_settings_file(path: &Path) -> Option<HashMap<String, toml::Value>> {
    let raw = fs::read_to_string(path).ok()?;
    match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
        Ok(file_cfg) => Some(file_cfg),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable settings file");
            None
        }
    }
}

fn apply_file(settings: &mut Settings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_cfg.get("base_url").and_then(toml::Value::as_str) {
        settings.base_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("transport").and_then(toml::Value::as_str) {
        match v.parse::<TransportKind>() {
            Ok(kind) => settings.transport = kind,
            Err(err) => tracing::warn!(error = %err, "ignoring transport setting"),
        }
    }
    if let Some(v) = file_integer(file_cfg, "stale_after_secs") {
        settings.stale_after = Duration::from_secs(v);
    }
    if let Some(v) = file_integer(file_cfg, "ack_timeout_ms") {
        settings.ack_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_integer(file_cfg, "reconnect_delay_ms") {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_integer(file_cfg, "reconnect_delay_max_ms") {
        settings.reconnect_delay_max = Duration::from_millis(v);
    }
    if let Some(v) = file_integer(file_cfg, "max_reconnect_attempts") {
        settings.max_reconnect_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
}

fn file_integer(file_cfg: &HashMap<String, toml::Value>, key: &str) -> Option<u64> {
    file_cfg
        .get(key)
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("MENU_SYNC_BASE_URL") {
        settings.base_url = v;
    }
    if let Some(v) = lookup("APP__BASE_URL") {
        settings.base_url = v;
    }
    if let Some(kind) = lookup("APP__TRANSPORT").and_then(|v| v.parse::<TransportKind>().ok()) {
        settings.transport = kind;
    }

    if let Some(v) = env_integer(&lookup, "APP__STALE_AFTER_SECS") {
        settings.stale_after = Duration::from_secs(v);
    }
    if let Some(v) = env_integer(&lookup, "APP__ACK_TIMEOUT_MS") {
        settings.ack_timeout = Duration::from_millis(v);
    }
    if let Some(v) = env_integer(&lookup, "APP__RECONNECT_DELAY_MS") {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = env_integer(&lookup, "APP__RECONNECT_DELAY_MAX_MS") {
        settings.reconnect_delay_max = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__MAX_RECONNECT_ATTEMPTS") {
        if let Ok(parsed) = v.trim().parse::<u32>() {
            settings.max_reconnect_attempts = parsed;
        }
    }
}

fn env_integer(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key).and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
