use super::{apply_env, apply_file, read_settings_file, websocket_url, Settings, TransportKind};

use std::{
    collections::HashMap,
    env, fs,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use shared::domain::SessionId;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn builds_progress_url_from_http_base() {
    let settings = Settings::default();
    let url = settings
        .progress_url(&SessionId::from("abc-123"))
        .expect("progress url");
    assert_eq!(url.as_str(), "http://127.0.0.1:8000/api/v1/progress/abc-123");
    assert_eq!(
        websocket_url(&url).expect("ws url").as_str(),
        "ws://127.0.0.1:8000/api/v1/progress/abc-123"
    );
}

#[test]
fn event_stream_is_the_default_transport() {
    assert_eq!(Settings::default().transport, TransportKind::EventStream);
    assert_eq!("SSE".parse::<TransportKind>().expect("sse"), TransportKind::EventStream);
    assert_eq!("websocket".parse::<TransportKind>().expect("ws"), TransportKind::WebSocket);
    assert!("carrier-pigeon".parse::<TransportKind>().is_err());
}

#[test]
fn https_base_maps_to_wss_and_tolerates_trailing_slash() {
    let settings = Settings {
        base_url: "https://menu.example.com/api/v1/".into(),
        ..Settings::default()
    };
    let url = settings
        .progress_url(&SessionId::from("s1"))
        .expect("progress url");
    assert_eq!(url.as_str(), "https://menu.example.com/api/v1/progress/s1");
    assert_eq!(
        websocket_url(&url).expect("wss url").as_str(),
        "wss://menu.example.com/api/v1/progress/s1"
    );
    assert_eq!(
        settings
            .pong_url(&SessionId::from("s1"))
            .expect("pong url")
            .as_str(),
        "https://menu.example.com/api/v1/pong/s1"
    );
    assert_eq!(
        settings.health_url().expect("health url").as_str(),
        "https://menu.example.com/api/v1/health"
    );
}

#[test]
fn rejects_non_http_base() {
    let settings = Settings {
        base_url: "ftp://example.com".into(),
        ..Settings::default()
    };
    assert!(settings.progress_url(&SessionId::from("s1")).is_err());
    assert!(settings.health_url().is_err());
}

#[test]
fn reconnect_backoff_grows_linearly_and_caps() {
    let settings = Settings {
        reconnect_delay: Duration::from_millis(400),
        reconnect_delay_max: Duration::from_secs(1),
        ..Settings::default()
    };
    assert_eq!(settings.reconnect_backoff(1), Duration::from_millis(400));
    assert_eq!(settings.reconnect_backoff(2), Duration::from_millis(800));
    assert_eq!(settings.reconnect_backoff(3), Duration::from_secs(1));
    assert_eq!(settings.reconnect_backoff(0), Duration::from_millis(400));
}

#[test]
fn prefixed_env_overrides_win() {
    let mut settings = Settings::default();
    apply_env(
        &mut settings,
        lookup_from(&[
            ("MENU_SYNC_BASE_URL", "http://legacy:1/api"),
            ("APP__BASE_URL", "http://pipeline:9000/api/v1"),
            ("APP__TRANSPORT", "ws"),
            ("APP__STALE_AFTER_SECS", "12"),
            ("APP__ACK_TIMEOUT_MS", "250"),
            ("APP__MAX_RECONNECT_ATTEMPTS", "not-a-number"),
        ]),
    );
    assert_eq!(settings.base_url, "http://pipeline:9000/api/v1");
    assert_eq!(settings.transport, TransportKind::WebSocket);
    assert_eq!(settings.stale_after, Duration::from_secs(12));
    assert_eq!(settings.ack_timeout, Duration::from_millis(250));
    assert_eq!(settings.max_reconnect_attempts, 5);
}

#[test]
fn settings_file_values_apply_over_defaults() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = env::temp_dir().join(format!("menu_sync_config_test_{suffix}"));
    fs::create_dir_all(&temp_root).expect("temp dir");
    let path = temp_root.join("menu_sync.toml");
    fs::write(
        &path,
        "base_url = \"http://file:8000/api/v1\"\nreconnect_delay_ms = 50\nmax_reconnect_attempts = 2\n",
    )
    .expect("write settings");

    let file_cfg = read_settings_file(&path).expect("parsed file");
    let mut settings = Settings::default();
    apply_file(&mut settings, &file_cfg);

    assert_eq!(settings.base_url, "http://file:8000/api/v1");
    assert_eq!(settings.reconnect_delay, Duration::from_millis(50));
    assert_eq!(settings.max_reconnect_attempts, 2);
    assert_eq!(settings.stale_after, Duration::from_secs(30));

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn unreadable_settings_file_is_ignored() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = env::temp_dir().join(format!("menu_sync_config_bad_{suffix}"));
    fs::create_dir_all(&temp_root).expect("temp dir");
    let path = temp_root.join("menu_sync.toml");
    fs::write(&path, "base_url = [unterminated").expect("write settings");

    assert!(read_settings_file(&path).is_none());
    assert!(read_settings_file(&temp_root.join("missing.toml")).is_none());

    fs::remove_dir_all(temp_root).expect("cleanup");
}
