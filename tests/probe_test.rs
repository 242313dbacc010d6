//! Probe tests against a scripted TCP broker.

use brokerdeck::models::{ConnectionStatus, NewBrokerConfig};
use brokerdeck::probe::ConnectionProbe;
use brokerdeck::store::{ConfigStore, MemoryRepository};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

#[derive(Clone, Copy)]
enum Script {
    Accept,
    /// Answer CONNACK only after the given delay.
    SlowAccept(Duration),
    Refuse,
    /// Read the CONNECT packet and hang up.
    HangUp,
    /// Read the CONNECT packet and never answer.
    Silent,
}

/// Serves one connection according to `script`. Returns the port and a
/// handle yielding whatever the client sent after CONNACK, up to EOF.
async fn scripted_broker(script: Script) -> (u16, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let _ = socket.read(&mut buf).await;

        let connack = match script {
            Script::Accept => CONNACK_ACCEPTED,
            Script::SlowAccept(delay) => {
                tokio::time::sleep(delay).await;
                CONNACK_ACCEPTED
            }
            Script::Refuse => CONNACK_NOT_AUTHORIZED,
            Script::HangUp => return Vec::new(),
            Script::Silent => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return Vec::new();
            }
        };
        if socket.write_all(&connack).await.is_err() {
            return Vec::new();
        }

        let mut received = Vec::new();
        while let Ok(n) = socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    (port, handle)
}

async fn fake_broker(script: Script) -> u16 {
    scripted_broker(script).await.0
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn candidate(port: u16) -> brokerdeck::models::BrokerConfig {
    NewBrokerConfig::new("127.0.0.1", port)
        .into_config(1, time::OffsetDateTime::now_utc())
        .unwrap()
}

#[tokio::test]
async fn accepted_connection_reports_latency() {
    let port = fake_broker(Script::Accept).await;
    let result = ConnectionProbe::default()
        .test(&candidate(port), Duration::from_secs(2))
        .await;

    assert!(result.success, "{:?}", result);
    assert_eq!(result.message, "Connection successful");
    assert!(result.latency_ms.is_some());
}

#[tokio::test]
async fn accepted_connection_is_ended_with_disconnect() {
    let (port, received) = scripted_broker(Script::Accept).await;
    let result = ConnectionProbe::default()
        .test(&candidate(port), Duration::from_secs(2))
        .await;
    assert!(result.success, "{:?}", result);

    let received = tokio::time::timeout(Duration::from_secs(2), received)
        .await
        .expect("connection was never closed")
        .unwrap();
    assert!(
        received.windows(2).any(|w| w == [0xE0, 0x00]),
        "no DISCONNECT in {:02x?}",
        received
    );
}

#[tokio::test]
async fn slow_connack_within_the_deadline_succeeds() {
    let port = fake_broker(Script::SlowAccept(Duration::from_secs(6))).await;
    let mut config = candidate(port);
    config.connect_timeout = 30_000;

    let started = Instant::now();
    let result = ConnectionProbe::default()
        .test(&config, Duration::from_secs(10))
        .await;

    assert!(result.success, "{:?}", result);
    assert_eq!(result.message, "Connection successful");
    assert!(result.latency_ms.unwrap() >= 6_000);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn refused_connack_is_a_transport_failure() {
    let port = fake_broker(Script::Refuse).await;
    let result = ConnectionProbe::default()
        .test(&candidate(port), Duration::from_secs(2))
        .await;

    assert!(!result.success);
    assert!(result.message.starts_with("Connection failed: "), "{}", result.message);
    assert_eq!(result.error_kind, Some("ProbeTransportError"));
}

#[tokio::test]
async fn hang_up_before_connack_is_reported_as_closed() {
    let port = fake_broker(Script::HangUp).await;
    let result = ConnectionProbe::default()
        .test(&candidate(port), Duration::from_secs(2))
        .await;

    assert!(!result.success);
    assert_eq!(result.message, "Connection closed unexpectedly");
    assert_eq!(result.error_kind, Some("ProbeClosedUnexpectedly"));
}

#[tokio::test]
async fn silent_broker_times_out_at_the_deadline() {
    let port = fake_broker(Script::Silent).await;
    let deadline = Duration::from_millis(300);
    let started = Instant::now();
    let result = ConnectionProbe::default().test(&candidate(port), deadline).await;

    assert!(!result.success);
    assert_eq!(result.message, "Connection timeout");
    assert!(started.elapsed() >= deadline);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn failed_probe_is_recorded_on_the_stored_row() {
    let store = ConfigStore::new(Arc::new(MemoryRepository::default())).unwrap();
    let cfg = store
        .create(NewBrokerConfig::new("127.0.0.1", closed_port().await))
        .unwrap();

    let result = ConnectionProbe::new(Duration::from_secs(2))
        .test_and_record(&store, cfg.id)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(
        result.message.contains("Connection failed") || result.message.contains("timeout"),
        "{}",
        result.message
    );
    let row = store.get(cfg.id).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::Error);
    assert_eq!(row.last_error.as_deref(), Some(result.message.as_str()));
}

#[tokio::test]
async fn successful_probe_marks_the_row_connected() {
    let store = ConfigStore::new(Arc::new(MemoryRepository::default())).unwrap();
    let port = fake_broker(Script::Accept).await;
    let cfg = store.create(NewBrokerConfig::new("127.0.0.1", port)).unwrap();

    let result = ConnectionProbe::new(Duration::from_secs(2))
        .test_and_record(&store, cfg.id)
        .await
        .unwrap();

    assert!(result.success, "{:?}", result);
    let row = store.get(cfg.id).unwrap();
    assert_eq!(row.connection_status, ConnectionStatus::Connected);
    assert!(row.last_connected.is_some());
    assert!(row.last_error.is_none());
}

#[tokio::test]
async fn probing_an_unknown_id_is_not_found() {
    let store = ConfigStore::new(Arc::new(MemoryRepository::default())).unwrap();
    let err = ConnectionProbe::default()
        .test_and_record(&store, 42)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");
}
