//! End-to-end tests through the WebSocket listener

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use avstream_relay::config::Config;
use avstream_relay::destination::Destination;
use avstream_relay::encoder::{CommandFactory, CommandSpec, TrackLayout};
use avstream_relay::metrics::Metrics;
use avstream_relay::registry::ConnectionRegistry;
use avstream_relay::server::RelayServer;
use avstream_relay::session::SessionSettings;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Writes everything it receives to `<dir>/<port>.bin`
struct FileSink {
    dir: PathBuf,
}

impl CommandFactory for FileSink {
    fn build(&self, destination: &Destination, _tracks: TrackLayout) -> CommandSpec {
        let path = self
            .dir
            .join(format!("{}.bin", destination.port().unwrap_or(0)));
        CommandSpec::new("sh")
            .arg("-c")
            .arg(format!("cat > '{}'", path.display()))
    }
}

struct Relay {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
}

async fn start_relay(dir: PathBuf, max_connections: usize) -> Relay {
    let mut config = Config::default();
    config.relay.max_connections = max_connections;
    config.relay.stdin_grace_ms = 1000;
    config.relay.terminate_grace_ms = 1000;

    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(ConnectionRegistry::new(max_connections, metrics.clone()));
    let settings = SessionSettings::from_config(&config)
        .unwrap()
        .with_factory(Arc::new(FileSink { dir }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);

    let server = Arc::new(RelayServer::new(
        &config,
        settings,
        registry.clone(),
        metrics.clone(),
    ));
    tokio::spawn(server.run(listener, shutdown_tx.subscribe()));

    Relay {
        addr,
        registry,
        metrics,
        shutdown_tx,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    client
}

/// Next JSON text frame from the relay
async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("timed out waiting for relay message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_websocket_relay_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path().to_path_buf(), 10).await;
    let mut client = connect(relay.addr).await;

    client
        .send(Message::Text(
            r#"{"action":"start","destination":"srt://127.0.0.1:9100","config":{"hasAudio":true,"hasVideo":true}}"#
                .to_string(),
        ))
        .await
        .unwrap();
    let started = next_json(&mut client).await;
    assert_eq!(started["type"], "started");
    assert_eq!(
        started["destination"],
        "srt://127.0.0.1:9100?mode=caller&latency=200"
    );

    let mut expected = Vec::new();
    for i in 0..10u8 {
        let frame = vec![0x1a ^ i; 1000];
        expected.extend_from_slice(&frame);
        client.send(Message::Binary(frame)).await.unwrap();
    }
    let metrics = relay.metrics.clone();
    wait_until("frames relayed", || metrics.snapshot().bytes_relayed == 10_000).await;

    client
        .send(Message::Text(r#"{"action":"stop"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut client).await["type"], "stopped");
    assert_eq!(std::fs::read(dir.path().join("9100.bin")).unwrap(), expected);

    client.close(None).await.unwrap();
    let registry = relay.registry.clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection never deregistered");
    assert_eq!(relay.metrics.snapshot().connections_closed, 1);
}

#[tokio::test]
async fn test_malformed_control_keeps_connection() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path().to_path_buf(), 10).await;
    let mut client = connect(relay.addr).await;

    client
        .send(Message::Binary(br#"{"action":"start"}"#.to_vec()))
        .await
        .unwrap();
    let error = next_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["source"], "protocol");

    client
        .send(Message::Text(r#"{"action":"dance"}"#.to_string()))
        .await
        .unwrap();
    let error = next_json(&mut client).await;
    assert_eq!(error["message"], "Unknown action: dance");

    // Still usable afterwards
    client
        .send(Message::Text(r#"{"action":"stop"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut client).await["type"], "stopped");
}

#[tokio::test]
async fn test_wrong_path_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path().to_path_buf(), 10).await;

    let result = connect_async(format!("ws://{}/other", relay.addr)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_connection_limit() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path().to_path_buf(), 1).await;

    let _first = connect(relay.addr).await;
    let registry = relay.registry.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.len().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut second = connect(relay.addr).await;
    let refusal = next_json(&mut second).await;
    assert_eq!(refusal["type"], "error");
    assert!(refusal["message"]
        .as_str()
        .unwrap()
        .contains("Maximum connections reached"));
    assert_eq!(relay.metrics.snapshot().connections_rejected, 1);
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path().to_path_buf(), 10).await;
    let mut client = connect(relay.addr).await;

    client
        .send(Message::Text(
            r#"{"action":"start","destination":"srt://127.0.0.1:9200"}"#.to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(next_json(&mut client).await["type"], "started");

    let _ = relay.shutdown_tx.send(());
    let remaining = relay.registry.shutdown_all(Duration::from_secs(10)).await;
    assert_eq!(remaining, 0);

    let stopped = next_json(&mut client).await;
    assert_eq!(stopped["type"], "stopped");
    assert_eq!(stopped["reason"], "server shutting down");
}
