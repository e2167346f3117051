//! End-to-end tests over loopback TCP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camrelay::broker::{BrokerConfig, MemoryDirectory};
use camrelay::server::{RelayConfig, RelayServer};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestRelay {
    internal: SocketAddr,
    external: SocketAddr,
    stop: oneshot::Sender<()>,
    server: JoinHandle<camrelay::Result<()>>,
}

impl TestRelay {
    async fn start() -> Self {
        Self::start_with(RelayConfig::default()).await
    }

    async fn start_with(config: RelayConfig) -> Self {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = config
            .internal_addr(loopback)
            .external_addr(loopback)
            .broker(
                BrokerConfig::default()
                    .known_client("agent-1")
                    .stream_source_timeout(Duration::from_secs(2))
                    .video_request_timeout(Duration::from_secs(2)),
            );

        let directory = Arc::new(MemoryDirectory::new());
        directory.add_camera("cam1", Some("agent-1".into())).await;

        let server = RelayServer::new(config, directory);
        let listeners = server.bind().await.unwrap();
        let internal = listeners.internal_addr().unwrap();
        let external = listeners.external_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(server.serve(listeners, async {
            let _ = stopped.await;
        }));

        Self {
            internal,
            external,
            stop,
            server,
        }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(2), self.server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

/// Connect, check the greeting and send one request line
async fn open(addr: SocketAddr, request: &str) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);

    let mut greeting = String::new();
    stream.read_line(&mut greeting).await.unwrap();
    assert_eq!(greeting, "accepted\n");

    stream.get_mut().write_all(request.as_bytes()).await.unwrap();
    stream.get_mut().write_all(b"\n").await.unwrap();
    stream
}

async fn read_to_end(mut stream: BufReader<TcpStream>) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Long-poll the agent's signals until one arrives
async fn collect_signals(addr: SocketAddr, client_id: &str) -> Vec<String> {
    let request = format!(r#"{{"request_type":"signal","client_id":"{client_id}"}}"#);
    for _ in 0..100 {
        let session = open(addr, &request).await;
        let body = String::from_utf8(read_to_end(session).await).unwrap();
        if !body.is_empty() {
            return body.lines().map(str::to_owned).collect();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no signal for {client_id}");
}

fn chunk(payload: &[u8]) -> Vec<u8> {
    let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

#[tokio::test]
async fn test_live_stream_through_relay() {
    let relay = TestRelay::start().await;

    let viewer = open(
        relay.internal,
        r#"{"request_type":"stream_request","camera_name":"cam1"}"#,
    )
    .await;

    let signals = collect_signals(relay.external, "agent-1").await;
    assert_eq!(
        signals,
        vec![r#"{"request_type":"stream_request","camera_name":"cam1"}"#.to_string()]
    );

    let mut camera = open(
        relay.external,
        r#"{"request_type":"stream_response","camera_name":"cam1"}"#,
    )
    .await;
    let mut payload = chunk(b"frame-1");
    payload.extend(chunk(b"frame-2"));
    payload.extend(chunk(b""));
    camera.get_mut().write_all(&payload).await.unwrap();

    let received = read_to_end(viewer).await;
    let mut expected = chunk(b"frame-1");
    expected.extend(chunk(b"frame-2"));
    assert_eq!(received, expected);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_video_fetch_through_relay() {
    let relay = TestRelay::start().await;

    let request = r#"{"request_type":"video_request","camera_name":"cam1","video_name":"V1"}"#;
    let first = open(relay.internal, request).await;
    let second = open(relay.internal, request).await;

    let signals = collect_signals(relay.external, "agent-1").await;
    assert_eq!(signals.len(), 1);
    assert!(signals[0].contains(r#""video_name":"V1""#));

    let answer = open(
        relay.external,
        r#"{"request_type":"video_response","video_name":"V1","request_result":"success","video_size":512}"#,
    )
    .await;
    assert!(read_to_end(answer).await.is_empty());

    assert_eq!(read_to_end(first).await, b"success\n");
    assert_eq!(read_to_end(second).await, b"success\n");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_wrong_listener_is_refused() {
    let relay = TestRelay::start().await;

    let misplaced = open(
        relay.internal,
        r#"{"request_type":"signal","client_id":"agent-1"}"#,
    )
    .await;
    assert!(read_to_end(misplaced).await.is_empty());

    relay.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drops_connections_still_greeting() {
    let relay =
        TestRelay::start_with(RelayConfig::default().handshake_timeout(Duration::from_secs(60)))
            .await;

    // greeted, but the request line never comes
    let stream = TcpStream::connect(relay.internal).await.unwrap();
    let mut idle = BufReader::new(stream);
    let mut greeting = String::new();
    idle.read_line(&mut greeting).await.unwrap();
    assert_eq!(greeting, "accepted\n");

    relay.shutdown().await;

    let mut rest = Vec::new();
    // end of file or reset, either way well before the handshake timeout
    let _ = tokio::time::timeout(Duration::from_secs(2), idle.read_to_end(&mut rest))
        .await
        .unwrap();
    assert!(rest.is_empty());
}
