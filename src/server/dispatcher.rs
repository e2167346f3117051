//! Request dispatch
//!
//! Every accepted connection gets the `accepted` line, then has to send
//! exactly one request line. The request type decides which broker takes over
//! the connection; from then on the broker owns and eventually closes it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::broker::{FetchBroker, RecordSink, Relay, SignalBroker, StreamBroker};
use crate::error::{ProtocolError, Result};
use crate::protocol::{CodecMode, Message, Request, RequestType, ACCEPTED};
use crate::session::Connection;

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Viewer side
    Internal,
    /// Camera agents and user devices
    External,
}

impl Endpoint {
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::Internal => "internal",
            Endpoint::External => "external",
        }
    }

    /// Whether this listener serves the request type
    pub fn accepts(&self, request_type: RequestType) -> bool {
        use RequestType::*;

        match self {
            Endpoint::Internal => matches!(
                request_type,
                StreamRequest | VideoRequest | ApproveUserRequest
            ),
            Endpoint::External => matches!(
                request_type,
                StreamResponse
                    | VideoResponse
                    | Signal
                    | ApproveUserResponse
                    | NewCameraRecord
                    | NewVideoRecord
            ),
        }
    }
}

/// Routes accepted connections to the brokers
#[derive(Clone)]
pub struct Dispatcher {
    streams: StreamBroker,
    videos: FetchBroker,
    approvals: FetchBroker,
    signals: SignalBroker,
    records: Arc<dyn RecordSink>,
    handshake_timeout: Duration,
}

impl Dispatcher {
    pub fn new(relay: &Relay, handshake_timeout: Duration) -> Self {
        Self {
            streams: relay.streams().clone(),
            videos: relay.videos().clone(),
            approvals: relay.approvals().clone(),
            signals: relay.signals().clone(),
            records: relay.records(),
            handshake_timeout,
        }
    }

    /// Greet, read the request and hand the connection to its broker
    pub async fn handle(&self, mut connection: Connection, endpoint: Endpoint) -> Result<()> {
        connection.send_line(ACCEPTED).await?;

        let message = match timeout(self.handshake_timeout, connection.recv_message()).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => return Err(ProtocolError::ConnectionClosed.into()),
            Ok(Err(e)) => {
                connection.close().await;
                return Err(e);
            }
            Err(_) => {
                connection.close().await;
                return Err(ProtocolError::HandshakeTimeout.into());
            }
        };

        let request_type = message.request_type();
        if !endpoint.accepts(request_type) {
            connection.close().await;
            return Err(ProtocolError::WrongEndpoint {
                request_type: request_type.as_str(),
                endpoint: endpoint.name(),
            }
            .into());
        }

        if matches!(
            request_type,
            RequestType::StreamRequest | RequestType::StreamResponse
        ) {
            connection.set_mode(CodecMode::Chunks);
        }

        tracing::debug!(
            connection = %connection.id(),
            peer = %connection.peer(),
            endpoint = endpoint.name(),
            request_type = %request_type,
            "Request accepted"
        );

        self.route(Request::new(message, connection)).await
    }

    async fn route(&self, request: Request) -> Result<()> {
        match request.request_type() {
            RequestType::StreamRequest => self.streams.submit_request(request)?,
            RequestType::StreamResponse => self.streams.submit_source(request)?,
            RequestType::VideoRequest => self.videos.submit_request(request)?,
            RequestType::VideoResponse => self.videos.submit_response(request)?,
            RequestType::ApproveUserRequest => self.approvals.submit_request(request)?,
            RequestType::ApproveUserResponse => self.approvals.submit_response(request)?,
            RequestType::Signal => self.signals.register_connection(request)?,
            RequestType::NewCameraRecord | RequestType::NewVideoRecord => {
                self.store_record(request).await?
            }
        }
        Ok(())
    }

    /// Records need no reply; the connection is closed once stored
    async fn store_record(&self, request: Request) -> Result<()> {
        let (message, mut connection) = request.into_parts();

        let stored = match &message {
            Message::NewCameraRecord {
                camera_name,
                client_id,
            } => self.camera_added(camera_name, client_id.as_deref()).await,
            Message::NewVideoRecord {
                camera_name,
                video_name,
                video_size,
            } => {
                tracing::info!(camera = %camera_name, video = %video_name, "Video recorded");
                self.records
                    .video_added(camera_name, video_name, *video_size)
                    .await
                    .map_err(Into::into)
            }
            _ => Ok(()),
        };

        connection.close().await;
        stored
    }

    async fn camera_added(&self, camera_name: &str, client_id: Option<&str>) -> Result<()> {
        self.records.camera_added(camera_name, client_id).await?;
        if let Some(client_id) = client_id {
            self.signals.add_client(client_id)?;
        }
        self.streams.register_camera(camera_name)?;
        tracing::info!(camera = %camera_name, client_id = ?client_id, "Camera added");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::broker::{BrokerConfig, ClientDirectory, MemoryDirectory, VideoRecord};
    use crate::error::Error;

    async fn setup() -> (Relay, Dispatcher, Arc<MemoryDirectory>) {
        let directory = Arc::new(MemoryDirectory::new());
        let relay = Relay::start(&BrokerConfig::default(), directory.clone());
        let dispatcher = Dispatcher::new(&relay, Duration::from_millis(100));
        (relay, dispatcher, directory)
    }

    async fn connect(line: &str) -> (Connection, DuplexStream) {
        let (local, mut remote) = duplex(4096);
        remote.write_all(line.as_bytes()).await.unwrap();
        remote.write_all(b"\n").await.unwrap();
        (Connection::new(local, "test"), remote)
    }

    async fn read_all(mut remote: DuplexStream) -> String {
        let mut buf = String::new();
        remote.read_to_string(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_endpoint_routing_table() {
        assert!(Endpoint::Internal.accepts(RequestType::StreamRequest));
        assert!(Endpoint::Internal.accepts(RequestType::ApproveUserRequest));
        assert!(!Endpoint::Internal.accepts(RequestType::Signal));
        assert!(Endpoint::External.accepts(RequestType::StreamResponse));
        assert!(Endpoint::External.accepts(RequestType::NewVideoRecord));
        assert!(!Endpoint::External.accepts(RequestType::VideoRequest));
    }

    #[tokio::test]
    async fn test_wrong_endpoint_is_closed() {
        let (relay, dispatcher, _) = setup().await;

        let (connection, remote) =
            connect(r#"{"request_type":"stream_request","camera_name":"cam1"}"#).await;
        let err = dispatcher
            .handle(connection, Endpoint::External)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::WrongEndpoint { .. })
        ));
        assert_eq!(read_all(remote).await, "accepted\n");
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (relay, dispatcher, _) = setup().await;

        let (local, remote) = duplex(4096);
        let err = dispatcher
            .handle(Connection::new(local, "idle"), Endpoint::Internal)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(ProtocolError::HandshakeTimeout)));
        assert_eq!(read_all(remote).await, "accepted\n");
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_request_line() {
        let (relay, dispatcher, _) = setup().await;

        let (connection, _remote) = connect("{not json").await;
        let err = dispatcher
            .handle(connection, Endpoint::Internal)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Json(_)));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_camera_record_registers_everywhere() {
        let (relay, dispatcher, directory) = setup().await;

        let (connection, remote) = connect(
            r#"{"request_type":"new_camera_record","camera_name":"cam3","client_id":"agent-3"}"#,
        )
        .await;
        dispatcher
            .handle(connection, Endpoint::External)
            .await
            .unwrap();

        assert_eq!(read_all(remote).await, "accepted\n");
        assert_eq!(
            directory.client_for_camera("cam3").await.unwrap(),
            Some("agent-3".to_string())
        );
        assert!(relay.streams().channel("cam3").await.unwrap().is_some());
        assert!(relay.signals().client("agent-3").await.unwrap().is_some());
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_camera_agent_gets_first_stream_signal() {
        let (relay, dispatcher, _) = setup().await;

        let (record, _record_remote) = connect(
            r#"{"request_type":"new_camera_record","camera_name":"cam4","client_id":"agent-4"}"#,
        )
        .await;
        dispatcher.handle(record, Endpoint::External).await.unwrap();

        let (viewer, _viewer_remote) =
            connect(r#"{"request_type":"stream_request","camera_name":"cam4"}"#).await;
        dispatcher.handle(viewer, Endpoint::Internal).await.unwrap();

        for _ in 0..200 {
            let client = relay.signals().client("agent-4").await.unwrap();
            if client.is_some_and(|c| c.queued == 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (poll, poll_remote) =
            connect(r#"{"request_type":"signal","client_id":"agent-4"}"#).await;
        dispatcher.handle(poll, Endpoint::External).await.unwrap();
        assert_eq!(
            read_all(poll_remote).await,
            "accepted\n{\"request_type\":\"stream_request\",\"camera_name\":\"cam4\"}\n"
        );
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_video_record_is_stored() {
        let (relay, dispatcher, directory) = setup().await;

        let (connection, _remote) = connect(
            r#"{"request_type":"new_video_record","camera_name":"cam1","video_name":"V9","video_size":10}"#,
        )
        .await;
        dispatcher
            .handle(connection, Endpoint::External)
            .await
            .unwrap();

        assert_eq!(
            directory.videos().await,
            vec![VideoRecord {
                camera_name: "cam1".into(),
                video_name: "V9".into(),
                video_size: Some(10),
            }]
        );
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_video_request_reaches_fetch_broker() {
        let (relay, dispatcher, _) = setup().await;

        let (connection, _remote) =
            connect(r#"{"request_type":"video_request","video_name":"V1"}"#).await;
        dispatcher
            .handle(connection, Endpoint::Internal)
            .await
            .unwrap();

        let snapshot = relay.videos().pending("V1").await.unwrap().unwrap();
        assert_eq!(snapshot.requesters, 1);
        relay.shutdown().await;
    }
}
