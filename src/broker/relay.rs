//! The running set of brokers
//!
//! One `Relay` per process. It wires the brokers to each other and to the
//! external collaborators, runs their workers under one cancellation token,
//! and hands out the handles the dispatcher routes to.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::config::BrokerConfig;
use super::directory::{CameraRoster, ClientDirectory, RecordSink};
use super::fetch::{FetchBroker, FetchKind};
use super::signal::SignalBroker;
use super::stream::StreamBroker;
use super::tasks::TaskGroup;

/// Handles to every broker plus their running workers
pub struct Relay {
    streams: StreamBroker,
    videos: FetchBroker,
    approvals: FetchBroker,
    signals: SignalBroker,
    records: Arc<dyn RecordSink>,
    shutdown: CancellationToken,
    workers: TaskGroup,
}

impl Relay {
    /// Start all brokers against one directory implementation
    pub fn start<D>(config: &BrokerConfig, directory: Arc<D>) -> Self
    where
        D: CameraRoster + ClientDirectory + RecordSink + 'static,
    {
        let shutdown = CancellationToken::new();
        let mut workers = TaskGroup::new("relay");

        let (signals, signal_worker) = SignalBroker::new(config);
        let (streams, stream_worker) =
            StreamBroker::new(config, signals.clone(), directory.clone(), directory.clone());
        let (videos, video_worker) =
            FetchBroker::new(FetchKind::Video, config, signals.clone(), directory.clone());
        let (approvals, approval_worker) =
            FetchBroker::new(FetchKind::Approval, config, signals.clone(), directory.clone());

        workers.spawn(signal_worker.run(shutdown.clone()));
        workers.spawn(stream_worker.run(shutdown.clone()));
        workers.spawn(video_worker.run(shutdown.clone()));
        workers.spawn(approval_worker.run(shutdown.clone()));

        tracing::info!(
            relay_client = %config.relay_client_id,
            stream_source_timeout_ms = config.stream_source_timeout.as_millis() as u64,
            video_request_timeout_ms = config.video_request_timeout.as_millis() as u64,
            "Relay brokers started"
        );

        Self {
            streams,
            videos,
            approvals,
            signals,
            records: directory,
            shutdown,
            workers,
        }
    }

    pub fn streams(&self) -> &StreamBroker {
        &self.streams
    }

    pub fn videos(&self) -> &FetchBroker {
        &self.videos
    }

    pub fn approvals(&self) -> &FetchBroker {
        &self.approvals
    }

    pub fn signals(&self) -> &SignalBroker {
        &self.signals
    }

    pub fn records(&self) -> Arc<dyn RecordSink> {
        Arc::clone(&self.records)
    }

    /// Stop every worker and wait for them, including their entity tasks
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while self.workers.reap().await.is_some() {}
        tracing::info!("Relay brokers stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::BrokerError;
    use crate::broker::directory::MemoryDirectory;
    use crate::broker::signal::Signal;
    use crate::protocol::Message;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let directory = Arc::new(MemoryDirectory::new());
        let relay = Relay::start(&BrokerConfig::default(), directory);

        assert!(relay.signals().client("relay").await.unwrap().is_some());
        assert_eq!(relay.videos().kind(), FetchKind::Video);
        assert_eq!(relay.approvals().kind(), FetchKind::Approval);

        let signals = relay.signals().clone();
        tokio::time::timeout(Duration::from_secs(1), relay.shutdown())
            .await
            .unwrap();

        let message = Message::StreamRequest {
            camera_name: "cam1".into(),
        };
        assert!(matches!(
            signals.enqueue(Signal::new("relay", message)),
            Err(BrokerError::Closed(_))
        ));
    }
}
