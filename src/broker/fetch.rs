//! Coalesced request/response fetches
//!
//! A fetch asks a remote agent to do something (make a video available, ask a
//! user to approve) and waits for the agent's answer on a separate
//! connection. Requesters asking for the same key while a fetch is pending
//! share it: one upstream signal, one answer, written to all of them.
//!
//! The same machinery serves two kinds of fetch:
//!
//! | kind       | request               | response               | key          |
//! |------------|-----------------------|------------------------|--------------|
//! | `Video`    | `video_request`       | `video_response`       | `video_name` |
//! | `Approval` | `aprove_user_request` | `aprove_user_response` | `client_id`  |
//!
//! Finished entries linger until the next garbage-collection tick.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Message, Request, RequestResult, RequestType};
use crate::session::Connection;

use super::config::BrokerConfig;
use super::directory::ClientDirectory;
use super::error::BrokerError;
use super::signal::{Signal, SignalBroker};
use super::tasks::TaskGroup;

/// What a [`FetchBroker`] coalesces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    /// Archived video made available by a camera agent
    Video,
    /// User approval answered by the user's device
    Approval,
}

impl FetchKind {
    pub fn name(&self) -> &'static str {
        match self {
            FetchKind::Video => "video",
            FetchKind::Approval => "approval",
        }
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            FetchKind::Video => RequestType::VideoRequest,
            FetchKind::Approval => RequestType::ApproveUserRequest,
        }
    }

    pub fn response_type(&self) -> RequestType {
        match self {
            FetchKind::Video => RequestType::VideoResponse,
            FetchKind::Approval => RequestType::ApproveUserResponse,
        }
    }

    fn request_key(&self, message: &Message) -> Option<String> {
        match (self, message) {
            (FetchKind::Video, Message::VideoRequest { video_name, .. }) => Some(video_name.clone()),
            (FetchKind::Approval, Message::ApproveUserRequest { client_id }) => {
                Some(client_id.clone())
            }
            _ => None,
        }
    }

    fn response_key(&self, message: &Message) -> Option<(String, RequestResult)> {
        match (self, message) {
            (
                FetchKind::Video,
                Message::VideoResponse {
                    video_name,
                    request_result,
                    ..
                },
            ) => Some((video_name.clone(), *request_result)),
            (
                FetchKind::Approval,
                Message::ApproveUserResponse {
                    client_id,
                    request_result,
                },
            ) => Some((client_id.clone(), *request_result)),
            _ => None,
        }
    }
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time view of one fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSnapshot {
    pub key: String,
    /// Requesters still waiting for the answer
    pub requesters: usize,
    /// The answer is known and has been handed out
    pub done: bool,
    pub response: Option<RequestResult>,
}

enum Control {
    Snapshot {
        key: String,
        reply: oneshot::Sender<Option<FetchSnapshot>>,
    },
}

enum FetchEvent {
    Resolved {
        key: String,
        generation: u64,
        result: RequestResult,
    },
}

/// Handle to one fetch broker
#[derive(Debug, Clone)]
pub struct FetchBroker {
    kind: FetchKind,
    requests: mpsc::UnboundedSender<Request>,
    responses: mpsc::UnboundedSender<Request>,
    control: mpsc::UnboundedSender<Control>,
}

impl FetchBroker {
    /// Create the handle and its worker
    pub fn new(
        kind: FetchKind,
        config: &BrokerConfig,
        signals: SignalBroker,
        directory: Arc<dyn ClientDirectory>,
    ) -> (Self, FetchWorker) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = FetchWorker {
            kind,
            pending: HashMap::new(),
            requests: requests_rx,
            responses: responses_rx,
            control: control_rx,
            events_tx,
            events: events_rx,
            signals,
            directory,
            request_timeout: config.video_request_timeout,
            gc_interval: config.gc_interval,
            relay_client_id: config.relay_client_id.clone(),
            tasks: TaskGroup::new(kind.name()),
            next_generation: 0,
        };

        let handle = Self {
            kind,
            requests: requests_tx,
            responses: responses_tx,
            control: control_tx,
        };

        (handle, worker)
    }

    pub fn kind(&self) -> FetchKind {
        self.kind
    }

    /// Hand over a requester
    pub fn submit_request(&self, request: Request) -> Result<(), BrokerError> {
        self.expect_type(&request, self.kind.request_type())?;
        self.requests
            .send(request)
            .map_err(|_| BrokerError::Closed(self.kind.name()))
    }

    /// Hand over the upstream answer
    pub fn submit_response(&self, response: Request) -> Result<(), BrokerError> {
        self.expect_type(&response, self.kind.response_type())?;
        self.responses
            .send(response)
            .map_err(|_| BrokerError::Closed(self.kind.name()))
    }

    /// Snapshot of the fetch for `key`, `None` if there is no entry
    pub async fn pending(&self, key: &str) -> Result<Option<FetchSnapshot>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot {
                key: key.to_owned(),
                reply,
            })
            .map_err(|_| BrokerError::Closed(self.kind.name()))?;
        rx.await.map_err(|_| BrokerError::Closed(self.kind.name()))
    }

    fn expect_type(&self, request: &Request, expected: RequestType) -> Result<(), BrokerError> {
        if request.request_type() == expected {
            Ok(())
        } else {
            Err(BrokerError::UnexpectedRequest {
                broker: self.kind.name(),
                request_type: request.request_type(),
            })
        }
    }
}

struct PendingFetch {
    key: String,
    generation: u64,
    requesters: Vec<Connection>,
    /// Taken by the first response
    response_slot: Option<oneshot::Sender<RequestResult>>,
    response: Option<RequestResult>,
    task_done: bool,
    task: Option<JoinHandle<()>>,
}

impl PendingFetch {
    fn snapshot(&self) -> FetchSnapshot {
        FetchSnapshot {
            key: self.key.clone(),
            requesters: self.requesters.len(),
            done: self.task_done,
            response: self.response,
        }
    }
}

/// Wait for the answer; no answer in time is a `timeout_error`
async fn resolve(
    key: String,
    generation: u64,
    slot: oneshot::Receiver<RequestResult>,
    wait: Duration,
    events: mpsc::UnboundedSender<FetchEvent>,
) {
    let result = match timeout(wait, slot).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) | Err(_) => RequestResult::TimeoutError,
    };
    let _ = events.send(FetchEvent::Resolved {
        key,
        generation,
        result,
    });
}

/// Write the result line to every requester and close them
async fn deliver(kind: FetchKind, result: RequestResult, requesters: Vec<Connection>) {
    for mut requester in requesters {
        if let Err(e) = requester.send_line(result.as_str()).await {
            tracing::debug!(
                kind = %kind,
                requester = %requester.id(),
                error = %e,
                "Could not deliver fetch result"
            );
        }
        requester.close().await;
    }
}

/// Owner of one fetch table
pub struct FetchWorker {
    kind: FetchKind,
    pending: HashMap<String, PendingFetch>,
    requests: mpsc::UnboundedReceiver<Request>,
    responses: mpsc::UnboundedReceiver<Request>,
    control: mpsc::UnboundedReceiver<Control>,
    events_tx: mpsc::UnboundedSender<FetchEvent>,
    events: mpsc::UnboundedReceiver<FetchEvent>,
    signals: SignalBroker,
    directory: Arc<dyn ClientDirectory>,
    request_timeout: Duration,
    gc_interval: Duration,
    relay_client_id: String,
    tasks: TaskGroup,
    next_generation: u64,
}

impl FetchWorker {
    /// Serve requests, responses and GC ticks until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut gc = interval_at(Instant::now() + self.gc_interval, self.gc_interval);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(kind = %self.kind, "Fetch broker started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                Some(request) = self.requests.recv() => self.on_request(request).await,
                Some(response) = self.responses.recv() => self.on_response(response),
                Some(event) = self.events.recv() => self.on_event(event).await,
                Some(command) = self.control.recv() => self.on_control(command),
                _ = gc.tick() => self.collect_garbage(),
                Some(()) = self.tasks.reap(), if !self.tasks.is_empty() => {}
            }
        }

        self.stop().await;
    }

    async fn on_request(&mut self, request: Request) {
        let (message, requester) = request.into_parts();
        let Some(key) = self.kind.request_key(&message) else {
            self.tasks.close_later(requester);
            return;
        };

        if let Some(fetch) = self.pending.get_mut(&key) {
            if !fetch.task_done {
                tracing::debug!(
                    kind = %self.kind,
                    key = %key,
                    requester = %requester.id(),
                    "Joined pending fetch"
                );
                fetch.requesters.push(requester);
                return;
            }
        }

        // no entry, or a finished one the collector has not removed yet
        self.signal_upstream(message).await;

        self.next_generation += 1;
        let generation = self.next_generation;
        let (slot_tx, slot_rx) = oneshot::channel();
        let task = tokio::spawn(resolve(
            key.clone(),
            generation,
            slot_rx,
            self.request_timeout,
            self.events_tx.clone(),
        ));

        tracing::info!(kind = %self.kind, key = %key, "Fetch started");
        self.pending.insert(
            key.clone(),
            PendingFetch {
                key,
                generation,
                requesters: vec![requester],
                response_slot: Some(slot_tx),
                response: None,
                task_done: false,
                task: Some(task),
            },
        );
    }

    /// Forward the request to whichever client can answer it
    async fn signal_upstream(&self, message: Message) {
        let client_id = match &message {
            Message::VideoRequest {
                camera_name: Some(camera_name),
                ..
            } => match self.directory.client_for_camera(camera_name).await {
                Ok(Some(client_id)) => client_id,
                Ok(None) => self.relay_client_id.clone(),
                Err(e) => {
                    tracing::warn!(camera = %camera_name, error = %e, "Client lookup failed");
                    self.relay_client_id.clone()
                }
            },
            Message::ApproveUserRequest { client_id } => client_id.clone(),
            _ => self.relay_client_id.clone(),
        };

        if let Err(e) = self.signals.enqueue(Signal::new(client_id, message)) {
            tracing::warn!(kind = %self.kind, error = %e, "Could not signal fetch upstream");
        }
    }

    fn on_response(&mut self, response: Request) {
        let (message, connection) = response.into_parts();
        self.tasks.close_later(connection);

        let Some((key, result)) = self.kind.response_key(&message) else {
            return;
        };

        let slot = self
            .pending
            .get_mut(&key)
            .filter(|fetch| !fetch.task_done)
            .map(|fetch| fetch.response_slot.take());

        match slot {
            Some(Some(slot)) => {
                tracing::debug!(kind = %self.kind, key = %key, result = %result, "Fetch answered");
                // a send error means the wait already timed out
                let _ = slot.send(result);
            }
            Some(None) => {
                tracing::debug!(kind = %self.kind, key = %key, "Duplicate fetch response ignored");
            }
            None => {
                tracing::warn!(kind = %self.kind, key = %key, "Response for unknown fetch dropped");
            }
        }
    }

    async fn on_event(&mut self, event: FetchEvent) {
        let FetchEvent::Resolved {
            key,
            generation,
            result,
        } = event;

        let Some(fetch) = self.pending.get_mut(&key) else {
            return;
        };
        if fetch.generation != generation {
            return;
        }

        if let Some(task) = fetch.task.take() {
            let _ = task.await;
        }
        fetch.response = Some(result);
        fetch.response_slot = None;
        fetch.task_done = true;
        let requesters = std::mem::take(&mut fetch.requesters);

        tracing::info!(
            kind = %self.kind,
            key = %key,
            result = %result,
            requesters = requesters.len(),
            "Fetch resolved"
        );
        self.tasks.spawn(deliver(self.kind, result, requesters));
    }

    fn on_control(&mut self, command: Control) {
        match command {
            Control::Snapshot { key, reply } => {
                let _ = reply.send(self.pending.get(&key).map(PendingFetch::snapshot));
            }
        }
    }

    /// Drop finished fetches; pending ones are never touched
    fn collect_garbage(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, fetch| !fetch.task_done);
        let removed = before - self.pending.len();
        if removed > 0 {
            tracing::debug!(kind = %self.kind, removed, "Collected finished fetches");
        }
    }

    async fn stop(mut self) {
        for (_, fetch) in self.pending.drain() {
            if let Some(task) = fetch.task {
                task.abort();
                let _ = task.await;
            }
        }
        self.tasks.shutdown().await;
        tracing::debug!(kind = %self.kind, "Fetch broker stopped");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    use super::*;
    use crate::broker::directory::MemoryDirectory;

    struct Harness {
        videos: FetchBroker,
        approvals: FetchBroker,
        signals: SignalBroker,
        shutdown: CancellationToken,
    }

    async fn harness(config: BrokerConfig) -> Harness {
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_camera("cam1", Some("agent-1".into())).await;

        let config = config.known_client("agent-1").known_client("u1");
        let shutdown = CancellationToken::new();
        let (signals, signal_worker) = SignalBroker::new(&config);
        let (videos, video_worker) =
            FetchBroker::new(FetchKind::Video, &config, signals.clone(), directory.clone());
        let (approvals, approval_worker) =
            FetchBroker::new(FetchKind::Approval, &config, signals.clone(), directory);
        tokio::spawn(signal_worker.run(shutdown.clone()));
        tokio::spawn(video_worker.run(shutdown.clone()));
        tokio::spawn(approval_worker.run(shutdown.clone()));

        Harness {
            videos,
            approvals,
            signals,
            shutdown,
        }
    }

    fn request(message: Message) -> (Request, DuplexStream) {
        let (local, remote) = duplex(4096);
        (Request::new(message, Connection::new(local, "requester")), remote)
    }

    fn video_request(video: &str) -> (Request, DuplexStream) {
        request(Message::VideoRequest {
            camera_name: None,
            video_name: video.into(),
        })
    }

    fn video_response(video: &str, result: RequestResult) -> (Request, DuplexStream) {
        request(Message::VideoResponse {
            video_name: video.into(),
            request_result: result,
            video_size: Some(2048),
        })
    }

    async fn read_all(mut remote: DuplexStream) -> String {
        let mut buf = String::new();
        remote.read_to_string(&mut buf).await.unwrap();
        buf
    }

    async fn wait_fetch<F>(broker: &FetchBroker, key: &str, done: F) -> Option<FetchSnapshot>
    where
        F: Fn(Option<&FetchSnapshot>) -> bool,
    {
        for _ in 0..200 {
            let snapshot = broker.pending(key).await.unwrap();
            if done(snapshot.as_ref()) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("fetch {key} never reached the expected state");
    }

    async fn queued_for(signals: &SignalBroker, client_id: &str) -> usize {
        for _ in 0..200 {
            let queued = signals.client(client_id).await.unwrap().unwrap().queued;
            if queued > 0 {
                return queued;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        0
    }

    #[tokio::test]
    async fn test_success_reaches_every_requester() {
        let config = BrokerConfig::default().gc_interval(Duration::from_millis(100));
        let h = harness(config).await;

        let (first, first_remote) = video_request("V1");
        let (second, second_remote) = video_request("V1");
        h.videos.submit_request(first).unwrap();
        h.videos.submit_request(second).unwrap();
        wait_fetch(&h.videos, "V1", |f| f.is_some_and(|f| f.requesters == 2)).await;

        let (response, response_remote) = video_response("V1", RequestResult::Success);
        h.videos.submit_response(response).unwrap();

        assert_eq!(read_all(first_remote).await, "success\n");
        assert_eq!(read_all(second_remote).await, "success\n");
        assert_eq!(read_all(response_remote).await, "");

        let snapshot = h.videos.pending("V1").await.unwrap();
        if let Some(snapshot) = snapshot {
            assert!(snapshot.done);
            assert_eq!(snapshot.response, Some(RequestResult::Success));
        }
        wait_fetch(&h.videos, "V1", |f| f.is_none()).await;
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_no_response_times_out() {
        let config = BrokerConfig::default().video_request_timeout(Duration::from_millis(50));
        let h = harness(config).await;

        let (request, remote) = video_request("V2");
        h.videos.submit_request(request).unwrap();

        assert_eq!(read_all(remote).await, "timeout_error\n");
        let snapshot = h.videos.pending("V2").await.unwrap().unwrap();
        assert!(snapshot.done);
        assert_eq!(snapshot.response, Some(RequestResult::TimeoutError));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let h = harness(BrokerConfig::default()).await;

        let mut remotes = Vec::new();
        for _ in 0..5 {
            let (request, remote) = video_request("V3");
            h.videos.submit_request(request).unwrap();
            remotes.push(remote);
        }
        wait_fetch(&h.videos, "V3", |f| f.is_some_and(|f| f.requesters == 5)).await;
        assert_eq!(queued_for(&h.signals, "relay").await, 1);

        let (response, _response_remote) = video_response("V3", RequestResult::Failure);
        h.videos.submit_response(response).unwrap();

        for remote in remotes {
            assert_eq!(read_all(remote).await, "failure\n");
        }
        assert_eq!(h.signals.client("relay").await.unwrap().unwrap().queued, 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_gc_keeps_pending_fetches() {
        let config = BrokerConfig::default().gc_interval(Duration::from_millis(20));
        let h = harness(config).await;

        let (request, _remote) = video_request("V4");
        h.videos.submit_request(request).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = h.videos.pending("V4").await.unwrap().unwrap();
        assert!(!snapshot.done);
        assert_eq!(snapshot.requesters, 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let h = harness(BrokerConfig::default()).await;

        let (response, remote) = video_response("nope", RequestResult::Success);
        h.videos.submit_response(response).unwrap();

        assert_eq!(read_all(remote).await, "");
        assert_eq!(h.videos.pending("nope").await.unwrap(), None);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_video_signal_goes_to_camera_owner() {
        let h = harness(BrokerConfig::default()).await;

        let (request, _remote) = request(Message::VideoRequest {
            camera_name: Some("cam1".into()),
            video_name: "V5".into(),
        });
        h.videos.submit_request(request).unwrap();

        assert_eq!(queued_for(&h.signals, "agent-1").await, 1);
        assert_eq!(h.signals.client("relay").await.unwrap().unwrap().queued, 0);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_approval_round_trip() {
        let h = harness(BrokerConfig::default()).await;

        let (first, first_remote) = request(Message::ApproveUserRequest {
            client_id: "u1".into(),
        });
        let (second, second_remote) = request(Message::ApproveUserRequest {
            client_id: "u1".into(),
        });
        h.approvals.submit_request(first).unwrap();
        h.approvals.submit_request(second).unwrap();
        wait_fetch(&h.approvals, "u1", |f| f.is_some_and(|f| f.requesters == 2)).await;
        assert_eq!(queued_for(&h.signals, "u1").await, 1);

        let (response, _remote) = request(Message::ApproveUserResponse {
            client_id: "u1".into(),
            request_result: RequestResult::Failure,
        });
        h.approvals.submit_response(response).unwrap();

        assert_eq!(read_all(first_remote).await, "failure\n");
        assert_eq!(read_all(second_remote).await, "failure\n");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wrong_kind_is_rejected() {
        let h = harness(BrokerConfig::default()).await;

        let (request, _remote) = video_request("V6");
        assert!(matches!(
            h.approvals.submit_request(request),
            Err(BrokerError::UnexpectedRequest { .. })
        ));
        h.shutdown.cancel();
    }
}
