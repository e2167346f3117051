//! Single-flight live stream fan-out
//!
//! One `StreamChannel` per camera. The first viewer of an idle channel
//! starts a fan-out session: one `stream_request` signal goes upstream to the
//! camera's agent, and the session waits for the agent to connect back with a
//! `stream_response`. Every chunk read from that source is written to all
//! viewers. Viewers arriving while the session runs simply join it.
//!
//! ```text
//!  viewer ──┐                      ┌── session task ──────────────┐
//!  viewer ──┼─> StreamWorker ─────>│ wait source (timeout)        │
//!  viewer ──┘        │             │ loop: read chunk, write all  │
//!                    │ signal      │ cleanup: close everything    │
//!                    v             └──────────────────────────────┘
//!              SignalBroker ──> camera agent ──> stream_response
//! ```
//!
//! A session ends when its source times out, the source finishes, or every
//! viewer is gone. The channel then goes idle until the next viewer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Message, Request, RequestType};
use crate::session::{Connection, ConnectionId};

use super::config::{BrokerConfig, RosterRefresh};
use super::directory::{CameraRoster, ClientDirectory};
use super::error::BrokerError;
use super::signal::{Signal, SignalBroker};
use super::tasks::TaskGroup;

const BROKER: &str = "stream";

/// Point-in-time view of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub camera_name: String,
    /// A fan-out session is running
    pub active: bool,
    /// Viewers attached to the running session
    pub viewers: usize,
    /// The running session has its source
    pub source_attached: bool,
    /// Sessions started since the channel was created
    pub sessions: u64,
}

/// Why a fan-out session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanOutEnd {
    /// No source connected in time
    SourceTimeout,
    /// The source sent its end marker or hung up
    SourceEnded,
    /// Reading from the source failed
    SourceFailed,
    /// Every viewer went away
    NoViewers,
    /// The broker stopped waiting for a source
    Abandoned,
}

enum Control {
    RegisterCamera(String),
    Snapshot {
        camera_name: String,
        reply: oneshot::Sender<Option<ChannelSnapshot>>,
    },
}

enum FanOutEvent {
    Finished {
        camera_name: String,
        generation: u64,
        end: FanOutEnd,
        /// Viewers that joined after the session stopped accepting
        orphans: Vec<Connection>,
    },
}

/// Handle to the stream broker
#[derive(Debug, Clone)]
pub struct StreamBroker {
    requests: mpsc::UnboundedSender<Request>,
    sources: mpsc::UnboundedSender<Request>,
    control: mpsc::UnboundedSender<Control>,
}

impl StreamBroker {
    /// Create the handle and its worker
    pub fn new(
        config: &BrokerConfig,
        signals: SignalBroker,
        roster: Arc<dyn CameraRoster>,
        directory: Arc<dyn ClientDirectory>,
    ) -> (Self, StreamWorker) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (sources_tx, sources_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = StreamWorker {
            channels: HashMap::new(),
            requests: requests_rx,
            sources: sources_rx,
            control: control_rx,
            events_tx,
            events: events_rx,
            signals,
            roster,
            directory,
            source_timeout: config.stream_source_timeout,
            write_timeout: config.viewer_write_timeout,
            roster_refresh: config.roster_refresh,
            last_refresh: None,
            tasks: TaskGroup::new(BROKER),
            next_generation: 0,
        };

        let handle = Self {
            requests: requests_tx,
            sources: sources_tx,
            control: control_tx,
        };

        (handle, worker)
    }

    /// Hand over a viewer's `stream_request`
    pub fn submit_request(&self, request: Request) -> Result<(), BrokerError> {
        expect_type(&request, RequestType::StreamRequest)?;
        self.requests
            .send(request)
            .map_err(|_| BrokerError::Closed(BROKER))
    }

    /// Hand over a camera agent's `stream_response`
    pub fn submit_source(&self, response: Request) -> Result<(), BrokerError> {
        expect_type(&response, RequestType::StreamResponse)?;
        self.sources
            .send(response)
            .map_err(|_| BrokerError::Closed(BROKER))
    }

    /// Create an idle channel for a newly announced camera
    pub fn register_camera(&self, camera_name: impl Into<String>) -> Result<(), BrokerError> {
        self.control
            .send(Control::RegisterCamera(camera_name.into()))
            .map_err(|_| BrokerError::Closed(BROKER))
    }

    /// Snapshot of one channel, `None` if the camera is unknown
    pub async fn channel(&self, camera_name: &str) -> Result<Option<ChannelSnapshot>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot {
                camera_name: camera_name.to_owned(),
                reply,
            })
            .map_err(|_| BrokerError::Closed(BROKER))?;
        rx.await.map_err(|_| BrokerError::Closed(BROKER))
    }
}

fn expect_type(request: &Request, expected: RequestType) -> Result<(), BrokerError> {
    if request.request_type() == expected {
        Ok(())
    } else {
        Err(BrokerError::UnexpectedRequest {
            broker: BROKER,
            request_type: request.request_type(),
        })
    }
}

struct FanOutSession {
    generation: u64,
    viewers: mpsc::UnboundedSender<Connection>,
    /// Taken once the source has been handed over
    source: Option<oneshot::Sender<Connection>>,
    task: JoinHandle<()>,
}

/// Per-camera stream state
struct StreamChannel {
    camera_name: String,
    viewer_count: Arc<AtomicUsize>,
    session: Option<FanOutSession>,
    sessions: u64,
}

impl StreamChannel {
    fn new(camera_name: String) -> Self {
        Self {
            camera_name,
            viewer_count: Arc::new(AtomicUsize::new(0)),
            session: None,
            sessions: 0,
        }
    }

    /// Join the running session; hands the viewer back if there is none
    fn join(&mut self, viewer: Connection) -> Result<(), Connection> {
        let Some(session) = &self.session else {
            return Err(viewer);
        };
        match session.viewers.send(viewer) {
            Ok(()) => {
                self.viewer_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::SendError(viewer)) => Err(viewer),
        }
    }

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            camera_name: self.camera_name.clone(),
            active: self.session.is_some(),
            viewers: self.viewer_count.load(Ordering::SeqCst),
            source_attached: self
                .session
                .as_ref()
                .is_some_and(|session| session.source.is_none()),
            sessions: self.sessions,
        }
    }
}

/// Owner of the channel table
pub struct StreamWorker {
    channels: HashMap<String, StreamChannel>,
    requests: mpsc::UnboundedReceiver<Request>,
    sources: mpsc::UnboundedReceiver<Request>,
    control: mpsc::UnboundedReceiver<Control>,
    events_tx: mpsc::UnboundedSender<FanOutEvent>,
    events: mpsc::UnboundedReceiver<FanOutEvent>,
    signals: SignalBroker,
    roster: Arc<dyn CameraRoster>,
    directory: Arc<dyn ClientDirectory>,
    source_timeout: Duration,
    write_timeout: Duration,
    roster_refresh: RosterRefresh,
    last_refresh: Option<Instant>,
    tasks: TaskGroup,
    next_generation: u64,
}

impl StreamWorker {
    /// Serve viewers and sources until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!("Stream broker started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                Some(request) = self.requests.recv() => self.on_request(request).await,
                Some(response) = self.sources.recv() => self.on_source(response),
                Some(event) = self.events.recv() => self.on_event(event).await,
                Some(command) = self.control.recv() => self.on_control(command),
                Some(()) = self.tasks.reap(), if !self.tasks.is_empty() => {}
            }
        }

        self.stop().await;
    }

    async fn on_request(&mut self, request: Request) {
        let (message, viewer) = request.into_parts();
        let Message::StreamRequest { camera_name } = message else {
            self.tasks.close_later(viewer);
            return;
        };

        if !self.channels.contains_key(&camera_name) {
            self.refresh_roster().await;
        }
        if !self.channels.contains_key(&camera_name) {
            tracing::warn!(
                camera = %camera_name,
                viewer = %viewer.id(),
                "Stream request for unknown camera dropped"
            );
            self.tasks.close_later(viewer);
            return;
        }

        self.serve_viewer(&camera_name, viewer).await;
    }

    /// Join the running session or start a new one
    async fn serve_viewer(&mut self, camera_name: &str, viewer: Connection) {
        let Some(channel) = self.channels.get_mut(camera_name) else {
            self.tasks.close_later(viewer);
            return;
        };

        let viewer_id = viewer.id();
        match channel.join(viewer) {
            Ok(()) => {
                tracing::debug!(camera = %camera_name, viewer = %viewer_id, "Viewer joined stream");
            }
            Err(viewer) => self.start_session(camera_name, viewer).await,
        }
    }

    async fn start_session(&mut self, camera_name: &str, viewer: Connection) {
        self.next_generation += 1;
        let generation = self.next_generation;

        // a session that refused the viewer is on its way out
        let stale = self
            .channels
            .get_mut(camera_name)
            .and_then(|channel| channel.session.take());
        if let Some(stale) = stale {
            stale.task.abort();
            let _ = stale.task.await;
            tracing::debug!(
                camera = %camera_name,
                generation = stale.generation,
                "Superseded stream session"
            );
        }

        self.request_upstream(camera_name).await;

        let Some(channel) = self.channels.get_mut(camera_name) else {
            self.tasks.close_later(viewer);
            return;
        };

        let (viewers_tx, viewers_rx) = mpsc::unbounded_channel();
        let (source_tx, source_rx) = oneshot::channel();
        let viewer_id = viewer.id();
        let _ = viewers_tx.send(viewer);
        channel.viewer_count.store(1, Ordering::SeqCst);

        let fan_out = FanOut {
            camera_name: camera_name.to_owned(),
            generation,
            viewers: Vec::new(),
            joins: viewers_rx,
            viewer_count: Arc::clone(&channel.viewer_count),
            write_timeout: self.write_timeout,
            events: self.events_tx.clone(),
        };
        let task = tokio::spawn(fan_out.run(source_rx, self.source_timeout));

        channel.session = Some(FanOutSession {
            generation,
            viewers: viewers_tx,
            source: Some(source_tx),
            task,
        });
        channel.sessions += 1;

        tracing::info!(
            camera = %camera_name,
            generation,
            viewer = %viewer_id,
            "Stream channel started"
        );
    }

    /// Ask the camera's agent to connect back with its stream
    async fn request_upstream(&self, camera_name: &str) {
        let client_id = match self.directory.client_for_camera(camera_name).await {
            Ok(Some(client_id)) => client_id,
            Ok(None) => {
                tracing::warn!(camera = %camera_name, "No client owns this camera, waiting anyway");
                return;
            }
            Err(e) => {
                tracing::warn!(camera = %camera_name, error = %e, "Client lookup failed");
                return;
            }
        };

        let message = Message::StreamRequest {
            camera_name: camera_name.to_owned(),
        };
        if let Err(e) = self.signals.enqueue(Signal::new(client_id, message)) {
            tracing::warn!(camera = %camera_name, error = %e, "Could not signal stream request");
        }
    }

    fn on_source(&mut self, response: Request) {
        let (message, source) = response.into_parts();
        let Message::StreamResponse { camera_name } = message else {
            self.tasks.close_later(source);
            return;
        };

        let waiting = self
            .channels
            .get_mut(&camera_name)
            .and_then(|channel| channel.session.as_mut())
            .and_then(|session| session.source.take());

        match waiting {
            Some(slot) => match slot.send(source) {
                Ok(()) => tracing::debug!(camera = %camera_name, "Stream source attached"),
                Err(source) => {
                    tracing::debug!(camera = %camera_name, "Session ended before its source attached");
                    self.tasks.close_later(source);
                }
            },
            None => {
                tracing::warn!(
                    camera = %camera_name,
                    source = %source.id(),
                    "No session waiting for this stream source"
                );
                self.tasks.close_later(source);
            }
        }
    }

    async fn on_event(&mut self, event: FanOutEvent) {
        let FanOutEvent::Finished {
            camera_name,
            generation,
            end,
            orphans,
        } = event;

        if let Some(channel) = self.channels.get_mut(&camera_name) {
            let current = channel.session.as_ref().map(|s| s.generation) == Some(generation);
            if current {
                if let Some(session) = channel.session.take() {
                    let _ = session.task.await;
                }
                channel.viewer_count.store(0, Ordering::SeqCst);
                tracing::info!(camera = %camera_name, generation, ?end, "Stream channel idle");
            }
        }

        for viewer in orphans {
            self.serve_viewer(&camera_name, viewer).await;
        }
    }

    fn on_control(&mut self, command: Control) {
        match command {
            Control::RegisterCamera(camera_name) => {
                if !self.channels.contains_key(&camera_name) {
                    tracing::info!(camera = %camera_name, "Camera registered");
                    self.channels
                        .insert(camera_name.clone(), StreamChannel::new(camera_name));
                }
            }
            Control::Snapshot { camera_name, reply } => {
                let _ = reply.send(self.channels.get(&camera_name).map(StreamChannel::snapshot));
            }
        }
    }

    /// Add channels for every active camera not yet known
    async fn refresh_roster(&mut self) {
        if let (RosterRefresh::AtMostEvery { interval }, Some(last)) =
            (self.roster_refresh, self.last_refresh)
        {
            if last.elapsed() < interval {
                tracing::debug!("Roster refresh skipped");
                return;
            }
        }
        self.last_refresh = Some(Instant::now());

        match self.roster.active_cameras().await {
            Ok(cameras) => {
                for camera_name in cameras {
                    self.channels
                        .entry(camera_name.clone())
                        .or_insert_with(|| StreamChannel::new(camera_name));
                }
                tracing::debug!(channels = self.channels.len(), "Camera roster refreshed");
            }
            Err(e) => tracing::warn!(error = %e, "Camera roster refresh failed"),
        }
    }

    async fn stop(mut self) {
        for channel in self.channels.values_mut() {
            if let Some(session) = channel.session.take() {
                session.task.abort();
                let _ = session.task.await;
            }
        }
        self.tasks.shutdown().await;
        tracing::debug!("Stream broker stopped");
    }
}

/// One running fan-out session
struct FanOut {
    camera_name: String,
    generation: u64,
    viewers: Vec<Connection>,
    joins: mpsc::UnboundedReceiver<Connection>,
    viewer_count: Arc<AtomicUsize>,
    write_timeout: Duration,
    events: mpsc::UnboundedSender<FanOutEvent>,
}

impl FanOut {
    async fn run(mut self, source: oneshot::Receiver<Connection>, wait: Duration) {
        let end = match timeout(wait, source).await {
            Ok(Ok(mut source)) => {
                let end = self.pump(&mut source).await;
                source.close().await;
                end
            }
            Ok(Err(_)) => FanOutEnd::Abandoned,
            Err(_) => {
                tracing::warn!(camera = %self.camera_name, "Stream source timed out");
                FanOutEnd::SourceTimeout
            }
        };

        self.finish(end).await;
    }

    /// Copy chunks from the source to every viewer
    async fn pump(&mut self, source: &mut Connection) -> FanOutEnd {
        loop {
            self.accept_joins();
            if self.viewers.is_empty() {
                return FanOutEnd::NoViewers;
            }

            let chunk = match source.read_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return FanOutEnd::SourceEnded,
                Err(e) => {
                    tracing::warn!(camera = %self.camera_name, error = %e, "Stream source read failed");
                    return FanOutEnd::SourceFailed;
                }
            };
            self.broadcast(chunk).await;
        }
    }

    fn accept_joins(&mut self) {
        while let Ok(viewer) = self.joins.try_recv() {
            self.viewers.push(viewer);
        }
    }

    async fn broadcast(&mut self, chunk: Bytes) {
        let mut failed: Vec<ConnectionId> = Vec::new();
        let mut stalled: Vec<ConnectionId> = Vec::new();
        for viewer in &mut self.viewers {
            match timeout(self.write_timeout, viewer.write_chunk(chunk.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(
                        camera = %self.camera_name,
                        viewer = %viewer.id(),
                        error = %e,
                        "Viewer write failed"
                    );
                    failed.push(viewer.id());
                }
                Err(_) => {
                    tracing::debug!(
                        camera = %self.camera_name,
                        viewer = %viewer.id(),
                        "Viewer stalled, dropping it"
                    );
                    stalled.push(viewer.id());
                }
            }
        }

        for id in failed {
            if let Some(mut gone) = self.remove_viewer(id) {
                gone.close().await;
            }
        }
        // a flush would block again; dropping releases the socket
        for id in stalled {
            drop(self.remove_viewer(id));
        }
    }

    fn remove_viewer(&mut self, id: ConnectionId) -> Option<Connection> {
        let position = self.viewers.iter().position(|viewer| viewer.id() == id)?;
        self.viewer_count.fetch_sub(1, Ordering::SeqCst);
        Some(self.viewers.remove(position))
    }

    async fn finish(mut self, end: FanOutEnd) {
        // viewers still queued never saw a source; after a normal end they
        // go back to the broker for a fresh session
        if matches!(end, FanOutEnd::SourceTimeout | FanOutEnd::Abandoned) {
            self.accept_joins();
        }
        for mut viewer in self.viewers.drain(..) {
            viewer.close().await;
        }

        self.joins.close();
        let mut orphans = Vec::new();
        while let Ok(viewer) = self.joins.try_recv() {
            orphans.push(viewer);
        }
        self.viewer_count.store(0, Ordering::SeqCst);

        tracing::debug!(
            camera = %self.camera_name,
            generation = self.generation,
            ?end,
            orphans = orphans.len(),
            "Fan-out finished"
        );

        let _ = self.events.send(FanOutEvent::Finished {
            camera_name: self.camera_name,
            generation: self.generation,
            end,
            orphans,
        });
    }
}
