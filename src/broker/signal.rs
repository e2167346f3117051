//! Addressed push signaling
//!
//! Every known client owns a FIFO of pending signals. A client collects them
//! by opening a `signal` session (long-poll): the worker hands the whole queue
//! to a delivery task which writes each signal as one JSON line and closes the
//! connection once nothing is left. Signals that arrive while a session is
//! running go straight into that session's outbox.
//!
//! A failed write ends the session early. Everything not yet written goes back
//! to the front of the client's queue, in order, for the next registration.
//!
//! Registrations, signals and roster changes share one queue, so the worker
//! applies them in the order a caller issued them.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Message, Request, RequestType};
use crate::session::Connection;

use super::config::BrokerConfig;
use super::error::BrokerError;
use super::tasks::TaskGroup;

const BROKER: &str = "signal";

/// A message addressed to one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub client_id: String,
    pub message: Message,
}

impl Signal {
    pub fn new(client_id: impl Into<String>, message: Message) -> Self {
        Self {
            client_id: client_id.into(),
            message,
        }
    }
}

/// Point-in-time view of one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub client_id: String,
    /// Signals waiting for the next session
    pub queued: usize,
    /// A delivery session is running
    pub delivering: bool,
    /// A registration is waiting for the running session to end
    pub waiting: bool,
    pub dead: bool,
}

enum Command {
    Register(Request),
    Enqueue(Signal),
    AddClient(String),
    MarkDead(String),
}

enum Control {
    Snapshot {
        client_id: String,
        reply: oneshot::Sender<Option<ClientSnapshot>>,
    },
}

enum SessionEvent {
    Drained {
        client_id: String,
        generation: u64,
        unsent: VecDeque<Message>,
    },
}

/// Handle to the signal broker
///
/// Cheap to clone; every clone talks to the same worker.
#[derive(Debug, Clone)]
pub struct SignalBroker {
    commands: mpsc::UnboundedSender<Command>,
    control: mpsc::UnboundedSender<Control>,
}

impl SignalBroker {
    /// Create the handle and its worker; the roster is seeded from the config
    pub fn new(config: &BrokerConfig) -> (Self, SignalWorker) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let clients = config
            .seeded_clients()
            .into_iter()
            .map(|id| (id.clone(), Client::new(id)))
            .collect();

        let worker = SignalWorker {
            clients,
            commands: commands_rx,
            control: control_rx,
            events_tx,
            events: events_rx,
            tasks: TaskGroup::new(BROKER),
            sweep_interval: config.client_sweep_interval,
            next_generation: 0,
        };

        let handle = Self {
            commands: commands_tx,
            control: control_tx,
        };

        (handle, worker)
    }

    /// Attach a client's `signal` connection
    pub fn register_connection(&self, request: Request) -> Result<(), BrokerError> {
        if request.request_type() != RequestType::Signal {
            return Err(BrokerError::UnexpectedRequest {
                broker: BROKER,
                request_type: request.request_type(),
            });
        }
        self.command(Command::Register(request))
    }

    /// Queue a signal for its client
    ///
    /// Signals for unknown clients are logged and dropped by the worker; only
    /// a stopped broker is reported back.
    pub fn enqueue(&self, signal: Signal) -> Result<(), BrokerError> {
        self.command(Command::Enqueue(signal))
    }

    /// Add a client id to the roster
    pub fn add_client(&self, client_id: impl Into<String>) -> Result<(), BrokerError> {
        self.command(Command::AddClient(client_id.into()))
    }

    /// Flag a client dead; the next sweep removes it
    pub fn mark_dead(&self, client_id: impl Into<String>) -> Result<(), BrokerError> {
        self.command(Command::MarkDead(client_id.into()))
    }

    /// Snapshot of one client, `None` if the id is not in the roster
    pub async fn client(&self, client_id: &str) -> Result<Option<ClientSnapshot>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot {
                client_id: client_id.to_owned(),
                reply,
            })
            .map_err(|_| BrokerError::Closed(BROKER))?;
        rx.await.map_err(|_| BrokerError::Closed(BROKER))
    }

    fn command(&self, command: Command) -> Result<(), BrokerError> {
        self.commands
            .send(command)
            .map_err(|_| BrokerError::Closed(BROKER))
    }
}

struct DeliverySession {
    generation: u64,
    outbox: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

struct Client {
    client_id: String,
    signal_queue: VecDeque<Message>,
    /// Registration waiting behind the running session
    connection: Option<Connection>,
    session: Option<DeliverySession>,
    dead: bool,
}

impl Client {
    fn new(client_id: String) -> Self {
        Self {
            client_id,
            signal_queue: VecDeque::new(),
            connection: None,
            session: None,
            dead: false,
        }
    }

    fn push(&mut self, message: Message) {
        match &self.session {
            Some(session) => {
                if let Err(mpsc::error::SendError(message)) = session.outbox.send(message) {
                    // session is draining its last writes
                    self.signal_queue.push_back(message);
                }
            }
            None => self.signal_queue.push_back(message),
        }
    }

    fn start_delivery(
        &mut self,
        connection: Connection,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let pending = self.signal_queue.len();
        for message in self.signal_queue.drain(..) {
            let _ = outbox.send(message);
        }

        tracing::debug!(
            client_id = %self.client_id,
            connection = %connection.id(),
            pending,
            "Signal session started"
        );

        let task = tokio::spawn(deliver(
            self.client_id.clone(),
            generation,
            connection,
            inbox,
            events,
        ));
        self.session = Some(DeliverySession {
            generation,
            outbox,
            task,
        });
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            client_id: self.client_id.clone(),
            queued: self.signal_queue.len(),
            delivering: self.session.is_some(),
            waiting: self.connection.is_some(),
            dead: self.dead,
        }
    }
}

/// Write queued signals until none are left, then close the connection
async fn deliver(
    client_id: String,
    generation: u64,
    mut connection: Connection,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut unsent = VecDeque::new();
    let mut delivered = 0usize;

    while let Ok(message) = inbox.try_recv() {
        if let Err(e) = connection.send_message(&message).await {
            tracing::warn!(
                client_id = %client_id,
                error = %e,
                "Signal delivery failed, keeping the rest queued"
            );
            unsent.push_back(message);
            break;
        }
        delivered += 1;
    }

    inbox.close();
    while let Ok(message) = inbox.try_recv() {
        unsent.push_back(message);
    }
    connection.close().await;

    tracing::debug!(
        client_id = %client_id,
        delivered,
        requeued = unsent.len(),
        "Signal session closed"
    );

    let _ = events.send(SessionEvent::Drained {
        client_id,
        generation,
        unsent,
    });
}

/// Owner of the client table
pub struct SignalWorker {
    clients: HashMap<String, Client>,
    commands: mpsc::UnboundedReceiver<Command>,
    control: mpsc::UnboundedReceiver<Control>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    tasks: TaskGroup,
    sweep_interval: Duration,
    next_generation: u64,
}

impl SignalWorker {
    /// Process registrations, signals and sweeps until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(clients = self.clients.len(), "Signal broker started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(event) = self.events.recv() => self.on_event(event),
                Some(command) = self.control.recv() => self.on_control(command),
                _ = sweep.tick() => self.sweep_dead().await,
                Some(()) = self.tasks.reap(), if !self.tasks.is_empty() => {}
            }
        }

        self.stop().await;
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Register(request) => self.on_register(request),
            Command::Enqueue(signal) => self.on_signal(signal),
            Command::AddClient(client_id) => {
                let client = self
                    .clients
                    .entry(client_id.clone())
                    .or_insert_with(|| Client::new(client_id));
                client.dead = false;
            }
            Command::MarkDead(client_id) => match self.clients.get_mut(&client_id) {
                Some(client) => client.dead = true,
                None => tracing::debug!(client_id = %client_id, "Cannot mark unknown client dead"),
            },
        }
    }

    fn on_register(&mut self, request: Request) {
        let (message, connection) = request.into_parts();
        let Message::Signal { client_id } = message else {
            self.tasks.close_later(connection);
            return;
        };

        let generation = self.generation();
        let Some(client) = self.clients.get_mut(&client_id) else {
            tracing::warn!(client_id = %client_id, "Signal session from unknown client ignored");
            self.tasks.close_later(connection);
            return;
        };

        if client.session.is_some() {
            // picked up when the running session drains
            if let Some(stale) = client.connection.replace(connection) {
                self.tasks.close_later(stale);
            }
            return;
        }

        client.start_delivery(connection, generation, self.events_tx.clone());
    }

    fn on_signal(&mut self, signal: Signal) {
        match self.clients.get_mut(&signal.client_id) {
            Some(client) => client.push(signal.message),
            None => {
                tracing::warn!(
                    client_id = %signal.client_id,
                    request_type = %signal.message.request_type(),
                    "Signal for unknown client dropped"
                );
            }
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        let SessionEvent::Drained {
            client_id,
            generation,
            unsent,
        } = event;

        let next = self.generation();
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        if client.session.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        client.session = None;

        for message in unsent.into_iter().rev() {
            client.signal_queue.push_front(message);
        }

        if let Some(connection) = client.connection.take() {
            client.start_delivery(connection, next, self.events_tx.clone());
        }
    }

    fn on_control(&mut self, command: Control) {
        match command {
            Control::Snapshot { client_id, reply } => {
                let _ = reply.send(self.clients.get(&client_id).map(Client::snapshot));
            }
        }
    }

    async fn sweep_dead(&mut self) {
        let dead: Vec<String> = self
            .clients
            .values()
            .filter(|client| client.dead)
            .map(|client| client.client_id.clone())
            .collect();

        for client_id in dead {
            let Some(mut client) = self.clients.remove(&client_id) else {
                continue;
            };
            if let Some(session) = client.session.take() {
                session.task.abort();
                let _ = session.task.await;
            }
            if let Some(connection) = client.connection.take() {
                self.tasks.close_later(connection);
            }
            tracing::info!(
                client_id = %client_id,
                dropped_signals = client.signal_queue.len(),
                "Dead client removed"
            );
        }
    }

    async fn stop(mut self) {
        for (_, mut client) in self.clients.drain() {
            if let Some(session) = client.session.take() {
                session.task.abort();
                let _ = session.task.await;
            }
        }
        self.tasks.shutdown().await;
        tracing::debug!("Signal broker stopped");
    }
}
