//! Connection brokers
//!
//! Three brokers turn accepted connections into relay work. Each one is a
//! tokio actor: a cheap cloneable handle sends commands to a single worker
//! task, and that worker is the only code that ever touches its entity table.
//! Per-entity jobs (a fan-out session, a fetch timer, a signal delivery) run as
//! their own tasks and report back to the worker through an event queue.
//!
//! # Architecture
//!
//! ```text
//!   Dispatcher
//!       │ submit_request / submit_source / register_connection
//!       ▼
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!  │ StreamWorker │   │ FetchWorker  │   │ SignalWorker │
//!  │ channels     │   │ pending      │   │ clients      │
//!  └──────┬───────┘   └──────┬───────┘   └──────▲───────┘
//!         │ fan-out tasks    │ resolve tasks    │ delivery tasks
//!         └──── enqueue(Signal) ─┴──────────────┘
//! ```
//!
//! Every upstream request goes out as a [`Signal`] through the
//! [`SignalBroker`]; a camera agent or user device picks it up on its next
//! `signal` session and answers on a fresh connection.

pub mod config;
pub mod directory;
pub mod error;
pub mod fetch;
pub mod relay;
pub mod signal;
pub mod stream;
pub mod tasks;

pub use config::{BrokerConfig, RosterRefresh};
pub use directory::{CameraRoster, ClientDirectory, MemoryDirectory, RecordSink, VideoRecord};
pub use error::BrokerError;
pub use fetch::{FetchBroker, FetchKind, FetchSnapshot};
pub use relay::Relay;
pub use signal::{ClientSnapshot, Signal, SignalBroker};
pub use stream::{ChannelSnapshot, StreamBroker};
pub use tasks::TaskGroup;
