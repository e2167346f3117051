//! Camera stream relay
//!
//! Sits between viewers and camera agents that cannot be reached directly.
//! Viewers connect to the internal listener and ask for a live stream, an
//! archived video, or a user approval. The relay asks the right agent through
//! a queued signal, the agent connects back on the external listener, and the
//! relay pipes the answer (or the stream) to everyone who asked.
//!
//! ```text
//!   viewers ──> internal listener ──┐          ┌── external listener <── agents
//!                                   ▼          ▼
//!                                  Dispatcher (one request line per connection)
//!                                   │
//!            ┌──────────────────────┼──────────────────────┐
//!            ▼                      ▼                      ▼
//!      StreamBroker            FetchBroker            SignalBroker
//!   single-flight fan-out   coalesced fetches    queued long-poll delivery
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use camrelay::broker::MemoryDirectory;
//! use camrelay::server::{RelayConfig, RelayServer};
//!
//! # async fn run() -> camrelay::error::Result<()> {
//! let directory = Arc::new(MemoryDirectory::new());
//! directory.add_camera("cam1", Some("agent-1".into())).await;
//!
//! let server = RelayServer::new(RelayConfig::default(), directory);
//! server
//!     .run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! # }
//! ```

pub mod broker;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use broker::{BrokerConfig, Relay};
pub use error::{Error, Result};
pub use protocol::{Message, Request, RequestResult, RequestType};
pub use server::{RelayConfig, RelayServer};
pub use session::Connection;
