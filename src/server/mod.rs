//! TCP front end
//!
//! - `config`: listener, codec and logging settings
//! - `dispatcher`: greets a connection, reads its request and routes it
//! - `listener`: the two accept loops

pub mod config;
pub mod dispatcher;
pub mod listener;

pub use config::{LogFormat, LoggingConfig, RelayConfig};
pub use dispatcher::{Dispatcher, Endpoint};
pub use listener::{BoundListeners, RelayServer};
