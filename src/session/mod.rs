//! Connection handles
//!
//! The relay never owns sockets directly; every accepted socket becomes a
//! [`Connection`] that is handed from the dispatcher to exactly one broker
//! entity at a time.

pub mod connection;

pub use connection::{Connection, ConnectionId, Transport};
