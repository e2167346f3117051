//! Error types
//!
//! Crate-wide error type used by the codec, the dispatcher and the server.
//! Broker-level failures have their own [`BrokerError`](crate::broker::BrokerError).

use std::io;

use thiserror::Error;

use crate::broker::BrokerError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A request line was not valid JSON for any known request type
    #[error("invalid request: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer violated the line protocol
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration could not be loaded
    #[error("config error: {0}")]
    Config(String),

    /// A broker rejected or could not accept a command
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Line protocol violations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the connection before sending a request
    #[error("connection closed before a request was received")]
    ConnectionClosed,

    /// Peer sent a frame of the wrong kind for the current mode
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    /// Request parsed but carries unusable values
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// Request type not accepted on this listener
    #[error("request type {request_type} not accepted on the {endpoint} listener")]
    WrongEndpoint {
        request_type: &'static str,
        endpoint: &'static str,
    },

    /// No request arrived within the handshake timeout
    #[error("handshake timed out")]
    HandshakeTimeout,
}
