//! Broker error types

use thiserror::Error;

use crate::protocol::RequestType;

/// Error type for broker operations
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker's worker task has stopped
    #[error("{0} broker is not running")]
    Closed(&'static str),

    /// A request was submitted to a broker that does not handle its type
    #[error("{broker} broker cannot handle {request_type} requests")]
    UnexpectedRequest {
        broker: &'static str,
        request_type: RequestType,
    },

    /// An external collaborator (roster, directory, record store) failed
    #[error("directory error: {0}")]
    Directory(String),
}

impl BrokerError {
    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }
}
