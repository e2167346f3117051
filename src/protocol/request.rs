//! Parsed request plus its connection

use std::time::Instant;

use crate::session::Connection;

use super::message::{Message, RequestType};

/// One accepted request
///
/// The message is immutable once built. The connection travels with it
/// until a broker takes ownership through [`Request::into_parts`].
#[derive(Debug)]
pub struct Request {
    message: Message,
    connection: Connection,
    created: Instant,
}

impl Request {
    /// Build a request; no I/O happens here
    pub fn new(message: Message, connection: Connection) -> Self {
        Self {
            message,
            connection,
            created: Instant::now(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn request_type(&self) -> RequestType {
        self.message.request_type()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// When the request was built
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Split into message and connection
    pub fn into_parts(self) -> (Message, Connection) {
        (self.message, self.connection)
    }
}
