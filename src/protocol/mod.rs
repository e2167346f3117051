//! Relay line protocol
//!
//! - `codec`: line / length-prefixed chunk framing
//! - `message`: the JSON request union
//! - `request`: a parsed message together with the connection it arrived on

pub mod codec;
pub mod message;
pub mod request;

pub use codec::{CodecMode, Frame, RelayCodec};
pub use message::{Message, RequestResult, RequestType};
pub use request::Request;

/// Acknowledgement written to every accepted connection
pub const ACCEPTED: &str = "accepted";
