//! Request messages
//!
//! Every request line is a JSON object whose `request_type` field selects the
//! variant. Fields a variant does not know about are ignored; a missing
//! required field or an unknown `request_type` fails to parse.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ProtocolError, Result};

/// Terminal outcome of a fetch, as written back to requesters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestResult {
    Success,
    Failure,
    TimeoutError,
}

impl RequestResult {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestResult::Success => "success",
            RequestResult::Failure => "failure",
            RequestResult::TimeoutError => "timeout_error",
        }
    }
}

impl fmt::Display for RequestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    StreamRequest,
    StreamResponse,
    VideoRequest,
    VideoResponse,
    Signal,
    ApproveUserRequest,
    ApproveUserResponse,
    NewCameraRecord,
    NewVideoRecord,
}

impl RequestType {
    /// Wire name (value of the `request_type` field)
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::StreamRequest => "stream_request",
            RequestType::StreamResponse => "stream_response",
            RequestType::VideoRequest => "video_request",
            RequestType::VideoResponse => "video_response",
            RequestType::Signal => "signal",
            RequestType::ApproveUserRequest => "aprove_user_request",
            RequestType::ApproveUserResponse => "aprove_user_response",
            RequestType::NewCameraRecord => "new_camera_record",
            RequestType::NewVideoRecord => "new_video_record",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum Message {
    /// Viewer wants the live stream of a camera
    StreamRequest { camera_name: String },

    /// Camera agent offers itself as the stream source
    StreamResponse { camera_name: String },

    /// Viewer wants an archived video made available
    VideoRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        camera_name: Option<String>,
        video_name: String,
    },

    /// Camera agent reports the outcome of a video fetch
    VideoResponse {
        video_name: String,
        request_result: RequestResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_size: Option<u64>,
    },

    /// Client opens a long-poll session to collect its signals
    Signal { client_id: String },

    /// A user's device is asked to approve something
    #[serde(rename = "aprove_user_request")]
    ApproveUserRequest { client_id: String },

    /// The user's device answered an approval request
    #[serde(rename = "aprove_user_response")]
    ApproveUserResponse {
        client_id: String,
        request_result: RequestResult,
    },

    /// A camera was added on some agent
    NewCameraRecord {
        camera_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// A video file was recorded on some agent
    NewVideoRecord {
        camera_name: String,
        video_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_size: Option<u64>,
    },
}

impl Message {
    /// Parse and validate one request line
    pub fn parse(line: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(line)?;
        message.validate()?;
        Ok(message)
    }

    /// Serialize to a single JSON line (without terminator)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The variant's discriminant
    pub fn request_type(&self) -> RequestType {
        match self {
            Message::StreamRequest { .. } => RequestType::StreamRequest,
            Message::StreamResponse { .. } => RequestType::StreamResponse,
            Message::VideoRequest { .. } => RequestType::VideoRequest,
            Message::VideoResponse { .. } => RequestType::VideoResponse,
            Message::Signal { .. } => RequestType::Signal,
            Message::ApproveUserRequest { .. } => RequestType::ApproveUserRequest,
            Message::ApproveUserResponse { .. } => RequestType::ApproveUserResponse,
            Message::NewCameraRecord { .. } => RequestType::NewCameraRecord,
            Message::NewVideoRecord { .. } => RequestType::NewVideoRecord,
        }
    }

    /// Camera name, for variants that carry one
    pub fn camera_name(&self) -> Option<&str> {
        match self {
            Message::StreamRequest { camera_name }
            | Message::StreamResponse { camera_name }
            | Message::NewCameraRecord { camera_name, .. }
            | Message::NewVideoRecord { camera_name, .. } => Some(camera_name.as_str()),
            Message::VideoRequest { camera_name, .. } => camera_name.as_deref(),
            _ => None,
        }
    }

    /// Video name, for variants that carry one
    pub fn video_name(&self) -> Option<&str> {
        match self {
            Message::VideoRequest { video_name, .. }
            | Message::VideoResponse { video_name, .. }
            | Message::NewVideoRecord { video_name, .. } => Some(video_name.as_str()),
            _ => None,
        }
    }

    /// Client id, for variants that carry one
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Message::Signal { client_id }
            | Message::ApproveUserRequest { client_id }
            | Message::ApproveUserResponse { client_id, .. } => Some(client_id.as_str()),
            Message::NewCameraRecord { client_id, .. } => client_id.as_deref(),
            _ => None,
        }
    }

    /// Reject empty keys; serde already enforced presence
    fn validate(&self) -> Result<()> {
        let keys = [self.camera_name(), self.video_name(), self.client_id()];
        if keys.iter().flatten().any(|key| key.trim().is_empty()) {
            return Err(Error::Protocol(ProtocolError::InvalidRequest(
                "request key must not be empty",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_request() {
        let message = Message::parse(r#"{"request_type":"stream_request","camera_name":"cam1"}"#)
            .unwrap();

        assert_eq!(
            message,
            Message::StreamRequest {
                camera_name: "cam1".into()
            }
        );
        assert_eq!(message.request_type(), RequestType::StreamRequest);
        assert_eq!(message.camera_name(), Some("cam1"));
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let message = Message::parse(
            r#"{"request_type":"video_response","video_name":"V1","request_result":"success","extra":true}"#,
        )
        .unwrap();

        assert_eq!(
            message,
            Message::VideoResponse {
                video_name: "V1".into(),
                request_result: RequestResult::Success,
                video_size: None,
            }
        );
    }

    #[test]
    fn test_parse_approval_keeps_wire_spelling() {
        let message =
            Message::parse(r#"{"request_type":"aprove_user_request","client_id":"u1"}"#).unwrap();

        assert_eq!(message.request_type(), RequestType::ApproveUserRequest);
        assert_eq!(
            message.to_line().unwrap(),
            r#"{"request_type":"aprove_user_request","client_id":"u1"}"#
        );
    }

    #[test]
    fn test_parse_rejects_bad_requests() {
        // unknown type
        assert!(Message::parse(r#"{"request_type":"reboot"}"#).is_err());
        // missing required field
        assert!(Message::parse(r#"{"request_type":"stream_request"}"#).is_err());
        // bad result value
        assert!(Message::parse(
            r#"{"request_type":"video_response","video_name":"V1","request_result":"maybe"}"#
        )
        .is_err());
        // empty key
        assert!(Message::parse(r#"{"request_type":"signal","client_id":""}"#).is_err());
        assert!(Message::parse("not json").is_err());
    }

    #[test]
    fn test_serialize_skips_absent_optionals() {
        let message = Message::VideoRequest {
            camera_name: None,
            video_name: "V1".into(),
        };

        assert_eq!(
            message.to_line().unwrap(),
            r#"{"request_type":"video_request","video_name":"V1"}"#
        );
    }

    #[test]
    fn test_result_strings() {
        assert_eq!(RequestResult::Success.as_str(), "success");
        assert_eq!(RequestResult::Failure.to_string(), "failure");
        assert_eq!(RequestResult::TimeoutError.as_str(), "timeout_error");
        assert_eq!(RequestType::NewVideoRecord.to_string(), "new_video_record");
    }
}
