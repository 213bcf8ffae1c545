//! Hub protocol messages and the handshake sub-protocol.
//!
//! Messages are JSON objects discriminated by an integer `type` field and
//! terminated by the record separator (see [`crate::messages`]). The
//! handshake exchange that precedes them uses the same framing but has no
//! `type` field.

use crate::{messages, value::Value};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt::Display;
use thiserror::Error;
use tracing::*;

pub const PROTOCOL_NAME: &str = "json";
pub const PROTOCOL_VERSION: u8 = 1;

pub const WEB_SOCKET_TRANSPORT: &str = "WebSockets";
pub const TEXT_TRANSPORT_FORMAT: &str = "Text";

#[derive(Debug, Serialize_repr, Deserialize_repr, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
    Other = 8,
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Invocation => "Invocation",
            MessageType::StreamItem => "StreamItem",
            MessageType::Completion => "Completion",
            MessageType::StreamInvocation => "StreamInvocation",
            MessageType::CancelInvocation => "CancelInvocation",
            MessageType::Ping => "Ping",
            MessageType::Close => "Close",
            MessageType::Other => "Other",
        };
        write!(f, "{}", name)
    }
}

impl From<u8> for MessageType {
    fn from(i: u8) -> Self {
        match i {
            1 => MessageType::Invocation,
            2 => MessageType::StreamItem,
            3 => MessageType::Completion,
            4 => MessageType::StreamInvocation,
            5 => MessageType::CancelInvocation,
            6 => MessageType::Ping,
            7 => MessageType::Close,
            _ => MessageType::Other,
        }
    }
}

/// Indicates a request to invoke a particular method (the target) with the
/// provided arguments on the remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub r#type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_ids: Option<Vec<String>>,
}

impl Invocation {
    pub fn new(
        invocation_id: Option<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Invocation {
            r#type: MessageType::Invocation,
            invocation_id,
            target: target.into(),
            arguments,
            stream_ids: None,
        }
    }
}

/// Terminates a previous invocation, carrying either a result or an error.
/// The result is absent for void methods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub r#type: MessageType,
    pub invocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Completion {
    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Completion {
            r#type: MessageType::Completion,
            invocation_id: invocation_id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Completion {
            r#type: MessageType::Completion,
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Sent by either party to check that the connection is alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub r#type: MessageType,
}

impl Ping {
    pub fn new() -> Self {
        Ping {
            r#type: MessageType::Ping,
        }
    }
}

impl Default for Ping {
    fn default() -> Self {
        Ping::new()
    }
}

/// Sent when a connection is closed. Contains an error if the close was
/// caused by one, and a flag granting the client one reconnect attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Close {
    pub r#type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
}

impl Close {
    pub fn new() -> Self {
        Close {
            r#type: MessageType::Close,
            error: None,
            allow_reconnect: None,
        }
    }
}

impl Default for Close {
    fn default() -> Self {
        Close::new()
    }
}

/// A parsed protocol message this client acts on.
#[derive(Debug, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    Completion(Completion),
    Ping,
    Close(Close),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {source}")]
    Malformed {
        #[from]
        source: serde_json::Error,
    },
    #[error("fields 'error' and 'result' are mutually exclusive in a completion message")]
    ConflictingCompletion,
}

#[derive(Deserialize)]
struct RoutingData {
    #[serde(rename = "type")]
    message_type: u8,
}

/// Parses a single unterminated frame into a [`HubMessage`].
///
/// Returns `Ok(None)` for message types this client recognizes but does not
/// act on, so that callers can skip them without treating the connection as
/// broken.
pub fn parse_message(payload: &str) -> Result<Option<HubMessage>, ProtocolError> {
    let routing: RoutingData = serde_json::from_str(payload)?;

    match MessageType::from(routing.message_type) {
        MessageType::Invocation => {
            let invocation: Invocation = serde_json::from_str(payload)?;
            Ok(Some(HubMessage::Invocation(invocation)))
        }
        MessageType::Completion => {
            let completion: Completion = serde_json::from_str(payload)?;
            if completion.error.is_some() && completion.result.is_some() {
                return Err(ProtocolError::ConflictingCompletion);
            }
            Ok(Some(HubMessage::Completion(completion)))
        }
        MessageType::Ping => Ok(Some(HubMessage::Ping)),
        MessageType::Close => {
            let close: Close = serde_json::from_str(payload)?;
            Ok(Some(HubMessage::Close(close)))
        }
        unsupported @ (MessageType::StreamItem
        | MessageType::StreamInvocation
        | MessageType::CancelInvocation) => {
            warn!("received unsupported message type '{}'", unsupported);
            Ok(None)
        }
        MessageType::Other => {
            warn!(
                "received unknown message type {}",
                routing.message_type
            );
            Ok(None)
        }
    }
}

/// Parses every terminated frame in `payload`, skipping bad ones.
///
/// A malformed frame is dropped with a warning and does not affect the
/// remaining frames.
pub fn parse_messages(payload: &str) -> Vec<HubMessage> {
    let mut parsed = Vec::new();

    for frame in messages::split_frames(payload) {
        match parse_message(frame) {
            Ok(Some(message)) => parsed.push(message),
            Ok(None) => {}
            Err(error) => warn!(%error, frame, "dropping malformed message"),
        }
    }

    parsed
}

/// Sent by the client to agree on the message format.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    protocol: String,
    version: u8,
}

impl HandshakeRequest {
    pub fn new(protocol: impl ToString) -> Self {
        HandshakeRequest {
            protocol: protocol.to_string(),
            version: PROTOCOL_VERSION,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake rejected by server: {0}")]
    Rejected(String),
    #[error("received unexpected message while waiting for the handshake response")]
    UnexpectedMessage,
    #[error("malformed handshake response: {source}")]
    Malformed {
        #[from]
        source: serde_json::Error,
    },
}

/// Serializes the handshake request frame.
pub fn create_handshake_request() -> Result<String, serde_json::Error> {
    messages::to_json(&HandshakeRequest::new(PROTOCOL_NAME))
}

/// Parses the server's handshake response out of `buffer`.
///
/// Returns `Ok(None)` when no record separator has arrived yet; the caller
/// must keep the buffer and retry once more data is available. On success the
/// returned slice is the unconsumed remainder of the buffer, which may
/// already contain protocol messages.
pub fn parse_handshake_response(buffer: &str) -> Result<Option<&str>, HandshakeError> {
    let position = match buffer.find(messages::RECORD_SEPARATOR) {
        Some(position) => position,
        None => return Ok(None),
    };

    let payload = &buffer[..position];
    let remainder = &buffer[position + messages::RECORD_SEPARATOR.len()..];

    let response: serde_json::Value = serde_json::from_str(payload)?;

    if let Some(error) = response.get("error").and_then(|error| error.as_str()) {
        return Err(HandshakeError::Rejected(error.to_owned()));
    }
    if response.get("type").is_some() {
        return Err(HandshakeError::UnexpectedMessage);
    }

    Ok(Some(remainder))
}

/// Response of the HTTP negotiate step.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub error: Option<String>,
    /// Only present on legacy ASP.NET server generations.
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: Option<serde_json::Value>,
    pub url: Option<String>,
    pub access_token: Option<String>,
    pub connection_id: Option<String>,
    pub connection_token: Option<String>,
    pub available_transports: Option<Vec<TransportSpec>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSpec {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}
