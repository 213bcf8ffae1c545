//! Errors surfaced by the public connection API.

use crate::transport::{NegotiateError, TransportError};
use thiserror::Error;

/// Errors that can occur while establishing a connection.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("negotiate error")]
    Negotiate {
        #[from]
        source: NegotiateError,
    },
    #[error("transport error")]
    Transport {
        #[from]
        source: TransportError,
    },
}

/// Errors that can occur while registering an invocation handler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("event name cannot be empty")]
    EmptyEventName,
    #[error("a handler for event '{0}' has already been registered")]
    DuplicateHandler(String),
}

/// Errors that can occur when invoking a hub method or awaiting its result.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
    #[error("connection dropped before a completion was received")]
    ConnectionDropped,
}
