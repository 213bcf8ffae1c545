#![deny(unsafe_code)]

//! Asynchronous client for ASP.NET Core SignalR-style hubs.
//!
//! This crate implements the hub connection protocol over WebSockets with
//! JSON text frames: HTTP transport negotiation, protocol handshake, framed
//! message exchange, remote invocations with completion tracking, keep-alive
//! pings and graceful close with an optional server-granted reconnect.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hublite::{HubConnection, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = HubConnection::builder("https://example.com/game")
//!         .use_access_token("token")
//!         .build();
//!
//!     connection.on("PlayerJoined", |arguments| {
//!         println!("player joined: {:?}", arguments);
//!     })?;
//!
//!     connection.start().await?;
//!
//!     let pending = connection.invoke("Matchmake", vec![Value::from("eu-west")])?;
//!     let completion = pending.response().await?;
//!     println!("matchmade: {:?}", completion.result);
//!
//!     connection.stop();
//!     Ok(())
//! }
//! ```

mod builder;
mod callback;
mod connection;
mod error;
pub mod messages;
pub mod protocol;
mod transport;
pub mod value;

pub use self::{
    builder::HubConnectionBuilder,
    callback::{CompletionResult, PendingInvocation},
    connection::{ConnectionState, HubConnection},
    error::{InvocationError, RegistrationError, StartError},
    protocol::{HandshakeError, ProtocolError},
    transport::{NegotiateError, TransportError},
    value::{TypeMismatch, Value, ValueKind},
};
