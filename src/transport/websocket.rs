//! WebSocket socket lifecycle and the connection's receive/send loop.

use crate::connection::TransportHandle;
use crate::transport::{error::TransportError, TransportCommand};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::*;

pub(crate) type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Rewrites an HTTP(S) url into its WebSocket equivalent.
pub(crate) fn to_websocket_url(url: &str) -> String {
    let trimmed = url.trim();
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_owned()
    }
}

/// Opens the WebSocket with the supplied custom headers, bounded by `timeout`.
pub(crate) async fn connect(
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<WebSocket, TransportError> {
    let mut request = url.into_client_request()?;

    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader { name: name.clone() })?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidHeader { name: name.clone() })?;
        request.headers_mut().insert(header_name, header_value);
    }

    match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok((websocket, _))) => Ok(websocket),
        Ok(Err(source)) => Err(TransportError::Websocket { source }),
        Err(_) => Err(TransportError::ConnectTimeout(timeout)),
    }
}

/// Runs one connection's transport loop until the socket goes away.
///
/// All socket events are handled here, in arrival order, on this task. The
/// keep-alive timer lives here as well so that pings keep flowing while the
/// receive side is idle.
pub(crate) async fn run(
    mut websocket: WebSocket,
    handle: TransportHandle,
    commands: flume::Receiver<TransportCommand>,
    keep_alive_interval: Duration,
    handshake_timeout: Duration,
) {
    handle.handle_connected();

    let mut keep_alive = interval_at(
        Instant::now() + keep_alive_interval,
        keep_alive_interval,
    );
    let handshake_deadline = tokio::time::sleep(handshake_timeout);
    tokio::pin!(handshake_deadline);

    let (code, reason, was_clean) = loop {
        tokio::select! {
            _ = &mut handshake_deadline, if !handle.handshake_received() => {
                error!("closing: no handshake response within {:?}", handshake_timeout);
                let _ = websocket.close(None).await;
                break (None, "handshake timed out".to_owned(), false);
            }
            _ = keep_alive.tick() => {
                if let Some(ping) = handle.keep_alive_ping() {
                    if let Err(error) = websocket.send(Message::Text(ping)).await {
                        error!(%error, "cannot send ping");
                    } else {
                        trace!("ping sent");
                    }
                }
            }
            command = commands.recv_async() => match command {
                Ok(TransportCommand::SendText(text)) => {
                    trace!(%text, "text message sent");
                    if let Err(error) = websocket.send(Message::Text(text)).await {
                        error!(%error, "cannot send message");
                    }
                }
                Ok(TransportCommand::Close) => {
                    // Frames queued before the close request still go out.
                    while let Ok(TransportCommand::SendText(text)) = commands.try_recv() {
                        let _ = websocket.send(Message::Text(text)).await;
                    }
                    let _ = websocket.close(None).await;
                    break (None, String::new(), true);
                }
                Err(_) => {
                    let _ = websocket.close(None).await;
                    break (None, "connection handle dropped".to_owned(), true);
                }
            },
            received = websocket.next() => match received {
                Some(Ok(Message::Text(text))) => handle.handle_message(text),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(error) = websocket.send(Message::Pong(payload)).await {
                        error!(%error, "cannot send pong");
                    }
                }
                Some(Ok(Message::Binary(payload))) => {
                    warn!(length = payload.len(), "ignoring unsupported binary message");
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    break (code, reason, true);
                }
                Some(Ok(_)) => { /* Pong and raw frames are ignored */ }
                Some(Err(error)) => {
                    let message = error.to_string();
                    handle.handle_connection_error(&message);
                    break (None, message, false);
                }
                None => break (None, "websocket stream ended".to_owned(), false),
            }
        }
    };

    handle.handle_closed(code, &reason, was_clean);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_http_schemes_to_websocket_schemes() {
        assert_eq!(
            to_websocket_url("http://example.com/game?access_token=t"),
            "ws://example.com/game?access_token=t"
        );
        assert_eq!(
            to_websocket_url("https://example.com/game"),
            "wss://example.com/game"
        );
    }

    #[test]
    fn leaves_other_schemes_untouched() {
        assert_eq!(to_websocket_url("wss://example.com"), "wss://example.com");
        assert_eq!(to_websocket_url("  http://a  "), "ws://a");
    }
}
