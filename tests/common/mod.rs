//! In-process hub server used by the integration tests.
//!
//! Listens on a single TCP port and answers both sides of the connection
//! sequence: the HTTP negotiate POST (answered by hand) and the WebSocket
//! upgrade GET (handed to tungstenite's acceptor).

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

pub const RS: &str = "\u{001E}";

/// Installs a test logger; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn default_negotiate_body() -> String {
    "{\"connectionId\":\"abc123\",\"negotiateVersion\":1,\
     \"availableTransports\":[{\"transport\":\"WebSockets\",\
     \"transferFormats\":[\"Text\"]}]}"
        .to_owned()
}

/// Reads the request headers and answers with the given status and body.
pub async fn serve_negotiate(
    mut stream: TcpStream,
    status_line: &str,
    body: &str,
) -> anyhow::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }

    let response = format!(
        "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Accepts connections until a WebSocket upgrade arrives, answering any
/// negotiate POSTs on the way, and returns the established socket.
pub async fn accept_session(
    listener: &TcpListener,
    negotiate_body: &str,
) -> anyhow::Result<WebSocketStream<TcpStream>> {
    loop {
        let (stream, _) = listener.accept().await?;

        let mut probe = [0u8; 4];
        loop {
            let peeked = stream.peek(&mut probe).await?;
            if peeked >= 4 {
                break;
            }
            tokio::task::yield_now().await;
        }

        if &probe == b"POST" {
            serve_negotiate(stream, "200 OK", negotiate_body).await?;
        } else {
            return Ok(accept_async(stream).await?);
        }
    }
}

/// Next text message from the client, skipping transport-level frames.
/// `None` once the socket is closed.
pub async fn recv_text(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

/// Sends one record-separator-terminated frame to the client.
pub async fn send_frame(ws: &mut WebSocketStream<TcpStream>, json: &str) -> anyhow::Result<()> {
    ws.send(Message::Text(format!("{}{}", json, RS))).await?;
    Ok(())
}

/// Asserts the client opened with a JSON protocol handshake request.
pub async fn expect_handshake(ws: &mut WebSocketStream<TcpStream>) -> anyhow::Result<()> {
    let request = recv_text(ws).await.context("no handshake request received")?;
    anyhow::ensure!(
        request.contains("\"protocol\":\"json\""),
        "unexpected handshake request: {}",
        request
    );
    Ok(())
}
