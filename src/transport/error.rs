use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSockets error")]
    Websocket {
        #[from]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("invalid connection header '{name}'")]
    InvalidHeader { name: String },
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}
