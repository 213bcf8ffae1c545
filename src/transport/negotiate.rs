//! HTTP negotiate step performed before the WebSocket upgrade.

use crate::protocol::{NegotiateResponse, TEXT_TRANSPORT_FORMAT, WEB_SOCKET_TRANSPORT};
use std::time::Duration;
use thiserror::Error;
use tracing::*;

/// Session details extracted from a successful negotiate exchange.
#[derive(Debug)]
pub(crate) struct NegotiatedSession {
    pub connection_id: Option<String>,
}

/// Errors that can occur while negotiating transport capabilities.
#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("request error")]
    Request {
        #[from]
        source: reqwest::Error,
    },
    #[error("negotiate failed with status code {0}")]
    HttpStatus(u16),
    #[error("deserialization error")]
    Deserialization {
        #[from]
        source: serde_json::Error,
    },
    #[error("negotiate error from server: {0}")]
    Server(String),
    #[error("detected a connection attempt to an ASP.NET SignalR server; only ASP.NET Core SignalR servers are supported")]
    LegacyServer,
    #[error("server redirected the connection to {url}, redirection is not supported")]
    Redirect { url: String },
    #[error("the server does not support WebSockets transport with Text format")]
    UnsupportedTransport,
}

/// Performs the negotiate POST and validates the response.
pub(crate) async fn negotiate(
    base_url: &str,
    access_token: &str,
    timeout: Duration,
) -> Result<NegotiatedSession, NegotiateError> {
    let endpoint = format!(
        "{}/negotiate?negotiateVersion=1&access_token={}",
        base_url, access_token
    );

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.post(&endpoint).send().await?;

    let status = response.status().as_u16();
    if status != 200 {
        return Err(NegotiateError::HttpStatus(status));
    }

    let body = response.text().await?;
    let negotiate: NegotiateResponse = serde_json::from_str(&body)?;

    if let Some(error) = negotiate.error {
        return Err(NegotiateError::Server(error));
    }
    if negotiate.protocol_version.is_some() {
        return Err(NegotiateError::LegacyServer);
    }
    if let Some(url) = negotiate.url {
        debug!(
            has_access_token = negotiate.access_token.is_some(),
            "negotiate requested redirection"
        );
        return Err(NegotiateError::Redirect { url });
    }

    if let Some(transports) = &negotiate.available_transports {
        let compatible = transports.iter().any(|spec| {
            spec.transport == WEB_SOCKET_TRANSPORT
                && spec
                    .transfer_formats
                    .iter()
                    .any(|format| format == TEXT_TRANSPORT_FORMAT)
        });
        if !compatible {
            return Err(NegotiateError::UnsupportedTransport);
        }
    }

    // A connection token supersedes the plain id when both are present.
    let connection_id = negotiate.connection_token.or(negotiate.connection_id);

    Ok(NegotiatedSession { connection_id })
}
