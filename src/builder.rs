//! Hub connection builder.

use crate::connection::HubConnection;
use std::time::Duration;

const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// [`HubConnection`] builder.
///
/// Collects connection settings; no network activity happens until
/// [`HubConnection::start`] is called on the built connection.
///
/// # Example
/// ```rust,no_run
/// use hublite::HubConnection;
///
/// let connection = HubConnection::builder("https://example.com/game")
///     .use_access_token("token")
///     .use_header("x-client-version", "1.4.2")
///     .build();
/// ```
pub struct HubConnectionBuilder {
    url: String,
    access_token: String,
    headers: Vec<(String, String)>,
    keep_alive_interval: Duration,
    negotiate_timeout: Duration,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

/// Settings a [`HubConnection`] is created with.
pub(crate) struct ClientConfig {
    pub url: String,
    pub access_token: String,
    pub headers: Vec<(String, String)>,
    pub keep_alive_interval: Duration,
    pub negotiate_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl HubConnectionBuilder {
    pub fn new(url: impl ToString) -> Self {
        HubConnectionBuilder {
            url: url.to_string(),
            access_token: String::new(),
            headers: Vec::new(),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            negotiate_timeout: DEFAULT_NEGOTIATE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Specifies the access token appended to the negotiate and socket urls.
    pub fn use_access_token(mut self, token: impl ToString) -> Self {
        self.access_token = token.to_string();
        self
    }

    /// Adds a custom header to the WebSocket upgrade request.
    pub fn use_header(mut self, name: impl ToString, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Specifies how often a keep-alive ping is sent once connected.
    pub fn use_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Specifies the timeout for the HTTP negotiate request.
    pub fn use_negotiate_timeout(mut self, timeout: Duration) -> Self {
        self.negotiate_timeout = timeout;
        self
    }

    /// Specifies the timeout for opening the WebSocket.
    pub fn use_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Specifies how long to wait for the server's handshake response before
    /// the attempt is torn down.
    pub fn use_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Builds the connection. Call [`HubConnection::start`] to connect.
    pub fn build(self) -> HubConnection {
        HubConnection::from_config(ClientConfig {
            url: self.url,
            access_token: self.access_token,
            headers: self.headers,
            keep_alive_interval: self.keep_alive_interval,
            negotiate_timeout: self.negotiate_timeout,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
        })
    }
}
