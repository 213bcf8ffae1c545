//! The hub connection state machine.
//!
//! A [`HubConnection`] drives one logical session: negotiate, socket upgrade,
//! handshake, message dispatch and teardown. All transport events are
//! delivered by the transport task in arrival order, so invocation handlers
//! and completion resolutions run in server-emission order.

use crate::{
    builder::{ClientConfig, HubConnectionBuilder},
    callback::{CallbackManager, CompletionResult, PendingInvocation},
    error::{InvocationError, RegistrationError, StartError},
    messages, protocol,
    protocol::{Close, Completion, HubMessage, Invocation},
    transport::{negotiate, websocket, TransportCommand},
    value::Value,
};
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::*;

/// Lifecycle state of a [`HubConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

type InvocationHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;
type ConnectedObserver = Arc<dyn Fn() + Send + Sync>;
type ConnectionErrorObserver = Arc<dyn Fn(&str) + Send + Sync>;
type ClosedObserver = Arc<dyn Fn() + Send + Sync>;

/// A client connection to a remote hub.
///
/// Create one with [`HubConnection::builder`], register invocation handlers
/// with [`on`](HubConnection::on), then call [`start`](HubConnection::start).
/// Handlers persist across reconnects.
pub struct HubConnection {
    inner: Arc<ConnectionInner>,
}

impl HubConnection {
    pub fn builder(url: impl ToString) -> HubConnectionBuilder {
        HubConnectionBuilder::new(url)
    }

    pub(crate) fn from_config(config: ClientConfig) -> Self {
        HubConnection {
            inner: Arc::new(ConnectionInner::new(config)),
        }
    }

    /// Establishes the connection: negotiate, socket upgrade and handshake.
    ///
    /// Returns once the transport is connected; the handshake completes
    /// asynchronously and is signalled through the connected event. Does
    /// nothing unless the connection is disconnected.
    pub async fn start(&self) -> Result<(), StartError> {
        ConnectionInner::start(Arc::clone(&self.inner)).await
    }

    /// Performs an orderly shutdown: sends a close message and closes the
    /// transport. Does nothing when already disconnected.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Registers the handler invoked when the server calls `event`.
    ///
    /// At most one handler per event name; a second registration is rejected.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(Vec<Value>) + Send + Sync + 'static,
    ) -> Result<(), RegistrationError> {
        self.inner.handlers.register(event, Arc::new(handler))
    }

    /// Invokes a hub method and returns a handle resolved by its completion.
    ///
    /// Issued before the handshake completes, the frame is queued and flushed
    /// right after it.
    pub fn invoke(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<PendingInvocation, InvocationError> {
        self.inner.invoke(target, arguments)
    }

    /// Invokes a hub method without expecting a completion.
    pub fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), InvocationError> {
        self.inner.send(target, arguments)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// Session identifier assigned by the server during negotiation.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection_id.lock().unwrap().clone()
    }

    /// Observes handshake completion.
    pub fn on_connected(&self, observer: impl Fn() + Send + Sync + 'static) {
        self.inner
            .connected_observers
            .lock()
            .unwrap()
            .push(Arc::new(observer));
    }

    /// Observes transport and server-reported errors.
    pub fn on_connection_error(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.inner
            .error_observers
            .lock()
            .unwrap()
            .push(Arc::new(observer));
    }

    /// Observes the transition back to disconnected.
    pub fn on_closed(&self, observer: impl Fn() + Send + Sync + 'static) {
        self.inner
            .closed_observers
            .lock()
            .unwrap()
            .push(Arc::new(observer));
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        if *self.inner.state.lock().unwrap() != ConnectionState::Disconnected {
            self.inner.send_close_message();
            self.inner.transport_close();
        }
    }
}

/// Table of per-event invocation handlers.
#[derive(Default)]
struct HandlerTable {
    handlers: Mutex<HashMap<String, InvocationHandler>>,
}

impl HandlerTable {
    fn register(&self, event: &str, handler: InvocationHandler) -> Result<(), RegistrationError> {
        if event.is_empty() {
            return Err(RegistrationError::EmptyEventName);
        }

        let mut handlers = self.handlers.lock().unwrap();
        match handlers.entry(event.to_owned()) {
            Entry::Occupied(_) => Err(RegistrationError::DuplicateHandler(event.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    fn get(&self, target: &str) -> Option<InvocationHandler> {
        self.handlers.lock().unwrap().get(target).cloned()
    }
}

pub(crate) struct ConnectionInner {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    connection_id: Mutex<Option<String>>,
    outbound: Mutex<Option<flume::Sender<TransportCommand>>>,
    handlers: HandlerTable,
    callbacks: CallbackManager,
    /// Serialized frames issued while the handshake is in flight. Flushed in
    /// order exactly once; the flag flip happens under this lock so later
    /// sends cannot overtake queued frames.
    waiting_calls: Mutex<Vec<String>>,
    handshake_received: AtomicBool,
    handshake_buffer: Mutex<String>,
    close_received: AtomicBool,
    should_reconnect: AtomicBool,
    connected_observers: Mutex<Vec<ConnectedObserver>>,
    error_observers: Mutex<Vec<ConnectionErrorObserver>>,
    closed_observers: Mutex<Vec<ClosedObserver>>,
}

impl ConnectionInner {
    fn new(config: ClientConfig) -> Self {
        ConnectionInner {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            connection_id: Mutex::new(None),
            outbound: Mutex::new(None),
            handlers: HandlerTable::default(),
            callbacks: CallbackManager::default(),
            waiting_calls: Mutex::new(Vec::new()),
            handshake_received: AtomicBool::new(false),
            handshake_buffer: Mutex::new(String::new()),
            close_received: AtomicBool::new(false),
            should_reconnect: AtomicBool::new(false),
            connected_observers: Mutex::new(Vec::new()),
            error_observers: Mutex::new(Vec::new()),
            closed_observers: Mutex::new(Vec::new()),
        }
    }

    async fn start(self: Arc<Self>) -> Result<(), StartError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ConnectionState::Disconnected {
                error!("hub connection can only be started in the disconnected state");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let session = match negotiate::negotiate(
            &self.config.url,
            &self.config.access_token,
            self.config.negotiate_timeout,
        )
        .await
        {
            Ok(session) => session,
            Err(error) => {
                self.connect_attempt_failed(&error.to_string());
                return Err(error.into());
            }
        };

        if let Some(connection_id) = &session.connection_id {
            debug!(%connection_id, "negotiated session");
        }
        *self.connection_id.lock().unwrap() = session.connection_id;

        let websocket_url = websocket::to_websocket_url(&format!(
            "{}?access_token={}",
            self.config.url, self.config.access_token
        ));
        let socket = match websocket::connect(
            &websocket_url,
            &self.config.headers,
            self.config.connect_timeout,
        )
        .await
        {
            Ok(socket) => socket,
            Err(error) => {
                self.connect_attempt_failed(&error.to_string());
                return Err(error.into());
            }
        };

        let (commands, commands_rx) = flume::unbounded();
        *self.outbound.lock().unwrap() = Some(commands);
        self.handshake_received.store(false, Ordering::SeqCst);
        self.handshake_buffer.lock().unwrap().clear();
        self.close_received.store(false, Ordering::SeqCst);

        tokio::spawn(websocket::run(
            socket,
            TransportHandle {
                inner: Arc::clone(&self),
            },
            commands_rx,
            self.config.keep_alive_interval,
            self.config.handshake_timeout,
        ));

        Ok(())
    }

    fn connect_attempt_failed(&self, error: &str) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.notify_connection_error(error);
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Disconnected {
                info!("stop ignored because the connection is already disconnected");
                return;
            }
            *state = ConnectionState::Disconnecting;
        }
        self.send_close_message();
        self.transport_close();
    }

    fn invoke(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<PendingInvocation, InvocationError> {
        let (invocation_id, pending) = self.callbacks.register_callback();
        if let Err(error) = self.invoke_hub_method(target, arguments, Some(invocation_id.clone())) {
            self.callbacks.remove_callback(&invocation_id);
            return Err(error);
        }
        Ok(pending)
    }

    fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), InvocationError> {
        self.invoke_hub_method(target, arguments, None)
    }

    fn invoke_hub_method(
        &self,
        target: &str,
        arguments: Vec<Value>,
        invocation_id: Option<String>,
    ) -> Result<(), InvocationError> {
        let invocation = Invocation::new(invocation_id, target, arguments);
        let frame = messages::to_json(&invocation)?;
        self.enqueue_or_send(frame);
        Ok(())
    }

    /// Routes a frame directly to the transport once the handshake completed,
    /// queueing it otherwise. Re-checks the flag under the queue lock so a
    /// send racing the handshake flush cannot strand a frame in the queue.
    fn enqueue_or_send(&self, frame: String) {
        let mut waiting = self.waiting_calls.lock().unwrap();
        if self.handshake_received.load(Ordering::SeqCst) {
            drop(waiting);
            self.transport_send(frame);
        } else {
            waiting.push(frame);
        }
    }

    fn transport_send(&self, frame: String) {
        let outbound = self.outbound.lock().unwrap();
        match outbound.as_ref() {
            Some(sender) => {
                if sender.send(TransportCommand::SendText(frame)).is_err() {
                    error!("cannot send data, the transport task is gone");
                }
            }
            None => error!("cannot send data to a disconnected transport"),
        }
    }

    fn transport_close(&self) {
        let outbound = self.outbound.lock().unwrap();
        match outbound.as_ref() {
            Some(sender) => {
                if sender.send(TransportCommand::Close).is_err() {
                    error!("cannot close, the transport task is gone");
                }
            }
            None => error!("cannot close a disconnected transport"),
        }
    }

    fn send_close_message(&self) {
        match messages::to_json(&Close::new()) {
            Ok(frame) => self.transport_send(frame),
            Err(error) => error!(%error, "cannot serialize close message"),
        }
    }

    fn handle_connected(&self) {
        debug!(url = %self.config.url, "transport connected, sending handshake request");
        self.handshake_received.store(false, Ordering::SeqCst);
        match protocol::create_handshake_request() {
            Ok(request) => self.transport_send(request),
            Err(error) => error!(%error, "cannot serialize handshake request"),
        }
    }

    fn handle_message(&self, text: &str) {
        let payload;

        if !self.handshake_received.load(Ordering::SeqCst) {
            let buffered = {
                let mut buffer = self.handshake_buffer.lock().unwrap();
                buffer.push_str(text);
                buffer.clone()
            };

            match protocol::parse_handshake_response(&buffered) {
                Ok(None) => return,
                Ok(Some(remainder)) => {
                    payload = remainder.to_owned();
                    self.handshake_buffer.lock().unwrap().clear();
                    self.complete_handshake();
                }
                Err(error) => {
                    // This attempt is abandoned; the handshake deadline in
                    // the transport loop tears the socket down.
                    self.handshake_buffer.lock().unwrap().clear();
                    error!(%error, "handshake failed");
                    return;
                }
            }
        } else {
            payload = text.to_owned();
        }

        for message in protocol::parse_messages(&payload) {
            match message {
                HubMessage::Invocation(invocation) => self.dispatch_invocation(invocation),
                HubMessage::Completion(completion) => self.dispatch_completion(completion),
                HubMessage::Ping => trace!("ping received"),
                HubMessage::Close(close) => self.handle_close_message(close),
            }
        }
    }

    fn complete_handshake(&self) {
        *self.state.lock().unwrap() = ConnectionState::Connected;
        debug!("handshake completed");
        self.notify_connected();

        let mut waiting = self.waiting_calls.lock().unwrap();
        for frame in waiting.drain(..) {
            self.transport_send(frame);
        }
        self.handshake_received.store(true, Ordering::SeqCst);
    }

    fn dispatch_invocation(&self, invocation: Invocation) {
        match self.handlers.get(&invocation.target) {
            Some(handler) => handler(invocation.arguments),
            // Absence of a local subscriber is not a protocol fault.
            None => trace!(event = %invocation.target, "no handler registered for invocation"),
        }
    }

    fn dispatch_completion(&self, completion: Completion) {
        let Completion {
            invocation_id,
            result,
            error,
            ..
        } = completion;

        if let Some(message) = &error {
            error!(%invocation_id, "invocation completed with error: {}", message);
        }

        let resolved = self
            .callbacks
            .invoke_callback(&invocation_id, CompletionResult { result, error }, true);
        if !resolved {
            warn!(%invocation_id, "no callback found for invocation id");
        }
    }

    fn handle_close_message(&self, close: Close) {
        if let Some(error) = &close.error {
            warn!("received close message with error: {}", error);
            self.notify_connection_error(error);
        }

        self.close_received.store(true, Ordering::SeqCst);
        self.should_reconnect
            .store(close.allow_reconnect.unwrap_or(false), Ordering::SeqCst);

        self.stop();
    }

    fn handle_closed(self: &Arc<Self>, code: Option<u16>, reason: &str, was_clean: bool) {
        if !self.close_received.load(Ordering::SeqCst) {
            warn!("the server was unexpectedly disconnected");
        }
        debug!(?code, %reason, was_clean, "transport closed");

        *self.outbound.lock().unwrap() = None;
        self.handshake_received.store(false, Ordering::SeqCst);
        self.handshake_buffer.lock().unwrap().clear();
        self.callbacks
            .clear("connection was stopped before the invocation result was received");

        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.notify_closed();

        if self.close_received.swap(false, Ordering::SeqCst) {
            self.try_reconnect();
        }
    }

    /// Consumes the server-granted reconnect flag and restarts at most once.
    fn try_reconnect(self: &Arc<Self>) {
        if self.should_reconnect.swap(false, Ordering::SeqCst) {
            debug!("reconnecting");
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = ConnectionInner::start(inner).await {
                    error!(%error, "reconnect attempt failed");
                }
            });
        }
    }

    fn keep_alive_ping(&self) -> Option<String> {
        if !self.handshake_received.load(Ordering::SeqCst) {
            return None;
        }
        match messages::to_json(&protocol::Ping::new()) {
            Ok(frame) => Some(frame),
            Err(error) => {
                error!(%error, "cannot serialize ping");
                None
            }
        }
    }

    fn notify_connected(&self) {
        let observers: Vec<_> = self.connected_observers.lock().unwrap().clone();
        for observer in observers {
            observer();
        }
    }

    fn notify_connection_error(&self, error: &str) {
        let observers: Vec<_> = self.error_observers.lock().unwrap().clone();
        for observer in observers {
            observer(error);
        }
    }

    fn notify_closed(&self) {
        let observers: Vec<_> = self.closed_observers.lock().unwrap().clone();
        for observer in observers {
            observer();
        }
    }
}

/// Connection-side endpoint of transport events.
///
/// The transport loop reports everything through this handle, one event at a
/// time, in arrival order.
pub(crate) struct TransportHandle {
    inner: Arc<ConnectionInner>,
}

impl TransportHandle {
    pub(crate) fn handle_connected(&self) {
        self.inner.handle_connected();
    }

    pub(crate) fn handle_message(&self, text: String) {
        self.inner.handle_message(&text);
    }

    pub(crate) fn handle_connection_error(&self, error: &str) {
        warn!("websocket error: {}", error);
        self.inner.notify_connection_error(error);
        self.inner.try_reconnect();
    }

    pub(crate) fn handle_closed(&self, code: Option<u16>, reason: &str, was_clean: bool) {
        self.inner.handle_closed(code, reason, was_clean);
    }

    pub(crate) fn handshake_received(&self) -> bool {
        self.inner.handshake_received.load(Ordering::SeqCst)
    }

    pub(crate) fn keep_alive_ping(&self) -> Option<String> {
        self.inner.keep_alive_ping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RECORD_SEPARATOR;

    fn connection() -> HubConnection {
        HubConnection::builder("http://localhost:5000/hub").build()
    }

    #[test]
    fn starts_disconnected() {
        let connection = connection();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.is_connected());
    }

    #[test]
    fn stop_when_disconnected_is_a_no_op() {
        let connection = connection();
        connection.stop();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn start_is_a_no_op_unless_disconnected() {
        let connection = connection();
        *connection.inner.state.lock().unwrap() = ConnectionState::Connected;
        connection.start().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[test]
    fn second_handler_registration_is_rejected() {
        let connection = connection();
        connection.on("Echo", |_| {}).unwrap();
        assert_eq!(
            connection.on("Echo", |_| {}),
            Err(RegistrationError::DuplicateHandler("Echo".to_owned()))
        );
    }

    #[test]
    fn empty_event_name_is_rejected() {
        let connection = connection();
        assert_eq!(
            connection.on("", |_| {}),
            Err(RegistrationError::EmptyEventName)
        );
    }

    #[test]
    fn calls_issued_before_handshake_are_queued() {
        let connection = connection();
        connection.send("First", vec![]).unwrap();
        let _pending = connection.invoke("Second", vec![Value::from(1i32)]).unwrap();

        let waiting = connection.inner.waiting_calls.lock().unwrap();
        assert_eq!(waiting.len(), 2);
        assert!(waiting[0].contains("\"target\":\"First\""));
        assert!(waiting[1].contains("\"invocationId\":\"0\""));
    }

    #[tokio::test]
    async fn handshake_ack_connects_flushes_and_dispatches_remainder() {
        let connection = connection();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        connection
            .on("Echo", move |arguments| {
                sink.lock().unwrap().push(arguments);
            })
            .unwrap();

        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        connection.on_connected(move || flag.store(true, Ordering::SeqCst));

        let pending = connection.invoke("Add", vec![Value::from(1i32)]).unwrap();

        // Ack, an invocation and the matching completion in a single buffer.
        let buffer = format!(
            "{{}}{0}{{\"type\":1,\"target\":\"Echo\",\"arguments\":[\"hi\"]}}{0}\
             {{\"type\":3,\"invocationId\":\"0\",\"result\":7}}{0}",
            RECORD_SEPARATOR
        );
        connection.inner.handle_message(&buffer);

        assert!(connection.is_connected());
        assert!(connected.load(Ordering::SeqCst));
        assert!(connection.inner.waiting_calls.lock().unwrap().is_empty());
        assert_eq!(
            *received.lock().unwrap(),
            vec![vec![Value::from("hi")]]
        );

        let completion = pending.response().await.unwrap();
        assert_eq!(completion.result, Some(Value::from(7i32)));
        assert!(completion.error.is_none());
    }

    #[test]
    fn handshake_fragments_are_buffered_until_terminated() {
        let connection = connection();
        connection.inner.handle_message("{");
        assert!(!connection.is_connected());
        connection
            .inner
            .handle_message(&format!("}}{}", RECORD_SEPARATOR));
        assert!(connection.is_connected());
    }

    #[test]
    fn handshake_error_does_not_connect() {
        let connection = connection();
        connection
            .inner
            .handle_message(&format!("{{\"error\":\"denied\"}}{}", RECORD_SEPARATOR));
        assert!(!connection.is_connected());
    }

    #[test]
    fn message_before_ack_does_not_connect() {
        let connection = connection();
        connection
            .inner
            .handle_message(&format!("{{\"type\":6}}{}", RECORD_SEPARATOR));
        assert!(!connection.is_connected());
    }

    #[test]
    fn invocation_without_handler_is_ignored() {
        let connection = connection();
        connection
            .inner
            .handle_message(&format!("{{}}{}", RECORD_SEPARATOR));
        connection.inner.handle_message(&format!(
            "{{\"type\":1,\"target\":\"Unknown\",\"arguments\":[]}}{}",
            RECORD_SEPARATOR
        ));
        assert!(connection.is_connected());
    }

    #[test]
    fn server_close_records_reconnect_grant_and_stops() {
        let connection = connection();
        connection
            .inner
            .handle_message(&format!("{{}}{}", RECORD_SEPARATOR));

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        connection.on_connection_error(move |error| {
            sink.lock().unwrap().push(error.to_owned());
        });

        connection.inner.handle_message(&format!(
            "{{\"type\":7,\"error\":\"maintenance\",\"allowReconnect\":true}}{}",
            RECORD_SEPARATOR
        ));

        assert_eq!(connection.state(), ConnectionState::Disconnecting);
        assert!(connection.inner.close_received.load(Ordering::SeqCst));
        assert!(connection.inner.should_reconnect.load(Ordering::SeqCst));
        assert_eq!(errors.lock().unwrap().as_slice(), &["maintenance"]);
    }
}
