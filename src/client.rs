//! OS2L protocol client.
//!
//! Owns one outbound connection, drives a [`FrameDecoder`] over its inbound
//! bytes, exposes typed senders for the outbound event kinds, and manages
//! reconnect-on-failure.
//!
//! # Lifecycle
//!
//! `Idle → Connecting → Connected → Idle`. Exactly one transport connection
//! is owned at a time. Every close — failure or deliberate — raises the
//! same [`ClientEvent::Closed`] signal, and with auto-reconnect enabled
//! that signal re-arms the dial timer; the loop retries forever at a fixed
//! interval. Calling [`Os2lClient::close`] during the retry window cancels
//! the pending attempt, which is the one way to stop the loop.
//!
//! # Usage
//!
//! ```ignore
//! let client = Os2lClient::builder()
//!     .host("192.168.1.20")
//!     .port(4444)
//!     .build()?;
//! let mut events = client.subscribe();
//! client.connect().await?;
//! client.beat(true, 1.0, 128.0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::constants::{DEFAULT_CLIENT_HOST, DEFAULT_CLIENT_PORT, DEFAULT_RECONNECT_INTERVAL, SERVICE_TYPE};
use crate::discovery::Discovery;
use crate::error::Os2lError;
use crate::events::{ClientEvent, EventBus};
use crate::framing::FrameDecoder;
use crate::message::{to_json_string, Os2lMessage, Switch};
use crate::transport::{StreamReader, StreamWriter, TcpTransport, Transport};

const LOCK_POISONED: &str = "client state lock poisoned";

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
}

/// Builder for [`Os2lClient`].
pub struct Os2lClientBuilder {
    host: String,
    port: u16,
    auto_reconnect: bool,
    auto_reconnect_interval: Duration,
    transport: Option<Arc<dyn Transport>>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl Default for Os2lClientBuilder {
    fn default() -> Self {
        Self {
            host: DEFAULT_CLIENT_HOST.to_string(),
            port: DEFAULT_CLIENT_PORT,
            auto_reconnect: true,
            auto_reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            transport: None,
            discovery: None,
        }
    }
}

impl Os2lClientBuilder {
    /// Create a builder with protocol defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host to dial when discovery is not attached.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port to dial when discovery is not attached.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Whether to redial automatically after the connection closes.
    #[must_use]
    pub fn auto_reconnect(mut self, enable: bool) -> Self {
        self.auto_reconnect = enable;
        self
    }

    /// Delay between automatic reconnect attempts.
    #[must_use]
    pub fn auto_reconnect_interval(mut self, interval: Duration) -> Self {
        self.auto_reconnect_interval = interval;
        self
    }

    /// Substitute the byte-stream transport (defaults to TCP).
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Attach a discovery resolver; when present, `connect()` resolves the
    /// target instead of using the configured host/port.
    #[must_use]
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`Os2lError::Config`] for an empty host or a zero reconnect
    /// interval.
    pub fn build(self) -> Result<Os2lClient, Os2lError> {
        if self.host.is_empty() {
            return Err(Os2lError::Config("host must not be empty".into()));
        }
        if self.auto_reconnect_interval.is_zero() {
            return Err(Os2lError::Config(
                "auto-reconnect interval must be greater than zero".into(),
            ));
        }
        Ok(Os2lClient {
            inner: Arc::new(ClientInner {
                host: self.host,
                port: self.port,
                auto_reconnect: self.auto_reconnect,
                reconnect_interval: self.auto_reconnect_interval,
                transport: self.transport.unwrap_or_else(|| Arc::new(TcpTransport)),
                discovery: self.discovery,
                events: EventBus::new(),
                phase: Mutex::new(Phase::Idle),
                outbound: Mutex::new(None),
                reader_task: Mutex::new(None),
                writer_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        })
    }
}

/// A TCP client that talks the OS2L protocol.
///
/// Cheap to clone; all clones share the same connection and event bus.
#[derive(Clone)]
pub struct Os2lClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Os2lClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Os2lClient")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("auto_reconnect", &self.inner.auto_reconnect)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    host: String,
    port: u16,
    auto_reconnect: bool,
    reconnect_interval: Duration,
    transport: Arc<dyn Transport>,
    discovery: Option<Arc<dyn Discovery>>,
    events: EventBus<ClientEvent>,
    phase: Mutex<Phase>,
    /// Send queue feeding the writer task of the current connection.
    outbound: Mutex<Option<UnboundedSender<Vec<u8>>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every teardown; tasks from a previous connection compare
    /// their captured value and stand down if it moved.
    generation: AtomicU64,
}

impl Os2lClient {
    /// Create a client builder with protocol defaults.
    #[must_use]
    pub fn builder() -> Os2lClientBuilder {
        Os2lClientBuilder::new()
    }

    /// Register an observer. Every subscriber receives every event in
    /// emission order.
    pub fn subscribe(&self) -> UnboundedReceiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// True while a connection is established.
    pub fn is_connected(&self) -> bool {
        *self.inner.phase.lock().expect(LOCK_POISONED) == Phase::Connected
    }

    /// Connect to the server.
    ///
    /// Resolves the target through discovery when a resolver is attached,
    /// otherwise dials the configured host/port. Calling this while not
    /// idle emits a warning and leaves state untouched.
    ///
    /// # Errors
    ///
    /// With auto-reconnect disabled, a connect failure is returned (and
    /// also emitted as [`ClientEvent::Error`]). With auto-reconnect
    /// enabled, failures are absorbed and the retry timer is armed.
    pub async fn connect(&self) -> Result<(), Os2lError> {
        do_connect(&self.inner).await
    }

    /// Close the connection.
    ///
    /// Cancels a pending reconnect attempt if one is scheduled. Closing an
    /// open connection emits [`ClientEvent::Closed`] — which, with
    /// auto-reconnect enabled, re-arms the dial timer just like a failure
    /// close does (longstanding protocol-library behavior). Closing a
    /// client that is neither open nor waiting to reconnect emits
    /// [`ClientEvent::Error`].
    pub fn close(&self) {
        let inner = &self.inner;
        let pending = inner.reconnect_task.lock().expect(LOCK_POISONED).take();
        let had_pending = pending.is_some();
        if let Some(handle) = pending {
            handle.abort();
        }

        let is_idle = *inner.phase.lock().expect(LOCK_POISONED) == Phase::Idle;
        if is_idle {
            if !had_pending {
                inner.events.emit(ClientEvent::Error(
                    "cannot close OS2L client because it is not open".into(),
                ));
            }
            return;
        }
        teardown(inner, None);
    }

    /// Send a `btn` event with state on.
    pub fn button_on(&self, name: &str) {
        self.send_message(&Os2lMessage::Button {
            name: name.to_string(),
            state: Switch::On,
        });
    }

    /// Send a `btn` event with state off.
    pub fn button_off(&self, name: &str) {
        self.send_message(&Os2lMessage::Button {
            name: name.to_string(),
            state: Switch::Off,
        });
    }

    /// Send a `cmd` event. `param` is expected in [0, 1] but not validated.
    pub fn command(&self, id: u32, param: f64) {
        self.send_message(&Os2lMessage::Command { id, param });
    }

    /// Send a `beat` event.
    pub fn beat(&self, change: bool, pos: f64, bpm: f64) {
        self.send_message(&Os2lMessage::Beat { change, pos, bpm });
    }

    /// Send an arbitrary object, JSON-encoded.
    ///
    /// Escape hatch for message kinds this crate does not model.
    pub fn send_custom(&self, value: &Value) {
        send_wire(&self.inner, to_json_string(value));
    }

    /// Send an already-serialized string verbatim, bypassing JSON encoding.
    ///
    /// The caller is responsible for it being one well-formed JSON object.
    pub fn send_custom_raw(&self, json: &str) {
        send_wire(&self.inner, json.to_string());
    }

    fn send_message(&self, message: &Os2lMessage) {
        send_wire(&self.inner, message.to_wire());
    }
}

/// Queue one serialized object on the current connection, or warn when
/// there is none. Writes are fire-and-forget.
fn send_wire(inner: &ClientInner, json: String) {
    let queued = {
        let outbound = inner.outbound.lock().expect(LOCK_POISONED);
        match outbound.as_ref() {
            Some(tx) => {
                // A send error here means the writer task already exited;
                // teardown is in flight and will warn via Closed.
                let _ = tx.send(json.into_bytes());
                true
            }
            None => false,
        }
    };
    if !queued {
        inner
            .events
            .emit(ClientEvent::Warning("OS2L client is not connected".into()));
    }
}

async fn do_connect(inner: &Arc<ClientInner>) -> Result<(), Os2lError> {
    {
        let mut phase = inner.phase.lock().expect(LOCK_POISONED);
        if *phase != Phase::Idle {
            drop(phase);
            inner.events.emit(ClientEvent::Warning(
                "OS2L client is already connected".into(),
            ));
            return Ok(());
        }
        *phase = Phase::Connecting;
    }
    let generation = inner.generation.load(Ordering::SeqCst);

    let (host, port) = match &inner.discovery {
        Some(discovery) => match discovery.resolve(SERVICE_TYPE).await {
            Ok(target) => target,
            Err(e) => {
                return connect_failed(inner, generation, format!("discovery failed: {e}"));
            }
        },
        None => (inner.host.clone(), inner.port),
    };

    match inner.transport.connect(&host, port).await {
        Ok(pair) => {
            let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
            {
                let mut phase = inner.phase.lock().expect(LOCK_POISONED);
                if inner.generation.load(Ordering::SeqCst) != generation
                    || *phase != Phase::Connecting
                {
                    // close() raced the dial; abandon the fresh connection.
                    return Ok(());
                }
                *phase = Phase::Connected;
                *inner.outbound.lock().expect(LOCK_POISONED) = Some(outbound_tx);
                *inner.reader_task.lock().expect(LOCK_POISONED) = Some(tokio::spawn(
                    read_loop(Arc::clone(inner), pair.reader, generation),
                ));
                *inner.writer_task.lock().expect(LOCK_POISONED) = Some(tokio::spawn(
                    write_loop(Arc::clone(inner), pair.writer, outbound_rx, generation),
                ));
            }
            log::info!("[OS2L Client] connected to {host}:{port}");
            inner.events.emit(ClientEvent::Connected);
            Ok(())
        }
        Err(e) => connect_failed(
            inner,
            generation,
            format!("connect to {host}:{port} failed: {e}"),
        ),
    }
}

/// Resolve a failed dial: back to idle, `Closed`, and either the retry
/// timer (auto-reconnect) or a surfaced error.
fn connect_failed(
    inner: &Arc<ClientInner>,
    generation: u64,
    msg: String,
) -> Result<(), Os2lError> {
    if inner.generation.load(Ordering::SeqCst) != generation {
        // close() raced the dial and already settled the state.
        return Ok(());
    }
    log::warn!("[OS2L Client] {msg}");
    *inner.phase.lock().expect(LOCK_POISONED) = Phase::Idle;
    inner.events.emit(ClientEvent::Closed);
    if inner.auto_reconnect {
        schedule_reconnect(inner);
        Ok(())
    } else {
        inner.events.emit(ClientEvent::Error(msg.clone()));
        Err(Os2lError::Transport(msg))
    }
}

/// Drop the current connection, emit `Closed`, and either re-arm the dial
/// timer (auto-reconnect) or surface `error`.
fn teardown(inner: &Arc<ClientInner>, error: Option<String>) {
    {
        let mut phase = inner.phase.lock().expect(LOCK_POISONED);
        if *phase == Phase::Idle {
            return;
        }
        *phase = Phase::Idle;
    }
    inner.generation.fetch_add(1, Ordering::SeqCst);
    inner.outbound.lock().expect(LOCK_POISONED).take();
    if let Some(handle) = inner.reader_task.lock().expect(LOCK_POISONED).take() {
        handle.abort();
    }
    if let Some(handle) = inner.writer_task.lock().expect(LOCK_POISONED).take() {
        handle.abort();
    }
    inner.events.emit(ClientEvent::Closed);
    if inner.auto_reconnect {
        schedule_reconnect(inner);
    } else if let Some(msg) = error {
        inner.events.emit(ClientEvent::Error(msg));
    }
}

/// Arm the fixed-interval redial timer. No backoff, no attempt cap.
fn schedule_reconnect(inner: &Arc<ClientInner>) {
    if !inner.auto_reconnect {
        return;
    }
    inner.events.emit(ClientEvent::Warning(
        "OS2L client connection closed; trying to reconnect".into(),
    ));
    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(task_inner.reconnect_interval).await;
        task_inner
            .reconnect_task
            .lock()
            .expect(LOCK_POISONED)
            .take();
        // With auto-reconnect enabled a failed dial resolves Ok and
        // re-arms the timer itself.
        let _ = do_connect(&task_inner).await;
    });
    if let Some(previous) = inner
        .reconnect_task
        .lock()
        .expect(LOCK_POISONED)
        .replace(handle)
    {
        previous.abort();
    }
}

/// Read loop — feeds inbound chunks to this connection's decoder and
/// dispatches decoded messages.
async fn read_loop(inner: Arc<ClientInner>, mut reader: Box<dyn StreamReader>, generation: u64) {
    let mut decoder = FrameDecoder::new();
    let error = loop {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => {
                let outcome = decoder.feed(&chunk);
                for message in outcome.messages {
                    dispatch_message(&inner, message);
                }
                if let Some(err) = outcome.error {
                    log::warn!("[OS2L Client] bad OS2L data received: {err}");
                    inner.events.emit(ClientEvent::Decode(err));
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(format!("read failed: {e}")),
        }
    };
    if inner.generation.load(Ordering::SeqCst) == generation {
        teardown(&inner, error);
    }
}

fn dispatch_message(inner: &Arc<ClientInner>, message: Value) {
    inner.events.emit(ClientEvent::Data(message.clone()));
    // Only feedback is specially classified on the client side.
    if let Some(Os2lMessage::Feedback { name, state, page }) = Os2lMessage::classify(&message) {
        inner.events.emit(ClientEvent::Feedback { name, state, page });
    }
}

/// Write loop — drains the send queue into the transport. A write failure
/// is a transport error and tears the connection down.
async fn write_loop(
    inner: Arc<ClientInner>,
    mut writer: Box<dyn StreamWriter>,
    mut outbound: UnboundedReceiver<Vec<u8>>,
    generation: u64,
) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            let msg = format!("write failed: {e}");
            log::warn!("[OS2L Client] {msg}");
            if inner.generation.load(Ordering::SeqCst) == generation {
                teardown(&inner, Some(msg));
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let client = Os2lClient::builder().build().expect("Should build");
        assert_eq!(client.inner.host, DEFAULT_CLIENT_HOST);
        assert_eq!(client.inner.port, DEFAULT_CLIENT_PORT);
        assert!(client.inner.auto_reconnect);
        assert_eq!(client.inner.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_empty_host_is_a_config_error() {
        let result = Os2lClient::builder().host("").build();
        assert!(matches!(result, Err(Os2lError::Config(_))));
    }

    #[test]
    fn test_zero_interval_is_a_config_error() {
        let result = Os2lClient::builder()
            .auto_reconnect_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(Os2lError::Config(_))));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_warns_per_send() {
        let client = Os2lClient::builder().build().expect("Should build");
        let mut events = client.subscribe();

        client.button_on("flash");
        client.command(1, 0.5);

        for _ in 0..2 {
            match events.try_recv().expect("Should have received event") {
                ClientEvent::Warning(msg) => assert!(msg.contains("not connected")),
                other => panic!("Expected Warning, got: {other:?}"),
            }
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_when_idle_emits_error() {
        let client = Os2lClient::builder().build().expect("Should build");
        let mut events = client.subscribe();

        client.close();

        match events.try_recv().expect("Should have received event") {
            ClientEvent::Error(msg) => assert!(msg.contains("not open")),
            other => panic!("Expected Error, got: {other:?}"),
        }
    }
}
