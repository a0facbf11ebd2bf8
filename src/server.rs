//! OS2L protocol server.
//!
//! Accepts any number of client connections, frames each session's inbound
//! bytes independently, dispatches typed events per message kind, and
//! broadcasts feedback to every connected session.
//!
//! # Usage
//!
//! ```ignore
//! let server = Os2lServer::builder().port(0).build();
//! let mut events = server.subscribe();
//! server.start().await?;
//! server.feedback("flash", true, Some("main"));
//! server.stop().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::constants::{DEFAULT_SERVER_PORT, SERVICE_TYPE};
use crate::discovery::{Advertisement, Discovery};
use crate::error::Os2lError;
use crate::events::{EventBus, ServerEvent};
use crate::framing::FrameDecoder;
use crate::message::{to_json_string, Os2lMessage};
use crate::transport::{Listener, StreamPair, StreamReader, StreamWriter, TcpTransport, Transport};

const LOCK_POISONED: &str = "server state lock poisoned";

/// Opaque identifier for one accepted connection, unique for the lifetime
/// of the server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Builder for [`Os2lServer`].
pub struct Os2lServerBuilder {
    port: u16,
    transport: Option<Arc<dyn Transport>>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl Default for Os2lServerBuilder {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            transport: None,
            discovery: None,
        }
    }
}

impl Os2lServerBuilder {
    /// Create a builder with protocol defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Port to listen on (0 picks an ephemeral port).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Substitute the byte-stream transport (defaults to TCP).
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Attach a discovery advertiser; when present, `start()` advertises
    /// the bound port under the OS2L service type.
    #[must_use]
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Build the server.
    pub fn build(self) -> Os2lServer {
        Os2lServer {
            inner: Arc::new(ServerInner {
                port: self.port,
                transport: self.transport.unwrap_or_else(|| Arc::new(TcpTransport)),
                discovery: self.discovery,
                events: EventBus::new(),
                running: Mutex::new(ServerState::Stopped),
                next_session: AtomicU64::new(1),
            }),
        }
    }
}

/// A TCP server that accepts OS2L client connections.
///
/// Cheap to clone; all clones share the same listener and event bus.
#[derive(Clone)]
pub struct Os2lServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Os2lServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Os2lServer")
            .field("port", &self.inner.port)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

enum ServerState {
    Stopped,
    /// Reserved while `start()` is mid-flight so a second start cannot race.
    Starting,
    Running(Running),
}

struct Running {
    accept_task: Option<JoinHandle<()>>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    advertisement: Option<Box<dyn Advertisement>>,
    local_port: u16,
}

struct SessionHandle {
    outbound: UnboundedSender<Vec<u8>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

struct ServerInner {
    port: u16,
    transport: Arc<dyn Transport>,
    discovery: Option<Arc<dyn Discovery>>,
    events: EventBus<ServerEvent>,
    running: Mutex<ServerState>,
    next_session: AtomicU64,
}

impl Os2lServer {
    /// Create a server builder with protocol defaults.
    #[must_use]
    pub fn builder() -> Os2lServerBuilder {
        Os2lServerBuilder::new()
    }

    /// Register an observer. Every subscriber receives every event in
    /// emission order.
    pub fn subscribe(&self) -> UnboundedReceiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// True while the server is accepting connections.
    pub fn is_running(&self) -> bool {
        matches!(
            *self.inner.running.lock().expect(LOCK_POISONED),
            ServerState::Running(_)
        )
    }

    /// The actual bound port while running.
    pub fn local_port(&self) -> Option<u16> {
        match &*self.inner.running.lock().expect(LOCK_POISONED) {
            ServerState::Running(running) => Some(running.local_port),
            _ => None,
        }
    }

    /// Start listening and, when a discovery advertiser is attached,
    /// advertise the bound port.
    ///
    /// # Errors
    ///
    /// Returns [`Os2lError::Usage`] (after a warning event) when already
    /// running, or [`Os2lError::Transport`] (after error and closed
    /// events) when binding or advertising fails.
    pub async fn start(&self) -> Result<(), Os2lError> {
        let inner = &self.inner;
        {
            let mut state = inner.running.lock().expect(LOCK_POISONED);
            match *state {
                ServerState::Stopped => *state = ServerState::Starting,
                _ => {
                    drop(state);
                    inner.events.emit(ServerEvent::Warning(
                        "OS2L server is already running".into(),
                    ));
                    return Err(Os2lError::Usage("OS2L server is already running".into()));
                }
            }
        }

        let listener = match inner.transport.listen(inner.port).await {
            Ok(listener) => listener,
            Err(e) => {
                return start_failed(inner, format!("listen on port {} failed: {e}", inner.port));
            }
        };
        let local_port = listener.local_port();

        let advertisement = match &inner.discovery {
            Some(discovery) => match discovery.advertise(SERVICE_TYPE, local_port).await {
                Ok(ad) => Some(ad),
                Err(e) => {
                    return start_failed(inner, format!("service advertisement failed: {e}"));
                }
            },
            None => None,
        };

        let sessions = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(inner),
            listener,
            Arc::clone(&sessions),
        ));
        {
            let mut state = inner.running.lock().expect(LOCK_POISONED);
            *state = ServerState::Running(Running {
                accept_task: Some(accept_task),
                sessions,
                advertisement,
                local_port,
            });
        }
        log::info!("[OS2L Server] listening on port {local_port}");
        Ok(())
    }

    /// Stop the server: close every session, withdraw the advertisement,
    /// and emit [`ServerEvent::Closed`]. Stopping a server that is not
    /// running emits a warning instead.
    pub async fn stop(&self) {
        let inner = &self.inner;
        match try_take_running(inner) {
            TakeRunning::Taken(running) => shutdown_running(inner, running, true).await,
            TakeRunning::Starting | TakeRunning::NotRunning => {
                inner.events.emit(ServerEvent::Warning(
                    "cannot stop OS2L server because it is not running".into(),
                ));
            }
        }
    }

    /// Broadcast a `feedback` message to every connected session.
    ///
    /// `state` goes on the wire as a raw JSON boolean; `page` is omitted
    /// entirely when `None`. While stopped, or with no sessions, this is a
    /// silent no-op.
    pub fn feedback(&self, name: &str, state: bool, page: Option<&str>) {
        let frame = FeedbackFrame {
            evt: "feedback",
            name,
            state,
            page,
        };
        let json = to_json_string(&frame);

        let targets: Vec<UnboundedSender<Vec<u8>>> = {
            let guard = self.inner.running.lock().expect(LOCK_POISONED);
            match &*guard {
                ServerState::Running(running) => running
                    .sessions
                    .lock()
                    .expect(LOCK_POISONED)
                    .values()
                    .map(|handle| handle.outbound.clone())
                    .collect(),
                _ => Vec::new(),
            }
        };
        for tx in targets {
            // A closed queue means that session is mid-teardown; skip it.
            let _ = tx.send(json.clone().into_bytes());
        }
    }
}

/// Outbound feedback wire shape. Unlike inbound classification, `state`
/// here is always a boolean on the wire.
#[derive(Serialize)]
struct FeedbackFrame<'a> {
    evt: &'static str,
    name: &'a str,
    state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<&'a str>,
}

/// Resolve a failed start: back to stopped, then error and closed events.
fn start_failed(inner: &Arc<ServerInner>, msg: String) -> Result<(), Os2lError> {
    log::warn!("[OS2L Server] {msg}");
    *inner.running.lock().expect(LOCK_POISONED) = ServerState::Stopped;
    inner.events.emit(ServerEvent::Error(msg.clone()));
    inner.events.emit(ServerEvent::Closed);
    Err(Os2lError::Transport(msg))
}

/// Outcome of [`try_take_running`].
enum TakeRunning {
    /// The server was running; the caller now owns the teardown.
    Taken(Running),
    /// A `start()` is mid-flight and has not published its state yet.
    Starting,
    NotRunning,
}

/// Try to take the running state out, leaving `Stopped`. The state is
/// untouched unless `Taken` is returned.
fn try_take_running(inner: &Arc<ServerInner>) -> TakeRunning {
    let mut state = inner.running.lock().expect(LOCK_POISONED);
    match std::mem::replace(&mut *state, ServerState::Stopped) {
        ServerState::Running(running) => TakeRunning::Taken(running),
        ServerState::Starting => {
            *state = ServerState::Starting;
            TakeRunning::Starting
        }
        ServerState::Stopped => TakeRunning::NotRunning,
    }
}

async fn shutdown_running(inner: &Arc<ServerInner>, mut running: Running, abort_accept: bool) {
    if abort_accept {
        if let Some(handle) = running.accept_task.take() {
            handle.abort();
        }
    }
    let drained: Vec<SessionHandle> = {
        let mut sessions = running.sessions.lock().expect(LOCK_POISONED);
        sessions.drain().map(|(_, handle)| handle).collect()
    };
    for handle in drained {
        handle.read_task.abort();
        handle.write_task.abort();
    }
    if let Some(mut advertisement) = running.advertisement.take() {
        advertisement.withdraw().await;
    }
    log::info!("[OS2L Server] stopped");
    inner.events.emit(ServerEvent::Closed);
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    mut listener: Box<dyn Listener>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
) {
    loop {
        match listener.accept().await {
            Ok(pair) => {
                let session = SessionId(inner.next_session.fetch_add(1, Ordering::SeqCst));
                let handle = spawn_session(&inner, &sessions, session, pair);
                sessions
                    .lock()
                    .expect(LOCK_POISONED)
                    .insert(session, handle);
                log::info!("[OS2L Server] new connection {session}");
                inner.events.emit(ServerEvent::Connection { session });
            }
            Err(e) => {
                let msg = format!("accept failed: {e}");
                log::warn!("[OS2L Server] {msg}");
                inner.events.emit(ServerEvent::Error(msg));
                // The listener is unusable; shut the whole server down.
                // This task is the accept task, so it must not abort itself.
                // start() publishes the running state right after spawning
                // this task; wait the gap out if the error beat it there.
                loop {
                    match try_take_running(&inner) {
                        TakeRunning::Taken(running) => {
                            shutdown_running(&inner, running, false).await;
                            break;
                        }
                        TakeRunning::Starting => tokio::task::yield_now().await,
                        TakeRunning::NotRunning => break,
                    }
                }
                break;
            }
        }
    }
}

fn spawn_session(
    inner: &Arc<ServerInner>,
    sessions: &Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    session: SessionId,
    pair: StreamPair,
) -> SessionHandle {
    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let read_task = tokio::spawn(session_read_loop(
        Arc::clone(inner),
        Arc::clone(sessions),
        session,
        pair.reader,
    ));
    let write_task = tokio::spawn(session_write_loop(
        Arc::clone(inner),
        Arc::clone(sessions),
        session,
        pair.writer,
        outbound_rx,
    ));
    SessionHandle {
        outbound: outbound_tx,
        read_task,
        write_task,
    }
}

/// Per-session read loop. Each session gets its own decoder; a framing
/// failure discards that session's buffer but keeps the session alive.
async fn session_read_loop(
    inner: Arc<ServerInner>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    session: SessionId,
    mut reader: Box<dyn StreamReader>,
) {
    let mut decoder = FrameDecoder::new();
    loop {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => {
                let outcome = decoder.feed(&chunk);
                for message in outcome.messages {
                    dispatch(&inner, session, message);
                }
                if let Some(error) = outcome.error {
                    log::warn!("[OS2L Server] bad OS2L data on {session}: {error}");
                    inner.events.emit(ServerEvent::Decode { session, error });
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("[OS2L Server] read failed on {session}: {e}");
                break;
            }
        }
    }
    // Remove ourselves unless a server-wide shutdown or a write failure
    // already removed this session (in which case Closed or the writer's
    // SessionClosed supersedes ours).
    let removed = sessions.lock().expect(LOCK_POISONED).remove(&session);
    if let Some(handle) = removed {
        handle.write_task.abort();
        log::info!("[OS2L Server] connection {session} closed");
        inner.events.emit(ServerEvent::SessionClosed { session });
    }
}

/// Per-session write loop. A write failure is a transport error and
/// terminates the session, exactly like a read failure.
async fn session_write_loop(
    inner: Arc<ServerInner>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    session: SessionId,
    mut writer: Box<dyn StreamWriter>,
    mut outbound: UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::warn!("[OS2L Server] write failed on {session}: {e}");
            let removed = sessions.lock().expect(LOCK_POISONED).remove(&session);
            if let Some(handle) = removed {
                handle.read_task.abort();
                log::info!("[OS2L Server] connection {session} closed");
                inner.events.emit(ServerEvent::SessionClosed { session });
            }
            return;
        }
    }
}

/// Emit the generic data event, then the typed event(s) for a decoded
/// message. Button messages additionally fan out to on/off events.
fn dispatch(inner: &Arc<ServerInner>, session: SessionId, message: Value) {
    inner.events.emit(ServerEvent::Data {
        session,
        message: message.clone(),
    });
    match Os2lMessage::classify(&message) {
        Some(Os2lMessage::Button { name, state }) => {
            inner.events.emit(ServerEvent::Button {
                session,
                name: name.clone(),
                state,
            });
            if state.is_on() {
                inner.events.emit(ServerEvent::ButtonOn { session, name });
            } else {
                inner.events.emit(ServerEvent::ButtonOff { session, name });
            }
        }
        Some(Os2lMessage::Command { id, param }) => {
            inner.events.emit(ServerEvent::Command { session, id, param });
        }
        Some(Os2lMessage::Beat { change, pos, bpm }) => {
            inner.events.emit(ServerEvent::Beat {
                session,
                change,
                pos,
                bpm,
            });
        }
        Some(Os2lMessage::Feedback { name, state, page }) => {
            inner.events.emit(ServerEvent::Feedback {
                session,
                name,
                state,
                page,
            });
        }
        None => {}
    }
}
