//! Multi-subscriber event dispatch.
//!
//! Client and server expose their signals as streams of tagged event
//! variants. Any number of observers may subscribe; every subscriber
//! receives every event in emission order. Delivery is non-blocking
//! (unbounded queues); a dropped receiver is pruned on the next emit.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::DecodeError;
use crate::message::Switch;
use crate::server::SessionId;

/// Fan-out bus for one component instance's events.
#[derive(Debug)]
pub(crate) struct EventBus<T> {
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T: Clone> EventBus<T> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new observer. Events emitted after this call are
    /// delivered in emission order.
    pub(crate) fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber, pruning dropped ones.
    pub(crate) fn emit(&self, event: T) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Signals observable on an [`crate::Os2lClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection was established.
    Connected,
    /// The connection is gone — failure and deliberate close raise the
    /// same signal, and both re-arm auto-reconnect when it is enabled.
    Closed,
    /// A feedback message arrived from the server.
    Feedback {
        /// Button name (empty when the server omitted it).
        name: String,
        /// Indicator state (off when the server omitted it).
        state: Switch,
        /// Page name, if any.
        page: Option<String>,
    },
    /// Any decoded message, regardless of kind.
    Data(Value),
    /// Inbound bytes could not be framed; the connection stays up.
    Decode(DecodeError),
    /// A recoverable condition (invalid-state call, reconnect attempt).
    Warning(String),
    /// A fatal condition surfaced to observers.
    Error(String),
}

/// Signals observable on an [`crate::Os2lServer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A client connected and joined the session set.
    Connection {
        /// The new session.
        session: SessionId,
    },
    /// Any decoded message from any session, regardless of kind.
    Data {
        /// Originating session.
        session: SessionId,
        /// The raw decoded object.
        message: Value,
    },
    /// A `btn` message.
    Button {
        /// Originating session.
        session: SessionId,
        /// Button name.
        name: String,
        /// Button state.
        state: Switch,
    },
    /// A `btn` message with state on.
    ButtonOn {
        /// Originating session.
        session: SessionId,
        /// Button name.
        name: String,
    },
    /// A `btn` message with state off.
    ButtonOff {
        /// Originating session.
        session: SessionId,
        /// Button name.
        name: String,
    },
    /// A `cmd` message.
    Command {
        /// Originating session.
        session: SessionId,
        /// Command identifier.
        id: u32,
        /// Command parameter.
        param: f64,
    },
    /// A `beat` message.
    Beat {
        /// Originating session.
        session: SessionId,
        /// Whether the tempo changed.
        change: bool,
        /// Beat position.
        pos: f64,
        /// Beats per minute.
        bpm: f64,
    },
    /// A `feedback` message received from a client (unusual but legal).
    Feedback {
        /// Originating session.
        session: SessionId,
        /// Button name.
        name: String,
        /// Indicator state.
        state: Switch,
        /// Page name, if any.
        page: Option<String>,
    },
    /// Inbound bytes on one session could not be framed; the session
    /// stays connected.
    Decode {
        /// Originating session.
        session: SessionId,
        /// The framing failure.
        error: DecodeError,
    },
    /// A session left the session set (error or clean end-of-stream).
    SessionClosed {
        /// The departed session.
        session: SessionId,
    },
    /// A recoverable condition.
    Warning(String),
    /// A fatal condition; the server shuts itself down afterwards.
    Error(String),
    /// The server stopped.
    Closed,
}
