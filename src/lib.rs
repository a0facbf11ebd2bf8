//! OS2L ("Open Sound to Light") protocol implementation.
//!
//! OS2L links audio software to lighting control software over a local
//! TCP connection: JSON objects flow in both directions with no delimiter
//! or length prefix. The audio side acts as the client, pushing `btn`,
//! `cmd`, and `beat` events; the lighting side acts as the server and
//! answers with `feedback` broadcasts.
//!
//! # Architecture
//!
//! - **Os2lClient** - dials the server, sends typed events, auto-reconnects
//! - **Os2lServer** - accepts any number of sessions, dispatches typed events
//! - **FrameDecoder** - brace-matching extraction of JSON objects from the
//!   byte stream, shared by both roles
//! - **Transport / Discovery** - injectable collaborators; TCP ships here,
//!   DNS-SD style discovery is attached by the application
//!
//! # Modules
//!
//! - [`client`] - protocol client
//! - [`server`] - protocol server
//! - [`framing`] - wire framing
//! - [`message`] - typed message kinds
//! - [`events`] - observable client/server events

pub mod client;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod events;
pub mod framing;
pub mod message;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use client::{Os2lClient, Os2lClientBuilder};
pub use constants::{
    DEFAULT_CLIENT_HOST, DEFAULT_CLIENT_PORT, DEFAULT_RECONNECT_INTERVAL, DEFAULT_SERVER_PORT,
    SERVICE_TYPE,
};
pub use error::{DecodeError, DecodeErrorKind, Os2lError};
pub use events::{ClientEvent, ServerEvent};
pub use framing::{FeedOutcome, FrameDecoder};
pub use message::{Os2lMessage, Switch};
pub use server::{Os2lServer, Os2lServerBuilder, SessionId};
