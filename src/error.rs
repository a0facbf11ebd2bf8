//! Errors that can occur during OS2L operations.
//!
//! Decode errors are always recoverable: the decoder discards the corrupt
//! buffer and resynchronizes on the next well-formed object. Transport
//! errors terminate the affected connection only. Usage errors are reported
//! as warning signals and never unwind to the caller; configuration errors
//! fail fast at construction.

/// What made an inbound byte sequence undecodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The accumulation buffer does not start with `{`.
    BadData,
    /// A balanced-brace span was extracted but is not valid JSON.
    CorruptJson,
}

/// A non-fatal framing failure.
///
/// Carries the discarded content: the whole buffer for [`DecodeErrorKind::BadData`],
/// the offending candidate span for [`DecodeErrorKind::CorruptJson`]. Either
/// way the decoder's buffer is empty afterwards and the bytes are lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Failure classification.
    pub kind: DecodeErrorKind,
    /// The content that was discarded (lossy UTF-8).
    pub content: String,
}

impl DecodeError {
    pub(crate) fn bad_data(content: String) -> Self {
        Self {
            kind: DecodeErrorKind::BadData,
            content,
        }
    }

    pub(crate) fn corrupt_json(content: String) -> Self {
        Self {
            kind: DecodeErrorKind::CorruptJson,
            content,
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DecodeErrorKind::BadData => write!(f, "bad data: {:?}", self.content),
            DecodeErrorKind::CorruptJson => write!(f, "corrupt JSON object: {:?}", self.content),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors surfaced by the OS2L client and server.
#[derive(Debug, Clone, PartialEq)]
pub enum Os2lError {
    /// Invalid construction options. Fatal, raised synchronously at build time.
    Config(String),
    /// Connect/listen/accept/write failure on the underlying byte stream.
    Transport(String),
    /// Framing failure on inbound bytes.
    Decode(DecodeError),
    /// An operation was invoked in an invalid state.
    Usage(String),
}

impl std::fmt::Display for Os2lError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Decode(err) => write!(f, "decode error: {err}"),
            Self::Usage(msg) => write!(f, "usage error: {msg}"),
        }
    }
}

impl std::error::Error for Os2lError {}

impl From<DecodeError> for Os2lError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}
