//! Byte-stream transport abstraction and the default TCP implementation.
//!
//! The protocol core consumes transports through these traits only:
//! a client-initiated [`Transport::connect`] or a server-side
//! [`Transport::listen`]/[`Listener::accept`], each yielding a split
//! [`StreamPair`]. The reader half is a push source of inbound chunks; the
//! writer half takes fire-and-forget writes. Dropping a half releases it.
//!
//! [`TcpTransport`] is the implementation both roles use in production.
//! Tests substitute scripted transports to exercise failure paths.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Read buffer size for TCP chunk reads.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Inbound half of one connection.
#[async_trait]
pub trait StreamReader: Send {
    /// Wait for the next chunk of inbound bytes.
    ///
    /// Returns `Ok(None)` on clean end-of-stream. Chunk boundaries carry
    /// no meaning; the framing layer reassembles messages.
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;
}

/// Outbound half of one connection.
#[async_trait]
pub trait StreamWriter: Send {
    /// Write the whole buffer to the peer.
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// A connected byte stream, split into independently owned halves so
/// reading and writing can proceed from different tasks.
pub struct StreamPair {
    /// Inbound half.
    pub reader: Box<dyn StreamReader>,
    /// Outbound half.
    pub writer: Box<dyn StreamWriter>,
}

impl std::fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPair").finish_non_exhaustive()
    }
}

/// A bound listening socket producing accepted connections.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> io::Result<StreamPair>;

    /// The actual bound port (useful when listening on port 0).
    fn local_port(&self) -> u16;
}

/// Reliable, ordered byte-stream transport consumed by the protocol core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> io::Result<StreamPair>;

    /// Bind a listening socket on `port` (0 picks an ephemeral port).
    async fn listen(&self, port: u16) -> io::Result<Box<dyn Listener>>;
}

/// Plain TCP transport backed by `tokio::net`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> io::Result<StreamPair> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(split_tcp_stream(stream))
    }

    async fn listen(&self, port: u16) -> io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        Ok(Box::new(TcpStreamListener {
            listener,
            local_port,
        }))
    }
}

fn split_tcp_stream(stream: TcpStream) -> StreamPair {
    let (read_half, write_half) = stream.into_split();
    StreamPair {
        reader: Box::new(TcpStreamReader {
            inner: read_half,
            buf: vec![0u8; READ_BUFFER_SIZE],
        }),
        writer: Box::new(TcpStreamWriter { inner: write_half }),
    }
}

struct TcpStreamReader {
    inner: OwnedReadHalf,
    buf: Vec<u8>,
}

#[async_trait]
impl StreamReader for TcpStreamReader {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
        }
    }
}

struct TcpStreamWriter {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl StreamWriter for TcpStreamWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes).await
    }
}

struct TcpStreamListener {
    listener: TcpListener,
    local_port: u16,
}

#[async_trait]
impl Listener for TcpStreamListener {
    async fn accept(&mut self) -> io::Result<StreamPair> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(split_tcp_stream(stream))
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_round_trip_and_eof() {
        let transport = TcpTransport;
        let mut listener = transport.listen(0).await.expect("Should bind");
        let port = listener.local_port();
        assert_ne!(port, 0);

        let client = tokio::spawn(async move {
            let mut pair = TcpTransport
                .connect("127.0.0.1", port)
                .await
                .expect("Should connect");
            pair.writer.write_all(b"hello").await.expect("Should write");
            let StreamPair { reader, writer } = pair;
            drop(writer);
            reader
        });

        let mut accepted = listener.accept().await.expect("Should accept");
        let chunk = accepted
            .reader
            .next_chunk()
            .await
            .expect("Should read")
            .expect("Should not be EOF yet");
        assert_eq!(&chunk[..], b"hello");

        // Client dropped its writer; the next read sees end-of-stream.
        let eof = accepted.reader.next_chunk().await.expect("Should read");
        assert!(eof.is_none());

        let _pair = client.await.expect("Client task should finish");
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        let transport = TcpTransport;
        let listener = transport.listen(0).await.expect("Should bind");
        let port = listener.local_port();
        drop(listener);

        let result = transport.connect("127.0.0.1", port).await;
        assert!(result.is_err());
    }
}
