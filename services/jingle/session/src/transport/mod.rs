//! Content transports and the byte streams they produce.
//!
//! A [`Transport`] negotiates one byte stream for one content. Transports are
//! created by a [`TransportFactory`] registered under the transport
//! namespace, so new transports plug in without engine changes.

pub mod candidate;
pub mod relay;
pub mod s5b;
pub mod socks5;
pub mod stream_host;

use crate::error::{JingleError, TransportError};
use crate::security::stream::SecureStream;
use crate::signaling::ContentLink;
use async_trait::async_trait;
use jingle_wire::{Jid, Role, SessionId, TransportElement};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Any stream usable as a negotiated byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Negotiated byte stream handed to the payload consumer
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// Stream wrapped by the encrypted-transport overlay
    Encrypted(Box<SecureStream>),
    /// Stream produced by a custom transport
    Boxed(Box<dyn ByteStream>),
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStream::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            IoStream::Encrypted(_) => f.write_str("Encrypted"),
            IoStream::Boxed(_) => f.write_str("Boxed"),
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Encrypted(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            IoStream::Boxed(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Encrypted(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            IoStream::Boxed(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Encrypted(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            IoStream::Boxed(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Encrypted(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            IoStream::Boxed(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Peer address of the underlying TCP stream, if there is one
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr().ok(),
            IoStream::Encrypted(_) | IoStream::Boxed(_) => None,
        }
    }

    /// Whether the encrypted-transport overlay wraps the stream
    pub fn is_encrypted(&self) -> bool {
        matches!(self, IoStream::Encrypted(_))
    }
}

/// Parameters for creating a transport for one content
#[derive(Clone, Debug)]
pub struct TransportSetup {
    /// Session id
    pub sid: SessionId,
    /// Local endpoint
    pub local: Jid,
    /// Remote endpoint
    pub peer: Jid,
    /// Local role in the session
    pub role: Role,
    /// Content name
    pub content: String,
    /// Peer's transport element when the peer offered first
    pub remote: Option<TransportElement>,
}

/// Transport of one content
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transport namespace
    fn namespace(&self) -> &str;

    /// Element announcing the local side of the transport
    fn element(&self) -> TransportElement;

    /// Record the peer's transport element
    fn accept_remote(&self, element: &TransportElement) -> Result<(), JingleError>;

    /// Handle a transport-info message
    fn handle_info(&self, element: &TransportElement) -> Result<(), JingleError>;

    /// Negotiate the byte stream
    async fn establish(&self, link: ContentLink) -> Result<IoStream, TransportError>;

    /// Release resources reserved by the transport
    async fn release(&self);
}

/// Creates transports for one namespace
#[async_trait]
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Transport namespace
    fn namespace(&self) -> &str;

    /// Create a transport for a content
    async fn create(&self, setup: TransportSetup) -> Result<Arc<dyn Transport>, JingleError>;
}
