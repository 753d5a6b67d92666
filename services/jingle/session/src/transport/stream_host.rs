//! Local stream-host server behind our direct candidates.
//!
//! One listener per engine accepts peers connecting to our direct
//! candidates, reads the SOCKS5 destination address and hands the
//! connection to whichever negotiator registered that address.

use crate::error::TransportError;
use crate::transport::socks5::{self, ReplyCode};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Expected = Arc<DashMap<String, mpsc::Sender<TcpStream>>>;

/// Listener accepting connections to our direct candidates
#[derive(Debug)]
pub struct StreamHostServer {
    local_addr: SocketAddr,
    expected: Expected,
    accept_task: JoinHandle<()>,
}

impl StreamHostServer {
    /// Bind the listener and start accepting
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let expected: Expected = Arc::new(DashMap::new());
        info!("Stream host listening on {}", local_addr);

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&expected)));
        Ok(Arc::new(Self {
            local_addr,
            expected,
            accept_task,
        }))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Expect connections for `dstaddr` until the registration is dropped
    pub fn expect(&self, dstaddr: impl Into<String>) -> StreamHostRegistration {
        let dstaddr = dstaddr.into();
        let (tx, rx) = mpsc::channel(4);
        self.expected.insert(dstaddr.clone(), tx);
        StreamHostRegistration {
            dstaddr,
            expected: Arc::clone(&self.expected),
            incoming: rx,
        }
    }

    /// Number of registered destination addresses
    pub fn registrations(&self) -> usize {
        self.expected.len()
    }
}

impl Drop for StreamHostServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Connections arriving for one destination address
#[derive(Debug)]
pub struct StreamHostRegistration {
    dstaddr: String,
    expected: Expected,
    incoming: mpsc::Receiver<TcpStream>,
}

impl StreamHostRegistration {
    /// Destination address this registration receives
    pub fn dstaddr(&self) -> &str {
        &self.dstaddr
    }

    /// Wait for the next connection
    pub async fn next(&mut self) -> Option<TcpStream> {
        self.incoming.recv().await
    }
}

impl Drop for StreamHostRegistration {
    fn drop(&mut self) {
        self.expected.remove(&self.dstaddr);
    }
}

async fn accept_loop(listener: TcpListener, expected: Expected) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Stream host accepted connection from {}", peer);
                tokio::spawn(handle_connection(stream, peer, Arc::clone(&expected)));
            }
            Err(e) => {
                warn!("Stream host accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, expected: Expected) {
    let dstaddr = match tokio::time::timeout(HANDSHAKE_TIMEOUT, socks5::accept(&mut stream)).await {
        Ok(Ok(dstaddr)) => dstaddr,
        Ok(Err(e)) => {
            debug!("SOCKS5 handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("SOCKS5 handshake with {} timed out", peer);
            return;
        }
    };

    let sender = expected.get(&dstaddr).map(|entry| entry.value().clone());
    let Some(sender) = sender else {
        debug!("No negotiator expects {} (from {})", dstaddr, peer);
        let _ = socks5::reply(&mut stream, &dstaddr, ReplyCode::HostUnreachable).await;
        return;
    };

    if let Err(e) = socks5::reply(&mut stream, &dstaddr, ReplyCode::Succeeded).await {
        debug!("SOCKS5 reply to {} failed: {}", peer, e);
        return;
    }
    if stream.set_nodelay(true).is_err() {
        debug!("Could not disable Nagle for {}", peer);
    }
    if sender.send(stream).await.is_err() {
        debug!("Negotiator for {} went away before taking the stream", dstaddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_registered_destination_receives_stream() {
        let server = StreamHostServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut registration = server.expect("abcdef");

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        socks5::connect(&mut client, "abcdef").await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let mut accepted = registration.next().await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_unknown_destination_is_refused() {
        let server = StreamHostServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let result = socks5::connect(&mut client, "nobody").await;
        assert!(matches!(result, Err(TransportError::Socks5(_))));
    }

    #[tokio::test]
    async fn test_registration_drop_unregisters() {
        let server = StreamHostServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let registration = server.expect("abc");
        assert_eq!(server.registrations(), 1);
        assert_eq!(registration.dstaddr(), "abc");
        drop(registration);
        assert_eq!(server.registrations(), 0);
    }
}
