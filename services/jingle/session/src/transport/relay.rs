//! Relay directory collaborator and an in-process SOCKS5 relay.

use crate::error::TransportError;
use crate::transport::socks5::{self, ReplyCode};
use async_trait::async_trait;
use dashmap::DashMap;
use jingle_wire::Jid;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Network details of a relay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamHost {
    /// Relay identity
    pub jid: Jid,
    /// Host name or address literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

/// Source of relay candidates and relay activation
#[async_trait]
pub trait RelayDirectory: Send + Sync + fmt::Debug {
    /// Relays currently usable by the local endpoint
    async fn list_available_relays(&self) -> Result<Vec<Jid>, TransportError>;

    /// Network details of a relay
    async fn query_relay_capabilities(&self, relay: &Jid) -> Result<StreamHost, TransportError>;

    /// Instruct the relay to splice the two connections for the stream
    async fn activate(
        &self,
        relay: &Jid,
        sid: &str,
        requester: &Jid,
        target: &Jid,
    ) -> Result<(), TransportError>;

    /// Give up an activated relay allocation
    async fn release(&self, relay: &Jid, sid: &str, requester: &Jid, target: &Jid);
}

/// Directory without any relays
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelays;

#[async_trait]
impl RelayDirectory for NoRelays {
    async fn list_available_relays(&self) -> Result<Vec<Jid>, TransportError> {
        Ok(Vec::new())
    }

    async fn query_relay_capabilities(&self, relay: &Jid) -> Result<StreamHost, TransportError> {
        Err(TransportError::Proxy(format!("unknown relay {}", relay)))
    }

    async fn activate(
        &self,
        relay: &Jid,
        _sid: &str,
        _requester: &Jid,
        _target: &Jid,
    ) -> Result<(), TransportError> {
        Err(TransportError::Proxy(format!("unknown relay {}", relay)))
    }

    async fn release(&self, _relay: &Jid, _sid: &str, _requester: &Jid, _target: &Jid) {}
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Parked {
    stream: TcpStream,
    since: Instant,
}

#[derive(Debug)]
struct RelayState {
    pairing_timeout: Duration,
    waiting: Mutex<HashMap<String, Vec<Parked>>>,
    arrivals: Notify,
    splices: DashMap<String, JoinHandle<()>>,
    activations: AtomicUsize,
}

impl RelayState {
    fn new(pairing_timeout: Duration) -> Self {
        Self {
            pairing_timeout,
            waiting: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
            splices: DashMap::new(),
            activations: AtomicUsize::new(0),
        }
    }

    /// Drop connections for `dstaddr` that have waited longer than the pairing timeout
    fn evict_stale(&self, dstaddr: &str) {
        let Ok(mut waiting) = self.waiting.lock() else {
            return;
        };
        let Some(parked) = waiting.get_mut(dstaddr) else {
            return;
        };
        let before = parked.len();
        parked.retain(|entry| entry.since.elapsed() < self.pairing_timeout);
        let evicted = before - parked.len();
        if parked.is_empty() {
            waiting.remove(dstaddr);
        }
        if evicted > 0 {
            debug!("Relay evicted {} unpaired connection(s) for {}", evicted, dstaddr);
        }
    }
}

/// SOCKS5 relay running inside the process
///
/// Connections are parked by destination address; activation pairs the
/// two connections of a stream and splices them together.
pub struct LocalRelay {
    jid: Jid,
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    accept_task: JoinHandle<()>,
}

impl fmt::Debug for LocalRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRelay")
            .field("jid", &self.jid)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl LocalRelay {
    /// Bind the relay listener
    pub async fn bind(jid: Jid, addr: SocketAddr) -> Result<Arc<Self>, TransportError> {
        Self::bind_with_pairing_timeout(jid, addr, PAIRING_TIMEOUT).await
    }

    /// Bind the relay listener; unpaired connections are dropped after `pairing_timeout`
    pub async fn bind_with_pairing_timeout(
        jid: Jid,
        addr: SocketAddr,
        pairing_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(RelayState::new(pairing_timeout));
        info!("Relay {} listening on {}", jid, local_addr);

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Ok(Arc::new(Self {
            jid,
            local_addr,
            state,
            accept_task,
        }))
    }

    /// Relay identity
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// Address the relay listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of successful activations
    pub fn activation_count(&self) -> usize {
        self.state.activations.load(Ordering::Relaxed)
    }

    /// Number of streams currently spliced
    pub fn active_splices(&self) -> usize {
        self.state.splices.len()
    }

    /// Number of connections parked and waiting for their pair
    pub fn parked_connections(&self) -> usize {
        self.state
            .waiting
            .lock()
            .map(|waiting| waiting.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn check_relay(&self, relay: &Jid) -> Result<(), TransportError> {
        if relay != &self.jid {
            return Err(TransportError::Proxy(format!("unknown relay {}", relay)));
        }
        Ok(())
    }

    fn take_pair(&self, dstaddr: &str) -> Option<(TcpStream, TcpStream)> {
        let mut waiting = self.state.waiting.lock().ok()?;
        let ready = waiting.get(dstaddr).map(|parked| parked.len() >= 2).unwrap_or(false);
        if !ready {
            return None;
        }
        let mut parked = waiting.remove(dstaddr)?;
        let second = parked.pop()?;
        let first = parked.pop()?;
        Some((first.stream, second.stream))
    }
}

impl Drop for LocalRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
        for entry in self.state.splices.iter() {
            entry.value().abort();
        }
    }
}

#[async_trait]
impl RelayDirectory for LocalRelay {
    async fn list_available_relays(&self) -> Result<Vec<Jid>, TransportError> {
        Ok(vec![self.jid.clone()])
    }

    async fn query_relay_capabilities(&self, relay: &Jid) -> Result<StreamHost, TransportError> {
        self.check_relay(relay)?;
        Ok(StreamHost {
            jid: self.jid.clone(),
            host: self.local_addr.ip().to_string(),
            port: self.local_addr.port(),
        })
    }

    async fn activate(
        &self,
        relay: &Jid,
        sid: &str,
        requester: &Jid,
        target: &Jid,
    ) -> Result<(), TransportError> {
        self.check_relay(relay)?;
        let dstaddr = socks5::destination_address(sid, requester.as_str(), target.as_str());

        let pairing = async {
            loop {
                let arrived = self.state.arrivals.notified();
                tokio::pin!(arrived);
                arrived.as_mut().enable();
                if let Some(pair) = self.take_pair(&dstaddr) {
                    return pair;
                }
                arrived.await;
            }
        };
        let (mut first, mut second) = tokio::time::timeout(self.state.pairing_timeout, pairing)
            .await
            .map_err(|_| TransportError::Proxy(format!("no pair for stream {}", sid)))?;

        let splice_key = dstaddr.clone();
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            match tokio::io::copy_bidirectional(&mut first, &mut second).await {
                Ok((a, b)) => debug!("Relay splice {} closed after {}/{} bytes", splice_key, a, b),
                Err(e) => debug!("Relay splice {} ended: {}", splice_key, e),
            }
            state.splices.remove(&splice_key);
        });
        self.state.splices.insert(dstaddr, handle);
        self.state.activations.fetch_add(1, Ordering::Relaxed);
        info!("Relay {} activated stream {} for {} -> {}", self.jid, sid, requester, target);
        Ok(())
    }

    async fn release(&self, relay: &Jid, sid: &str, requester: &Jid, target: &Jid) {
        if self.check_relay(relay).is_err() {
            return;
        }
        let dstaddr = socks5::destination_address(sid, requester.as_str(), target.as_str());
        if let Ok(mut waiting) = self.state.waiting.lock() {
            waiting.remove(&dstaddr);
        }
        if let Some((_, handle)) = self.state.splices.remove(&dstaddr) {
            handle.abort();
            debug!("Relay {} released stream {}", self.jid, sid);
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<RelayState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(park_connection(stream, peer, Arc::clone(&state)));
            }
            Err(e) => {
                warn!("Relay accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn park_connection(mut stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) {
    let handshake = async {
        let dstaddr = socks5::accept(&mut stream).await?;
        socks5::reply(&mut stream, &dstaddr, ReplyCode::Succeeded).await?;
        Ok::<_, TransportError>(dstaddr)
    };
    let dstaddr = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(dstaddr)) => dstaddr,
        Ok(Err(e)) => {
            debug!("Relay handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("Relay handshake with {} timed out", peer);
            return;
        }
    };

    let _ = stream.set_nodelay(true);
    let parked = Parked {
        stream,
        since: Instant::now(),
    };
    match state.waiting.lock() {
        Ok(mut waiting) => waiting.entry(dstaddr.clone()).or_default().push(parked),
        Err(_) => return,
    }
    state.arrivals.notify_waiters();

    tokio::time::sleep(state.pairing_timeout).await;
    state.evict_stale(&dstaddr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_activation_splices_both_sides() {
        let relay = LocalRelay::bind(jid("proxy.example.org"), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let alice = jid("alice@example.org/a");
        let bob = jid("bob@example.org/b");
        let dst = socks5::destination_address("s1", alice.as_str(), bob.as_str());

        let mut from_bob = TcpStream::connect(relay.local_addr()).await.unwrap();
        socks5::connect(&mut from_bob, &dst).await.unwrap();
        let mut from_alice = TcpStream::connect(relay.local_addr()).await.unwrap();
        socks5::connect(&mut from_alice, &dst).await.unwrap();

        relay.activate(relay.jid(), "s1", &alice, &bob).await.unwrap();
        assert_eq!(relay.activation_count(), 1);

        from_alice.write_all(b"through the relay").await.unwrap();
        let mut buf = [0u8; 17];
        from_bob.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the relay");

        relay.release(relay.jid(), "s1", &alice, &bob).await;
        assert_eq!(relay.active_splices(), 0);
    }

    #[tokio::test]
    async fn test_unknown_relay_is_rejected() {
        let relay = LocalRelay::bind(jid("proxy.example.org"), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let other = jid("other.example.org");
        assert!(relay.query_relay_capabilities(&other).await.is_err());
        let caps = relay.query_relay_capabilities(relay.jid()).await.unwrap();
        assert_eq!(caps.port, relay.local_addr().port());
        assert!(NoRelays.list_available_relays().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unpaired_connection_is_evicted() {
        let relay = LocalRelay::bind_with_pairing_timeout(
            jid("proxy.example.org"),
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        let alice = jid("alice@example.org/a");
        let bob = jid("bob@example.org/b");
        let dst = socks5::destination_address("s1", alice.as_str(), bob.as_str());

        let mut lonely = TcpStream::connect(relay.local_addr()).await.unwrap();
        socks5::connect(&mut lonely, &dst).await.unwrap();
        let parked = async {
            while relay.parked_connections() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), parked).await.unwrap();
        drop(lonely);

        // Release of the opposite direction leaves the parked connection alone
        relay.release(relay.jid(), "s1", &bob, &alice).await;
        assert_eq!(relay.parked_connections(), 1);

        let evicted = async {
            while relay.parked_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), evicted)
            .await
            .expect("unpaired connection was never evicted");
        assert_eq!(relay.active_splices(), 0);
    }
}
