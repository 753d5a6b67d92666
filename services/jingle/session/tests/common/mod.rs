//! Two-endpoint harness over the loopback signaling network.

#![allow(dead_code)]

use async_trait::async_trait;
use jingle_session::transport::TransportSetup;
use jingle_session::{
    ChannelConsumer, ContentOutcome, ContentSpec, Extensions, IoStream, JingleError, JingleEvent,
    JingleManager, LoopbackNetwork, NoRelays, OpaqueDescription, OpaqueDescriptionFactory,
    RelayDirectory, SecurityFactory, Session, SessionConfig, Socks5TransportFactory, StreamHost,
    Transport, TransportError, TransportFactory,
};
use jingle_session::signaling::ContentLink;
use jingle_wire::{Jid, Reason, Role, TransportElement};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Application namespace used by every test content
pub const APP_NS: &str = "urn:example:file-transfer";

/// Namespace of the in-memory fallback transport
pub const DUPLEX_NS: &str = "urn:example:transport:duplex";

const WAIT: Duration = Duration::from_secs(10);

pub fn jid(value: &str) -> Jid {
    Jid::new(value).unwrap()
}

/// Fast timeouts, direct candidates on localhost, no relays
pub fn test_config() -> SessionConfig {
    SessionConfig {
        response_timeout: Duration::from_secs(2),
        connect_budget: Duration::from_secs(1),
        activation_timeout: Duration::from_secs(2),
        announcement_timeout: Duration::from_secs(3),
        key_exchange_timeout: Duration::from_secs(2),
        stream_host_bind: "127.0.0.1:0".parse().unwrap(),
        local_addresses: vec!["127.0.0.1".parse().unwrap()],
        use_relays: false,
        ..Default::default()
    }
}

pub struct PeerOptions {
    pub config: SessionConfig,
    pub relays: Arc<dyn RelayDirectory>,
    pub security: Option<Arc<dyn SecurityFactory>>,
    pub fallback: Option<Arc<DuplexFactory>>,
    /// Whether the application namespace is registered
    pub application: bool,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            config: test_config(),
            relays: Arc::new(NoRelays),
            security: None,
            fallback: None,
            application: true,
        }
    }
}

pub struct Peer {
    pub jid: Jid,
    pub manager: Arc<JingleManager>,
    pub events: mpsc::UnboundedReceiver<JingleEvent>,
    pub consumer: Arc<ChannelConsumer>,
    pub outcomes: mpsc::UnboundedReceiver<ContentOutcome>,
}

impl Peer {
    pub async fn spawn(network: &Arc<LoopbackNetwork>, name: &str, options: PeerOptions) -> Self {
        let jid = jid(name);
        let s5b = Socks5TransportFactory::bind(Arc::new(options.config.clone()), options.relays)
            .await
            .unwrap();
        let (consumer, outcomes) = ChannelConsumer::new();

        let mut extensions = Extensions::new().with_transport(Arc::new(s5b));
        if options.application {
            extensions = extensions
                .with_description(Arc::new(OpaqueDescriptionFactory::new(APP_NS, consumer.clone())));
        }
        if let Some(security) = options.security {
            extensions = extensions.with_security(security);
        }
        if let Some(fallback) = options.fallback {
            extensions = extensions.with_transport(fallback);
        }

        let (manager, events) =
            JingleManager::new(jid.clone(), network.endpoint(jid.clone()), extensions, options.config);
        manager.start();

        Self {
            jid,
            manager,
            events,
            consumer,
            outcomes,
        }
    }

    pub fn spec(&self, name: &str) -> ContentSpec {
        let description = OpaqueDescription::new(
            APP_NS,
            ciborium::Value::Text(format!("{}.bin", name)),
            self.consumer.clone(),
        );
        ContentSpec::new(name, description)
    }

    pub async fn next_event(&mut self) -> JingleEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    pub async fn incoming(&mut self) -> Arc<Session> {
        loop {
            if let JingleEvent::IncomingSession(session) = self.next_event().await {
                return session;
            }
        }
    }

    pub async fn next_outcome(&mut self) -> ContentOutcome {
        tokio::time::timeout(WAIT, self.outcomes.recv())
            .await
            .expect("timed out waiting for a content outcome")
            .expect("outcome channel closed")
    }

    pub async fn ready(&mut self) -> IoStream {
        match self.next_outcome().await {
            ContentOutcome::Ready { stream, .. } => stream,
            ContentOutcome::Failed { content, reason, .. } => {
                panic!("content {} failed: {}", content, reason)
            }
        }
    }
}

pub async fn wait_ended(session: &Session) -> Option<Reason> {
    tokio::time::timeout(WAIT, session.ended())
        .await
        .expect("session did not end")
}

/// Send a message each way and check it arrives intact
pub async fn exchange(mut first: IoStream, mut second: IoStream) {
    first.write_all(b"hello from the initiator").await.unwrap();
    first.flush().await.unwrap();
    let mut buf = [0u8; 24];
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello from the initiator");

    second.write_all(b"and back").await.unwrap();
    second.flush().await.unwrap();
    let mut buf = [0u8; 8];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"and back");
}

/// Directory announcing a relay nobody listens on
#[derive(Debug)]
pub struct DeadRelay {
    host: StreamHost,
}

impl DeadRelay {
    pub async fn new(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Self {
            host: StreamHost {
                jid: jid(name),
                host: "127.0.0.1".into(),
                port,
            },
        }
    }
}

#[async_trait]
impl RelayDirectory for DeadRelay {
    async fn list_available_relays(&self) -> Result<Vec<Jid>, TransportError> {
        Ok(vec![self.host.jid.clone()])
    }

    async fn query_relay_capabilities(&self, _relay: &Jid) -> Result<StreamHost, TransportError> {
        Ok(self.host.clone())
    }

    async fn activate(
        &self,
        relay: &Jid,
        _sid: &str,
        _requester: &Jid,
        _target: &Jid,
    ) -> Result<(), TransportError> {
        Err(TransportError::Proxy(format!("{} is down", relay)))
    }

    async fn release(&self, _relay: &Jid, _sid: &str, _requester: &Jid, _target: &Jid) {}
}

type Rendezvous = Arc<Mutex<HashMap<String, DuplexStream>>>;

/// In-memory transport; both factories must share one rendezvous map
#[derive(Debug, Default, Clone)]
pub struct DuplexFactory {
    rendezvous: Rendezvous,
}

impl DuplexFactory {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let first = Self::default();
        let second = first.clone();
        (Arc::new(first), Arc::new(second))
    }
}

#[async_trait]
impl TransportFactory for DuplexFactory {
    fn namespace(&self) -> &str {
        DUPLEX_NS
    }

    async fn create(&self, setup: TransportSetup) -> Result<Arc<dyn Transport>, JingleError> {
        Ok(Arc::new(DuplexTransport {
            key: format!("{}/{}", setup.sid, setup.content),
            role: setup.role,
            rendezvous: Arc::clone(&self.rendezvous),
        }))
    }
}

#[derive(Debug)]
struct DuplexTransport {
    key: String,
    role: Role,
    rendezvous: Rendezvous,
}

#[async_trait]
impl Transport for DuplexTransport {
    fn namespace(&self) -> &str {
        DUPLEX_NS
    }

    fn element(&self) -> TransportElement {
        TransportElement::opaque(DUPLEX_NS, ciborium::Value::Null)
    }

    fn accept_remote(&self, _element: &TransportElement) -> Result<(), JingleError> {
        Ok(())
    }

    fn handle_info(&self, _element: &TransportElement) -> Result<(), JingleError> {
        Ok(())
    }

    async fn establish(&self, _link: ContentLink) -> Result<IoStream, TransportError> {
        if self.role == Role::Initiator {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            self.rendezvous.lock().unwrap().insert(self.key.clone(), theirs);
            return Ok(IoStream::Boxed(Box::new(ours)));
        }
        for _ in 0..200 {
            if let Some(stream) = self.rendezvous.lock().unwrap().remove(&self.key) {
                return Ok(IoStream::Boxed(Box::new(stream)));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(TransportError::Timeout("duplex rendezvous"))
    }

    async fn release(&self) {}
}
