//! SOCKS5 bytestreams transport negotiation.
//!
//! Each side connects to the peer's candidates, announces the one it could
//! use and waits for the peer's announcement. Both choices feed
//! [`nominate`], which both sides evaluate identically. A nominated relay
//! must be activated by the party that offered it before data flows.

use crate::config::SessionConfig;
use crate::error::{JingleError, TransportError};
use crate::signaling::ContentLink;
use crate::transport::candidate::{nominate, Candidate, Nomination};
use crate::transport::relay::RelayDirectory;
use crate::transport::socks5;
use crate::transport::stream_host::{StreamHostRegistration, StreamHostServer};
use crate::transport::{IoStream, Transport, TransportFactory, TransportSetup};
use async_trait::async_trait;
use jingle_wire::{
    Jid, Role, Socks5Info, Socks5Mode, Socks5Transport, TransportElement, NS_JINGLE_S5B,
};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Relay activation notice received from the peer
#[derive(Clone, Debug, PartialEq, Eq)]
enum PeerActivation {
    Activated(String),
    ProxyError,
}

/// SOCKS5 bytestreams negotiator for one content
#[derive(Debug)]
pub struct Socks5Negotiator {
    stream_sid: String,
    local: Jid,
    peer: Jid,
    role: Role,
    config: Arc<SessionConfig>,
    relays: Arc<dyn RelayDirectory>,
    local_candidates: Vec<Candidate>,
    /// Destination address peers use on our candidates
    offer_dstaddr: String,
    /// Destination address we use on the peer's candidates
    connect_dstaddr: String,
    remote_candidates: OnceLock<Vec<Candidate>>,
    their_choice: watch::Sender<Option<Candidate>>,
    peer_activation: watch::Sender<Option<PeerActivation>>,
    incoming: tokio::sync::Mutex<Option<StreamHostRegistration>>,
    activated_relays: Mutex<Vec<Jid>>,
}

impl Socks5Negotiator {
    /// Stream id of the bytestream
    pub fn stream_sid(&self) -> &str {
        &self.stream_sid
    }

    /// Candidates offered to the peer, highest priority first
    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    /// Candidates offered by the peer, once known
    pub fn remote_candidates(&self) -> Option<&[Candidate]> {
        self.remote_candidates.get().map(Vec::as_slice)
    }

    /// The peer's announced choice, once received
    pub fn their_choice(&self) -> Option<Candidate> {
        self.their_choice.borrow().clone()
    }

    fn record_their_choice(&self, candidate: Candidate) -> Result<(), JingleError> {
        let recorded = self.their_choice.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(candidate);
            true
        });
        if !recorded {
            return Err(JingleError::OutOfOrder(format!(
                "candidate already announced for stream {}",
                self.stream_sid
            )));
        }
        Ok(())
    }

    /// Try the peer's candidates in order and keep the first that connects
    async fn connect_first(&self, candidates: &[Candidate]) -> Option<(Candidate, TcpStream)> {
        let deadline = Instant::now() + self.config.connect_budget;
        for (index, candidate) in candidates.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Connect budget exhausted for stream {}", self.stream_sid);
                break;
            }
            let left = u32::try_from(candidates.len() - index).unwrap_or(u32::MAX);
            let slice = remaining / left;

            match tokio::time::timeout(slice, candidate.connect(&self.connect_dstaddr)).await {
                Ok(Ok(stream)) => return Some((candidate.clone(), stream)),
                Ok(Err(e)) => debug!("Candidate {} failed: {}", candidate, e),
                Err(_) => debug!("Candidate {} timed out after {:?}", candidate, slice),
            }
        }
        None
    }

    async fn announce(&self, link: &ContentLink, info: Socks5Info) -> Result<(), TransportError> {
        debug!("Announcing {} on stream {}", info.as_str(), self.stream_sid);
        let element = TransportElement::socks5(Socks5Transport::info(self.stream_sid.clone(), info));
        link.send_transport_info(element)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn wait_their_choice(&self) -> Result<Candidate, TransportError> {
        let mut rx = self.their_choice.subscribe();
        let wait = async {
            match rx.wait_for(Option::is_some).await {
                Ok(choice) => choice.clone(),
                Err(_) => None,
            }
        };
        match tokio::time::timeout(self.config.announcement_timeout, wait).await {
            Ok(Some(candidate)) => Ok(candidate),
            Ok(None) => Err(TransportError::Negotiation("negotiator dropped".into())),
            Err(_) => Err(TransportError::Timeout("candidate announcement")),
        }
    }

    async fn wait_peer_activation(&self, candidate: &Candidate) -> Result<(), TransportError> {
        let mut rx = self.peer_activation.subscribe();
        let wait = async {
            match rx.wait_for(Option::is_some).await {
                Ok(notice) => notice.clone(),
                Err(_) => None,
            }
        };
        // The peer spends up to activation_timeout on the relay, then signals us
        let bound = self.config.activation_timeout + self.config.response_timeout;
        let notice = tokio::time::timeout(bound, wait)
            .await
            .map_err(|_| TransportError::Timeout("candidate-activated"))?;
        self.peer_activation.send_replace(None);

        match notice {
            Some(PeerActivation::Activated(cid)) if cid == candidate.cid => Ok(()),
            Some(PeerActivation::Activated(cid)) => Err(TransportError::Proxy(format!(
                "peer activated {} instead of {}",
                cid, candidate.cid
            ))),
            Some(PeerActivation::ProxyError) => {
                Err(TransportError::Proxy("peer reported proxy-error".into()))
            }
            None => Err(TransportError::Negotiation("negotiator dropped".into())),
        }
    }

    async fn activate_local(&self, candidate: &Candidate) -> Result<TcpStream, TransportError> {
        let relay = candidate
            .jid
            .clone()
            .ok_or_else(|| TransportError::Negotiation("relay candidate without jid".into()))?;
        let work = async {
            let stream = candidate.connect(&self.offer_dstaddr).await?;
            self.relays
                .activate(&relay, &self.stream_sid, &self.local, &self.peer)
                .await?;
            Ok::<_, TransportError>(stream)
        };
        let stream = tokio::time::timeout(self.config.activation_timeout, work)
            .await
            .map_err(|_| TransportError::Timeout("relay activation"))??;

        if let Ok(mut activated) = self.activated_relays.lock() {
            activated.push(relay);
        }
        Ok(stream)
    }

    async fn take_incoming(&self) -> Result<TcpStream, TransportError> {
        let mut incoming = self.incoming.lock().await;
        let registration = incoming
            .as_mut()
            .ok_or_else(|| TransportError::Negotiation("transport released".into()))?;
        match tokio::time::timeout(self.config.activation_timeout, registration.next()).await {
            Ok(Some(stream)) => Ok(stream),
            Ok(None) => Err(TransportError::Negotiation("stream host closed".into())),
            Err(_) => Err(TransportError::Timeout("peer connection")),
        }
    }
}

#[async_trait]
impl Transport for Socks5Negotiator {
    fn namespace(&self) -> &str {
        NS_JINGLE_S5B
    }

    fn element(&self) -> TransportElement {
        TransportElement::socks5(Socks5Transport {
            sid: self.stream_sid.clone(),
            dstaddr: Some(self.offer_dstaddr.clone()),
            mode: Socks5Mode::Tcp,
            candidates: self
                .local_candidates
                .iter()
                .filter_map(Candidate::to_element)
                .collect(),
            info: None,
        })
    }

    fn accept_remote(&self, element: &TransportElement) -> Result<(), JingleError> {
        let offer = element
            .as_socks5()
            .ok_or_else(|| JingleError::BadRequest("expected a socks5 transport".into()))?;
        if offer.sid != self.stream_sid {
            return Err(JingleError::BadRequest(format!(
                "stream id {} does not match {}",
                offer.sid, self.stream_sid
            )));
        }
        if offer.mode != Socks5Mode::Tcp {
            return Err(JingleError::BadRequest("only tcp mode is supported".into()));
        }
        if let Some(dstaddr) = &offer.dstaddr {
            if dstaddr != &self.connect_dstaddr {
                warn!("Peer {} announced unexpected dstaddr {}", self.peer, dstaddr);
            }
        }

        let candidates = offer.candidates.iter().map(Candidate::from).collect::<Vec<_>>();
        debug!(
            "Stream {} received {} candidates from {}",
            self.stream_sid,
            candidates.len(),
            self.peer
        );
        self.remote_candidates
            .set(candidates)
            .map_err(|_| JingleError::OutOfOrder("peer candidates already received".into()))
    }

    fn handle_info(&self, element: &TransportElement) -> Result<(), JingleError> {
        let message = element
            .as_socks5()
            .ok_or_else(|| JingleError::BadRequest("expected a socks5 transport".into()))?;
        if message.sid != self.stream_sid {
            return Err(JingleError::BadRequest(format!(
                "stream id {} does not match {}",
                message.sid, self.stream_sid
            )));
        }

        match &message.info {
            None => Err(JingleError::BadRequest("transport-info without info".into())),
            Some(Socks5Info::CandidateUsed { cid }) => {
                let candidate = self
                    .local_candidates
                    .iter()
                    .find(|candidate| &candidate.cid == cid)
                    .cloned()
                    .ok_or_else(|| JingleError::BadRequest(format!("unknown candidate {}", cid)))?;
                debug!("Peer {} used candidate {}", self.peer, candidate);
                self.record_their_choice(candidate)
            }
            Some(Socks5Info::CandidateError) => {
                debug!("Peer {} could not connect to any candidate", self.peer);
                self.record_their_choice(Candidate::failure())
            }
            Some(Socks5Info::CandidateActivated { cid }) => {
                self.peer_activation
                    .send_replace(Some(PeerActivation::Activated(cid.clone())));
                Ok(())
            }
            Some(Socks5Info::ProxyError) => {
                self.peer_activation.send_replace(Some(PeerActivation::ProxyError));
                Ok(())
            }
        }
    }

    async fn establish(&self, link: ContentLink) -> Result<IoStream, TransportError> {
        let remote = self
            .remote_candidates
            .get()
            .cloned()
            .ok_or_else(|| TransportError::Negotiation("peer candidates missing".into()))?;
        info!(
            "Negotiating bytestream {} with {} ({} local, {} remote candidates)",
            self.stream_sid,
            self.peer,
            self.local_candidates.len(),
            remote.len()
        );

        let (mut our, mut our_stream) = match self.connect_first(&remote).await {
            Some((candidate, stream)) => (candidate, Some(stream)),
            None => (Candidate::failure(), None),
        };

        let announcement = if our.is_failure() {
            Socks5Info::CandidateError
        } else {
            Socks5Info::CandidateUsed {
                cid: our.cid.clone(),
            }
        };
        self.announce(&link, announcement).await?;

        let mut their = self.wait_their_choice().await?;

        loop {
            let nomination = nominate(&our, &their, self.role);
            debug!(
                "Stream {} nomination: ours {}, theirs {} -> {:?}",
                self.stream_sid,
                our,
                their,
                nomination.candidate().map(|c| c.cid.as_str())
            );

            match nomination {
                Nomination::Failed => {
                    info!("All candidates failed for stream {}", self.stream_sid);
                    return Err(TransportError::AllCandidatesFailed);
                }
                Nomination::Remote(candidate) => {
                    let stream = our_stream.take().ok_or_else(|| {
                        TransportError::Negotiation("no connection to nominated candidate".into())
                    })?;
                    if !candidate.is_relay() {
                        info!("Stream {} using peer candidate {}", self.stream_sid, candidate);
                        return Ok(IoStream::Plain(stream));
                    }
                    match self.wait_peer_activation(&candidate).await {
                        Ok(()) => {
                            info!("Stream {} using peer relay {}", self.stream_sid, candidate);
                            return Ok(IoStream::Plain(stream));
                        }
                        Err(TransportError::Proxy(reason)) => {
                            warn!("Peer relay {} unusable: {}", candidate, reason);
                            our = Candidate::failure();
                        }
                        Err(e) => return Err(e),
                    }
                }
                Nomination::Local(candidate) => {
                    if !candidate.is_relay() {
                        let stream = self.take_incoming().await?;
                        info!("Stream {} using our candidate {}", self.stream_sid, candidate);
                        return Ok(IoStream::Plain(stream));
                    }
                    match self.activate_local(&candidate).await {
                        Ok(stream) => {
                            self.announce(
                                &link,
                                Socks5Info::CandidateActivated {
                                    cid: candidate.cid.clone(),
                                },
                            )
                            .await?;
                            info!("Stream {} using our relay {}", self.stream_sid, candidate);
                            return Ok(IoStream::Plain(stream));
                        }
                        Err(e) => {
                            warn!("Activation of relay {} failed: {}", candidate, e);
                            self.announce(&link, Socks5Info::ProxyError).await?;
                            their = Candidate::failure();
                        }
                    }
                }
            }
        }
    }

    async fn release(&self) {
        self.incoming.lock().await.take();
        let activated = match self.activated_relays.lock() {
            Ok(mut activated) => std::mem::take(&mut *activated),
            Err(_) => Vec::new(),
        };
        for relay in activated {
            debug!("Releasing relay {} for stream {}", relay, self.stream_sid);
            self.relays
                .release(&relay, &self.stream_sid, &self.local, &self.peer)
                .await;
        }
    }
}

/// Creates SOCKS5 bytestream negotiators sharing one stream-host server
#[derive(Debug)]
pub struct Socks5TransportFactory {
    config: Arc<SessionConfig>,
    stream_host: Arc<StreamHostServer>,
    relays: Arc<dyn RelayDirectory>,
}

impl Socks5TransportFactory {
    /// Create a factory around an existing stream-host server
    pub fn new(
        config: Arc<SessionConfig>,
        stream_host: Arc<StreamHostServer>,
        relays: Arc<dyn RelayDirectory>,
    ) -> Self {
        Self {
            config,
            stream_host,
            relays,
        }
    }

    /// Bind a stream-host server on the configured address and create a factory
    pub async fn bind(
        config: Arc<SessionConfig>,
        relays: Arc<dyn RelayDirectory>,
    ) -> Result<Self, TransportError> {
        let stream_host = StreamHostServer::bind(config.stream_host_bind).await?;
        Ok(Self::new(config, stream_host, relays))
    }

    /// The stream-host server behind our direct candidates
    pub fn stream_host(&self) -> &Arc<StreamHostServer> {
        &self.stream_host
    }

    async fn gather(&self, local: &Jid) -> Vec<Candidate> {
        let port = self.stream_host.local_addr().port();
        let mut candidates = self
            .config
            .local_addresses
            .iter()
            .map(|address| {
                Candidate::direct(
                    new_cid(),
                    address.to_string(),
                    port,
                    local.clone(),
                    self.config.direct_priority,
                )
            })
            .collect::<Vec<_>>();

        if self.config.use_relays {
            match self.relays.list_available_relays().await {
                Ok(relays) => {
                    for relay in relays {
                        match self.relays.query_relay_capabilities(&relay).await {
                            Ok(host) => candidates.push(Candidate::relay(
                                new_cid(),
                                host.host,
                                host.port,
                                host.jid,
                                self.config.relay_priority,
                            )),
                            Err(e) => warn!("Skipping relay {}: {}", relay, e),
                        }
                    }
                }
                Err(e) => warn!("Relay lookup failed: {}", e),
            }
        }

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates
    }
}

fn new_cid() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[async_trait]
impl TransportFactory for Socks5TransportFactory {
    fn namespace(&self) -> &str {
        NS_JINGLE_S5B
    }

    async fn create(&self, setup: TransportSetup) -> Result<Arc<dyn Transport>, JingleError> {
        let stream_sid = match &setup.remote {
            Some(element) => element
                .as_socks5()
                .ok_or_else(|| JingleError::BadRequest("expected a socks5 transport".into()))?
                .sid
                .clone(),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        let local_candidates = self.gather(&setup.local).await;
        let offer_dstaddr =
            socks5::destination_address(&stream_sid, setup.local.as_str(), setup.peer.as_str());
        let connect_dstaddr =
            socks5::destination_address(&stream_sid, setup.peer.as_str(), setup.local.as_str());
        let registration = self.stream_host.expect(offer_dstaddr.clone());
        debug!(
            "Created bytestream {} for content {} of session {} with {} candidates",
            stream_sid,
            setup.content,
            setup.sid,
            local_candidates.len()
        );

        let negotiator = Socks5Negotiator {
            stream_sid,
            local: setup.local,
            peer: setup.peer,
            role: setup.role,
            config: Arc::clone(&self.config),
            relays: Arc::clone(&self.relays),
            local_candidates,
            offer_dstaddr,
            connect_dstaddr,
            remote_candidates: OnceLock::new(),
            their_choice: watch::channel(None).0,
            peer_activation: watch::channel(None).0,
            incoming: tokio::sync::Mutex::new(Some(registration)),
            activated_relays: Mutex::new(Vec::new()),
        };
        if let Some(remote) = &setup.remote {
            negotiator.accept_remote(remote)?;
        }
        Ok(Arc::new(negotiator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::relay::NoRelays;
    use jingle_wire::SessionId;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::TcpListener;

    const TEST_BOUND: Duration = Duration::from_secs(2);

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    fn test_config() -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            stream_host_bind: "127.0.0.1:0".parse().unwrap(),
            local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            connect_budget: Duration::from_millis(300),
            ..Default::default()
        })
    }

    fn bare_negotiator(
        config: Arc<SessionConfig>,
        factory: &Socks5TransportFactory,
    ) -> Socks5Negotiator {
        Socks5Negotiator {
            stream_sid: "s".into(),
            local: jid("alice@example.org/a"),
            peer: jid("bob@example.org/b"),
            role: Role::Initiator,
            config,
            relays: Arc::new(NoRelays),
            local_candidates: Vec::new(),
            offer_dstaddr: "x".into(),
            connect_dstaddr: "y".into(),
            remote_candidates: OnceLock::new(),
            their_choice: watch::channel(None).0,
            peer_activation: watch::channel(None).0,
            incoming: tokio::sync::Mutex::new(Some(factory.stream_host().expect("x"))),
            activated_relays: Mutex::new(Vec::new()),
        }
    }

    async fn negotiator(remote: Option<TransportElement>) -> Arc<dyn Transport> {
        let factory = Socks5TransportFactory::bind(test_config(), Arc::new(NoRelays))
            .await
            .unwrap();
        let role = if remote.is_some() { Role::Responder } else { Role::Initiator };
        factory
            .create(TransportSetup {
                sid: SessionId::new("session-1"),
                local: jid("alice@example.org/a"),
                peer: jid("bob@example.org/b"),
                role,
                content: "file".into(),
                remote,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offer_lists_direct_candidates() {
        let transport = negotiator(None).await;
        let element = transport.element();
        let offer = element.as_socks5().unwrap();
        assert_eq!(offer.candidates.len(), 1);
        assert_eq!(offer.candidates[0].priority, 100);
        assert_eq!(offer.candidates[0].host, "127.0.0.1");
        assert!(offer.dstaddr.is_some());
    }

    #[tokio::test]
    async fn test_their_choice_is_write_once() {
        let transport = negotiator(None).await;
        let offer = transport.element();
        let sid = offer.as_socks5().unwrap().sid.clone();
        let cid = offer.as_socks5().unwrap().candidates[0].cid.clone();

        let used = TransportElement::socks5(Socks5Transport::info(
            sid.clone(),
            Socks5Info::CandidateUsed { cid: cid.clone() },
        ));
        transport.handle_info(&used).unwrap();

        let again =
            TransportElement::socks5(Socks5Transport::info(sid.clone(), Socks5Info::CandidateError));
        let result = transport.handle_info(&again);
        assert!(matches!(result, Err(JingleError::OutOfOrder(_))));

        let unknown = TransportElement::socks5(Socks5Transport::info(
            sid,
            Socks5Info::CandidateUsed { cid: "nope".into() },
        ));
        assert!(matches!(transport.handle_info(&unknown), Err(JingleError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_responder_adopts_stream_sid_and_candidates() {
        let offer = negotiator(None).await.element();
        let transport = negotiator(Some(offer.clone())).await;
        let answer = transport.element();
        assert_eq!(answer.as_socks5().unwrap().sid, offer.as_socks5().unwrap().sid);

        let result = transport.accept_remote(&offer);
        assert!(matches!(result, Err(JingleError::OutOfOrder(_))));
    }

    #[tokio::test]
    async fn test_connect_attempts_respect_budget() {
        // Accepts TCP at the kernel level but never answers the SOCKS5 greeting
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let owner = jid("bob@example.org/b");
        let candidates = vec![
            Candidate::direct("c1", "127.0.0.1", port, owner.clone(), 100),
            Candidate::direct("c2", "127.0.0.1", port, owner, 100),
        ];

        let factory = Socks5TransportFactory::bind(test_config(), Arc::new(NoRelays))
            .await
            .unwrap();
        let negotiator = bare_negotiator(test_config(), &factory);

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(TEST_BOUND, negotiator.connect_first(&candidates))
            .await
            .expect("connect attempts exceeded their budget");
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(silent);
    }

    #[tokio::test]
    async fn test_peer_activation_wait_outlasts_activation_timeout() {
        let config = Arc::new(SessionConfig {
            activation_timeout: Duration::from_millis(100),
            response_timeout: Duration::from_millis(400),
            ..(*test_config()).clone()
        });
        let factory = Socks5TransportFactory::bind(Arc::clone(&config), Arc::new(NoRelays))
            .await
            .unwrap();
        let negotiator = Arc::new(bare_negotiator(config, &factory));
        let relay = Candidate::relay("r1", "127.0.0.1", 1080, jid("proxy.example.org"), 0);

        // The peer reports activation after its own activation_timeout has elapsed
        let notifier = Arc::clone(&negotiator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            notifier
                .peer_activation
                .send_replace(Some(PeerActivation::Activated("r1".into())));
        });

        let result = negotiator.wait_peer_activation(&relay).await;
        assert!(result.is_ok(), "activation wait gave up early: {:?}", result);

        // Without a notice the wait still ends once the combined bound expires
        let started = std::time::Instant::now();
        let result = negotiator.wait_peer_activation(&relay).await;
        assert!(matches!(result, Err(TransportError::Timeout("candidate-activated"))));
        assert!(started.elapsed() < TEST_BOUND);
    }
}
