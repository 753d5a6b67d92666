//! Signaling collaborator interface and the in-process loopback network.
//!
//! The engine never opens sockets for signaling. It issues requests through a
//! [`Signaling`] implementation, answers inbound requests by correlation id,
//! and receives inbound requests on a channel registered per namespace.

use crate::error::{JingleError, SignalingError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use jingle_wire::{
    decode_request, decode_response, encode_request, encode_response, Action, ContentElement,
    Jid, JingleRequest, Response, Role, SessionId, TransportElement, NS_JINGLE,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Correlates a response with the request it answers
pub type CorrelationId = u64;

/// Request delivered to a registered handler
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Correlation id to answer with
    pub correlation: CorrelationId,
    /// Sender of the request
    pub from: Jid,
    /// The request
    pub request: JingleRequest,
}

/// Message transport that delivers and correlates requests and responses
#[async_trait]
pub trait Signaling: Send + Sync + fmt::Debug {
    /// Send a request and wait for the correlated response
    async fn send_request(&self, to: &Jid, request: JingleRequest)
        -> Result<Response, SignalingError>;

    /// Answer an inbound request
    async fn send_response(
        &self,
        correlation: CorrelationId,
        response: Response,
    ) -> Result<(), SignalingError>;

    /// Route inbound requests of a namespace to the given channel
    fn register_handler(&self, namespace: &str, handler: mpsc::UnboundedSender<InboundRequest>);
}

/// Send a request, failing with [`SignalingError::Timeout`] after `timeout`
pub async fn request_with_timeout(
    signaling: &dyn Signaling,
    to: &Jid,
    request: JingleRequest,
    timeout: Duration,
) -> Result<Response, SignalingError> {
    match tokio::time::timeout(timeout, signaling.send_request(to, request)).await {
        Ok(result) => result,
        Err(_) => Err(SignalingError::Timeout),
    }
}

/// Outbound request path of one session
#[derive(Clone, Debug)]
pub struct SessionLink {
    signaling: Arc<dyn Signaling>,
    local: Jid,
    peer: Jid,
    sid: SessionId,
    role: Role,
    timeout: Duration,
}

impl SessionLink {
    /// Create a link for the given session
    pub fn new(
        signaling: Arc<dyn Signaling>,
        local: Jid,
        peer: Jid,
        sid: SessionId,
        role: Role,
        timeout: Duration,
    ) -> Self {
        Self {
            signaling,
            local,
            peer,
            sid,
            role,
            timeout,
        }
    }

    /// Local endpoint
    pub fn local(&self) -> &Jid {
        &self.local
    }

    /// Remote endpoint
    pub fn peer(&self) -> &Jid {
        &self.peer
    }

    /// Session id
    pub fn sid(&self) -> &SessionId {
        &self.sid
    }

    /// Local role in the session
    pub fn role(&self) -> Role {
        self.role
    }

    /// Empty request for this session
    pub fn request(&self, action: Action) -> JingleRequest {
        JingleRequest::new(action, self.sid.clone())
    }

    /// Send a request to the peer and require an acknowledgement
    pub async fn send(&self, request: JingleRequest) -> Result<(), JingleError> {
        let action = request.action;
        debug!("Sending {} for session {} to {}", action, self.sid, self.peer);
        match request_with_timeout(self.signaling.as_ref(), &self.peer, request, self.timeout)
            .await?
        {
            Response::Ack => Ok(()),
            Response::Error(error) => {
                debug!("Peer {} rejected {}: {}", self.peer, action, error);
                Err(JingleError::Remote(error))
            }
        }
    }

    /// Link scoped to one content
    pub fn content(&self, name: impl Into<String>, creator: Role) -> ContentLink {
        ContentLink {
            session: self.clone(),
            name: name.into(),
            creator,
        }
    }
}

/// Outbound request path of one content
#[derive(Clone, Debug)]
pub struct ContentLink {
    session: SessionLink,
    name: String,
    creator: Role,
}

impl ContentLink {
    /// The session link
    pub fn session(&self) -> &SessionLink {
        &self.session
    }

    /// Send a transport-info for this content
    pub async fn send_transport_info(&self, transport: TransportElement) -> Result<(), JingleError> {
        let content = ContentElement::new(self.creator, self.name.clone()).with_transport(transport);
        self.session
            .send(self.session.request(Action::TransportInfo).with_content(content))
            .await
    }
}

/// In-process signaling network connecting several endpoints
///
/// Every request and response passes through the CBOR codec so that the
/// engine sees exactly what a remote peer would have sent.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    handlers: DashMap<Jid, mpsc::UnboundedSender<InboundRequest>>,
    pending: DashMap<CorrelationId, oneshot::Sender<Bytes>>,
    disconnected: DashMap<Jid, ()>,
    next_correlation: AtomicU64,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an endpoint to the network
    pub fn endpoint(self: &Arc<Self>, local: Jid) -> Arc<LoopbackSignaling> {
        Arc::new(LoopbackSignaling {
            network: Arc::clone(self),
            local,
        })
    }

    /// Silently drop requests addressed to `jid` until reconnected
    pub fn disconnect(&self, jid: &Jid) {
        self.disconnected.insert(jid.clone(), ());
    }

    /// Resume delivery to `jid`
    pub fn reconnect(&self, jid: &Jid) {
        self.disconnected.remove(jid);
    }
}

/// Removes an unanswered correlation when the waiting request is dropped
struct PendingGuard<'a> {
    network: &'a LoopbackNetwork,
    correlation: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.network.pending.remove(&self.correlation);
    }
}

/// One endpoint of a [`LoopbackNetwork`]
#[derive(Debug)]
pub struct LoopbackSignaling {
    network: Arc<LoopbackNetwork>,
    local: Jid,
}

#[async_trait]
impl Signaling for LoopbackSignaling {
    async fn send_request(
        &self,
        to: &Jid,
        request: JingleRequest,
    ) -> Result<Response, SignalingError> {
        let raw = encode_request(&request)?;
        let handler = self
            .network
            .handlers
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SignalingError::Unreachable(to.clone()))?;

        let correlation = self.network.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.network.pending.insert(correlation, tx);
        let _guard = PendingGuard {
            network: &self.network,
            correlation,
        };

        if self.network.disconnected.contains_key(to) {
            trace!("Dropping {} to disconnected endpoint {}", request.action, to);
        } else {
            let inbound = InboundRequest {
                correlation,
                from: self.local.clone(),
                request: decode_request(&raw)?,
            };
            handler.send(inbound).map_err(|_| SignalingError::Closed)?;
        }

        let raw = rx.await.map_err(|_| SignalingError::Closed)?;
        Ok(decode_response(&raw)?)
    }

    async fn send_response(
        &self,
        correlation: CorrelationId,
        response: Response,
    ) -> Result<(), SignalingError> {
        let raw = encode_response(&response)?;
        match self.network.pending.remove(&correlation) {
            Some((_, tx)) => {
                if tx.send(raw).is_err() {
                    debug!("Requester of correlation {} went away", correlation);
                }
            }
            None => debug!("Late response for correlation {} discarded", correlation),
        }
        Ok(())
    }

    fn register_handler(&self, namespace: &str, handler: mpsc::UnboundedSender<InboundRequest>) {
        if namespace != NS_JINGLE {
            warn!("Loopback signaling only routes {}, ignoring {}", NS_JINGLE, namespace);
            return;
        }
        self.network.handlers.insert(self.local.clone(), handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jingle_wire::{Reason, StanzaError};

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let network = LoopbackNetwork::new();
        let alice = network.endpoint(jid("alice@example.org/a"));
        let bob = network.endpoint(jid("bob@example.org/b"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.register_handler(NS_JINGLE, tx);

        let responder = {
            let bob = Arc::clone(&bob);
            tokio::spawn(async move {
                let inbound = rx.recv().await.unwrap();
                assert_eq!(inbound.from, jid("alice@example.org/a"));
                assert_eq!(inbound.request.action, Action::SessionTerminate);
                bob.send_response(inbound.correlation, Response::Error(StanzaError::unknown_session()))
                    .await
                    .unwrap();
            })
        };

        let request = JingleRequest::new(Action::SessionTerminate, SessionId::new("s1"))
            .with_reason(Reason::Success.into());
        let response = alice.send_request(&jid("bob@example.org/b"), request).await.unwrap();
        assert_eq!(response, Response::Error(StanzaError::unknown_session()));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_unreachable() {
        let network = LoopbackNetwork::new();
        let alice = network.endpoint(jid("alice@example.org/a"));
        let request = JingleRequest::new(Action::SessionInfo, SessionId::new("s1"));
        let result = alice.send_request(&jid("nobody@example.org/x"), request).await;
        assert!(matches!(result, Err(SignalingError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_disconnected_endpoint_times_out() {
        let network = LoopbackNetwork::new();
        let alice = network.endpoint(jid("alice@example.org/a"));
        let bob = network.endpoint(jid("bob@example.org/b"));
        let (tx, _rx) = mpsc::unbounded_channel();
        bob.register_handler(NS_JINGLE, tx);
        network.disconnect(&jid("bob@example.org/b"));

        let request = JingleRequest::new(Action::SessionInfo, SessionId::new("s1"));
        let result = request_with_timeout(
            alice.as_ref(),
            &jid("bob@example.org/b"),
            request,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(SignalingError::Timeout)));
        assert!(network.pending.is_empty());
    }
}
