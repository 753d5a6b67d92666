//! Transport candidates and nomination.

use crate::error::TransportError;
use crate::transport::socks5;
use jingle_wire::{CandidateElement, CandidateType, Jid, Role};
use std::fmt;
use tokio::net::TcpStream;
use tracing::debug;

/// Kind of a candidate endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// Address of the offering party itself
    Direct,
    /// Third-party relay that splices both connections after activation
    Relay,
}

impl From<CandidateType> for CandidateKind {
    fn from(kind: CandidateType) -> Self {
        match kind {
            CandidateType::Direct => CandidateKind::Direct,
            CandidateType::Proxy => CandidateKind::Relay,
        }
    }
}

impl From<CandidateKind> for CandidateType {
    fn from(kind: CandidateKind) -> Self {
        match kind {
            CandidateKind::Direct => CandidateType::Direct,
            CandidateKind::Relay => CandidateType::Proxy,
        }
    }
}

/// One reachable network endpoint offered for a transport
///
/// A candidate with a negative priority is the failure sentinel: it stands
/// for "no candidate could be used" so that nomination compares uniformly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Candidate id, unique within the offer
    pub cid: String,
    /// Host name or address literal
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Owner of the address (the offering party or the relay)
    pub jid: Option<Jid>,
    /// Candidate kind
    pub kind: CandidateKind,
    /// Priority, higher is preferred
    pub priority: i64,
}

impl Candidate {
    /// Directly reachable address of `owner`
    pub fn direct(
        cid: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        owner: Jid,
        priority: u32,
    ) -> Self {
        Self {
            cid: cid.into(),
            host: host.into(),
            port,
            jid: Some(owner),
            kind: CandidateKind::Direct,
            priority: i64::from(priority),
        }
    }

    /// Relay endpoint identified by `relay`
    pub fn relay(
        cid: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        relay: Jid,
        priority: u32,
    ) -> Self {
        Self {
            cid: cid.into(),
            host: host.into(),
            port,
            jid: Some(relay),
            kind: CandidateKind::Relay,
            priority: i64::from(priority),
        }
    }

    /// The failure sentinel
    pub fn failure() -> Self {
        Self {
            cid: String::new(),
            host: String::new(),
            port: 0,
            jid: None,
            kind: CandidateKind::Direct,
            priority: -1,
        }
    }

    /// Whether this is the failure sentinel
    pub fn is_failure(&self) -> bool {
        self.priority < 0
    }

    /// Whether the candidate needs relay activation
    pub fn is_relay(&self) -> bool {
        self.kind == CandidateKind::Relay
    }

    /// Open a TCP connection and complete the SOCKS5 handshake for `dstaddr`
    pub async fn connect(&self, dstaddr: &str) -> Result<TcpStream, TransportError> {
        if self.is_failure() {
            return Err(TransportError::Negotiation(
                "cannot connect to the failure sentinel".into(),
            ));
        }
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        socks5::connect(&mut stream, dstaddr).await?;
        debug!("Connected to candidate {} at {}:{}", self.cid, self.host, self.port);
        Ok(stream)
    }

    /// Wire form of the candidate
    pub fn to_element(&self) -> Option<CandidateElement> {
        let jid = self.jid.clone()?;
        Some(CandidateElement {
            cid: self.cid.clone(),
            host: self.host.clone(),
            port: self.port,
            jid,
            kind: self.kind.into(),
            priority: u32::try_from(self.priority).ok()?,
        })
    }
}

impl From<&CandidateElement> for Candidate {
    fn from(element: &CandidateElement) -> Self {
        Self {
            cid: element.cid.clone(),
            host: element.host.clone(),
            port: element.port,
            jid: Some(element.jid.clone()),
            kind: element.kind.into(),
            priority: i64::from(element.priority),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_failure() {
            return f.write_str("<failure>");
        }
        write!(
            f,
            "{} ({:?} {}:{} prio {})",
            self.cid, self.kind, self.host, self.port, self.priority
        )
    }
}

/// Outcome of comparing both parties' choices
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Nomination {
    /// One of our offered candidates, which the peer connected to
    Local(Candidate),
    /// One of the peer's candidates, which we connected to
    Remote(Candidate),
    /// Neither party could connect
    Failed,
}

impl Nomination {
    /// Nominated candidate, if any
    pub fn candidate(&self) -> Option<&Candidate> {
        match self {
            Nomination::Local(candidate) | Nomination::Remote(candidate) => Some(candidate),
            Nomination::Failed => None,
        }
    }
}

/// Pick the candidate both parties use
///
/// `our` is the peer-offered candidate we connected to, `their` is our
/// candidate the peer reported. On equal priority the candidate chosen by
/// the session initiator wins, so both parties reach the same result.
pub fn nominate(our: &Candidate, their: &Candidate, role: Role) -> Nomination {
    match (our.is_failure(), their.is_failure()) {
        (true, true) => Nomination::Failed,
        (true, false) => Nomination::Local(their.clone()),
        (false, true) => Nomination::Remote(our.clone()),
        (false, false) => {
            if our.priority > their.priority {
                Nomination::Remote(our.clone())
            } else if our.priority < their.priority {
                Nomination::Local(their.clone())
            } else {
                match role {
                    Role::Initiator => Nomination::Remote(our.clone()),
                    Role::Responder => Nomination::Local(their.clone()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(cid: &str, priority: i64) -> Candidate {
        if priority < 0 {
            return Candidate::failure();
        }
        Candidate::direct(cid, "127.0.0.1", 1080, Jid::new("peer@example.org/r").unwrap(), priority as u32)
    }

    #[test]
    fn test_nomination_converges_for_all_inputs() {
        // "a" is offered by the responder and chosen by the initiator,
        // "b" is offered by the initiator and chosen by the responder.
        for pa in -1..=3 {
            for pb in -1..=3 {
                let a = candidate("a", pa);
                let b = candidate("b", pb);
                let at_initiator = nominate(&a, &b, Role::Initiator);
                let at_responder = nominate(&b, &a, Role::Responder);

                match (&at_initiator, &at_responder) {
                    (Nomination::Failed, Nomination::Failed) => assert!(pa < 0 && pb < 0),
                    (Nomination::Remote(x), Nomination::Local(y))
                    | (Nomination::Local(x), Nomination::Remote(y)) => {
                        assert_eq!(x.cid, y.cid, "priorities {} / {}", pa, pb);
                        assert!(!x.is_failure());
                    }
                    other => panic!("diverged for {} / {}: {:?}", pa, pb, other),
                }
            }
        }
    }

    #[test]
    fn test_tie_goes_to_initiator_choice() {
        let a = candidate("a", 100);
        let b = candidate("b", 100);
        assert_eq!(nominate(&a, &b, Role::Initiator), Nomination::Remote(a.clone()));
        assert_eq!(nominate(&b, &a, Role::Responder), Nomination::Local(a));
    }

    #[test]
    fn test_sentinel_absorption() {
        let failure = Candidate::failure();
        assert_eq!(nominate(&failure, &failure, Role::Initiator), Nomination::Failed);
        assert_eq!(nominate(&failure, &failure, Role::Responder), Nomination::Failed);

        let relay = Candidate::relay("r", "10.0.0.1", 7777, Jid::new("proxy.example.org").unwrap(), 0);
        assert_eq!(nominate(&failure, &relay, Role::Initiator), Nomination::Local(relay.clone()));
        assert_eq!(nominate(&relay, &failure, Role::Responder), Nomination::Remote(relay));
    }

    #[test]
    fn test_element_conversion() {
        let c = candidate("c1", 100);
        let element = c.to_element().unwrap();
        assert_eq!(element.kind, CandidateType::Direct);
        assert_eq!(Candidate::from(&element), c);
        assert!(Candidate::failure().to_element().is_none());
    }
}
