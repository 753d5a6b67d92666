//! Engine error types and their mapping onto protocol replies.

use jingle_wire::{
    CodecError, ErrorCondition, Jid, Reason, StanzaError, WireError,
};
use thiserror::Error;

/// Failures of the signaling collaborator
#[derive(Error, Debug)]
pub enum SignalingError {
    /// No response arrived within the response timeout
    #[error("response timed out")]
    Timeout,

    /// The signaling channel is closed
    #[error("signaling channel closed")]
    Closed,

    /// The addressed endpoint is not reachable
    #[error("endpoint {0} not reachable")]
    Unreachable(Jid),

    /// Encoding or decoding failed
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

/// Failures of a content's transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Neither side could connect to any candidate
    #[error("all candidates failed")]
    AllCandidatesFailed,

    /// Relay connection or activation failed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// SOCKS5 handshake violation
    #[error("socks5: {0}")]
    Socks5(String),

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Negotiation input is missing or inconsistent
    #[error("negotiation: {0}")]
    Negotiation(String),

    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the encrypted-transport overlay
#[derive(Error, Debug)]
pub enum SecurityError {
    /// The stream was requested before `prepare()` succeeded
    #[error("security overlay not prepared")]
    NotPrepared,

    /// Key wrap or unwrap failed
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// No encryption method registered for the namespace
    #[error("unknown encryption method {0}")]
    UnknownMethod(String),

    /// Cipher namespace not supported
    #[error("unsupported cipher {0}")]
    UnsupportedCipher(String),

    /// Key material has the wrong shape
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Sealing or opening a record failed
    #[error("cipher failure")]
    Crypto,

    /// Key unwrap did not complete in time
    #[error("key exchange timed out")]
    Timeout,
}

/// Errors surfaced by the session engine
#[derive(Error, Debug)]
pub enum JingleError {
    /// No session for the (peer, sid) pair
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// Request not valid in the current state
    #[error("out of order: {0}")]
    OutOfOrder(String),

    /// Both parties initiated the same session id
    #[error("tie break on session {0}")]
    TieBreak(String),

    /// Request is malformed or inconsistent
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Content name not present in the session
    #[error("unknown content {0}")]
    UnknownContent(String),

    /// Description namespace not registered
    #[error("unsupported application {0}")]
    UnsupportedApplication(String),

    /// Transport namespace not registered
    #[error("unsupported transport {0}")]
    UnsupportedTransport(String),

    /// Security namespace not registered
    #[error("unsupported security {0}")]
    UnsupportedSecurity(String),

    /// Info payload not understood
    #[error("unsupported info")]
    UnsupportedInfo,

    /// The session already ended
    #[error("session ended")]
    SessionEnded,

    /// The peer answered with an error
    #[error("peer returned {0}")]
    Remote(StanzaError),

    /// Transport failure
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Security overlay failure
    #[error("security: {0}")]
    Security(#[from] SecurityError),

    /// Signaling failure
    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),

    /// Wire constraint violated
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl JingleError {
    /// Protocol error reply for this failure
    pub fn to_stanza_error(&self) -> StanzaError {
        match self {
            JingleError::UnknownSession(_) | JingleError::SessionEnded => {
                StanzaError::unknown_session()
            }
            JingleError::OutOfOrder(text) => StanzaError::out_of_order().with_text(text.clone()),
            JingleError::TieBreak(_) => StanzaError::tie_break(),
            JingleError::BadRequest(text) => StanzaError::bad_request(text.clone()),
            JingleError::Wire(e) => StanzaError::bad_request(e.to_string()),
            JingleError::UnknownContent(name) => StanzaError::new(ErrorCondition::ItemNotFound)
                .with_text(format!("unknown content {}", name)),
            JingleError::UnsupportedApplication(ns)
            | JingleError::UnsupportedTransport(ns)
            | JingleError::UnsupportedSecurity(ns) => {
                StanzaError::new(ErrorCondition::FeatureNotImplemented).with_text(ns.clone())
            }
            JingleError::UnsupportedInfo => StanzaError::unsupported_info(),
            JingleError::Signaling(SignalingError::Timeout) => {
                StanzaError::new(ErrorCondition::RemoteServerTimeout)
            }
            JingleError::Security(_) => StanzaError::new(ErrorCondition::NotAcceptable)
                .with_text(self.to_string()),
            JingleError::Remote(_)
            | JingleError::Transport(_)
            | JingleError::Signaling(_) => {
                StanzaError::new(ErrorCondition::InternalServerError).with_text(self.to_string())
            }
        }
    }

    /// Session-terminate reason for failures that end a session
    pub fn terminate_reason(&self) -> Reason {
        match self {
            JingleError::UnsupportedApplication(_) => Reason::UnsupportedApplications,
            JingleError::UnsupportedTransport(_) => Reason::UnsupportedTransports,
            JingleError::UnsupportedSecurity(_) | JingleError::Security(_) => {
                Reason::SecurityError
            }
            JingleError::Transport(_) => Reason::FailedTransport,
            JingleError::Signaling(SignalingError::Timeout) => Reason::Timeout,
            JingleError::Signaling(_) => Reason::ConnectivityError,
            _ => Reason::GeneralError,
        }
    }

    /// Whether the failure is an unsupported-capability rejection
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            JingleError::UnsupportedApplication(_)
                | JingleError::UnsupportedTransport(_)
                | JingleError::UnsupportedSecurity(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jingle_wire::JingleCondition;

    #[test]
    fn test_unknown_session_maps_to_jingle_condition() {
        let error = JingleError::UnknownSession("abc".into()).to_stanza_error();
        assert_eq!(error.condition, ErrorCondition::ItemNotFound);
        assert_eq!(error.jingle, Some(JingleCondition::UnknownSession));
    }

    #[test]
    fn test_unsupported_capabilities_map_to_terminate_reasons() {
        assert_eq!(
            JingleError::UnsupportedApplication("urn:x".into()).terminate_reason(),
            Reason::UnsupportedApplications
        );
        assert_eq!(
            JingleError::UnsupportedTransport("urn:y".into()).terminate_reason(),
            Reason::UnsupportedTransports
        );
        assert!(JingleError::UnsupportedSecurity("urn:z".into()).is_unsupported());
        assert!(!JingleError::UnsupportedInfo.is_unsupported());
    }

    #[test]
    fn test_out_of_order_keeps_text() {
        let error = JingleError::OutOfOrder("candidate-used already received".into());
        let stanza = error.to_stanza_error();
        assert_eq!(stanza.jingle, Some(JingleCondition::OutOfOrder));
        assert_eq!(stanza.text.as_deref(), Some("candidate-used already received"));
    }
}
