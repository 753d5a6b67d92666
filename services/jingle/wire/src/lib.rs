//! Jingle signaling elements, action taxonomy, validation, and CBOR codec.
//!
//! This crate models the negotiation payloads exchanged between two endpoints
//! over the signaling channel: session envelopes, contents, and the
//! description/transport/security elements they carry.
//!
//! ## Features
//!
//! - **Action Taxonomy**: the fifteen Jingle action verbs
//! - **Elements**: contents, descriptions, transports, security overlays, reasons
//! - **SOCKS5 Bytestreams**: candidate elements and `candidate-used`-style info messages
//! - **Errors**: stanza error conditions including Jingle-specific ones
//! - **Codec**: canonical CBOR encoding of requests and responses
//!
//! ## Envelope
//!
//! ```text
//! +-----------------+------------------------------------------+
//! | action          | session-initiate, transport-info, ...    |
//! | sid             | session id, immutable after creation     |
//! | initiator       | set on session-initiate                  |
//! | responder       | set on session-accept                    |
//! | contents[]      | creator, name, senders,                  |
//! |                 | description?, transport?, security?      |
//! | reason?         | session-terminate / content-remove       |
//! | info?           | opaque session-info payload              |
//! +-----------------+------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod codec;
pub mod element;
pub mod error;
pub mod jid;
pub mod response;
pub mod transport;

// Re-export main types
pub use action::{Action, Role, Senders};
pub use codec::{
    decode_request, decode_response, encode_request, encode_response, CodecError,
    MAX_STANZA_SIZE,
};
pub use element::{
    ContentElement, DescriptionElement, JingleRequest, Reason, ReasonElement, SecurityElement,
};
pub use error::WireError;
pub use jid::{Jid, SessionId};
pub use response::{ErrorCondition, JingleCondition, Response, StanzaError};
pub use transport::{
    CandidateElement, CandidateType, InBandTransport, Socks5Info, Socks5Mode, Socks5Transport,
    TransportElement, TransportPayload,
};

/// Jingle session namespace
pub const NS_JINGLE: &str = "urn:xmpp:jingle:1";

/// SOCKS5 bytestreams transport namespace
pub const NS_JINGLE_S5B: &str = "urn:xmpp:jingle:transports:s5b:1";

/// In-band bytestreams transport namespace
pub const NS_JINGLE_IBB: &str = "urn:xmpp:jingle:transports:ibb:1";

/// Encrypted transports (security overlay) namespace
pub const NS_JINGLE_JET: &str = "urn:xmpp:jingle:jet:0";
