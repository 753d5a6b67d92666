//! Transport elements: SOCKS5 bytestreams and in-band bytestreams.

use crate::jid::Jid;
use crate::{NS_JINGLE_IBB, NS_JINGLE_S5B};
use serde::{Deserialize, Serialize};

/// Transport element of a content, keyed by namespace
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportElement {
    /// Transport namespace
    pub namespace: String,
    /// Namespace-specific payload
    pub payload: TransportPayload,
}

/// Typed transport payloads
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportPayload {
    /// SOCKS5 bytestreams offer or info message
    Socks5(Socks5Transport),
    /// In-band bytestreams parameters
    InBand(InBandTransport),
    /// Payload of a transport this crate does not model
    Opaque(ciborium::Value),
}

impl TransportElement {
    /// Wrap a SOCKS5 bytestreams payload
    pub fn socks5(transport: Socks5Transport) -> Self {
        Self {
            namespace: NS_JINGLE_S5B.to_string(),
            payload: TransportPayload::Socks5(transport),
        }
    }

    /// Wrap an in-band bytestreams payload
    pub fn in_band(transport: InBandTransport) -> Self {
        Self {
            namespace: NS_JINGLE_IBB.to_string(),
            payload: TransportPayload::InBand(transport),
        }
    }

    /// Wrap a payload of any other transport
    pub fn opaque(namespace: impl Into<String>, value: ciborium::Value) -> Self {
        Self {
            namespace: namespace.into(),
            payload: TransportPayload::Opaque(value),
        }
    }

    /// SOCKS5 payload, if this is a SOCKS5 bytestreams element
    pub fn as_socks5(&self) -> Option<&Socks5Transport> {
        match &self.payload {
            TransportPayload::Socks5(transport) => Some(transport),
            _ => None,
        }
    }
}

/// SOCKS5 connection mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Socks5Mode {
    /// Stream mode
    #[default]
    Tcp,
    /// Datagram mode
    Udp,
}

/// SOCKS5 bytestreams transport element
///
/// Offers carry the candidate list; `transport-info` messages carry exactly
/// one `info` entry and no candidates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Socks5Transport {
    /// Stream id shared by both parties
    pub sid: String,
    /// Destination address the offering party expects on its candidates
    pub dstaddr: Option<String>,
    /// Connection mode
    pub mode: Socks5Mode,
    /// Offered candidates, highest priority first
    pub candidates: Vec<CandidateElement>,
    /// Negotiation info message
    pub info: Option<Socks5Info>,
}

impl Socks5Transport {
    /// Build an info-only element for the given stream
    pub fn info(sid: impl Into<String>, info: Socks5Info) -> Self {
        Self {
            sid: sid.into(),
            info: Some(info),
            ..Default::default()
        }
    }
}

/// Candidate kind
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateType {
    /// Directly reachable address of the offering party
    Direct,
    /// Third-party relay that splices both connections after activation
    Proxy,
}

/// A single offered SOCKS5 candidate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateElement {
    /// Candidate id, unique within the offer
    pub cid: String,
    /// Host name or address literal
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Endpoint owning the address (the offerer or the relay)
    pub jid: Jid,
    /// Candidate kind
    #[serde(rename = "type")]
    pub kind: CandidateType,
    /// Priority, higher is preferred
    pub priority: u32,
}

/// SOCKS5 bytestreams negotiation messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Socks5Info {
    /// The sender connected to the named candidate
    CandidateUsed {
        /// Candidate id
        cid: String,
    },
    /// The sender activated the named relay candidate
    CandidateActivated {
        /// Candidate id
        cid: String,
    },
    /// The sender could not connect to any candidate
    CandidateError,
    /// The sender failed to use the nominated relay
    ProxyError,
}

impl Socks5Info {
    /// Wire name of the message
    pub fn as_str(&self) -> &'static str {
        match self {
            Socks5Info::CandidateUsed { .. } => "candidate-used",
            Socks5Info::CandidateActivated { .. } => "candidate-activated",
            Socks5Info::CandidateError => "candidate-error",
            Socks5Info::ProxyError => "proxy-error",
        }
    }
}

/// In-band bytestreams parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InBandTransport {
    /// Stream id
    pub sid: String,
    /// Maximum block size in bytes
    pub block_size: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_element_has_no_candidates() {
        let info = Socks5Transport::info("s1", Socks5Info::CandidateUsed { cid: "c1".into() });
        let element = TransportElement::socks5(info);
        assert_eq!(element.namespace, NS_JINGLE_S5B);
        let s5 = element.as_socks5().unwrap();
        assert!(s5.candidates.is_empty());
        assert_eq!(s5.info.as_ref().unwrap().as_str(), "candidate-used");
    }

    #[test]
    fn test_in_band_is_not_socks5() {
        let element = TransportElement::in_band(InBandTransport {
            sid: "s2".into(),
            block_size: 4096,
        });
        assert_eq!(element.namespace, NS_JINGLE_IBB);
        assert!(element.as_socks5().is_none());
    }
}
