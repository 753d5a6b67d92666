//! Encoding and decoding for the signaling channel.
//!
//! Requests and responses are serialized as CBOR. The messaging layer that
//! carries them is outside this crate; the codec only enforces a size bound.

use crate::element::JingleRequest;
use crate::error::WireError;
use crate::response::Response;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

/// Largest encoded request or response accepted
pub const MAX_STANZA_SIZE: usize = 256 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// CBOR serialization failed
    #[error("cbor encode failed: {0}")]
    Encode(String),

    /// CBOR deserialization failed
    #[error("cbor decode failed: {0}")]
    Decode(String),

    /// Wire constraint violated
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    if buf.len() > MAX_STANZA_SIZE {
        return Err(WireError::Size(buf.len()).into());
    }
    Ok(Bytes::from(buf))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CodecError> {
    if raw.len() > MAX_STANZA_SIZE {
        return Err(WireError::Size(raw.len()).into());
    }
    ciborium::from_reader(raw).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode a request
pub fn encode_request(request: &JingleRequest) -> Result<Bytes, CodecError> {
    let bytes = encode(request)?;
    trace!("Encoded {} request ({} bytes)", request.action, bytes.len());
    Ok(bytes)
}

/// Decode a request
pub fn decode_request(raw: &[u8]) -> Result<JingleRequest, CodecError> {
    decode(raw)
}

/// Encode a response
pub fn encode_response(response: &Response) -> Result<Bytes, CodecError> {
    encode(response)
}

/// Decode a response
pub fn decode_response(raw: &[u8]) -> Result<Response, CodecError> {
    decode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, Role};
    use crate::element::ContentElement;
    use crate::jid::{Jid, SessionId};
    use crate::response::StanzaError;
    use crate::transport::{CandidateElement, CandidateType, Socks5Transport, TransportElement};

    #[test]
    fn test_initiate_survives_the_wire() {
        let mut request =
            JingleRequest::new(Action::SessionInitiate, SessionId::new("a73sjjvkla37jfea"));
        request.initiator = Some(Jid::new("romeo@montague.example/dr4hcr0st3lup4c").unwrap());
        let offer = Socks5Transport {
            sid: "vj3hs98y".into(),
            dstaddr: Some("972b7bf47291ca609517f67f86b5081086052dad".into()),
            candidates: vec![CandidateElement {
                cid: "hft54dqy".into(),
                host: "192.168.4.1".into(),
                port: 5086,
                jid: Jid::new("romeo@montague.example/dr4hcr0st3lup4c").unwrap(),
                kind: CandidateType::Direct,
                priority: 100,
            }],
            ..Default::default()
        };
        request = request.with_content(
            ContentElement::new(Role::Initiator, "ex").with_transport(TransportElement::socks5(offer)),
        );

        let bytes = encode_request(&request).unwrap();
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_error_response_decodes() {
        let response = Response::Error(StanzaError::unknown_session());
        let decoded = decode_response(&encode_response(&response).unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decode_request(&[0xff, 0x00, 0x13]),
            Err(CodecError::Decode(_))
        ));
        let oversized = vec![0u8; MAX_STANZA_SIZE + 1];
        assert!(matches!(
            decode_response(&oversized),
            Err(CodecError::Wire(WireError::Size(_)))
        ));
    }
}
