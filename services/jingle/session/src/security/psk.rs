//! Pre-shared-key encryption method.

use crate::error::SecurityError;
use crate::security::EncryptionMethod;
use async_trait::async_trait;
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use jingle_wire::Jid;
use rand::RngCore;
use std::fmt;

/// Namespace of the pre-shared-key method
pub const NS_PSK: &str = "urn:xmpp:jingle:jet-psk:0";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Wraps keys with a secret both endpoints know
///
/// Envelopes are `nonce || ciphertext` with the recipient's JID as
/// associated data, so an envelope cannot be replayed to someone else.
pub struct PreSharedKeyMethod {
    local: Jid,
    cipher: ChaCha20Poly1305,
}

impl fmt::Debug for PreSharedKeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreSharedKeyMethod")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl PreSharedKeyMethod {
    /// Create the method for `local` with a 32-byte secret
    pub fn new(local: Jid, secret: [u8; 32]) -> Self {
        Self {
            local,
            cipher: ChaCha20Poly1305::new(&secret.into()),
        }
    }
}

#[async_trait]
impl EncryptionMethod for PreSharedKeyMethod {
    fn namespace(&self) -> &str {
        NS_PSK
    }

    async fn wrap_key(&self, peer: &Jid, key: &[u8]) -> Result<Bytes, SecurityError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let payload = Payload {
            msg: key,
            aad: peer.as_str().as_bytes(),
        };
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|e| SecurityError::KeyExchange(e.to_string()))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + sealed.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&sealed);
        Ok(Bytes::from(envelope))
    }

    async fn unwrap_key(&self, _peer: &Jid, envelope: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if envelope.len() < NONCE_LEN + TAG_LEN {
            return Err(SecurityError::KeyExchange("envelope too short".into()));
        }
        let (nonce, sealed) = envelope.split_at(NONCE_LEN);
        let payload = Payload {
            msg: sealed,
            aad: self.local.as_str().as_bytes(),
        };
        self.cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| SecurityError::KeyExchange("envelope does not authenticate".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_envelope_is_bound_to_recipient() {
        let alice = Jid::new("alice@example.org/a").unwrap();
        let bob = Jid::new("bob@example.org/b").unwrap();
        let carol = Jid::new("carol@example.org/c").unwrap();
        let secret = [3u8; 32];

        let at_alice = PreSharedKeyMethod::new(alice.clone(), secret);
        let at_bob = PreSharedKeyMethod::new(bob.clone(), secret);
        let at_carol = PreSharedKeyMethod::new(carol, secret);

        let envelope = at_alice.wrap_key(&bob, b"key material").await.unwrap();
        assert_eq!(at_bob.unwrap_key(&alice, &envelope).await.unwrap(), b"key material");
        assert!(at_carol.unwrap_key(&alice, &envelope).await.is_err());
        assert!(at_bob.unwrap_key(&alice, &envelope[..8]).await.is_err());
    }
}
