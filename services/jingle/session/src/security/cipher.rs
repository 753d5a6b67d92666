//! Symmetric ciphers of the encrypted-transport overlay.

use crate::error::SecurityError;
use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use jingle_wire::Role;
use rand::RngCore;
use std::fmt;

/// AES-256-GCM cipher namespace
pub const NS_AES_256_GCM: &str = "urn:xmpp:ciphers:aes-256-gcm-nopadding:0";

/// ChaCha20-Poly1305 cipher namespace
pub const NS_CHACHA20_POLY1305: &str = "urn:xmpp:ciphers:chacha20-poly1305:0";

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// IV length in bytes
pub const IV_LEN: usize = 12;

/// Authentication tag length of both ciphers
pub const TAG_LEN: usize = 16;

/// Supported ciphers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Cipher {
    /// AES-256 in GCM mode
    #[default]
    Aes256Gcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl Cipher {
    /// Wire namespace of the cipher
    pub fn namespace(&self) -> &'static str {
        match self {
            Cipher::Aes256Gcm => NS_AES_256_GCM,
            Cipher::ChaCha20Poly1305 => NS_CHACHA20_POLY1305,
        }
    }

    /// Resolve a cipher namespace
    pub fn from_namespace(namespace: &str) -> Result<Self, SecurityError> {
        match namespace {
            NS_AES_256_GCM => Ok(Cipher::Aes256Gcm),
            NS_CHACHA20_POLY1305 => Ok(Cipher::ChaCha20Poly1305),
            other => Err(SecurityError::UnsupportedCipher(other.to_string())),
        }
    }
}

#[derive(Clone)]
enum Engine {
    Aes(Box<Aes256Gcm>),
    ChaCha(ChaCha20Poly1305),
}

/// Record direction byte mixed into the nonce
pub fn direction(sender: Role) -> u8 {
    match sender {
        Role::Initiator => 0,
        Role::Responder => 1,
    }
}

/// Key material of one encrypted transport
#[derive(Clone)]
pub struct SymmetricKey {
    cipher: Cipher,
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    engine: Engine,
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl SymmetricKey {
    /// Generate fresh key material
    pub fn generate(cipher: Cipher) -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self::new(cipher, key, iv)
    }

    fn new(cipher: Cipher, key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        let engine = match cipher {
            Cipher::Aes256Gcm => Engine::Aes(Box::new(Aes256Gcm::new(&key.into()))),
            Cipher::ChaCha20Poly1305 => Engine::ChaCha(ChaCha20Poly1305::new(&key.into())),
        };
        Self {
            cipher,
            key,
            iv,
            engine,
        }
    }

    /// Rebuild key material from its serialized form
    pub fn from_bytes(cipher: Cipher, raw: &[u8]) -> Result<Self, SecurityError> {
        if raw.len() != KEY_LEN + IV_LEN {
            return Err(SecurityError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN + IV_LEN,
                raw.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        key.copy_from_slice(&raw[..KEY_LEN]);
        iv.copy_from_slice(&raw[KEY_LEN..]);
        Ok(Self::new(cipher, key, iv))
    }

    /// Serialized form: key followed by IV
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(KEY_LEN + IV_LEN);
        raw.extend_from_slice(&self.key);
        raw.extend_from_slice(&self.iv);
        raw
    }

    /// Cipher the key is used with
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    fn nonce(&self, direction: u8, counter: u64) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        nonce[3] ^= direction;
        for (byte, count) in nonce[4..].iter_mut().zip(counter.to_be_bytes()) {
            *byte ^= count;
        }
        nonce
    }

    /// Encrypt one record
    pub fn seal(
        &self,
        direction: u8,
        counter: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        let nonce = self.nonce(direction, counter);
        let sealed = match &self.engine {
            Engine::Aes(cipher) => cipher.encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext),
            Engine::ChaCha(cipher) => {
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
            }
        };
        sealed.map_err(|_| SecurityError::Crypto)
    }

    /// Decrypt and authenticate one record
    pub fn open(
        &self,
        direction: u8,
        counter: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        let nonce = self.nonce(direction, counter);
        let opened = match &self.engine {
            Engine::Aes(cipher) => cipher.decrypt(aes_gcm::Nonce::from_slice(&nonce), ciphertext),
            Engine::ChaCha(cipher) => {
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(&nonce), ciphertext)
            }
        };
        opened.map_err(|_| SecurityError::Crypto)
    }
}
