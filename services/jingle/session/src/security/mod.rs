//! Encrypted-transport overlay.
//!
//! A [`Security`] overlay wraps a negotiated byte stream with a symmetric
//! cipher. The symmetric key travels inside the session payload, wrapped by
//! an [`EncryptionMethod`] resolved from its namespace.

pub mod cipher;
pub mod jet;
pub mod psk;
pub mod stream;

use crate::error::{JingleError, SecurityError};
use crate::transport::IoStream;
use async_trait::async_trait;
use bytes::Bytes;
use jingle_wire::{Jid, Role, SecurityElement, SessionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use stream::{BoxedReader, BoxedWriter, DecryptingReader, EncryptingWriter, SecureStream};

/// Wraps and unwraps key material addressed to a peer
#[async_trait]
pub trait EncryptionMethod: Send + Sync + fmt::Debug {
    /// Method namespace carried in the security element
    fn namespace(&self) -> &str;

    /// Encrypt `key` so that only `peer` can recover it
    async fn wrap_key(&self, peer: &Jid, key: &[u8]) -> Result<Bytes, SecurityError>;

    /// Recover key material `peer` wrapped for us
    async fn unwrap_key(&self, peer: &Jid, envelope: &[u8]) -> Result<Vec<u8>, SecurityError>;
}

/// Encryption methods keyed by namespace
#[derive(Clone, Debug, Default)]
pub struct EncryptionMethods {
    methods: HashMap<String, Arc<dyn EncryptionMethod>>,
}

impl EncryptionMethods {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method under its namespace
    pub fn with(mut self, method: Arc<dyn EncryptionMethod>) -> Self {
        self.methods.insert(method.namespace().to_string(), method);
        self
    }

    /// Resolve a method namespace
    pub fn resolve(&self, namespace: &str) -> Result<Arc<dyn EncryptionMethod>, SecurityError> {
        self.methods
            .get(namespace)
            .cloned()
            .ok_or_else(|| SecurityError::UnknownMethod(namespace.to_string()))
    }
}

/// Parameters for creating a security overlay for one content
#[derive(Clone, Debug)]
pub struct SecuritySetup {
    /// Session id
    pub sid: SessionId,
    /// Local endpoint
    pub local: Jid,
    /// Remote endpoint
    pub peer: Jid,
    /// Local role in the session
    pub role: Role,
    /// Content name
    pub content: String,
}

/// Security overlay of one content
#[async_trait]
pub trait Security: Send + Sync + fmt::Debug {
    /// Overlay namespace
    fn namespace(&self) -> &str;

    /// Element announcing the local side of the overlay
    fn element(&self) -> SecurityElement;

    /// Handle a security-info message
    fn handle_info(&self, element: &SecurityElement) -> Result<(), JingleError>;

    /// Make the key available; completes at most once, later calls are no-ops
    async fn prepare(&self) -> Result<(), SecurityError>;

    /// Encrypt everything written to `writer`
    fn encrypt_outgoing(
        &self,
        writer: BoxedWriter,
    ) -> Result<EncryptingWriter<BoxedWriter>, SecurityError>;

    /// Decrypt everything read from `reader`
    fn decrypt_incoming(
        &self,
        reader: BoxedReader,
    ) -> Result<DecryptingReader<BoxedReader>, SecurityError>;

    /// Wrap both directions of a negotiated stream
    fn secure(&self, stream: IoStream) -> Result<IoStream, SecurityError> {
        let (reader, writer) = tokio::io::split(stream);
        let reader = self.decrypt_incoming(Box::new(reader))?;
        let writer = self.encrypt_outgoing(Box::new(writer))?;
        Ok(IoStream::Encrypted(Box::new(SecureStream::new(reader, writer))))
    }
}

/// Creates security overlays for one namespace
#[async_trait]
pub trait SecurityFactory: Send + Sync + fmt::Debug {
    /// Overlay namespace
    fn namespace(&self) -> &str;

    /// Create the overlay for a content we offer
    async fn offer(&self, setup: &SecuritySetup) -> Result<Arc<dyn Security>, JingleError>;

    /// Create the overlay for a content the peer offered
    async fn accept(
        &self,
        setup: &SecuritySetup,
        element: &SecurityElement,
    ) -> Result<Arc<dyn Security>, JingleError>;
}
