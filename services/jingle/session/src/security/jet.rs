//! Encrypted transport with a wrapped symmetric key.
//!
//! The party offering the content generates the key and sends it wrapped by
//! the chosen encryption method. The accepting party unwraps it in
//! [`Security::prepare`], which may take network round-trips of its own.

use crate::error::{JingleError, SecurityError};
use crate::security::cipher::{direction, Cipher, SymmetricKey};
use crate::security::stream::{BoxedReader, BoxedWriter, DecryptingReader, EncryptingWriter};
use crate::security::{EncryptionMethod, EncryptionMethods, Security, SecurityFactory, SecuritySetup};
use async_trait::async_trait;
use bytes::Bytes;
use jingle_wire::{Jid, Role, SecurityElement, NS_JINGLE_JET};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Encrypted-transport overlay of one content
#[derive(Debug)]
pub struct JetSecurity {
    role: Role,
    peer: Jid,
    content: String,
    cipher: Cipher,
    method: Arc<dyn EncryptionMethod>,
    /// Wrapped key: ours when we offered, the peer's when we accepted
    envelope: Mutex<Option<Bytes>>,
    generated_locally: bool,
    key: OnceCell<Arc<SymmetricKey>>,
    key_exchange_timeout: Duration,
}

impl JetSecurity {
    /// Whether the key is available
    pub fn is_prepared(&self) -> bool {
        self.key.initialized()
    }

    /// Cipher protecting the stream
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    fn ready_key(&self) -> Result<Arc<SymmetricKey>, SecurityError> {
        self.key.get().cloned().ok_or(SecurityError::NotPrepared)
    }

    fn envelope(&self) -> Option<Bytes> {
        self.envelope.lock().ok().and_then(|envelope| envelope.clone())
    }

    async fn unwrap_key(&self) -> Result<Arc<SymmetricKey>, SecurityError> {
        let envelope = self
            .envelope()
            .ok_or_else(|| SecurityError::KeyExchange("no key envelope received".into()))?;
        debug!(
            "Unwrapping key for content {} from {} with {}",
            self.content,
            self.peer,
            self.method.namespace()
        );
        let raw = tokio::time::timeout(
            self.key_exchange_timeout,
            self.method.unwrap_key(&self.peer, &envelope),
        )
        .await
        .map_err(|_| SecurityError::Timeout)??;
        Ok(Arc::new(SymmetricKey::from_bytes(self.cipher, &raw)?))
    }
}

#[async_trait]
impl Security for JetSecurity {
    fn namespace(&self) -> &str {
        NS_JINGLE_JET
    }

    fn element(&self) -> SecurityElement {
        SecurityElement {
            namespace: NS_JINGLE_JET.to_string(),
            name: self.content.clone(),
            cipher: self.cipher.namespace().to_string(),
            method: self.method.namespace().to_string(),
            envelope: if self.generated_locally {
                self.envelope()
            } else {
                None
            },
        }
    }

    fn handle_info(&self, element: &SecurityElement) -> Result<(), JingleError> {
        let Some(envelope) = &element.envelope else {
            return Err(JingleError::UnsupportedInfo);
        };
        if self.generated_locally || self.is_prepared() {
            return Err(JingleError::OutOfOrder("key already established".into()));
        }
        let mut slot = self
            .envelope
            .lock()
            .map_err(|_| JingleError::BadRequest("security state poisoned".into()))?;
        if slot.is_some() {
            return Err(JingleError::OutOfOrder("key envelope already received".into()));
        }
        *slot = Some(envelope.clone());
        Ok(())
    }

    async fn prepare(&self) -> Result<(), SecurityError> {
        if self.generated_locally {
            // Our own key never needs unwrapping
            return self.ready_key().map(|_| ());
        }
        match self.key.get_or_try_init(|| self.unwrap_key()).await {
            Ok(_) => {
                info!("Key for content {} ready", self.content);
                Ok(())
            }
            Err(e) => {
                warn!("Key exchange for content {} failed: {}", self.content, e);
                Err(e)
            }
        }
    }

    fn encrypt_outgoing(
        &self,
        writer: BoxedWriter,
    ) -> Result<EncryptingWriter<BoxedWriter>, SecurityError> {
        Ok(EncryptingWriter::new(writer, self.ready_key()?, direction(self.role)))
    }

    fn decrypt_incoming(
        &self,
        reader: BoxedReader,
    ) -> Result<DecryptingReader<BoxedReader>, SecurityError> {
        Ok(DecryptingReader::new(
            reader,
            self.ready_key()?,
            direction(self.role.opposite()),
        ))
    }
}

/// Creates encrypted-transport overlays
#[derive(Debug, Clone)]
pub struct JetSecurityFactory {
    methods: EncryptionMethods,
    method: String,
    cipher: Cipher,
    key_exchange_timeout: Duration,
}

impl JetSecurityFactory {
    /// Offer keys wrapped by `method` for `cipher`, accept any registered method
    pub fn new(
        methods: EncryptionMethods,
        method: impl Into<String>,
        cipher: Cipher,
        key_exchange_timeout: Duration,
    ) -> Self {
        Self {
            methods,
            method: method.into(),
            cipher,
            key_exchange_timeout,
        }
    }
}

#[async_trait]
impl SecurityFactory for JetSecurityFactory {
    fn namespace(&self) -> &str {
        NS_JINGLE_JET
    }

    async fn offer(&self, setup: &SecuritySetup) -> Result<Arc<dyn Security>, JingleError> {
        let method = self.methods.resolve(&self.method)?;
        let key = SymmetricKey::generate(self.cipher);
        let envelope = method.wrap_key(&setup.peer, &key.to_bytes()).await?;
        debug!(
            "Generated {:?} key for content {} of session {}",
            self.cipher, setup.content, setup.sid
        );

        Ok(Arc::new(JetSecurity {
            role: setup.role,
            peer: setup.peer.clone(),
            content: setup.content.clone(),
            cipher: self.cipher,
            method,
            envelope: Mutex::new(Some(envelope)),
            generated_locally: true,
            key: OnceCell::new_with(Some(Arc::new(key))),
            key_exchange_timeout: self.key_exchange_timeout,
        }))
    }

    async fn accept(
        &self,
        setup: &SecuritySetup,
        element: &SecurityElement,
    ) -> Result<Arc<dyn Security>, JingleError> {
        let cipher = Cipher::from_namespace(&element.cipher)
            .map_err(|_| JingleError::UnsupportedSecurity(element.cipher.clone()))?;
        let method = self
            .methods
            .resolve(&element.method)
            .map_err(|_| JingleError::UnsupportedSecurity(element.method.clone()))?;

        Ok(Arc::new(JetSecurity {
            role: setup.role,
            peer: setup.peer.clone(),
            content: setup.content.clone(),
            cipher,
            method,
            envelope: Mutex::new(element.envelope.clone()),
            generated_locally: false,
            key: OnceCell::new(),
            key_exchange_timeout: self.key_exchange_timeout,
        }))
    }
}
