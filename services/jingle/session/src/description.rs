//! Application descriptions and payload consumers.
//!
//! The engine treats descriptions as opaque: it only needs the namespace to
//! find a factory and a consumer to hand the negotiated stream to.

use crate::error::JingleError;
use crate::transport::IoStream;
use jingle_wire::{DescriptionElement, Jid, Reason, SessionId};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Receives the outcome of each content exactly once
pub trait PayloadConsumer: Send + Sync + fmt::Debug {
    /// The content's byte stream is ready (and encrypted, if configured)
    fn on_byte_stream_ready(&self, sid: &SessionId, content: &str, stream: IoStream);

    /// The content failed for good
    fn on_failed(&self, sid: &SessionId, content: &str, reason: Reason);
}

/// Application payload of a content
pub trait Description: Send + Sync + fmt::Debug {
    /// Application namespace
    fn namespace(&self) -> &str;

    /// Element describing the payload
    fn element(&self) -> DescriptionElement;

    /// Handle a description-info message
    fn handle_info(&self, element: &DescriptionElement) -> Result<(), JingleError> {
        let _ = element;
        Err(JingleError::UnsupportedInfo)
    }

    /// Consumer of the content outcome
    fn consumer(&self) -> Arc<dyn PayloadConsumer>;
}

/// Accepts descriptions of one namespace offered by peers
pub trait DescriptionFactory: Send + Sync + fmt::Debug {
    /// Application namespace
    fn namespace(&self) -> &str;

    /// Build the local description for an offered content
    fn accept(
        &self,
        sid: &SessionId,
        peer: &Jid,
        element: &DescriptionElement,
    ) -> Result<Arc<dyn Description>, JingleError>;
}

/// Description carrying an uninterpreted payload
#[derive(Debug)]
pub struct OpaqueDescription {
    namespace: String,
    payload: Mutex<ciborium::Value>,
    consumer: Arc<dyn PayloadConsumer>,
}

impl OpaqueDescription {
    /// Create a description
    pub fn new(
        namespace: impl Into<String>,
        payload: ciborium::Value,
        consumer: Arc<dyn PayloadConsumer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            payload: Mutex::new(payload),
            consumer,
        })
    }

    /// Current payload
    pub fn payload(&self) -> ciborium::Value {
        self.payload
            .lock()
            .map(|payload| payload.clone())
            .unwrap_or(ciborium::Value::Null)
    }
}

impl Description for OpaqueDescription {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn element(&self) -> DescriptionElement {
        DescriptionElement {
            namespace: self.namespace.clone(),
            payload: self.payload(),
        }
    }

    fn handle_info(&self, element: &DescriptionElement) -> Result<(), JingleError> {
        if element.namespace != self.namespace {
            return Err(JingleError::BadRequest(format!(
                "description-info for {} on a {} content",
                element.namespace, self.namespace
            )));
        }
        debug!("Description {} updated by peer", self.namespace);
        if let Ok(mut payload) = self.payload.lock() {
            *payload = element.payload.clone();
        }
        Ok(())
    }

    fn consumer(&self) -> Arc<dyn PayloadConsumer> {
        Arc::clone(&self.consumer)
    }
}

/// Accepts any payload of one namespace
#[derive(Debug)]
pub struct OpaqueDescriptionFactory {
    namespace: String,
    consumer: Arc<dyn PayloadConsumer>,
}

impl OpaqueDescriptionFactory {
    /// Accept payloads of `namespace`, reporting outcomes to `consumer`
    pub fn new(namespace: impl Into<String>, consumer: Arc<dyn PayloadConsumer>) -> Self {
        Self {
            namespace: namespace.into(),
            consumer,
        }
    }
}

impl DescriptionFactory for OpaqueDescriptionFactory {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn accept(
        &self,
        _sid: &SessionId,
        _peer: &Jid,
        element: &DescriptionElement,
    ) -> Result<Arc<dyn Description>, JingleError> {
        Ok(OpaqueDescription::new(
            element.namespace.clone(),
            element.payload.clone(),
            Arc::clone(&self.consumer),
        ))
    }
}

/// Outcome of one content
#[derive(Debug)]
pub enum ContentOutcome {
    /// The byte stream is ready
    Ready {
        /// Session id
        sid: SessionId,
        /// Content name
        content: String,
        /// Negotiated stream
        stream: IoStream,
    },
    /// The content failed
    Failed {
        /// Session id
        sid: SessionId,
        /// Content name
        content: String,
        /// Failure reason
        reason: Reason,
    },
}

impl ContentOutcome {
    /// Content name
    pub fn content(&self) -> &str {
        match self {
            ContentOutcome::Ready { content, .. } | ContentOutcome::Failed { content, .. } => {
                content
            }
        }
    }
}

/// Payload consumer forwarding outcomes to a channel
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<ContentOutcome>,
}

impl ChannelConsumer {
    /// Create a consumer and the receiving end of its channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ContentOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl PayloadConsumer for ChannelConsumer {
    fn on_byte_stream_ready(&self, sid: &SessionId, content: &str, stream: IoStream) {
        let outcome = ContentOutcome::Ready {
            sid: sid.clone(),
            content: content.to_string(),
            stream,
        };
        if self.tx.send(outcome).is_err() {
            debug!("Outcome receiver for session {} dropped", sid);
        }
    }

    fn on_failed(&self, sid: &SessionId, content: &str, reason: Reason) {
        let outcome = ContentOutcome::Failed {
            sid: sid.clone(),
            content: content.to_string(),
            reason,
        };
        if self.tx.send(outcome).is_err() {
            debug!("Outcome receiver for session {} dropped", sid);
        }
    }
}
