//! One negotiated exchange unit: description, transport and optional overlay.

use crate::description::Description;
use crate::error::JingleError;
use crate::manager::EngineContext;
use crate::security::{Security, SecuritySetup};
use crate::signaling::{ContentLink, SessionLink};
use crate::transport::{IoStream, Transport, TransportSetup};
use jingle_wire::{
    ContentElement, Reason, Role, Senders, SessionId, TransportElement, NS_JINGLE_S5B,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Lifecycle of a content
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentState {
    /// Offered by us, awaiting the peer's acceptance
    Offered,
    /// Offered by the peer, awaiting our acceptance
    Proposed,
    /// Transport and key preparation in progress
    Negotiating,
    /// We proposed a replacement transport
    Replacing,
    /// Waiting for the peer to propose a replacement transport
    AwaitingReplace,
    /// Byte stream delivered
    Ready,
    /// Failed for good
    Failed,
}

/// What the application wants to exchange
pub struct ContentSpec {
    /// Content name, unique within the session
    pub name: String,
    /// Who may send on the content
    pub senders: Senders,
    /// Application description
    pub description: Arc<dyn Description>,
    /// Transport namespace
    pub transport: String,
    /// Security overlay namespace
    pub security: Option<String>,
}

impl ContentSpec {
    /// Content over SOCKS5 bytestreams without an overlay
    pub fn new(name: impl Into<String>, description: Arc<dyn Description>) -> Self {
        Self {
            name: name.into(),
            senders: Senders::Both,
            description,
            transport: NS_JINGLE_S5B.to_string(),
            security: None,
        }
    }

    /// Use another transport namespace
    pub fn with_transport(mut self, namespace: impl Into<String>) -> Self {
        self.transport = namespace.into();
        self
    }

    /// Protect the stream with a security overlay
    pub fn with_security(mut self, namespace: impl Into<String>) -> Self {
        self.security = Some(namespace.into());
        self
    }

    /// Restrict who may send
    pub fn with_senders(mut self, senders: Senders) -> Self {
        self.senders = senders;
        self
    }
}

impl fmt::Debug for ContentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentSpec")
            .field("name", &self.name)
            .field("description", &self.description.namespace())
            .field("transport", &self.transport)
            .field("security", &self.security)
            .finish()
    }
}

/// Fires at most once per content
#[derive(Debug, Default)]
struct OutcomeLatch(AtomicBool);

impl OutcomeLatch {
    fn try_fire(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// Live content of a session
pub(crate) struct Content {
    pub(crate) name: String,
    pub(crate) creator: Role,
    pub(crate) senders: Senders,
    pub(crate) description: Arc<dyn Description>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pending_transport: Option<Arc<dyn Transport>>,
    pub(crate) security: Option<Arc<dyn Security>>,
    pub(crate) state: ContentState,
    /// Bumped whenever the transport is swapped; stale negotiation results are dropped
    pub(crate) generation: u64,
    task: Option<JoinHandle<()>>,
    latch: OutcomeLatch,
}

impl Content {
    pub(crate) fn new(
        name: String,
        creator: Role,
        senders: Senders,
        description: Arc<dyn Description>,
        transport: Arc<dyn Transport>,
        security: Option<Arc<dyn Security>>,
        state: ContentState,
    ) -> Self {
        Self {
            name,
            creator,
            senders,
            description,
            transport,
            pending_transport: None,
            security,
            state,
            generation: 0,
            task: None,
            latch: OutcomeLatch::default(),
        }
    }

    /// Full element as sent in initiate, accept and content-add
    pub(crate) fn element(&self) -> ContentElement {
        let mut element = ContentElement::new(self.creator, self.name.clone())
            .with_transport(self.transport.element());
        element.senders = self.senders;
        element.description = Some(self.description.element());
        element.security = self.security.as_ref().map(|security| security.element());
        element
    }

    /// Bare reference carrying only creator and name
    pub(crate) fn reference(&self) -> ContentElement {
        ContentElement::new(self.creator, self.name.clone())
    }

    pub(crate) fn set_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Abort the running negotiation; must not be called from that task
    pub(crate) fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub(crate) fn deliver(&self, sid: &SessionId, stream: IoStream) -> bool {
        if !self.latch.try_fire() {
            debug!("Content {} of session {} already reported", self.name, sid);
            return false;
        }
        self.description
            .consumer()
            .on_byte_stream_ready(sid, &self.name, stream);
        true
    }

    pub(crate) fn fail(&self, sid: &SessionId, reason: Reason) -> bool {
        if !self.latch.try_fire() {
            return false;
        }
        self.description.consumer().on_failed(sid, &self.name, reason);
        true
    }

    /// Release the transport and any pending replacement
    pub(crate) async fn release(self) {
        self.transport.release().await;
        if let Some(pending) = self.pending_transport {
            pending.release().await;
        }
    }
}

/// Negotiate a content's byte stream.
///
/// Transport establishment and key preparation run concurrently; the stream
/// is only handed out once both have succeeded.
pub(crate) async fn negotiate(
    link: ContentLink,
    transport: Arc<dyn Transport>,
    security: Option<Arc<dyn Security>>,
) -> Result<IoStream, JingleError> {
    let establish = async { transport.establish(link).await.map_err(JingleError::from) };
    let prepare = async {
        match &security {
            Some(security) => security.prepare().await.map_err(JingleError::from),
            None => Ok(()),
        }
    };
    let (stream, ()) = tokio::try_join!(establish, prepare)?;

    match &security {
        Some(security) => Ok(security.secure(stream)?),
        None => Ok(stream),
    }
}

pub(crate) fn transport_setup(
    link: &SessionLink,
    content: &str,
    remote: Option<TransportElement>,
) -> TransportSetup {
    TransportSetup {
        sid: link.sid().clone(),
        local: link.local().clone(),
        peer: link.peer().clone(),
        role: link.role(),
        content: content.to_string(),
        remote,
    }
}

fn security_setup(link: &SessionLink, content: &str) -> SecuritySetup {
    SecuritySetup {
        sid: link.sid().clone(),
        local: link.local().clone(),
        peer: link.peer().clone(),
        role: link.role(),
        content: content.to_string(),
    }
}

/// Build a content we offer to the peer
pub(crate) async fn build_local(
    ctx: &EngineContext,
    link: &SessionLink,
    spec: ContentSpec,
) -> Result<Content, JingleError> {
    let factory = ctx
        .extensions
        .transport(&spec.transport)
        .ok_or_else(|| JingleError::UnsupportedTransport(spec.transport.clone()))?;
    let transport = factory.create(transport_setup(link, &spec.name, None)).await?;

    let security = match &spec.security {
        Some(namespace) => {
            let factory = ctx
                .extensions
                .security(namespace)
                .ok_or_else(|| JingleError::UnsupportedSecurity(namespace.clone()))?;
            Some(factory.offer(&security_setup(link, &spec.name)).await?)
        }
        None => None,
    };

    Ok(Content::new(
        spec.name,
        link.role(),
        spec.senders,
        spec.description,
        transport,
        security,
        ContentState::Offered,
    ))
}

/// Build the local side of a content the peer offered
pub(crate) async fn build_offered(
    ctx: &EngineContext,
    link: &SessionLink,
    element: &ContentElement,
) -> Result<Content, JingleError> {
    let description_element = element.description.as_ref().ok_or_else(|| {
        JingleError::BadRequest(format!("content {} without description", element.name))
    })?;
    let description = ctx
        .extensions
        .description(&description_element.namespace)
        .ok_or_else(|| JingleError::UnsupportedApplication(description_element.namespace.clone()))?
        .accept(link.sid(), link.peer(), description_element)?;

    let transport_element = element.transport.as_ref().ok_or_else(|| {
        JingleError::BadRequest(format!("content {} without transport", element.name))
    })?;
    let transport = ctx
        .extensions
        .transport(&transport_element.namespace)
        .ok_or_else(|| JingleError::UnsupportedTransport(transport_element.namespace.clone()))?
        .create(transport_setup(link, &element.name, Some(transport_element.clone())))
        .await?;

    let security = match &element.security {
        Some(security_element) => {
            let factory = ctx
                .extensions
                .security(&security_element.namespace)
                .ok_or_else(|| JingleError::UnsupportedSecurity(security_element.namespace.clone()))?;
            Some(
                factory
                    .accept(&security_setup(link, &element.name), security_element)
                    .await?,
            )
        }
        None => None,
    };

    Ok(Content::new(
        element.name.clone(),
        element.creator,
        element.senders,
        description,
        transport,
        security,
        ContentState::Proposed,
    ))
}
