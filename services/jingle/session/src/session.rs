//! Per-session state machine.
//!
//! A [`Session`] owns its contents and reacts to inbound actions routed by the
//! manager. State changes happen under the session lock; anything that waits on
//! the peer (outbound requests, stream negotiation) runs outside of it so that
//! inbound handling for the same session is never blocked on the network.

use crate::content::{self, Content, ContentSpec, ContentState};
use crate::error::JingleError;
use crate::keepalive;
use crate::manager::{EngineContext, JingleEvent};
use crate::registry::SessionKey;
use crate::signaling::SessionLink;
use crate::transport::{IoStream, TransportFactory};
use jingle_wire::{Action, Jid, JingleRequest, Reason, Role, Senders, SessionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Initiated by us, waiting for session-accept
    Pending,
    /// Initiated by the peer, waiting for the local accept
    Unacknowledged,
    /// Accepted by both sides
    Active,
    /// Terminated; no further actions are processed
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Unacknowledged => "unacknowledged",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct SessionInner {
    contents: HashMap<String, Content>,
    keepalive: Option<JoinHandle<()>>,
}

/// A negotiation between the local endpoint and one peer
pub struct Session {
    ctx: Arc<EngineContext>,
    link: SessionLink,
    state: watch::Sender<SessionState>,
    end_reason: OnceLock<Reason>,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", self.sid())
            .field("peer", self.peer())
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        link: SessionLink,
        state: SessionState,
        contents: Vec<Content>,
    ) -> Arc<Self> {
        let contents = contents
            .into_iter()
            .map(|content| (content.name.clone(), content))
            .collect();
        Arc::new(Self {
            ctx,
            link,
            state: watch::channel(state).0,
            end_reason: OnceLock::new(),
            inner: Mutex::new(SessionInner {
                contents,
                keepalive: None,
            }),
        })
    }

    /// Session id
    pub fn sid(&self) -> &SessionId {
        self.link.sid()
    }

    /// Remote endpoint
    pub fn peer(&self) -> &Jid {
        self.link.peer()
    }

    /// Local endpoint
    pub fn local(&self) -> &Jid {
        self.link.local()
    }

    /// Local role
    pub fn role(&self) -> Role {
        self.link.role()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Reason the session ended with, once it has
    pub fn end_reason(&self) -> Option<Reason> {
        self.end_reason.get().copied()
    }

    /// Wait until the session has ended
    pub async fn ended(&self) -> Option<Reason> {
        let mut state = self.state.subscribe();
        // The sender lives as long as self, so the wait cannot fail
        let _ = state.wait_for(|state| *state == SessionState::Ended).await;
        self.end_reason()
    }

    /// Names and states of the live contents
    pub async fn contents(&self) -> Vec<(String, ContentState)> {
        let inner = self.inner.lock().await;
        let mut contents: Vec<_> = inner
            .contents
            .values()
            .map(|content| (content.name.clone(), content.state))
            .collect();
        contents.sort_by(|a, b| a.0.cmp(&b.0));
        contents
    }

    /// State of one content
    pub async fn content_state(&self, name: &str) -> Option<ContentState> {
        self.inner
            .lock()
            .await
            .contents
            .get(name)
            .map(|content| content.state)
    }

    pub(crate) fn key(&self) -> SessionKey {
        SessionKey::new(self.peer().clone(), self.sid().clone())
    }

    pub(crate) fn link(&self) -> &SessionLink {
        &self.link
    }

    /// Apply an inbound request routed to this session
    pub(crate) async fn handle(self: &Arc<Self>, request: &JingleRequest) -> Result<(), JingleError> {
        if self.state() == SessionState::Ended {
            return Err(JingleError::UnknownSession(self.sid().to_string()));
        }

        match request.action {
            Action::SessionInitiate => Err(match self.role() {
                Role::Initiator => JingleError::TieBreak(self.sid().to_string()),
                Role::Responder => JingleError::OutOfOrder("session already initiated".into()),
            }),
            Action::SessionAccept => self.on_session_accept(request).await,
            Action::SessionTerminate => {
                let reason = request
                    .reason
                    .as_ref()
                    .map(|reason| reason.reason)
                    .unwrap_or(Reason::Success);
                info!("Peer {} terminated session {}: {}", self.peer(), self.sid(), reason);
                self.finish(reason, false).await;
                Ok(())
            }
            Action::SessionInfo => match request.info {
                None => Ok(()),
                Some(_) => Err(JingleError::UnsupportedInfo),
            },
            Action::ContentAdd => self.on_content_add(request).await,
            Action::ContentAccept => self.on_content_accept(request).await,
            Action::ContentModify => self.on_content_modify(request).await,
            Action::ContentReject => self.on_content_removed(request, Reason::Decline).await,
            Action::ContentRemove => self.on_content_removed(request, Reason::Cancel).await,
            Action::DescriptionInfo => self.on_description_info(request).await,
            Action::SecurityInfo => self.on_security_info(request).await,
            Action::TransportInfo => self.on_transport_info(request).await,
            Action::TransportAccept => self.on_transport_accept(request).await,
            Action::TransportReject => self.on_transport_reject(request).await,
            Action::TransportReplace => self.on_transport_replace(request).await,
        }
    }

    async fn on_session_accept(self: &Arc<Self>, request: &JingleRequest) -> Result<(), JingleError> {
        if self.role() != Role::Initiator {
            return Err(JingleError::OutOfOrder(
                "session-accept received by the responder".into(),
            ));
        }

        let declined = {
            let mut inner = self.inner.lock().await;
            if self.state() != SessionState::Pending {
                return Err(JingleError::OutOfOrder("session already accepted".into()));
            }

            for element in &request.contents {
                let content = inner
                    .contents
                    .get(&element.name)
                    .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
                if let Some(transport) = &element.transport {
                    if transport.namespace != content.transport.namespace() {
                        return Err(JingleError::BadRequest(format!(
                            "content {} accepted with transport {}",
                            element.name, transport.namespace
                        )));
                    }
                }
            }
            for element in &request.contents {
                if let (Some(content), Some(transport)) =
                    (inner.contents.get(&element.name), &element.transport)
                {
                    content.transport.accept_remote(transport)?;
                }
            }

            if !self.state.send_if_modified(|state| {
                if *state == SessionState::Pending {
                    *state = SessionState::Active;
                    true
                } else {
                    false
                }
            }) {
                return Err(JingleError::SessionEnded);
            }

            let omitted: Vec<String> = inner
                .contents
                .keys()
                .filter(|name| request.content(name).is_none())
                .cloned()
                .collect();
            let mut declined = Vec::new();
            for name in omitted {
                if let Some(content) = inner.contents.remove(&name) {
                    debug!("Peer {} declined content {}", self.peer(), name);
                    content.fail(self.sid(), Reason::Decline);
                    declined.push(content);
                }
            }

            for content in inner.contents.values_mut() {
                self.start_negotiation(content);
            }
            self.start_keepalive(&mut inner);
            declined
        };

        info!("Session {} accepted by {}", self.sid(), self.peer());
        for content in declined {
            content.release().await;
        }
        Ok(())
    }

    async fn on_content_add(self: &Arc<Self>, request: &JingleRequest) -> Result<(), JingleError> {
        let mut built = Vec::with_capacity(request.contents.len());
        for element in &request.contents {
            built.push(content::build_offered(&self.ctx, &self.link, element).await?);
        }

        let names: Vec<String> = {
            let mut inner = self.inner.lock().await;
            if let Some(existing) = built
                .iter()
                .find(|content| inner.contents.contains_key(&content.name))
            {
                return Err(JingleError::BadRequest(format!(
                    "content {} already exists",
                    existing.name
                )));
            }
            built
                .into_iter()
                .map(|content| {
                    let name = content.name.clone();
                    inner.contents.insert(name.clone(), content);
                    name
                })
                .collect()
        };

        for name in names {
            info!("Peer {} added content {} to session {}", self.peer(), name, self.sid());
            let _ = self.ctx.events.send(JingleEvent::ContentAdded {
                session: Arc::clone(self),
                content: name,
            });
        }
        Ok(())
    }

    async fn on_content_accept(self: &Arc<Self>, request: &JingleRequest) -> Result<(), JingleError> {
        let mut inner = self.inner.lock().await;
        for element in &request.contents {
            let content = inner
                .contents
                .get(&element.name)
                .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
            if content.state != ContentState::Offered {
                return Err(JingleError::OutOfOrder(format!(
                    "content {} is not awaiting acceptance",
                    element.name
                )));
            }
        }

        for element in &request.contents {
            if let Some(content) = inner.contents.get_mut(&element.name) {
                if let Some(transport) = &element.transport {
                    content.transport.accept_remote(transport)?;
                }
                self.start_negotiation(content);
            }
        }
        Ok(())
    }

    async fn on_content_modify(&self, request: &JingleRequest) -> Result<(), JingleError> {
        let mut inner = self.inner.lock().await;
        for element in &request.contents {
            if !inner.contents.contains_key(&element.name) {
                return Err(JingleError::UnknownContent(element.name.clone()));
            }
        }
        for element in &request.contents {
            if let Some(content) = inner.contents.get_mut(&element.name) {
                content.senders = element.senders;
            }
        }
        Ok(())
    }

    async fn on_content_removed(
        self: &Arc<Self>,
        request: &JingleRequest,
        default_reason: Reason,
    ) -> Result<(), JingleError> {
        let (removed, now_empty) = {
            let mut inner = self.inner.lock().await;
            for element in &request.contents {
                let content = inner
                    .contents
                    .get(&element.name)
                    .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
                if request.action == Action::ContentReject && content.state != ContentState::Offered {
                    return Err(JingleError::OutOfOrder(format!(
                        "content {} is not awaiting acceptance",
                        element.name
                    )));
                }
            }
            let removed: Vec<Content> = request
                .contents
                .iter()
                .filter_map(|element| inner.contents.remove(&element.name))
                .collect();
            (removed, inner.contents.is_empty())
        };

        let reason = request
            .reason
            .as_ref()
            .map(|reason| reason.reason)
            .unwrap_or(default_reason);
        for mut content in removed {
            info!(
                "Content {} of session {} removed by peer: {}",
                content.name,
                self.sid(),
                reason
            );
            content.abort();
            content.fail(self.sid(), reason);
            content.release().await;
        }

        if now_empty && request.action == Action::ContentRemove {
            self.terminate_detached(Reason::Success);
        }
        Ok(())
    }

    async fn on_description_info(&self, request: &JingleRequest) -> Result<(), JingleError> {
        let inner = self.inner.lock().await;
        for element in &request.contents {
            let content = inner
                .contents
                .get(&element.name)
                .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
            if let Some(description) = &element.description {
                content.description.handle_info(description)?;
            }
        }
        Ok(())
    }

    async fn on_security_info(&self, request: &JingleRequest) -> Result<(), JingleError> {
        let inner = self.inner.lock().await;
        for element in &request.contents {
            let content = inner
                .contents
                .get(&element.name)
                .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
            let (Some(security), Some(info)) = (&content.security, &element.security) else {
                return Err(JingleError::BadRequest(format!(
                    "content {} has no security overlay",
                    element.name
                )));
            };
            security.handle_info(info)?;
        }
        Ok(())
    }

    async fn on_transport_info(&self, request: &JingleRequest) -> Result<(), JingleError> {
        let inner = self.inner.lock().await;
        for element in &request.contents {
            let content = inner
                .contents
                .get(&element.name)
                .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
            let Some(transport) = &element.transport else {
                return Err(JingleError::BadRequest("transport-info without transport".into()));
            };
            if transport.namespace != content.transport.namespace() {
                return Err(JingleError::BadRequest(format!(
                    "transport-info for {} on a {} content",
                    transport.namespace,
                    content.transport.namespace()
                )));
            }
            content.transport.handle_info(transport)?;
        }
        Ok(())
    }

    async fn on_transport_replace(self: &Arc<Self>, request: &JingleRequest) -> Result<(), JingleError> {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for element in &request.contents {
            let Some(transport_element) = element.transport.clone() else {
                return Err(JingleError::BadRequest("transport-replace without transport".into()));
            };
            let reference = {
                let inner = self.inner.lock().await;
                let content = inner
                    .contents
                    .get(&element.name)
                    .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
                if content.state == ContentState::Ready {
                    return Err(JingleError::OutOfOrder(format!(
                        "content {} already established",
                        element.name
                    )));
                }
                content.reference()
            };

            let Some(factory) = self.ctx.extensions.transport(&transport_element.namespace) else {
                info!(
                    "Rejecting replacement of content {} with unsupported {}",
                    element.name, transport_element.namespace
                );
                rejected.push(reference);
                continue;
            };
            let setup = content::transport_setup(&self.link, &element.name, Some(transport_element));
            let transport = factory.create(setup).await?;

            let replaced = {
                let mut inner = self.inner.lock().await;
                match inner.contents.get_mut(&element.name) {
                    Some(content) => {
                        content.abort();
                        let old = std::mem::replace(&mut content.transport, transport);
                        content.generation += 1;
                        content.state = ContentState::Negotiating;
                        accepted.push((
                            content.reference().with_transport(content.transport.element()),
                            content.generation,
                        ));
                        Some(old)
                    }
                    None => None,
                }
            };
            if let Some(old) = replaced {
                info!(
                    "Content {} of session {} switching to {}",
                    element.name,
                    self.sid(),
                    factory.namespace()
                );
                old.release().await;
            }
        }

        for (element, generation) in accepted {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let name = element.name.clone();
                let request = session.link.request(Action::TransportAccept).with_content(element);
                match session.link.send(request).await {
                    Ok(()) => session.resume_negotiation(&name, generation).await,
                    Err(error) => {
                        warn!("Failed to accept replacement transport for {}: {}", name, error);
                        session.conclude_failure(&name, Reason::FailedTransport).await;
                    }
                }
            });
        }
        for reference in rejected {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let name = reference.name.clone();
                let request = session.link.request(Action::TransportReject).with_content(reference);
                if let Err(error) = session.link.send(request).await {
                    debug!("Peer did not acknowledge transport-reject: {}", error);
                }
                session.conclude_failure(&name, Reason::FailedTransport).await;
            });
        }
        Ok(())
    }

    async fn on_transport_accept(self: &Arc<Self>, request: &JingleRequest) -> Result<(), JingleError> {
        let released = {
            let mut inner = self.inner.lock().await;
            for element in &request.contents {
                let content = inner
                    .contents
                    .get(&element.name)
                    .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
                if content.state != ContentState::Replacing || content.pending_transport.is_none() {
                    return Err(JingleError::OutOfOrder(format!(
                        "no transport replacement pending for {}",
                        element.name
                    )));
                }
            }

            let mut released = Vec::new();
            for element in &request.contents {
                let Some(content) = inner.contents.get_mut(&element.name) else {
                    continue;
                };
                if let (Some(pending), Some(transport)) =
                    (&content.pending_transport, &element.transport)
                {
                    pending.accept_remote(transport)?;
                }
                if let Some(pending) = content.pending_transport.take() {
                    released.push(std::mem::replace(&mut content.transport, pending));
                    content.generation += 1;
                    info!(
                        "Peer accepted {} for content {}",
                        content.transport.namespace(),
                        content.name
                    );
                    self.start_negotiation(content);
                }
            }
            released
        };

        for transport in released {
            transport.release().await;
        }
        Ok(())
    }

    async fn on_transport_reject(self: &Arc<Self>, request: &JingleRequest) -> Result<(), JingleError> {
        let rejected = {
            let mut inner = self.inner.lock().await;
            for element in &request.contents {
                let content = inner
                    .contents
                    .get(&element.name)
                    .ok_or_else(|| JingleError::UnknownContent(element.name.clone()))?;
                if content.state != ContentState::Replacing {
                    return Err(JingleError::OutOfOrder(format!(
                        "no transport replacement pending for {}",
                        element.name
                    )));
                }
            }
            request
                .contents
                .iter()
                .filter_map(|element| {
                    let content = inner.contents.get_mut(&element.name)?;
                    Some((element.name.clone(), content.pending_transport.take()))
                })
                .collect::<Vec<_>>()
        };

        for (name, pending) in rejected {
            info!("Peer rejected replacement transport for {}", name);
            if let Some(pending) = pending {
                pending.release().await;
            }
            self.conclude_failure(&name, Reason::FailedTransport).await;
        }
        Ok(())
    }

    /// Accept a session the peer initiated
    pub async fn accept(self: &Arc<Self>) -> Result<(), JingleError> {
        if self.role() != Role::Responder {
            return Err(JingleError::OutOfOrder(
                "only the responder accepts a session".into(),
            ));
        }

        let request = {
            let inner = self.inner.lock().await;
            match self.state() {
                SessionState::Unacknowledged => {}
                SessionState::Ended => return Err(JingleError::SessionEnded),
                _ => return Err(JingleError::OutOfOrder("session already accepted".into())),
            }
            let mut request = self.link.request(Action::SessionAccept);
            request.responder = Some(self.local().clone());
            request.contents = inner.contents.values().map(Content::element).collect();
            request
        };

        info!("Accepting session {} from {}", self.sid(), self.peer());
        if let Err(error) = self.link.send(request).await {
            warn!("Session-accept for {} failed: {}", self.sid(), error);
            self.finish(error.terminate_reason(), true).await;
            return Err(error);
        }

        let mut inner = self.inner.lock().await;
        if !self.state.send_if_modified(|state| {
            if *state == SessionState::Unacknowledged {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        }) {
            return Err(match self.state() {
                SessionState::Ended => JingleError::SessionEnded,
                _ => JingleError::OutOfOrder("session already accepted".into()),
            });
        }
        for content in inner.contents.values_mut() {
            if content.state == ContentState::Proposed {
                self.start_negotiation(content);
            }
        }
        self.start_keepalive(&mut inner);
        Ok(())
    }

    /// Terminate the session; a no-op once it has ended
    pub async fn terminate(&self, reason: Reason) {
        self.finish(reason, true).await;
    }

    /// Send an empty session-info and measure the round trip
    pub async fn ping(&self) -> Result<Duration, JingleError> {
        match self.state() {
            SessionState::Active => {}
            SessionState::Ended => return Err(JingleError::SessionEnded),
            _ => return Err(JingleError::OutOfOrder("session is not active".into())),
        }
        let started = Instant::now();
        self.link.send(self.link.request(Action::SessionInfo)).await?;
        Ok(started.elapsed())
    }

    /// Offer an additional content on an active session
    pub async fn add_content(self: &Arc<Self>, spec: ContentSpec) -> Result<(), JingleError> {
        self.require_active()?;

        let name = spec.name.clone();
        let content = content::build_local(&self.ctx, &self.link, spec).await?;
        let element = content.element();
        {
            let mut inner = self.inner.lock().await;
            if inner.contents.contains_key(&name) {
                drop(inner);
                content.release().await;
                return Err(JingleError::BadRequest(format!("content {} already exists", name)));
            }
            inner.contents.insert(name.clone(), content);
        }

        info!("Adding content {} to session {}", name, self.sid());
        let request = self.link.request(Action::ContentAdd).with_content(element);
        if let Err(error) = self.link.send(request).await {
            let removed = self.inner.lock().await.contents.remove(&name);
            if let Some(content) = removed {
                content.release().await;
            }
            return Err(error);
        }
        Ok(())
    }

    /// Accept a content the peer added
    pub async fn accept_content(self: &Arc<Self>, name: &str) -> Result<(), JingleError> {
        self.require_active()?;

        let element = {
            let inner = self.inner.lock().await;
            let content = inner
                .contents
                .get(name)
                .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?;
            if content.state != ContentState::Proposed {
                return Err(JingleError::OutOfOrder(format!(
                    "content {} is not awaiting acceptance",
                    name
                )));
            }
            content.element()
        };

        self.link
            .send(self.link.request(Action::ContentAccept).with_content(element))
            .await?;

        let mut inner = self.inner.lock().await;
        if let Some(content) = inner.contents.get_mut(name) {
            if content.state == ContentState::Proposed {
                self.start_negotiation(content);
            }
        }
        Ok(())
    }

    /// Decline a content the peer added
    pub async fn reject_content(&self, name: &str) -> Result<(), JingleError> {
        let content = {
            let mut inner = self.inner.lock().await;
            match inner.contents.get(name) {
                Some(content) if content.state == ContentState::Proposed => {}
                Some(_) => {
                    return Err(JingleError::OutOfOrder(format!(
                        "content {} is not awaiting acceptance",
                        name
                    )))
                }
                None => return Err(JingleError::UnknownContent(name.to_string())),
            }
            inner
                .contents
                .remove(name)
                .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?
        };

        content.fail(self.sid(), Reason::Decline);
        let reference = content.reference();
        content.release().await;
        let request = self
            .link
            .request(Action::ContentReject)
            .with_content(reference)
            .with_reason(Reason::Decline.into());
        self.link.send(request).await
    }

    /// Remove a content; the peer ends the session when none remain
    pub async fn remove_content(&self, name: &str, reason: Reason) -> Result<(), JingleError> {
        let mut content = self
            .inner
            .lock()
            .await
            .contents
            .remove(name)
            .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?;

        info!("Removing content {} from session {}: {}", name, self.sid(), reason);
        content.abort();
        content.fail(self.sid(), reason);
        let reference = content.reference();
        content.release().await;
        let request = self
            .link
            .request(Action::ContentRemove)
            .with_content(reference)
            .with_reason(reason.into());
        self.link.send(request).await
    }

    /// Change who may send on a content
    pub async fn modify_content(&self, name: &str, senders: Senders) -> Result<(), JingleError> {
        let element = {
            let mut inner = self.inner.lock().await;
            let content = inner
                .contents
                .get_mut(name)
                .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?;
            content.senders = senders;
            let mut element = content.reference();
            element.senders = senders;
            element
        };
        self.link
            .send(self.link.request(Action::ContentModify).with_content(element))
            .await
    }

    fn require_active(&self) -> Result<(), JingleError> {
        match self.state() {
            SessionState::Active => Ok(()),
            SessionState::Ended => Err(JingleError::SessionEnded),
            _ => Err(JingleError::OutOfOrder("session is not active".into())),
        }
    }

    fn start_negotiation(self: &Arc<Self>, content: &mut Content) {
        content.state = ContentState::Negotiating;
        let link = self.link.content(content.name.clone(), content.creator);
        let transport = Arc::clone(&content.transport);
        let security = content.security.clone();
        let generation = content.generation;
        let name = content.name.clone();
        let session = Arc::clone(self);

        debug!(
            "Negotiating content {} of session {} over {}",
            name,
            self.sid(),
            transport.namespace()
        );
        content.set_task(tokio::spawn(async move {
            let result = content::negotiate(link, transport, security).await;
            session.on_negotiated(&name, generation, result).await;
        }));
    }

    async fn resume_negotiation(self: &Arc<Self>, name: &str, generation: u64) {
        let mut inner = self.inner.lock().await;
        if self.state() == SessionState::Ended {
            return;
        }
        if let Some(content) = inner.contents.get_mut(name) {
            if content.generation == generation {
                self.start_negotiation(content);
            }
        }
    }

    async fn on_negotiated(
        self: &Arc<Self>,
        name: &str,
        generation: u64,
        result: Result<IoStream, JingleError>,
    ) {
        let mut inner = self.inner.lock().await;
        if self.state() == SessionState::Ended {
            return;
        }
        let Some(content) = inner.contents.get_mut(name) else {
            return;
        };
        if content.generation != generation || content.state != ContentState::Negotiating {
            return;
        }

        let error = match result {
            Ok(stream) => {
                info!(
                    "Content {} of session {} ready over {}",
                    name,
                    self.sid(),
                    content.transport.namespace()
                );
                content.state = ContentState::Ready;
                content.deliver(self.sid(), stream);
                return;
            }
            Err(error) => error,
        };

        warn!("Content {} of session {} failed: {}", name, self.sid(), error);
        match (self.fallback_for(content, &error), self.role()) {
            (Some(factory), Role::Initiator) => {
                content.state = ContentState::Replacing;
                drop(inner);
                self.propose_replacement(name, factory).await;
            }
            (Some(_), Role::Responder) => {
                content.state = ContentState::AwaitingReplace;
                let generation = content.generation;
                drop(inner);
                self.await_replacement(name, generation);
            }
            (None, _) => {
                drop(inner);
                self.conclude_failure(name, error.terminate_reason()).await;
            }
        }
    }

    fn fallback_for(&self, content: &Content, error: &JingleError) -> Option<Arc<dyn TransportFactory>> {
        if !matches!(error, JingleError::Transport(_)) {
            return None;
        }
        let namespace = self.ctx.config.fallback_transport.as_deref()?;
        if content.transport.namespace() == namespace {
            return None;
        }
        self.ctx.extensions.transport(namespace)
    }

    async fn propose_replacement(self: &Arc<Self>, name: &str, factory: Arc<dyn TransportFactory>) {
        let setup = content::transport_setup(&self.link, name, None);
        let transport = match factory.create(setup).await {
            Ok(transport) => transport,
            Err(error) => {
                warn!("Fallback transport for {} unavailable: {}", name, error);
                self.conclude_failure(name, Reason::FailedTransport).await;
                return;
            }
        };

        let element = {
            let mut inner = self.inner.lock().await;
            match inner.contents.get_mut(name) {
                Some(content) if content.state == ContentState::Replacing => {
                    content.pending_transport = Some(Arc::clone(&transport));
                    Some(content.reference().with_transport(transport.element()))
                }
                _ => None,
            }
        };
        let Some(element) = element else {
            transport.release().await;
            return;
        };

        info!(
            "Replacing transport of content {} in session {} with {}",
            name,
            self.sid(),
            factory.namespace()
        );
        let request = self.link.request(Action::TransportReplace).with_content(element);
        if let Err(error) = self.link.send(request).await {
            warn!("Transport-replace for {} failed: {}", name, error);
            self.conclude_failure(name, Reason::FailedTransport).await;
        }
    }

    fn await_replacement(self: &Arc<Self>, name: &str, generation: u64) {
        let session = Arc::clone(self);
        let name = name.to_string();
        let timeout = self.ctx.config.response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let inner = session.inner.lock().await;
                matches!(
                    inner.contents.get(&name),
                    Some(content) if content.generation == generation
                        && content.state == ContentState::AwaitingReplace
                )
            };
            if expired {
                debug!("No replacement transport proposed for {}", name);
                session.conclude_failure(&name, Reason::FailedTransport).await;
            }
        });
    }

    /// Mark a content failed and end the session once every content has
    async fn conclude_failure(self: &Arc<Self>, name: &str, reason: Reason) {
        let all_failed = {
            let mut inner = self.inner.lock().await;
            let Some(content) = inner.contents.get_mut(name) else {
                return;
            };
            if content.state == ContentState::Failed {
                return;
            }
            content.state = ContentState::Failed;
            content.fail(self.sid(), reason);
            inner
                .contents
                .values()
                .all(|content| content.state == ContentState::Failed)
        };

        if all_failed {
            warn!("All contents of session {} failed", self.sid());
            self.terminate_detached(reason);
        }
    }

    fn start_keepalive(self: &Arc<Self>, inner: &mut SessionInner) {
        if let Some(interval) = self.ctx.config.ping_interval {
            inner.keepalive = Some(keepalive::spawn(
                Arc::downgrade(self),
                interval,
                self.ctx.config.max_missed_pings,
            ));
        }
    }

    /// Terminate from a task the session itself may abort
    pub(crate) fn terminate_detached(self: &Arc<Self>, reason: Reason) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.finish(reason, true).await;
        });
    }

    /// Move to Ended exactly once, releasing everything the session holds
    pub(crate) async fn finish(&self, reason: Reason, notify: bool) {
        if self.end_reason.set(reason).is_err() {
            return;
        }
        self.state.send_replace(SessionState::Ended);

        let (contents, keepalive) = {
            let mut inner = self.inner.lock().await;
            (std::mem::take(&mut inner.contents), inner.keepalive.take())
        };
        if let Some(keepalive) = keepalive {
            keepalive.abort();
        }
        self.ctx.registry.remove(&self.key());

        for (_, mut content) in contents {
            content.abort();
            content.fail(self.sid(), reason);
            content.release().await;
        }

        info!("Session {} with {} ended: {}", self.sid(), self.peer(), reason);
        let _ = self.ctx.events.send(JingleEvent::SessionEnded {
            peer: self.peer().clone(),
            sid: self.sid().clone(),
            reason,
        });

        if notify {
            let request = self
                .link
                .request(Action::SessionTerminate)
                .with_reason(reason.into());
            if let Err(error) = self.link.send(request).await {
                debug!("Peer did not acknowledge session-terminate: {}", error);
            }
        }
    }
}
