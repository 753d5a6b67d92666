//! Engine entry point: routes inbound requests to sessions and creates new ones.

use crate::config::SessionConfig;
use crate::content::{self, Content, ContentSpec};
use crate::error::JingleError;
use crate::extensions::Extensions;
use crate::registry::{SessionKey, SessionRegistry};
use crate::session::{Session, SessionState};
use crate::signaling::{InboundRequest, SessionLink, Signaling};
use jingle_wire::{Action, Jid, JingleRequest, Reason, Response, Role, SessionId, NS_JINGLE};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notifications for the application
#[derive(Debug, Clone)]
pub enum JingleEvent {
    /// A peer initiated a session; call [`Session::accept`] or terminate it
    IncomingSession(Arc<Session>),
    /// A peer added a content to a session
    ContentAdded {
        /// The session
        session: Arc<Session>,
        /// Name of the new content
        content: String,
    },
    /// A session ended
    SessionEnded {
        /// Remote endpoint
        peer: Jid,
        /// Session id
        sid: SessionId,
        /// Termination reason
        reason: Reason,
    },
}

/// State shared by the manager and every session it owns
#[derive(Debug)]
pub(crate) struct EngineContext {
    pub(crate) local: Jid,
    pub(crate) signaling: Arc<dyn Signaling>,
    pub(crate) extensions: Extensions,
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) registry: SessionRegistry,
    pub(crate) events: mpsc::UnboundedSender<JingleEvent>,
}

enum Disposition {
    Handled,
    Incoming(Arc<Session>),
    Declined(SessionLink, Reason),
}

/// Jingle session manager for one local endpoint
#[derive(Debug)]
pub struct JingleManager {
    ctx: Arc<EngineContext>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl JingleManager {
    /// Create a manager and the receiver for its events
    pub fn new(
        local: Jid,
        signaling: Arc<dyn Signaling>,
        extensions: Extensions,
        config: SessionConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<JingleEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = EngineContext {
            local,
            signaling,
            extensions,
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            events,
        };
        let manager = Arc::new(Self {
            ctx: Arc::new(ctx),
            dispatch: Mutex::new(None),
        });
        (manager, rx)
    }

    /// Register for inbound Jingle requests and start dispatching them
    pub fn start(self: &Arc<Self>) {
        let Ok(mut dispatch) = self.dispatch.lock() else {
            return;
        };
        if dispatch.is_some() {
            return;
        }

        info!("Starting Jingle manager for {}", self.ctx.local);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.ctx.signaling.register_handler(NS_JINGLE, tx);

        let manager = Arc::downgrade(self);
        let local = self.ctx.local.clone();
        *dispatch = Some(tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    manager.handle_request(inbound).await;
                });
            }
            debug!("Dispatch loop for {} stopped", local);
        }));
    }

    /// Local endpoint
    pub fn local(&self) -> &Jid {
        &self.ctx.local
    }

    /// Engine configuration
    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Live sessions
    pub fn sessions(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    /// Look up a live session
    pub fn session(&self, peer: &Jid, sid: &SessionId) -> Option<Arc<Session>> {
        self.ctx
            .registry
            .get(&SessionKey::new(peer.clone(), sid.clone()))
    }

    /// Start a session with `peer` offering the given contents
    pub async fn initiate(
        &self,
        peer: Jid,
        contents: Vec<ContentSpec>,
    ) -> Result<Arc<Session>, JingleError> {
        if contents.is_empty() {
            return Err(JingleError::BadRequest(
                "a session needs at least one content".into(),
            ));
        }
        let mut names = HashSet::new();
        if let Some(duplicate) = contents.iter().find(|spec| !names.insert(spec.name.as_str())) {
            return Err(JingleError::BadRequest(format!(
                "duplicate content {}",
                duplicate.name
            )));
        }

        let link = self.link(peer, SessionId::generate(), Role::Initiator);
        let mut built = Vec::with_capacity(contents.len());
        for spec in contents {
            match content::build_local(&self.ctx, &link, spec).await {
                Ok(content) => built.push(content),
                Err(error) => {
                    for content in built {
                        content.release().await;
                    }
                    return Err(error);
                }
            }
        }

        let mut request = link.request(Action::SessionInitiate);
        request.initiator = Some(self.ctx.local.clone());
        request.contents = built.iter().map(Content::element).collect();

        let session = Session::new(Arc::clone(&self.ctx), link, SessionState::Pending, built);
        if !self.ctx.registry.insert_new(session.key(), Arc::clone(&session)) {
            return Err(JingleError::OutOfOrder(format!(
                "session {} already exists",
                session.sid()
            )));
        }

        info!("Initiating session {} with {}", session.sid(), session.peer());
        if let Err(error) = session.link().send(request).await {
            warn!("Session-initiate to {} failed: {}", session.peer(), error);
            session.finish(error.terminate_reason(), false).await;
            return Err(error);
        }
        Ok(session)
    }

    /// Process one inbound request and answer it
    pub async fn handle_request(&self, inbound: InboundRequest) {
        let InboundRequest {
            correlation,
            from,
            request,
        } = inbound;
        debug!(
            "Received {} for session {} from {}",
            request.action, request.sid, from
        );

        let disposition = self.process(&from, &request).await;
        let response = match &disposition {
            Ok(_) => Response::Ack,
            Err(error) => {
                debug!("Rejecting {} from {}: {}", request.action, from, error);
                Response::Error(error.to_stanza_error())
            }
        };
        if let Err(e) = self.ctx.signaling.send_response(correlation, response).await {
            warn!("Failed to answer {} from {}: {}", request.action, from, e);
        }

        match disposition {
            Ok(Disposition::Incoming(session)) => {
                info!("Incoming session {} from {}", session.sid(), session.peer());
                let _ = self.ctx.events.send(JingleEvent::IncomingSession(session));
            }
            Ok(Disposition::Declined(link, reason)) => {
                let terminate = link
                    .request(Action::SessionTerminate)
                    .with_reason(reason.into());
                if let Err(e) = link.send(terminate).await {
                    debug!("Peer {} did not acknowledge decline: {}", link.peer(), e);
                }
            }
            Ok(Disposition::Handled) | Err(_) => {}
        }
    }

    async fn process(&self, from: &Jid, request: &JingleRequest) -> Result<Disposition, JingleError> {
        request.validate()?;

        let key = SessionKey::new(from.clone(), request.sid.clone());
        if let Some(session) = self.ctx.registry.get(&key) {
            session.handle(request).await?;
            return Ok(Disposition::Handled);
        }

        match request.action {
            Action::SessionInitiate => self.accept_initiate(from, request).await,
            _ => Err(JingleError::UnknownSession(request.sid.to_string())),
        }
    }

    async fn accept_initiate(
        &self,
        from: &Jid,
        request: &JingleRequest,
    ) -> Result<Disposition, JingleError> {
        if request.initiator.as_ref() != Some(from) {
            return Err(JingleError::BadRequest(
                "initiator does not match sender".into(),
            ));
        }

        let link = self.link(from.clone(), request.sid.clone(), Role::Responder);
        let mut contents = Vec::with_capacity(request.contents.len());
        for element in &request.contents {
            match content::build_offered(&self.ctx, &link, element).await {
                Ok(content) => contents.push(content),
                Err(error) => {
                    for content in contents {
                        content.release().await;
                    }
                    if error.is_unsupported() {
                        info!("Declining session {} from {}: {}", request.sid, from, error);
                        return Ok(Disposition::Declined(link, error.terminate_reason()));
                    }
                    return Err(error);
                }
            }
        }

        let session = Session::new(
            Arc::clone(&self.ctx),
            link,
            SessionState::Unacknowledged,
            contents,
        );
        if !self.ctx.registry.insert_new(session.key(), Arc::clone(&session)) {
            return Err(JingleError::OutOfOrder(format!(
                "session {} already exists",
                request.sid
            )));
        }
        Ok(Disposition::Incoming(session))
    }

    /// Stop dispatching and terminate every live session with `gone`
    pub async fn shutdown(&self) {
        let dispatch = self.dispatch.lock().ok().and_then(|mut dispatch| dispatch.take());
        if let Some(dispatch) = dispatch {
            dispatch.abort();
        }

        let sessions = self.ctx.registry.all();
        info!(
            "Shutting down Jingle manager for {} ({} sessions)",
            self.ctx.local,
            sessions.len()
        );
        for session in sessions {
            session.terminate(Reason::Gone).await;
        }
    }

    fn link(&self, peer: Jid, sid: SessionId, role: Role) -> SessionLink {
        SessionLink::new(
            Arc::clone(&self.ctx.signaling),
            self.ctx.local.clone(),
            peer,
            sid,
            role,
            self.ctx.config.response_timeout,
        )
    }
}
