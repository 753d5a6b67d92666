//! Session envelope and content elements.

use crate::action::{Action, Role, Senders};
use crate::error::WireError;
use crate::jid::{Jid, SessionId};
use crate::transport::TransportElement;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A Jingle negotiation request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JingleRequest {
    /// Action verb
    pub action: Action,
    /// Session id
    pub sid: SessionId,
    /// Session initiator (required on session-initiate)
    pub initiator: Option<Jid>,
    /// Session responder (set on session-accept)
    pub responder: Option<Jid>,
    /// Contents the action applies to
    pub contents: Vec<ContentElement>,
    /// Termination or removal reason
    pub reason: Option<ReasonElement>,
    /// Opaque session-info payload
    pub info: Option<ciborium::Value>,
}

impl JingleRequest {
    /// Create an empty request for the given action and session
    pub fn new(action: Action, sid: SessionId) -> Self {
        Self {
            action,
            sid,
            initiator: None,
            responder: None,
            contents: Vec::new(),
            reason: None,
            info: None,
        }
    }

    /// Attach a content
    pub fn with_content(mut self, content: ContentElement) -> Self {
        self.contents.push(content);
        self
    }

    /// Attach a reason
    pub fn with_reason(mut self, reason: ReasonElement) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Look up a content by name
    pub fn content(&self, name: &str) -> Option<&ContentElement> {
        self.contents.iter().find(|content| content.name == name)
    }

    /// Check the structural requirements of the action
    pub fn validate(&self) -> Result<(), WireError> {
        if self.sid.as_str().is_empty() {
            return Err(WireError::Malformed("empty session id".into()));
        }

        if self.action == Action::SessionInitiate && self.initiator.is_none() {
            return Err(WireError::Malformed(
                "session-initiate without initiator".into(),
            ));
        }

        if self.action.requires_contents() && self.contents.is_empty() {
            return Err(WireError::Malformed(format!(
                "{} without contents",
                self.action
            )));
        }

        for (index, content) in self.contents.iter().enumerate() {
            if content.name.is_empty() {
                return Err(WireError::Malformed("content without name".into()));
            }
            if self.contents[..index].iter().any(|c| c.name == content.name) {
                return Err(WireError::Malformed(format!(
                    "duplicate content {}",
                    content.name
                )));
            }
            if self.action.requires_transport() && content.transport.is_none() {
                return Err(WireError::Malformed(format!(
                    "{} content {} without transport",
                    self.action, content.name
                )));
            }
            if matches!(self.action, Action::SessionInitiate | Action::ContentAdd)
                && content.description.is_none()
            {
                return Err(WireError::Malformed(format!(
                    "{} content {} without description",
                    self.action, content.name
                )));
            }
            if self.action == Action::DescriptionInfo && content.description.is_none() {
                return Err(WireError::Malformed("description-info without description".into()));
            }
            if self.action == Action::SecurityInfo && content.security.is_none() {
                return Err(WireError::Malformed("security-info without security".into()));
            }
        }

        Ok(())
    }
}

/// A content element: one negotiated exchange unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentElement {
    /// Which party created the content
    pub creator: Role,
    /// Content name, unique within the session
    pub name: String,
    /// Who may send on this content
    pub senders: Senders,
    /// Application description
    pub description: Option<DescriptionElement>,
    /// Transport
    pub transport: Option<TransportElement>,
    /// Security overlay
    pub security: Option<SecurityElement>,
}

impl ContentElement {
    /// Create a bare content reference
    pub fn new(creator: Role, name: impl Into<String>) -> Self {
        Self {
            creator,
            name: name.into(),
            senders: Senders::default(),
            description: None,
            transport: None,
            security: None,
        }
    }

    /// Attach a transport element
    pub fn with_transport(mut self, transport: TransportElement) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// Application description, opaque to the engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DescriptionElement {
    /// Application namespace
    pub namespace: String,
    /// Application payload
    pub payload: ciborium::Value,
}

/// Encrypted-transport security element
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityElement {
    /// Security overlay namespace
    pub namespace: String,
    /// Name of the content the overlay protects
    pub name: String,
    /// Cipher namespace
    pub cipher: String,
    /// Namespace of the encryption method that wrapped the key
    pub method: String,
    /// Wrapped key material, addressed to the peer
    pub envelope: Option<Bytes>,
}

/// Why a session or content ended
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    /// Another session replaces this one
    AlternativeSession,
    /// The party is busy
    Busy,
    /// The party cancelled the request
    Cancel,
    /// Connectivity was lost
    ConnectivityError,
    /// The party declined
    Decline,
    /// The session expired
    Expired,
    /// The application failed
    FailedApplication,
    /// The transport failed
    FailedTransport,
    /// Unspecified error
    GeneralError,
    /// The party went away
    Gone,
    /// Parameters are incompatible
    IncompatibleParameters,
    /// Security negotiation failed
    SecurityError,
    /// Normal completion
    Success,
    /// A response did not arrive in time
    Timeout,
    /// No offered application is supported
    UnsupportedApplications,
    /// No offered transport is supported
    UnsupportedTransports,
}

impl Reason {
    /// Wire name of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::AlternativeSession => "alternative-session",
            Reason::Busy => "busy",
            Reason::Cancel => "cancel",
            Reason::ConnectivityError => "connectivity-error",
            Reason::Decline => "decline",
            Reason::Expired => "expired",
            Reason::FailedApplication => "failed-application",
            Reason::FailedTransport => "failed-transport",
            Reason::GeneralError => "general-error",
            Reason::Gone => "gone",
            Reason::IncompatibleParameters => "incompatible-parameters",
            Reason::SecurityError => "security-error",
            Reason::Success => "success",
            Reason::Timeout => "timeout",
            Reason::UnsupportedApplications => "unsupported-applications",
            Reason::UnsupportedTransports => "unsupported-transports",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason with optional human-readable text
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonElement {
    /// Reason code
    pub reason: Reason,
    /// Free-form text
    pub text: Option<String>,
}

impl ReasonElement {
    /// Create a reason without text
    pub fn new(reason: Reason) -> Self {
        Self { reason, text: None }
    }

    /// Create a reason with text
    pub fn with_text(reason: Reason, text: impl Into<String>) -> Self {
        Self {
            reason,
            text: Some(text.into()),
        }
    }
}

impl From<Reason> for ReasonElement {
    fn from(reason: Reason) -> Self {
        Self::new(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InBandTransport, TransportElement};

    fn description() -> DescriptionElement {
        DescriptionElement {
            namespace: "urn:example:blob".into(),
            payload: ciborium::Value::Text("payload".into()),
        }
    }

    fn full_content(name: &str) -> ContentElement {
        let mut content = ContentElement::new(Role::Initiator, name).with_transport(
            TransportElement::in_band(InBandTransport {
                sid: "ibb".into(),
                block_size: 4096,
            }),
        );
        content.description = Some(description());
        content
    }

    #[test]
    fn test_initiate_requires_initiator_and_description() {
        let mut request = JingleRequest::new(Action::SessionInitiate, SessionId::new("s1"))
            .with_content(full_content("file"));
        assert!(request.validate().is_err());

        request.initiator = Some(Jid::new("romeo@example.net/a").unwrap());
        assert!(request.validate().is_ok());

        request.contents[0].description = None;
        assert!(matches!(request.validate(), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_duplicate_content_names_rejected() {
        let request = JingleRequest::new(Action::ContentRemove, SessionId::new("s1"))
            .with_content(ContentElement::new(Role::Initiator, "a"))
            .with_content(ContentElement::new(Role::Responder, "a"));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_transport_info_requires_transport() {
        let request = JingleRequest::new(Action::TransportInfo, SessionId::new("s1"))
            .with_content(ContentElement::new(Role::Initiator, "file"));
        assert!(request.validate().is_err());

        let ok = JingleRequest::new(Action::TransportInfo, SessionId::new("s1"))
            .with_content(full_content("file"));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_terminate_needs_no_contents() {
        let request = JingleRequest::new(Action::SessionTerminate, SessionId::new("s1"))
            .with_reason(Reason::Success.into());
        assert!(request.validate().is_ok());
        assert_eq!(request.reason.unwrap().reason.as_str(), "success");
    }
}
