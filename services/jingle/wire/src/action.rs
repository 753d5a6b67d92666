//! Jingle action verbs, party roles, and sender policies.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Negotiation action carried by every Jingle request
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Offer a new session
    SessionInitiate,
    /// Accept a pending session
    SessionAccept,
    /// End a session
    SessionTerminate,
    /// Session-level informational message or ping
    SessionInfo,
    /// Add a content to an existing session
    ContentAdd,
    /// Accept a content-add
    ContentAccept,
    /// Change the senders of a content
    ContentModify,
    /// Reject a content-add
    ContentReject,
    /// Remove a content
    ContentRemove,
    /// Application-specific information
    DescriptionInfo,
    /// Security overlay information
    SecurityInfo,
    /// Transport-specific information
    TransportInfo,
    /// Accept a transport-replace
    TransportAccept,
    /// Reject a transport-replace
    TransportReject,
    /// Replace a content's transport
    TransportReplace,
}

impl Action {
    /// Every action, in protocol order
    pub const ALL: [Action; 15] = [
        Action::SessionInitiate,
        Action::SessionAccept,
        Action::SessionTerminate,
        Action::SessionInfo,
        Action::ContentAdd,
        Action::ContentAccept,
        Action::ContentModify,
        Action::ContentReject,
        Action::ContentRemove,
        Action::DescriptionInfo,
        Action::SecurityInfo,
        Action::TransportInfo,
        Action::TransportAccept,
        Action::TransportReject,
        Action::TransportReplace,
    ];

    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::SessionInitiate => "session-initiate",
            Action::SessionAccept => "session-accept",
            Action::SessionTerminate => "session-terminate",
            Action::SessionInfo => "session-info",
            Action::ContentAdd => "content-add",
            Action::ContentAccept => "content-accept",
            Action::ContentModify => "content-modify",
            Action::ContentReject => "content-reject",
            Action::ContentRemove => "content-remove",
            Action::DescriptionInfo => "description-info",
            Action::SecurityInfo => "security-info",
            Action::TransportInfo => "transport-info",
            Action::TransportAccept => "transport-accept",
            Action::TransportReject => "transport-reject",
            Action::TransportReplace => "transport-replace",
        }
    }

    /// Whether the action operates on contents and must carry at least one
    pub fn requires_contents(&self) -> bool {
        matches!(
            self,
            Action::SessionInitiate
                | Action::SessionAccept
                | Action::ContentAdd
                | Action::ContentAccept
                | Action::ContentModify
                | Action::ContentReject
                | Action::ContentRemove
                | Action::DescriptionInfo
                | Action::SecurityInfo
                | Action::TransportInfo
                | Action::TransportAccept
                | Action::TransportReject
                | Action::TransportReplace
        )
    }

    /// Whether every content of the action must carry a transport element
    pub fn requires_transport(&self) -> bool {
        matches!(
            self,
            Action::SessionInitiate
                | Action::SessionAccept
                | Action::ContentAdd
                | Action::ContentAccept
                | Action::TransportInfo
                | Action::TransportAccept
                | Action::TransportReplace
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| WireError::UnknownAction(s.to_string()))
    }
}

/// Party role within a session
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// The party that sent session-initiate
    Initiator,
    /// The party that received session-initiate
    Responder,
}

impl Role {
    /// The other party's role
    pub fn opposite(&self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Which parties may transmit payload on a content
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Senders {
    /// Only the initiator sends
    Initiator,
    /// Only the responder sends
    Responder,
    /// Both parties send
    #[default]
    Both,
    /// Nobody sends (content on hold)
    None,
}

impl Senders {
    /// Whether the given role may send on the content
    pub fn allows(&self, role: Role) -> bool {
        match self {
            Senders::Initiator => role == Role::Initiator,
            Senders::Responder => role == Role::Responder,
            Senders::Both => true,
            Senders::None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_parse_back() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!(matches!(
            "session-ping".parse::<Action>(),
            Err(WireError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_senders_policy() {
        assert!(Senders::Both.allows(Role::Responder));
        assert!(Senders::Initiator.allows(Role::Initiator));
        assert!(!Senders::Initiator.allows(Role::Responder));
        assert!(!Senders::None.allows(Role::Initiator));
        assert_eq!(Role::Initiator.opposite(), Role::Responder);
    }
}
