//! Responses to Jingle requests and stanza error conditions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Response correlated with a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Response {
    /// Application-level acknowledgement
    Ack,
    /// Protocol-level error
    Error(StanzaError),
}

impl Response {
    /// Whether the response is an acknowledgement
    pub fn is_ack(&self) -> bool {
        matches!(self, Response::Ack)
    }
}

/// Generic stanza error condition
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCondition {
    /// The request is malformed
    BadRequest,
    /// The addressed item does not exist
    ItemNotFound,
    /// The request uses an unimplemented feature
    FeatureNotImplemented,
    /// The request is not expected in the current state
    UnexpectedRequest,
    /// The request is refused
    NotAcceptable,
    /// The recipient failed internally
    InternalServerError,
    /// A dependent remote operation timed out
    RemoteServerTimeout,
    /// The service is unavailable
    ServiceUnavailable,
}

/// Jingle-specific error condition
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JingleCondition {
    /// The request arrived out of order
    OutOfOrder,
    /// Both parties initiated the same session
    TieBreak,
    /// The session is not known
    UnknownSession,
    /// The info payload is not understood
    UnsupportedInfo,
}

/// Error carried in a response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
    /// Generic condition
    pub condition: ErrorCondition,
    /// Jingle-specific condition
    pub jingle: Option<JingleCondition>,
    /// Human-readable text
    pub text: Option<String>,
}

impl StanzaError {
    /// Create an error with a generic condition only
    pub fn new(condition: ErrorCondition) -> Self {
        Self {
            condition,
            jingle: None,
            text: None,
        }
    }

    /// Create an error with a Jingle-specific condition
    pub fn jingle(condition: ErrorCondition, jingle: JingleCondition) -> Self {
        Self {
            condition,
            jingle: Some(jingle),
            text: None,
        }
    }

    /// Attach text
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// `item-not-found` + `unknown-session`
    pub fn unknown_session() -> Self {
        Self::jingle(ErrorCondition::ItemNotFound, JingleCondition::UnknownSession)
    }

    /// `unexpected-request` + `out-of-order`
    pub fn out_of_order() -> Self {
        Self::jingle(ErrorCondition::UnexpectedRequest, JingleCondition::OutOfOrder)
    }

    /// `not-acceptable` + `tie-break`
    pub fn tie_break() -> Self {
        Self::jingle(ErrorCondition::NotAcceptable, JingleCondition::TieBreak)
    }

    /// `feature-not-implemented` + `unsupported-info`
    pub fn unsupported_info() -> Self {
        Self::jingle(
            ErrorCondition::FeatureNotImplemented,
            JingleCondition::UnsupportedInfo,
        )
    }

    /// `bad-request` with text
    pub fn bad_request(text: impl Into<String>) -> Self {
        Self::new(ErrorCondition::BadRequest).with_text(text)
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.condition)?;
        if let Some(jingle) = self.jingle {
            write!(f, "/{:?}", jingle)?;
        }
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StanzaError::out_of_order().with_text("candidate-used already received");
        assert_eq!(
            error.to_string(),
            "UnexpectedRequest/OutOfOrder: candidate-used already received"
        );
        assert!(!Response::Error(error).is_ack());
        assert!(Response::Ack.is_ack());
    }
}
