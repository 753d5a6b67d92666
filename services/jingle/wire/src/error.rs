//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unknown action verb
    #[error("unknown action {0}")]
    UnknownAction(String),

    /// Invalid endpoint address
    #[error("invalid jid: {0:?}")]
    InvalidJid(String),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Structurally invalid request
    #[error("malformed request: {0}")]
    Malformed(String),
}
