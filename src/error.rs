//! Call-related error types.

use crate::calls::InvalidTransition;
use crate::sdp::SdpError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call is already current.
    #[error("another call is already in progress")]
    Conflict,

    /// Local media access was not granted.
    #[error("media permission not granted")]
    Unauthorized,

    #[error("no capable resource found for {0}")]
    PeerUnreachable(String),

    #[error("protocol action delivery failed: {0}")]
    ProtocolDeliveryFailed(String),

    #[error("media negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Sibling session lost a multi-resource race.
    #[error("session superseded by another resource")]
    Superseded,

    #[error("timed out")]
    Timeout,

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("operation `{operation}` not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("unknown content: {0}")]
    UnknownContent(String),

    #[error("telephony service error: {0}")]
    Telephony(String),

    #[error("session description error: {0}")]
    Sdp(#[from] SdpError),

    #[error("service channel closed")]
    ChannelClosed,
}

impl CallError {
    pub(crate) fn invalid_state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            operation,
            state: format!("{:?}", state),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CallError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CallError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
