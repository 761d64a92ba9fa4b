//! Boundary to the platform telephony service (system call UI, audio session).

use super::state::{Call, CallDirection, CallHandle};
use crate::jid::Jid;
use crate::jingle::{MediaKind, TerminationReason};
use async_trait::async_trait;

/// What the platform needs to show a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMetadata {
    pub peer: Jid,
    pub direction: CallDirection,
    pub media: Vec<MediaKind>,
    pub has_video: bool,
}

impl From<&Call> for CallMetadata {
    fn from(call: &Call) -> Self {
        Self {
            peer: call.peer.clone(),
            direction: call.direction,
            media: call.media.clone(),
            has_video: call.has_video(),
        }
    }
}

/// Outcome reported for a call the platform did not end itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndedReason {
    Failed,
    RemoteEnded,
    Unanswered,
    AnsweredElsewhere,
    DeclinedElsewhere,
}

impl EndedReason {
    /// `None` for outcomes that are not surfaced.
    pub fn from_termination(reason: TerminationReason, was_ringing: bool) -> Option<Self> {
        match reason {
            TerminationReason::Superseded => None,
            TerminationReason::AnsweredElsewhere => Some(Self::AnsweredElsewhere),
            TerminationReason::DeclinedElsewhere => Some(Self::DeclinedElsewhere),
            TerminationReason::Timeout => Some(Self::Unanswered),
            TerminationReason::Cancel if was_ringing => Some(Self::Unanswered),
            reason if reason.is_error() => Some(Self::Failed),
            _ => Some(Self::RemoteEnded),
        }
    }
}

/// Platform telephony capability.
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Show an incoming call. An error means the platform refused it.
    async fn report_new_incoming_call(
        &self,
        handle: &CallHandle,
        metadata: CallMetadata,
    ) -> Result<(), anyhow::Error>;

    /// Ask the platform to start an outgoing call; `Ok` confirms it.
    async fn request_start_outgoing_call(
        &self,
        handle: &CallHandle,
        metadata: CallMetadata,
    ) -> Result<(), anyhow::Error>;

    async fn request_end_call(&self, handle: &CallHandle) -> Result<(), anyhow::Error>;

    async fn request_mute(&self, handle: &CallHandle, muted: bool) -> Result<(), anyhow::Error>;

    /// The call ended for a reason the platform did not initiate.
    async fn report_call_ended(&self, handle: &CallHandle, reason: EndedReason);

    async fn report_outgoing_connected(&self, handle: &CallHandle);
}

/// Callbacks from the telephony service into the call manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyAction {
    PerformAnswer { handle: CallHandle },
    PerformStart { handle: CallHandle },
    PerformEnd { handle: CallHandle },
    PerformMute { handle: CallHandle, muted: bool },
    ProviderReset,
}
