//! Call value object and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::meet::Meet;
use crate::jid::{BareJid, Jid};
use crate::jingle::{MediaKind, TerminationReason};

/// Locally generated call identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallHandle(String);

impl CallHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(hex::encode_upper(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fresh protocol session id.
pub fn generate_sid() -> String {
    hex::encode(rand::random::<[u8; 12]>())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Plain one-to-one call or the media leg of a multi-party meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallKind {
    Direct,
    Meet(Meet),
}

/// Current state of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    /// Known locally, not yet confirmed by telephony.
    #[default]
    New,
    /// Ringing locally (incoming) or at the peer (outgoing).
    Ringing { since: DateTime<Utc> },
    /// Call accepted, establishing media connection.
    Connecting { accepted_at: DateTime<Utc> },
    /// Media flowing.
    Connected {
        connected_at: DateTime<Utc>,
        muted: bool,
    },
    Ended {
        reason: TerminationReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Accepted locally or remotely.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Connected { .. })
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Telephony accepted the report.
    Reported,
    /// Answered locally.
    Answered,
    /// The peer accepted our offer.
    RemoteAccepted,
    MediaConnected,
    MuteChanged { muted: bool },
    Ended { reason: TerminationReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Call {
    pub handle: CallHandle,
    pub account: BareJid,
    pub peer: Jid,
    pub sid: String,
    pub direction: CallDirection,
    pub media: Vec<MediaKind>,
    pub kind: CallKind,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl Call {
    pub fn new_outgoing(account: BareJid, peer: Jid, media: Vec<MediaKind>) -> Self {
        Self {
            handle: CallHandle::generate(),
            account,
            peer,
            sid: generate_sid(),
            direction: CallDirection::Outgoing,
            media,
            kind: CallKind::Direct,
            state: CallState::New,
            created_at: Utc::now(),
        }
    }

    pub fn new_incoming(
        account: BareJid,
        peer: Jid,
        sid: impl Into<String>,
        media: Vec<MediaKind>,
    ) -> Self {
        Self {
            handle: CallHandle::generate(),
            account,
            peer,
            sid: sid.into(),
            direction: CallDirection::Incoming,
            media,
            kind: CallKind::Direct,
            state: CallState::New,
            created_at: Utc::now(),
        }
    }

    /// Outgoing media leg to the meet's room component.
    pub fn new_meet(meet: Meet, media: Vec<MediaKind>) -> Self {
        Self {
            handle: CallHandle::generate(),
            account: meet.account.clone(),
            peer: meet.room.clone(),
            sid: meet.sid.clone(),
            direction: CallDirection::Outgoing,
            media,
            kind: CallKind::Meet(meet),
            state: CallState::New,
            created_at: Utc::now(),
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    pub fn has_video(&self) -> bool {
        self.media.contains(&MediaKind::Video)
    }

    pub fn meet(&self) -> Option<&Meet> {
        match &self.kind {
            CallKind::Meet(meet) => Some(meet),
            CallKind::Direct => None,
        }
    }

    pub fn meet_mut(&mut self) -> Option<&mut Meet> {
        match &mut self.kind {
            CallKind::Meet(meet) => Some(meet),
            CallKind::Direct => None,
        }
    }

    /// Same account, bare peer and sid.
    pub fn matches(&self, account: &BareJid, peer: &Jid, sid: &str) -> bool {
        &self.account == account && self.peer.bare() == peer.bare() && self.sid == sid
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::New, CallTransition::Reported) => CallState::Ringing { since: Utc::now() },
            (CallState::Ringing { .. }, CallTransition::Answered)
                if self.direction == CallDirection::Incoming =>
            {
                CallState::Connecting {
                    accepted_at: Utc::now(),
                }
            }
            (CallState::Ringing { .. }, CallTransition::RemoteAccepted)
                if self.direction == CallDirection::Outgoing =>
            {
                CallState::Connecting {
                    accepted_at: Utc::now(),
                }
            }
            (CallState::Connecting { .. }, CallTransition::MediaConnected) => CallState::Connected {
                connected_at: Utc::now(),
                muted: false,
            },
            (CallState::Connected { connected_at, .. }, CallTransition::MuteChanged { muted }) => {
                CallState::Connected {
                    connected_at: *connected_at,
                    muted,
                }
            }
            (CallState::Connected { connected_at, .. }, CallTransition::Ended { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, CallTransition::Ended { reason }) if !current.is_ended() => {
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: None,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
