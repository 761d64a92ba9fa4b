//! Protocol actions exchanged with the messaging client.

use crate::calls::Publisher;
use crate::jid::{BareJid, Jid};
use crate::sdp::{Candidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Media kinds present in a description, in content order without repeats.
    pub fn from_description(description: &SessionDescription) -> Vec<Self> {
        let mut kinds = Vec::new();
        for media in description.media_kinds() {
            let kind = match media.as_str() {
                "audio" => Self::Audio,
                "video" => Self::Video,
                _ => continue,
            };
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    Success,
    Decline,
    Busy,
    Cancel,
    Timeout,
    Gone,
    ConnectivityError,
    FailedApplication,
    GeneralError,
    /// Lost a multi-resource race; never reported as a failure.
    Superseded,
    AnsweredElsewhere,
    DeclinedElsewhere,
}

impl TerminationReason {
    /// Reason element put on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Decline | Self::DeclinedElsewhere => "decline",
            Self::Busy => "busy",
            Self::Cancel | Self::Superseded | Self::AnsweredElsewhere => "cancel",
            Self::Timeout => "timeout",
            Self::Gone => "gone",
            Self::ConnectivityError => "connectivity-error",
            Self::FailedApplication => "failed-application",
            Self::GeneralError => "general-error",
        }
    }

    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "success" => Self::Success,
            "decline" => Self::Decline,
            "busy" => Self::Busy,
            "cancel" => Self::Cancel,
            "timeout" => Self::Timeout,
            "gone" => Self::Gone,
            "connectivity-error" => Self::ConnectivityError,
            "failed-application" => Self::FailedApplication,
            _ => Self::GeneralError,
        }
    }

    /// Whether the outcome should be surfaced as a failure.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ConnectivityError | Self::FailedApplication | Self::GeneralError
        )
    }
}

/// Lightweight pre-handshake payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageInitiationAction {
    Propose { media: Vec<MediaKind> },
    Retract,
    Accept,
    Reject,
    Proceed,
}

impl MessageInitiationAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Propose { .. } => "propose",
            Self::Retract => "retract",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Proceed => "proceed",
        }
    }
}

/// Action to deliver through the messaging client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    SessionInitiate {
        to: Jid,
        sid: String,
        description: SessionDescription,
    },
    SessionAccept {
        to: Jid,
        sid: String,
        description: SessionDescription,
    },
    TransportInfo {
        to: Jid,
        sid: String,
        content_name: String,
        candidates: Vec<Candidate>,
    },
    SessionTerminate {
        to: Jid,
        sid: String,
        reason: TerminationReason,
    },
    MessageInitiation {
        to: Jid,
        id: String,
        action: MessageInitiationAction,
    },
}

impl OutboundAction {
    pub fn to(&self) -> &Jid {
        match self {
            Self::SessionInitiate { to, .. }
            | Self::SessionAccept { to, .. }
            | Self::TransportInfo { to, .. }
            | Self::SessionTerminate { to, .. }
            | Self::MessageInitiation { to, .. } => to,
        }
    }

    pub fn sid(&self) -> &str {
        match self {
            Self::SessionInitiate { sid, .. }
            | Self::SessionAccept { sid, .. }
            | Self::TransportInfo { sid, .. }
            | Self::SessionTerminate { sid, .. } => sid,
            Self::MessageInitiation { id, .. } => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionInitiate { .. } => "session-initiate",
            Self::SessionAccept { .. } => "session-accept",
            Self::TransportInfo { .. } => "transport-info",
            Self::SessionTerminate { .. } => "session-terminate",
            Self::MessageInitiation { action, .. } => action.name(),
        }
    }
}

/// Event handed over by the messaging client.
///
/// `account` is the local account the event arrived on, `from` the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    SessionInitiate {
        account: BareJid,
        from: Jid,
        sid: String,
        description: SessionDescription,
    },
    SessionAccept {
        account: BareJid,
        from: Jid,
        sid: String,
        description: SessionDescription,
    },
    TransportInfo {
        account: BareJid,
        from: Jid,
        sid: String,
        content_name: String,
        candidates: Vec<Candidate>,
    },
    SessionTerminate {
        account: BareJid,
        from: Jid,
        sid: String,
        reason: TerminationReason,
    },
    MessageInitiation {
        account: BareJid,
        from: Jid,
        id: String,
        action: MessageInitiationAction,
    },
    ContactAvailabilityChanged {
        account: BareJid,
        peer: Jid,
        available: bool,
    },
    /// Publisher roster update from a multi-party media component.
    PublishersChanged {
        account: BareJid,
        room: Jid,
        sid: String,
        added: Vec<Publisher>,
        removed: Vec<Jid>,
    },
}

impl InboundEvent {
    pub fn account(&self) -> &BareJid {
        match self {
            Self::SessionInitiate { account, .. }
            | Self::SessionAccept { account, .. }
            | Self::TransportInfo { account, .. }
            | Self::SessionTerminate { account, .. }
            | Self::MessageInitiation { account, .. }
            | Self::ContactAvailabilityChanged { account, .. }
            | Self::PublishersChanged { account, .. } => account,
        }
    }
}

/// Outbound channel to the messaging client.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, account: &BareJid, action: OutboundAction) -> Result<(), anyhow::Error>;
}
