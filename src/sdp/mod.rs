//! Session description codec.
//!
//! Translates between the structured content model carried by session
//! actions (contents, payloads, transports, candidates) and the SDP text the
//! media engine consumes.
//!
//! # Layout
//!
//! - [`SessionDescription`]: ordered contents plus the optional BUNDLE group
//! - [`Content`]: one named stream with its RTP description and ICE transport
//! - [`Candidate`]: one ICE candidate, convertible to and from its line form
//!
//! Content order is significant: m-line indexes used for candidate
//! addressing are positions in [`SessionDescription::contents`].

mod candidate;
mod parser;
mod writer;

pub use candidate::{Candidate, CandidateType, IceCandidate};
pub use parser::parse;
pub use writer::serialize;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("empty session description")]
    Empty,

    #[error("missing session id (o= line)")]
    MissingSessionId,

    #[error("line {line}: malformed `{text}`")]
    MalformedLine { line: usize, text: String },

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

/// Negotiation role of a party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn other(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Which parties send media on a content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Senders {
    None,
    Initiator,
    Responder,
    #[default]
    Both,
}

impl Senders {
    fn from_role(role: Role) -> Self {
        match role {
            Role::Initiator => Self::Initiator,
            Role::Responder => Self::Responder,
        }
    }

    /// Map an SDP direction attribute to senders. Directions are written from
    /// the point of view of `author`, the party that produced the SDP.
    pub fn from_direction(direction: &str, author: Role) -> Option<Self> {
        match direction {
            "sendrecv" => Some(Self::Both),
            "inactive" => Some(Self::None),
            "sendonly" => Some(Self::from_role(author)),
            "recvonly" => Some(Self::from_role(author.other())),
            _ => None,
        }
    }

    /// SDP direction attribute for these senders as written by `author`.
    pub fn to_direction(self, author: Role) -> &'static str {
        match self {
            Self::Both => "sendrecv",
            Self::None => "inactive",
            s if s == Self::from_role(author) => "sendonly",
            _ => "recvonly",
        }
    }
}

/// A structured session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session id carried in the `o=` line.
    pub id: String,
    pub contents: Vec<Content>,
    /// Content names multiplexed over one transport (`a=group:BUNDLE`).
    pub bundle: Option<Vec<String>>,
}

impl SessionDescription {
    pub fn new(id: impl Into<String>, contents: Vec<Content>, bundle: Option<Vec<String>>) -> Self {
        Self {
            id: id.into(),
            contents,
            bundle,
        }
    }

    /// Parse SDP produced by `author`; every content gets `creator` as its creator.
    pub fn parse(text: &str, creator: Role, author: Role) -> Result<Self, SdpError> {
        parse(text, creator, author).map(|(description, _)| description)
    }

    /// Render as SDP written by `author` (the offerer is the initiator).
    pub fn to_sdp(&self, author: Role) -> String {
        serialize(self, &self.id, author)
    }

    /// Position of the content named `name`.
    pub fn content_index(&self, name: &str) -> Option<usize> {
        self.contents.iter().position(|c| c.name == name)
    }

    /// Resolve a content reference to an m-line index.
    ///
    /// Exact name match wins; otherwise a numeric reference is taken as a
    /// position, and a single-content description accepts any reference.
    pub fn resolve_content(&self, name: &str) -> Option<usize> {
        if let Some(index) = self.content_index(name) {
            return Some(index);
        }
        if let Ok(index) = name.parse::<usize>()
            && index < self.contents.len()
        {
            return Some(index);
        }
        (self.contents.len() == 1).then_some(0)
    }

    pub fn media_kinds(&self) -> Vec<String> {
        self.contents
            .iter()
            .map(|c| c.description.media.clone())
            .collect()
    }
}

/// One named media stream within a negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub name: String,
    pub creator: Role,
    pub senders: Senders,
    pub description: RtpDescription,
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RtpDescription {
    /// `audio` or `video`.
    pub media: String,
    pub payloads: Vec<Payload>,
    pub rtcp_mux: bool,
    pub header_extensions: Vec<HeaderExtension>,
    pub sources: Vec<Source>,
    pub source_groups: Vec<SourceGroup>,
    /// m-line protocol of a non-RTP section such as an SCTP data channel.
    /// Such a section has no payloads; its format tokens go in `formats`.
    pub protocol: Option<String>,
    pub formats: Vec<String>,
}

impl RtpDescription {
    pub fn is_rtp(&self) -> bool {
        self.protocol.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub id: u8,
    pub name: Option<String>,
    pub clockrate: Option<u32>,
    pub channels: u8,
    pub parameters: Vec<Parameter>,
    pub feedback: Vec<RtcpFeedback>,
}

impl Payload {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            name: None,
            clockrate: None,
            channels: 1,
            parameters: Vec::new(),
            feedback: Vec::new(),
        }
    }

    pub fn with_codec(mut self, name: &str, clockrate: u32, channels: u8) -> Self {
        self.name = Some(name.to_string());
        self.clockrate = Some(clockrate);
        self.channels = channels;
        self
    }
}

/// A `name=value` pair. Unnamed fmtp values (e.g. `0-16`) keep an empty name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    pub kind: String,
    pub subtype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderExtension {
    pub id: u16,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub ssrc: u32,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
    pub semantics: String,
    pub sources: Vec<u32>,
}

/// ICE-UDP transport of one content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transport {
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    /// DTLS role (`a=setup`), independent of whether a fingerprint is present.
    pub setup: Option<String>,
    pub candidates: Vec<Candidate>,
}

impl Transport {
    fn is_empty(&self) -> bool {
        self.ufrag.is_none()
            && self.pwd.is_none()
            && self.fingerprint.is_none()
            && self.setup.is_none()
            && self.candidates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub value: String,
}
