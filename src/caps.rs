//! Capability discovery.
//!
//! Decides how an outgoing call reaches a peer: a single bare-addressed
//! propose when every capable resource understands the pre-handshake,
//! otherwise one full session per capable resource.

use crate::error::CallError;
use crate::jid::{BareJid, Jid};
use crate::jingle::MediaKind;
use dashmap::DashMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Audio,
    Video,
    FileTransfer,
    /// Propose/retract/accept/reject/proceed pre-handshake.
    MessageInitiation,
}

impl From<MediaKind> for Feature {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video => Self::Video,
        }
    }
}

/// Features advertised by one resource of a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCapabilities {
    pub resource: String,
    pub features: HashSet<Feature>,
}

impl ResourceCapabilities {
    pub fn new(resource: &str, features: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            resource: resource.to_string(),
            features: features.into_iter().collect(),
        }
    }

    pub fn supports_media(&self, media: &[MediaKind]) -> bool {
        media.iter().all(|kind| self.features.contains(&(*kind).into()))
    }

    pub fn supports_message_initiation(&self) -> bool {
        self.features.contains(&Feature::MessageInitiation)
    }
}

/// Source of cached feature advertisements.
pub trait CapabilityProvider: Send + Sync {
    /// Available resources of `peer` with their advertised features.
    fn resources(&self, peer: &BareJid) -> Vec<ResourceCapabilities>;

    /// Content types supported by `peer`: the given resource when the address
    /// is resource-specific, otherwise the union over all resources.
    fn content_types(&self, peer: &Jid) -> HashSet<Feature> {
        self.resources(peer.bare())
            .into_iter()
            .filter(|r| peer.resource().is_none_or(|res| res == r.resource))
            .flat_map(|r| r.features)
            .collect()
    }
}

/// How an outgoing call is put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingPlan {
    /// Ring all resources with one bare-addressed propose.
    Propose(BareJid),
    /// Open one full session per listed resource.
    Initiate(Vec<Jid>),
}

/// Choose between the pre-handshake and a per-resource fan-out.
///
/// Resource-specific addresses always get a full session.
pub fn plan_outgoing(
    peer: &Jid,
    resources: &[ResourceCapabilities],
    media: &[MediaKind],
    prefer_message_initiation: bool,
) -> Result<OutgoingPlan, CallError> {
    let capable: Vec<&ResourceCapabilities> = resources
        .iter()
        .filter(|r| r.supports_media(media))
        .filter(|r| peer.resource().is_none_or(|res| res == r.resource))
        .collect();

    if capable.is_empty() {
        return Err(CallError::PeerUnreachable(peer.to_string()));
    }

    if peer.has_resource() {
        return Ok(OutgoingPlan::Initiate(vec![peer.clone()]));
    }

    if prefer_message_initiation && capable.iter().all(|r| r.supports_message_initiation()) {
        return Ok(OutgoingPlan::Propose(peer.to_bare()));
    }

    Ok(OutgoingPlan::Initiate(
        capable
            .iter()
            .map(|r| peer.bare().with_resource(&r.resource))
            .collect(),
    ))
}

/// In-memory [`CapabilityProvider`] fed from presence and disco results.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    entries: DashMap<BareJid, Vec<ResourceCapabilities>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the features of an available resource, replacing older ones.
    pub fn update(&self, jid: &Jid, features: impl IntoIterator<Item = Feature>) {
        let Some(resource) = jid.resource() else {
            return;
        };
        let mut entry = self.entries.entry(jid.to_bare()).or_default();
        entry.retain(|r| r.resource != resource);
        entry.push(ResourceCapabilities::new(resource, features));
    }

    /// Forget a resource that went offline, or every resource for a bare address.
    pub fn remove(&self, jid: &Jid) {
        match jid.resource() {
            Some(resource) => {
                if let Some(mut entry) = self.entries.get_mut(jid.bare()) {
                    entry.retain(|r| r.resource != resource);
                }
                self.entries.remove_if(jid.bare(), |_, v| v.is_empty());
            }
            None => {
                self.entries.remove(jid.bare());
            }
        }
    }
}

impl CapabilityProvider for CapabilityCache {
    fn resources(&self, peer: &BareJid) -> Vec<ResourceCapabilities> {
        self.entries
            .get(peer)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}
