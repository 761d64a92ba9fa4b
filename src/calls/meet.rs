//! Multi-party meet: a room component plus the remote publishers it relays.

use crate::jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};

/// A remote participant sending media into the meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    pub jid: Jid,
    /// Stream identifiers (media ids) the publisher sends.
    pub streams: Vec<String>,
}

impl Publisher {
    pub fn new(jid: Jid, streams: Vec<String>) -> Self {
        Self { jid, streams }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meet {
    pub account: BareJid,
    pub room: Jid,
    pub sid: String,
    active: bool,
    publishers: Vec<Publisher>,
}

impl Meet {
    pub fn new(account: BareJid, room: Jid, sid: impl Into<String>) -> Self {
        Self {
            account,
            room,
            sid: sid.into(),
            active: true,
            publishers: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current publishers; empty once the meet is over.
    pub fn publishers(&self) -> &[Publisher] {
        if self.active { &self.publishers } else { &[] }
    }

    /// Append publishers. A publisher already present is removed first and
    /// re-appended with its new streams.
    pub fn add_publishers(&mut self, added: impl IntoIterator<Item = Publisher>) {
        if !self.active {
            return;
        }
        for publisher in added {
            self.publishers.retain(|p| p.jid != publisher.jid);
            self.publishers.push(publisher);
        }
    }

    pub fn remove_publishers<'a>(&mut self, removed: impl IntoIterator<Item = &'a Jid>) {
        for jid in removed {
            self.publishers.retain(|p| &p.jid != jid);
        }
    }

    /// The meet ended; its publishers' streams are no longer valid.
    pub fn deactivate(&mut self) {
        self.active = false;
        self.publishers.clear();
    }
}
