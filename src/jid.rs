// src/jid.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JidError {
    #[error("invalid JID format: {0}")]
    InvalidFormat(String),
}

/// Address of an account or contact without a resource (`user@domain`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BareJid {
    pub user: String,
    pub server: String,
}

/// Address that may carry a resource (`user@domain/resource`).
///
/// A peer advertising several resources can hold a separate negotiation on
/// each of them, so equality includes the resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub bare: BareJid,
    pub resource: Option<String>,
}

impl BareJid {
    pub fn new(user: &str, server: &str) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_ascii_lowercase(),
        }
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            bare: self.clone(),
            resource: Some(resource.to_string()),
        }
    }
}

impl Jid {
    pub fn new(bare: BareJid, resource: Option<&str>) -> Self {
        Self {
            bare,
            resource: resource.map(str::to_string),
        }
    }

    pub fn bare(&self) -> &BareJid {
        &self.bare
    }

    pub fn to_bare(&self) -> BareJid {
        self.bare.clone()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn has_resource(&self) -> bool {
        self.resource.is_some()
    }
}

impl From<BareJid> for Jid {
    fn from(bare: BareJid) -> Self {
        Self {
            bare,
            resource: None,
        }
    }
}

impl FromStr for BareJid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let jid = Jid::from_str(s)?;
        if jid.resource.is_some() {
            return Err(JidError::InvalidFormat(s.to_string()));
        }
        Ok(jid.bare)
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The resource may itself contain '@' or '/', so split it off first.
        let (address, resource) = match s.split_once('/') {
            Some((a, r)) => (a, Some(r)),
            None => (s, None),
        };

        let (user, server) = match address.split_once('@') {
            Some((u, srv)) => (u, srv),
            None => ("", address),
        };

        if server.is_empty() || resource.is_some_and(str::is_empty) {
            return Err(JidError::InvalidFormat(s.to_string()));
        }
        if address.contains('@') && user.is_empty() {
            return Err(JidError::InvalidFormat(s.to_string()));
        }

        Ok(Jid {
            bare: BareJid::new(user, server),
            resource: resource.map(str::to_string),
        })
    }
}

impl fmt::Display for BareJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{}/{}", self.bare, resource),
            None => write!(f, "{}", self.bare),
        }
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

impl From<BareJid> for String {
    fn from(jid: BareJid) -> Self {
        jid.to_string()
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::from_str(&value)
    }
}

impl TryFrom<String> for BareJid {
    type Error = JidError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        BareJid::from_str(&value)
    }
}
