//! ICE candidate line parsing and formatting.
//!
//! Candidate lines follow RFC 8839:
//!
//! ```text
//! candidate:1 1 udp 2130706431 192.168.1.10 50000 typ host generation 0
//! candidate:2 1 udp 1694498815 203.0.113.7 61000 typ srflx raddr 192.168.1.10 rport 50000 generation 0
//! ```

use super::SdpError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Srflx => "srflx",
            Self::Prflx => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::Srflx),
            "prflx" => Ok(Self::Prflx),
            "relay" => Ok(Self::Relay),
            other => Err(SdpError::InvalidCandidate(format!(
                "unknown candidate type `{}`",
                other
            ))),
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured form of one ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub protocol: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub kind: CandidateType,
    pub rel_addr: Option<String>,
    pub rel_port: Option<u16>,
    pub generation: u8,
    pub tcptype: Option<String>,
}

impl Candidate {
    pub fn host(foundation: &str, priority: u32, ip: &str, port: u16) -> Self {
        Self {
            foundation: foundation.to_string(),
            component: 1,
            protocol: "udp".to_string(),
            priority,
            ip: ip.to_string(),
            port,
            kind: CandidateType::Host,
            rel_addr: None,
            rel_port: None,
            generation: 0,
            tcptype: None,
        }
    }

    /// The `a=candidate:...` attribute line.
    pub fn to_attribute(&self) -> String {
        format!("a={}", self)
    }
}

fn invalid(line: &str) -> SdpError {
    SdpError::InvalidCandidate(line.to_string())
}

impl FromStr for Candidate {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let body = line.strip_prefix("a=").unwrap_or(line);
        let body = body
            .strip_prefix("candidate:")
            .ok_or_else(|| invalid(line))?;

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 || fields[6] != "typ" {
            return Err(invalid(line));
        }

        let mut candidate = Candidate {
            foundation: fields[0].to_string(),
            component: fields[1].parse().map_err(|_| invalid(line))?,
            protocol: fields[2].to_ascii_lowercase(),
            priority: fields[3].parse().map_err(|_| invalid(line))?,
            ip: fields[4].to_string(),
            port: fields[5].parse().map_err(|_| invalid(line))?,
            kind: fields[7].parse()?,
            rel_addr: None,
            rel_port: None,
            generation: 0,
            tcptype: None,
        };

        // Trailing extension attributes come as name/value pairs; unknown
        // ones (network-id, ufrag, ...) are skipped.
        for pair in fields[8..].chunks(2) {
            let [name, value] = pair else {
                return Err(invalid(line));
            };
            match *name {
                "raddr" => candidate.rel_addr = Some(value.to_string()),
                "rport" => candidate.rel_port = Some(value.parse().map_err(|_| invalid(line))?),
                "generation" => candidate.generation = value.parse().map_err(|_| invalid(line))?,
                "tcptype" => candidate.tcptype = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(candidate)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.ip,
            self.port,
            self.kind
        )?;
        if let Some(addr) = &self.rel_addr {
            write!(f, " raddr {}", addr)?;
        }
        if let Some(port) = self.rel_port {
            write!(f, " rport {}", port)?;
        }
        if let Some(tcptype) = &self.tcptype {
            write!(f, " tcptype {}", tcptype)?;
        }
        write!(f, " generation {}", self.generation)
    }
}

/// A candidate as exchanged with the media engine.
///
/// The engine addresses candidates by m-line index and/or media id rather
/// than by protocol content name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: Candidate,
    /// SDP media stream identification (`a=mid`).
    pub sdp_mid: Option<String>,
    /// SDP media line index.
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: Candidate) -> Self {
        Self {
            candidate,
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}
