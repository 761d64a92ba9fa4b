//! Runtime configuration for the signaling services.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// STUN/TURN server handed to the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Configuration shared by the session registry and the call manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    /// Capacity of each actor's command channel.
    pub command_channel_capacity: usize,
    /// Ring timeout in seconds before a ringing call is ended as unanswered.
    pub ring_timeout_secs: u64,
    /// How long a local candidate may wait for the local description.
    pub local_candidate_grace_ms: u64,
    /// Lifetime of a session opened only by early transport-info.
    pub orphan_session_timeout_secs: u64,
    /// Use the propose/proceed pre-handshake when every resource supports it.
    pub prefer_message_initiation: bool,
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            command_channel_capacity: 256,
            ring_timeout_secs: 45,
            local_candidate_grace_ms: 2_000,
            orphan_session_timeout_secs: 30,
            prefer_message_initiation: true,
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl CallsConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn local_candidate_grace(&self) -> Duration {
        Duration::from_millis(self.local_candidate_grace_ms)
    }

    pub fn orphan_session_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_session_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CallsConfig::from_json(r#"{"ring_timeout_secs": 20}"#).unwrap();
        assert_eq!(config.ring_timeout(), Duration::from_secs(20));
        assert_eq!(config.command_channel_capacity, 256);
        assert!(config.prefer_message_initiation);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_ice_servers_from_json() {
        let config = CallsConfig::from_json(
            r#"{"ice_servers": [{"urls": ["turn:turn.example.com"], "username": "u", "credential": "c"}]}"#,
        )
        .unwrap();
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(config.local_candidate_grace(), Duration::from_millis(2_000));
    }

    #[test]
    fn test_rejects_wrong_types() {
        assert!(CallsConfig::from_json(r#"{"ring_timeout_secs": "soon"}"#).is_err());
    }
}
