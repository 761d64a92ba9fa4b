// Signaling and session layer
pub mod jid;
pub mod jingle;
pub mod sdp;

// Call orchestration
pub mod calls;
pub mod caps;

pub mod config;
pub mod error;
pub mod logging;

pub use calls::{Call, CallEvent, CallHandle, CallManager, CallManagerHandle, CallState};
pub use config::CallsConfig;
pub use error::CallError;
pub use jid::{BareJid, Jid};
