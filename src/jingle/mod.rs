//! Call signaling: protocol actions, per-peer sessions and the registry
//! that owns them.

pub mod action;
pub mod outbox;
pub mod registry;
pub mod session;

pub use action::{
    InboundEvent, MediaKind, MessageInitiationAction, OutboundAction, SignalingTransport,
    TerminationReason,
};
pub use outbox::Delivery;
pub use registry::{RegistryActor, RegistryHandle, SessionInfo, SessionRegistry, SignalingEvent};
pub use session::{RemoteCandidate, Session, SessionKey, SessionState, Style};
