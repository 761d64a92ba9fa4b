//! Call lifecycle on top of the signaling layer.
//!
//! # Architecture
//!
//! - [`Call`] & [`CallState`]: call value object and its state machine
//! - [`Meet`]: multi-party room roster carried by meet calls
//! - [`TelephonyProvider`]: platform call UI and audio session
//! - [`MediaEngine`] & [`PeerConnection`]: capture and media transport
//! - [`CallManager`]: actor owning the single current call
//!
//! Protocol sessions live in [`crate::jingle`]; the manager only ever talks
//! to them through a [`crate::jingle::RegistryHandle`].

mod manager;
mod media;
mod meet;
mod state;
mod telephony;

pub use manager::{CallEvent, CallManager, CallManagerHandle};
pub use media::{
    ConnectionState, MediaEngine, MediaEvent, MediaEventSink, PeerConnection, SdpType,
};
pub use meet::{Meet, Publisher};
pub use state::{
    Call, CallDirection, CallHandle, CallKind, CallState, CallTransition, InvalidTransition,
    generate_sid,
};
pub use telephony::{CallMetadata, EndedReason, TelephonyAction, TelephonyProvider};
