//! Boundary to the media transport engine.

use crate::config::IceServer;
use crate::jingle::MediaKind;
use crate::sdp::IceCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    RemoteTrackStarted { track_id: String, kind: MediaKind },
    RemoteTrackStopped { track_id: String },
}

/// Where a peer connection posts its [`MediaEvent`]s.
pub type MediaEventSink = mpsc::UnboundedSender<MediaEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Local media and peer connection factory.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Whether microphone (and camera for video) access was granted.
    async fn has_media_permission(&self, media: &[MediaKind]) -> bool;

    async fn start_capture(&self, media: &[MediaKind]) -> Result<(), anyhow::Error>;

    async fn stop_capture(&self);

    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
        events: MediaEventSink,
    ) -> Result<Arc<dyn PeerConnection>, anyhow::Error>;

    async fn switch_camera(&self) -> Result<(), anyhow::Error>;
}

/// One negotiated media connection. Offer/answer and description calls
/// complete once; callers never overlap them on the same connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_tracks(&self, media: &[MediaKind]) -> Result<(), anyhow::Error>;

    async fn remove_local_tracks(&self) -> Result<(), anyhow::Error>;

    /// SDP text of a fresh offer.
    async fn create_offer(&self) -> Result<String, anyhow::Error>;

    /// SDP text of an answer to the applied remote offer.
    async fn create_answer(&self) -> Result<String, anyhow::Error>;

    async fn set_local_description(&self, kind: SdpType, sdp: &str) -> Result<(), anyhow::Error>;

    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), anyhow::Error>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error>;

    async fn set_audio_enabled(&self, enabled: bool);

    async fn close(&self);
}
