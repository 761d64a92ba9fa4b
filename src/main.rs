use async_trait::async_trait;
use jingle_rust::calls::{
    CallEvent, CallHandle, CallManager, CallMetadata, ConnectionState, EndedReason, MediaEngine,
    MediaEvent, MediaEventSink, PeerConnection, SdpType, TelephonyProvider,
};
use jingle_rust::caps::CapabilityCache;
use jingle_rust::config::{CallsConfig, IceServer};
use jingle_rust::jid::{BareJid, Jid};
use jingle_rust::jingle::{InboundEvent, MediaKind, OutboundAction, SignalingTransport};
use jingle_rust::sdp::{Content, IceCandidate, Role, RtpDescription, Senders, SessionDescription};
use jingle_rust::sdp::{Candidate, Payload};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

// Plays one incoming call against logging stand-ins for the messaging
// client, the platform call UI and the media engine.
//
// Usage:
//   cargo run                                  # defaults
//   cargo run -- --config calls.json           # CallsConfig as JSON
//   cargo run -- -c calls.json --peer juliet@capulet.lit/balcony

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_arg(&args, "--config", "-c");
    let peer = parse_arg(&args, "--peer", "-p")
        .unwrap_or_else(|| "juliet@capulet.lit/balcony".to_string());

    if let Err(e) = jingle_rust::logging::init("info") {
        eprintln!("Logger already installed: {}", e);
    }

    let config = match config_path {
        Some(path) => match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| CallsConfig::from_json(&text).map_err(anyhow::Error::from))
        {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config from {}: {}", path, e);
                return;
            }
        },
        None => CallsConfig::default(),
    };

    let peer: Jid = match peer.parse() {
        Ok(peer) => peer,
        Err(e) => {
            error!("Invalid peer address: {}", e);
            return;
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async move {
        if let Err(e) = play_incoming_call(config, peer).await {
            error!("Demo call failed: {}", e);
        }
    });
}

async fn play_incoming_call(config: CallsConfig, peer: Jid) -> Result<(), anyhow::Error> {
    let account: BareJid = "romeo@montague.lit".parse()?;
    let calls = CallManager::spawn(
        config,
        Arc::new(LoggingTransport),
        Arc::new(LoggingTelephony),
        Arc::new(LoopbackMedia),
        Arc::new(CapabilityCache::new()),
    );
    let mut events = calls.subscribe();

    calls
        .registry()
        .inbound(InboundEvent::SessionInitiate {
            account,
            from: peer,
            sid: "demo-1".to_string(),
            description: audio_description("7"),
        })
        .await?;

    loop {
        match events.recv().await? {
            CallEvent::StateChanged(call) => {
                info!("Call {} is now {:?}", call.handle, call.state);
                if call.state.is_ringing() {
                    calls.answer(&call.handle).await?;
                } else if call.state.is_connected() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    calls.end(&call.handle).await?;
                } else if call.state.is_ended() {
                    break;
                }
            }
            CallEvent::Failed { handle, error } => {
                error!("Call {} failed: {}", handle, error);
                break;
            }
            other => info!("{:?}", other),
        }
    }

    calls.shutdown().await?;
    Ok(())
}

fn audio_description(id: &str) -> SessionDescription {
    SessionDescription::new(
        id,
        vec![Content {
            name: "0".into(),
            creator: Role::Initiator,
            senders: Senders::Both,
            description: RtpDescription {
                media: "audio".into(),
                payloads: vec![Payload::new(111).with_codec("opus", 48_000, 2)],
                rtcp_mux: true,
                ..Default::default()
            },
            transport: None,
        }],
        Some(vec!["0".into()]),
    )
}

struct LoggingTransport;

#[async_trait]
impl SignalingTransport for LoggingTransport {
    async fn send(&self, account: &BareJid, action: OutboundAction) -> Result<(), anyhow::Error> {
        info!("{} -> {}: {} ({})", account, action.to(), action.name(), action.sid());
        Ok(())
    }
}

struct LoggingTelephony;

#[async_trait]
impl TelephonyProvider for LoggingTelephony {
    async fn report_new_incoming_call(
        &self,
        handle: &CallHandle,
        metadata: CallMetadata,
    ) -> Result<(), anyhow::Error> {
        info!("Ringing {} from {}", handle, metadata.peer);
        Ok(())
    }

    async fn request_start_outgoing_call(
        &self,
        handle: &CallHandle,
        metadata: CallMetadata,
    ) -> Result<(), anyhow::Error> {
        info!("Calling {} as {}", metadata.peer, handle);
        Ok(())
    }

    async fn request_end_call(&self, handle: &CallHandle) -> Result<(), anyhow::Error> {
        info!("Hanging up {}", handle);
        Ok(())
    }

    async fn request_mute(&self, handle: &CallHandle, muted: bool) -> Result<(), anyhow::Error> {
        info!("Mute {}: {}", handle, muted);
        Ok(())
    }

    async fn report_call_ended(&self, handle: &CallHandle, reason: EndedReason) {
        info!("Call {} ended: {:?}", handle, reason);
    }

    async fn report_outgoing_connected(&self, handle: &CallHandle) {
        info!("Call {} connected", handle);
    }
}

/// Media engine that connects as soon as the local answer is set.
struct LoopbackMedia;

#[async_trait]
impl MediaEngine for LoopbackMedia {
    async fn has_media_permission(&self, _: &[MediaKind]) -> bool {
        true
    }

    async fn start_capture(&self, media: &[MediaKind]) -> Result<(), anyhow::Error> {
        info!("Capturing {:?}", media);
        Ok(())
    }

    async fn stop_capture(&self) {
        info!("Capture stopped");
    }

    async fn create_peer_connection(
        &self,
        _: &[IceServer],
        events: MediaEventSink,
    ) -> Result<Arc<dyn PeerConnection>, anyhow::Error> {
        Ok(Arc::new(LoopbackConnection { events }))
    }

    async fn switch_camera(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

struct LoopbackConnection {
    events: MediaEventSink,
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn add_local_tracks(&self, _: &[MediaKind]) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn remove_local_tracks(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, anyhow::Error> {
        Ok(audio_description("8").to_sdp(Role::Initiator))
    }

    async fn create_answer(&self) -> Result<String, anyhow::Error> {
        Ok(audio_description("9").to_sdp(Role::Responder))
    }

    async fn set_local_description(&self, kind: SdpType, _: &str) -> Result<(), anyhow::Error> {
        if kind == SdpType::Answer {
            let candidate = Candidate::host("1", 2_130_706_431, "127.0.0.1", 40_000);
            self.events.send(MediaEvent::LocalCandidate(
                IceCandidate::new(candidate).with_sdp_m_line_index(0),
            ))?;
            self.events
                .send(MediaEvent::ConnectionStateChanged(ConnectionState::Connected))?;
        }
        Ok(())
    }

    async fn set_remote_description(&self, _: SdpType, _: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        info!("Remote candidate {}", candidate.candidate);
        Ok(())
    }

    async fn set_audio_enabled(&self, _: bool) {}

    async fn close(&self) {
        info!("Peer connection closed");
    }
}

fn parse_arg(args: &[String], long: &str, short: &str) -> Option<String> {
    let long_prefix = format!("{}=", long);
    let mut iter = args.iter().skip(1); // Skip program name
    while let Some(arg) = iter.next() {
        if arg == long || arg == short {
            return iter.next().cloned();
        }
        if let Some(value) = arg.strip_prefix(&long_prefix) {
            return Some(value.to_string());
        }
    }
    None
}
