#![allow(dead_code)]

use async_trait::async_trait;
use jingle_rust::calls::{
    Call, CallEvent, CallHandle, CallManager, CallManagerHandle, EndedReason, MediaEngine,
    MediaEvent, MediaEventSink, PeerConnection, SdpType, TelephonyProvider,
    CallMetadata,
};
use jingle_rust::caps::{CapabilityCache, Feature};
use jingle_rust::config::{CallsConfig, IceServer};
use jingle_rust::jid::{BareJid, Jid};
use jingle_rust::jingle::{MediaKind, OutboundAction, SignalingTransport};
use jingle_rust::sdp::{Candidate, Content, Role, RtpDescription, Senders, SessionDescription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(2);

pub fn account() -> BareJid {
    "romeo@montague.lit".parse().unwrap()
}

pub fn juliet(resource: &str) -> Jid {
    format!("juliet@capulet.lit/{}", resource).parse().unwrap()
}

pub fn juliet_bare() -> Jid {
    "juliet@capulet.lit".parse().unwrap()
}

pub fn audio_description(id: &str) -> SessionDescription {
    SessionDescription::new(
        id,
        vec![Content {
            name: "audio".into(),
            creator: Role::Initiator,
            senders: Senders::Both,
            description: RtpDescription {
                media: "audio".into(),
                ..Default::default()
            },
            transport: None,
        }],
        None,
    )
}

pub fn candidate(foundation: &str, port: u16) -> Candidate {
    Candidate::host(foundation, 2_130_706_431, "192.0.2.1", port)
}

/// Poll `condition` until it holds or the wait expires.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next state change whose call satisfies `predicate`.
pub async fn wait_for_call(
    events: &mut broadcast::Receiver<CallEvent>,
    predicate: impl Fn(&Call) -> bool,
) -> Call {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged(call)) if predicate(&call) => return call,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("no matching call event")
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundAction>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<OutboundAction> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&OutboundAction) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|a| predicate(a)).count()
    }

    pub async fn wait_for(&self, predicate: impl Fn(&OutboundAction) -> bool) -> OutboundAction {
        let mut found = None;
        wait_until(|| {
            found = self.sent.lock().unwrap().iter().find(|a| predicate(a)).cloned();
            found.is_some()
        })
        .await;
        found.unwrap()
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    async fn send(&self, _: &BareJid, action: OutboundAction) -> Result<(), anyhow::Error> {
        self.sent.lock().unwrap().push(action);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTelephony {
    log: Mutex<Vec<String>>,
}

impl MockTelephony {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|l| l.starts_with(prefix)).count()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl TelephonyProvider for MockTelephony {
    async fn report_new_incoming_call(
        &self,
        handle: &CallHandle,
        _: CallMetadata,
    ) -> Result<(), anyhow::Error> {
        self.record(format!("incoming:{}", handle));
        Ok(())
    }

    async fn request_start_outgoing_call(
        &self,
        handle: &CallHandle,
        _: CallMetadata,
    ) -> Result<(), anyhow::Error> {
        self.record(format!("start:{}", handle));
        Ok(())
    }

    async fn request_end_call(&self, handle: &CallHandle) -> Result<(), anyhow::Error> {
        self.record(format!("end:{}", handle));
        Ok(())
    }

    async fn request_mute(&self, handle: &CallHandle, muted: bool) -> Result<(), anyhow::Error> {
        self.record(format!("mute:{}:{}", handle, muted));
        Ok(())
    }

    async fn report_call_ended(&self, handle: &CallHandle, reason: EndedReason) {
        self.record(format!("ended:{}:{:?}", handle, reason));
    }

    async fn report_outgoing_connected(&self, handle: &CallHandle) {
        self.record(format!("connected:{}", handle));
    }
}

/// Media engine whose peer connections log every call into one shared log.
pub struct MockMedia {
    permitted: AtomicBool,
    log: Arc<Mutex<Vec<String>>>,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl Default for MockMedia {
    fn default() -> Self {
        Self {
            permitted: AtomicBool::new(true),
            log: Arc::default(),
            connections: Mutex::default(),
        }
    }
}

impl MockMedia {
    pub fn deny_permission(&self) {
        self.permitted.store(false, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log().iter().position(|l| l == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log().iter().filter(|l| *l == entry).count()
    }

    pub fn connection(&self) -> Option<Arc<MockPeerConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }

    fn record(&self, entry: &str) {
        self.log.lock().unwrap().push(entry.to_string());
    }
}

#[async_trait]
impl MediaEngine for MockMedia {
    async fn has_media_permission(&self, _: &[MediaKind]) -> bool {
        self.permitted.load(Ordering::SeqCst)
    }

    async fn start_capture(&self, _: &[MediaKind]) -> Result<(), anyhow::Error> {
        self.record("capture");
        Ok(())
    }

    async fn stop_capture(&self) {
        self.record("stop_capture");
    }

    async fn create_peer_connection(
        &self,
        _: &[IceServer],
        events: MediaEventSink,
    ) -> Result<Arc<dyn PeerConnection>, anyhow::Error> {
        self.record("create_pc");
        let pc = Arc::new(MockPeerConnection {
            log: self.log.clone(),
            events,
        });
        self.connections.lock().unwrap().push(pc.clone());
        Ok(pc)
    }

    async fn switch_camera(&self) -> Result<(), anyhow::Error> {
        self.record("switch_camera");
        Ok(())
    }
}

pub struct MockPeerConnection {
    log: Arc<Mutex<Vec<String>>>,
    events: MediaEventSink,
}

impl MockPeerConnection {
    /// Play a media-engine callback.
    pub fn emit(&self, event: MediaEvent) {
        self.events.send(event).unwrap();
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_local_tracks(&self, _: &[MediaKind]) -> Result<(), anyhow::Error> {
        self.record("add_tracks".into());
        Ok(())
    }

    async fn remove_local_tracks(&self) -> Result<(), anyhow::Error> {
        self.record("remove_tracks".into());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, anyhow::Error> {
        self.record("create_offer".into());
        Ok(audio_description("101").to_sdp(Role::Initiator))
    }

    async fn create_answer(&self) -> Result<String, anyhow::Error> {
        self.record("create_answer".into());
        Ok(audio_description("202").to_sdp(Role::Responder))
    }

    async fn set_local_description(&self, kind: SdpType, _: &str) -> Result<(), anyhow::Error> {
        self.record(format!("set_local:{:?}", kind));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpType, _: &str) -> Result<(), anyhow::Error> {
        self.record(format!("set_remote:{:?}", kind));
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: jingle_rust::sdp::IceCandidate,
    ) -> Result<(), anyhow::Error> {
        self.record(format!("candidate:{}", candidate.candidate.foundation));
        Ok(())
    }

    async fn set_audio_enabled(&self, enabled: bool) {
        self.record(format!("audio:{}", enabled));
    }

    async fn close(&self) {
        self.record("close".into());
    }
}

pub struct Harness {
    pub handle: CallManagerHandle,
    pub transport: Arc<RecordingTransport>,
    pub telephony: Arc<MockTelephony>,
    pub media: Arc<MockMedia>,
    pub caps: Arc<CapabilityCache>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CallsConfig::default())
    }

    pub fn with_config(config: CallsConfig) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let telephony = Arc::new(MockTelephony::default());
        let media = Arc::new(MockMedia::default());
        let caps = Arc::new(CapabilityCache::new());
        let handle = CallManager::spawn(
            config,
            transport.clone(),
            telephony.clone(),
            media.clone(),
            caps.clone(),
        );
        let events = handle.subscribe();
        Self {
            handle,
            transport,
            telephony,
            media,
            caps,
            events,
        }
    }

    pub fn advertise(&self, jid: &Jid, features: &[Feature]) {
        self.caps.update(jid, features.iter().copied());
    }

    pub async fn current(&self) -> Option<Call> {
        self.handle.current_call().await.unwrap()
    }

    pub async fn peer_connection(&self) -> Arc<MockPeerConnection> {
        wait_until(|| self.media.connection().is_some()).await;
        self.media.connection().unwrap()
    }
}
