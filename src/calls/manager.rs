//! Call manager for orchestrating call lifecycle.
//!
//! The [`CallManager`] actor owns the single current call. It reconciles
//! signaling events from the session registry with the telephony service and
//! drives the media engine. Offer/answer work runs in spawned tasks whose
//! completions come back as commands tagged with the call handle; a
//! completion for a call that is no longer current is dropped.

use super::media::{ConnectionState, MediaEngine, MediaEvent, PeerConnection, SdpType};
use super::meet::{Meet, Publisher};
use super::state::{Call, CallDirection, CallHandle, CallTransition, generate_sid};
use super::telephony::{CallMetadata, EndedReason, TelephonyAction, TelephonyProvider};
use crate::caps::{CapabilityProvider, OutgoingPlan, plan_outgoing};
use crate::config::CallsConfig;
use crate::error::CallError;
use crate::jid::{BareJid, Jid};
use crate::jingle::{
    Delivery, MediaKind, RegistryActor, RegistryHandle, RemoteCandidate, SessionKey,
    SignalingEvent, SignalingTransport, Style, TerminationReason,
};
use crate::sdp::{IceCandidate, Role, SessionDescription};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notification for UI consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(Call),
    RemoteTrackStarted {
        handle: CallHandle,
        track_id: String,
        kind: MediaKind,
    },
    RemoteTrackStopped {
        handle: CallHandle,
        track_id: String,
    },
    PublishersChanged {
        handle: CallHandle,
        publishers: Vec<Publisher>,
    },
    Failed {
        handle: CallHandle,
        error: CallError,
    },
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    ReportIncoming {
        call: Call,
        reply: Reply<CallHandle>,
    },
    ReportOutgoing {
        call: Call,
        reply: Reply<CallHandle>,
    },
    StartCall {
        account: BareJid,
        peer: Jid,
        media: Vec<MediaKind>,
        reply: Reply<CallHandle>,
    },
    StartMeet {
        account: BareJid,
        room: Jid,
        media: Vec<MediaKind>,
        reply: Reply<CallHandle>,
    },
    Answer {
        handle: CallHandle,
        reply: Reply<()>,
    },
    AcceptOutgoing {
        handle: CallHandle,
        peer: Jid,
        reply: Reply<()>,
    },
    End {
        handle: CallHandle,
        reply: Reply<()>,
    },
    Mute {
        handle: CallHandle,
        muted: bool,
        reply: Reply<()>,
    },
    SwitchCamera {
        handle: CallHandle,
        reply: Reply<()>,
    },
    CurrentCall {
        reply: oneshot::Sender<Option<Call>>,
    },
    Telephony(TelephonyAction),
    Media {
        handle: CallHandle,
        event: MediaEvent,
    },
    OfferReady {
        handle: CallHandle,
        result: Result<SessionDescription, CallError>,
    },
    AnswerReady {
        handle: CallHandle,
        result: Result<SessionDescription, CallError>,
    },
    RemoteApplied {
        handle: CallHandle,
        result: Result<(), CallError>,
    },
    DeliveryFailed {
        handle: CallHandle,
        key: SessionKey,
        error: CallError,
    },
    RingTimeout {
        handle: CallHandle,
    },
    Shutdown,
}

/// Next negotiation step for the current call.
enum Step {
    Idle,
    CreateOffer(Arc<dyn PeerConnection>),
    CreateAnswer(Arc<dyn PeerConnection>, String),
    ApplyAnswer(Arc<dyn PeerConnection>, String),
    Initiate(SessionDescription, Vec<SessionKey>),
}

/// Orchestrator-side state of the current call.
struct ActiveCall {
    call: Call,
    style: Style,
    /// Session the call is settled on: the incoming one or the race winner.
    session: Option<SessionKey>,
    /// Resources still waiting for our offer.
    targets: Vec<SessionKey>,
    /// Sessions receiving local candidates, with how many were sent to each.
    bound: Vec<(SessionKey, usize)>,
    pc: Option<Arc<dyn PeerConnection>>,
    capturing: bool,
    /// An offer/answer or description call is in flight.
    negotiating: bool,
    offer: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_applied: bool,
    local_candidates: Vec<IceCandidate>,
    remote_candidates: Vec<RemoteCandidate>,
    proceeded: bool,
    muted: bool,
}

impl ActiveCall {
    fn new(call: Call) -> Self {
        Self {
            call,
            style: Style::Jingle,
            session: None,
            targets: Vec::new(),
            bound: Vec::new(),
            pc: None,
            capturing: false,
            negotiating: false,
            offer: None,
            remote_description: None,
            remote_applied: false,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            proceeded: false,
            muted: false,
        }
    }

    fn key_for(&self, peer: Jid) -> SessionKey {
        SessionKey::new(self.call.account.clone(), peer, self.call.sid.clone())
    }

    fn bind(&mut self, key: SessionKey) {
        if !self.bound.iter().any(|(bound, _)| bound == &key) {
            self.bound.push((key, 0));
        }
    }

    fn next_step(&mut self) -> Step {
        if self.negotiating {
            return Step::Idle;
        }
        let Some(pc) = self.pc.clone() else {
            return Step::Idle;
        };
        match self.call.direction {
            CallDirection::Incoming => {
                if !self.call.state.is_established() || self.remote_applied {
                    return Step::Idle;
                }
                match &self.remote_description {
                    Some(description) => {
                        self.negotiating = true;
                        Step::CreateAnswer(pc, description.to_sdp(Role::Initiator))
                    }
                    None => Step::Idle,
                }
            }
            CallDirection::Outgoing => {
                if !self.targets.is_empty() {
                    return match &self.offer {
                        None => {
                            self.negotiating = true;
                            Step::CreateOffer(pc)
                        }
                        Some(offer) => {
                            Step::Initiate(offer.clone(), std::mem::take(&mut self.targets))
                        }
                    };
                }
                if !self.remote_applied
                    && let Some(description) = &self.remote_description
                {
                    self.negotiating = true;
                    return Step::ApplyAnswer(pc, description.to_sdp(Role::Responder));
                }
                Step::Idle
            }
        }
    }
}

/// Reason sent to the peer when the call is ended locally.
fn local_end_reason(call: &Call) -> TerminationReason {
    if call.state.is_established() {
        TerminationReason::Success
    } else if call.direction == CallDirection::Incoming {
        TerminationReason::Decline
    } else {
        TerminationReason::Cancel
    }
}

fn termination_for(error: &CallError) -> TerminationReason {
    match error {
        CallError::NegotiationFailed(_) | CallError::Sdp(_) => TerminationReason::FailedApplication,
        CallError::ProtocolDeliveryFailed(_) => TerminationReason::ConnectivityError,
        CallError::Timeout => TerminationReason::Timeout,
        _ => TerminationReason::GeneralError,
    }
}

fn negotiation_failed(error: anyhow::Error) -> CallError {
    CallError::NegotiationFailed(error.to_string())
}

/// Generate a local offer or answer, commit it and return it parsed.
///
/// Contents belong to the initiator; directions in the SDP are read from the
/// point of view of whoever wrote it.
async fn create_local(
    pc: &dyn PeerConnection,
    kind: SdpType,
) -> Result<SessionDescription, CallError> {
    let (sdp, author) = match kind {
        SdpType::Offer => (pc.create_offer().await, Role::Initiator),
        SdpType::Answer => (pc.create_answer().await, Role::Responder),
    };
    let sdp = sdp.map_err(negotiation_failed)?;
    let description = SessionDescription::parse(&sdp, Role::Initiator, author)?;
    pc.set_local_description(kind, &sdp)
        .await
        .map_err(negotiation_failed)?;
    Ok(description)
}

/// Tag media-engine callbacks with the call they belong to.
fn forward_media_events(
    handle: CallHandle,
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
    tx: mpsc::WeakSender<Command>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(tx) = tx.upgrade() else {
                break;
            };
            let command = Command::Media {
                handle: handle.clone(),
                event,
            };
            if tx.send(command).await.is_err() {
                break;
            }
        }
    });
}

fn log_delivery(delivery: Delivery, what: &'static str, sid: String) {
    if delivery.is_empty() {
        return;
    }
    tokio::spawn(async move {
        if let Err(e) = delivery.wait().await {
            warn!("Failed to deliver {} for {}: {}", what, sid, e);
        }
    });
}

pub struct CallManager {
    config: CallsConfig,
    registry: RegistryHandle,
    telephony: Arc<dyn TelephonyProvider>,
    media: Arc<dyn MediaEngine>,
    caps: Arc<dyn CapabilityProvider>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::WeakSender<Command>,
    signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    events: broadcast::Sender<CallEvent>,
    current: Option<ActiveCall>,
}

impl CallManager {
    /// Start the session registry and the call manager.
    ///
    /// Feed inbound protocol events to [`CallManagerHandle::registry`].
    pub fn spawn(
        config: CallsConfig,
        transport: Arc<dyn SignalingTransport>,
        telephony: Arc<dyn TelephonyProvider>,
        media: Arc<dyn MediaEngine>,
        caps: Arc<dyn CapabilityProvider>,
    ) -> CallManagerHandle {
        let (registry, signaling_rx) = RegistryActor::spawn(config.clone(), transport);
        let (tx, command_rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            config,
            registry: registry.clone(),
            telephony,
            media,
            caps,
            command_rx,
            command_tx: tx.downgrade(),
            signaling_rx,
            events: events.clone(),
            current: None,
        };
        tokio::spawn(manager.run());
        CallManagerHandle {
            tx,
            registry,
            events,
        }
    }

    async fn run(mut self) {
        info!("Call manager started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.signaling_rx.recv() => self.handle_signaling(event).await,
            }
        }
        if let Some(active) = &self.current {
            let reason = local_end_reason(&active.call);
            self.reset(reason).await;
        }
        let _ = self.registry.shutdown().await;
        info!("Call manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ReportIncoming { call, reply } => {
                let _ = reply.send(self.report_incoming(call).await);
            }
            Command::ReportOutgoing { call, reply } => {
                let _ = reply.send(self.report_outgoing(call).await);
            }
            Command::StartCall {
                account,
                peer,
                media,
                reply,
            } => {
                let _ = reply.send(self.start_call(account, peer, media).await);
            }
            Command::StartMeet {
                account,
                room,
                media,
                reply,
            } => {
                let _ = reply.send(self.start_meet(account, room, media).await);
            }
            Command::Answer { handle, reply } => {
                let _ = reply.send(self.answer(&handle).await);
            }
            Command::AcceptOutgoing {
                handle,
                peer,
                reply,
            } => {
                let _ = reply.send(self.accept_outgoing(&handle, peer).await);
            }
            Command::End { handle, reply } => {
                let _ = reply.send(self.end(&handle).await);
            }
            Command::Mute {
                handle,
                muted,
                reply,
            } => {
                let _ = reply.send(self.mute(&handle, muted).await);
            }
            Command::SwitchCamera { handle, reply } => {
                let _ = reply.send(self.switch_camera(&handle).await);
            }
            Command::CurrentCall { reply } => {
                let _ = reply.send(self.current.as_ref().map(|a| a.call.clone()));
            }
            Command::Telephony(action) => self.on_telephony(action).await,
            Command::Media { handle, event } => self.on_media(&handle, event).await,
            Command::OfferReady { handle, result } => self.on_offer_ready(&handle, result).await,
            Command::AnswerReady { handle, result } => self.on_answer_ready(&handle, result).await,
            Command::RemoteApplied { handle, result } => {
                self.on_remote_applied(&handle, result).await
            }
            Command::DeliveryFailed { handle, key, error } => {
                self.on_delivery_failed(&handle, key, error).await
            }
            Command::RingTimeout { handle } => self.on_ring_timeout(&handle).await,
            Command::Shutdown => {}
        }
    }

    fn publish(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn is_current(&self, handle: &CallHandle) -> bool {
        self.current
            .as_ref()
            .is_some_and(|active| &active.call.handle == handle)
    }

    fn current_mut(&mut self, handle: &CallHandle) -> Result<&mut ActiveCall, CallError> {
        self.current
            .as_mut()
            .filter(|active| &active.call.handle == handle)
            .ok_or_else(|| CallError::NotFound(handle.to_string()))
    }

    fn active_for(&mut self, key: &SessionKey) -> Option<&mut ActiveCall> {
        self.current
            .as_mut()
            .filter(|active| active.call.matches(&key.account, &key.peer, &key.sid))
    }

    fn spawn_completion(&self, task: impl Future<Output = Command> + Send + 'static) {
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            let command = task.await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(command).await;
            }
        });
    }

    /// Fail the call if `delivery` for `key` does not go through.
    fn watch(&self, handle: &CallHandle, key: SessionKey, delivery: Delivery) {
        if delivery.is_empty() {
            return;
        }
        let handle = handle.clone();
        self.spawn_completion_if_failed(async move {
            delivery
                .wait()
                .await
                .err()
                .map(|error| Command::DeliveryFailed { handle, key, error })
        });
    }

    fn spawn_completion_if_failed(
        &self,
        task: impl Future<Output = Option<Command>> + Send + 'static,
    ) {
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            if let Some(command) = task.await
                && let Some(tx) = tx.upgrade()
            {
                let _ = tx.send(command).await;
            }
        });
    }

    fn schedule_ring_timeout(&self, handle: CallHandle) {
        let timeout = self.config.ring_timeout();
        self.spawn_completion(async move {
            tokio::time::sleep(timeout).await;
            Command::RingTimeout { handle }
        });
    }

    fn install(&mut self, call: Call) -> CallHandle {
        let handle = call.handle.clone();
        self.publish(CallEvent::StateChanged(call.clone()));
        self.schedule_ring_timeout(handle.clone());
        self.current = Some(ActiveCall::new(call));
        handle
    }

    /// Register an incoming call with telephony; the call starts ringing.
    async fn report_incoming(&mut self, mut call: Call) -> Result<CallHandle, CallError> {
        if let Some(active) = &self.current {
            warn!(
                "Rejecting call {} from {}: call {} is current",
                call.sid, call.peer, active.call.handle
            );
            return Err(CallError::Conflict);
        }
        if call.direction != CallDirection::Incoming {
            return Err(CallError::invalid_state("report_incoming", call.direction));
        }
        if !self.media.has_media_permission(&call.media).await {
            warn!("Rejecting call {} from {}: no media permission", call.sid, call.peer);
            return Err(CallError::Unauthorized);
        }
        self.telephony
            .report_new_incoming_call(&call.handle, CallMetadata::from(&call))
            .await
            .map_err(|e| CallError::Telephony(e.to_string()))?;
        call.apply_transition(CallTransition::Reported)?;
        info!("Incoming call {} from {} is ringing", call.handle, call.peer);
        Ok(self.install(call))
    }

    /// Ask telephony to start an outgoing call; it rings once confirmed.
    async fn report_outgoing(&mut self, mut call: Call) -> Result<CallHandle, CallError> {
        if let Some(active) = &self.current {
            warn!(
                "Refusing call to {}: call {} is current",
                call.peer, active.call.handle
            );
            return Err(CallError::Conflict);
        }
        if call.direction != CallDirection::Outgoing {
            return Err(CallError::invalid_state("report_outgoing", call.direction));
        }
        if !self.media.has_media_permission(&call.media).await {
            return Err(CallError::Unauthorized);
        }
        self.telephony
            .request_start_outgoing_call(&call.handle, CallMetadata::from(&call))
            .await
            .map_err(|e| CallError::Telephony(e.to_string()))?;
        call.apply_transition(CallTransition::Reported)?;
        info!("Outgoing call {} to {} is ringing", call.handle, call.peer);
        Ok(self.install(call))
    }

    async fn start_call(
        &mut self,
        account: BareJid,
        peer: Jid,
        media: Vec<MediaKind>,
    ) -> Result<CallHandle, CallError> {
        if self.current.is_some() {
            return Err(CallError::Conflict);
        }
        let resources = self.caps.resources(peer.bare());
        let plan = plan_outgoing(
            &peer,
            &resources,
            &media,
            self.config.prefer_message_initiation,
        )?;
        debug!("Calling {} via {:?}", peer, plan);
        let handle = self
            .report_outgoing(Call::new_outgoing(account, peer, media))
            .await?;
        self.begin_outgoing(&handle, plan).await?;
        Ok(handle)
    }

    async fn start_meet(
        &mut self,
        account: BareJid,
        room: Jid,
        media: Vec<MediaKind>,
    ) -> Result<CallHandle, CallError> {
        if self.current.is_some() {
            return Err(CallError::Conflict);
        }
        let meet = Meet::new(account, room.clone(), generate_sid());
        let handle = self.report_outgoing(Call::new_meet(meet, media)).await?;
        self.begin_outgoing(&handle, OutgoingPlan::Initiate(vec![room]))
            .await?;
        Ok(handle)
    }

    async fn begin_outgoing(
        &mut self,
        handle: &CallHandle,
        plan: OutgoingPlan,
    ) -> Result<(), CallError> {
        let result = match plan {
            OutgoingPlan::Propose(peer) => self.propose(handle, peer).await,
            OutgoingPlan::Initiate(resources) => {
                let active = self.current_mut(handle)?;
                let keys: Vec<SessionKey> = resources
                    .into_iter()
                    .map(|resource| active.key_for(resource))
                    .collect();
                active.targets.extend(keys);
                match self.ensure_media(handle).await {
                    Ok(()) => {
                        self.advance().await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = &result {
            self.fail_call(handle, e.clone()).await;
        }
        result
    }

    async fn propose(&mut self, handle: &CallHandle, peer: BareJid) -> Result<(), CallError> {
        let active = self.current_mut(handle)?;
        active.style = Style::MessageInitiation;
        let key = active.key_for(peer.clone().into());
        let media = active.call.media.clone();
        let delivery = self
            .registry
            .propose(key.account.clone(), peer, key.sid.clone(), media)
            .await?;
        self.watch(handle, key, delivery);
        Ok(())
    }

    async fn answer(&mut self, handle: &CallHandle) -> Result<(), CallError> {
        let active = self.current_mut(handle)?;
        if active.call.direction != CallDirection::Incoming || !active.call.state.is_ringing() {
            return Err(CallError::invalid_state("answer", &active.call.state));
        }
        active.call.apply_transition(CallTransition::Answered)?;
        let call = active.call.clone();
        info!("Answering call {} from {}", call.handle, call.peer);
        self.publish(CallEvent::StateChanged(call));

        if let Err(e) = self.ensure_media(handle).await {
            self.fail_call(handle, e.clone()).await;
            return Err(e);
        }

        let active = self.current_mut(handle)?;
        if active.style == Style::MessageInitiation
            && !active.proceeded
            && let Some(key) = active.session.clone()
        {
            match self.registry.proceed(key.clone()).await {
                Ok(delivery) => {
                    self.current_mut(handle)?.proceeded = true;
                    self.watch(handle, key, delivery);
                }
                Err(e) => {
                    self.fail_call(handle, e.clone()).await;
                    return Err(e);
                }
            }
        }
        self.advance().await;
        Ok(())
    }

    /// `peer` took our call: send it the offer.
    async fn accept_outgoing(&mut self, handle: &CallHandle, peer: Jid) -> Result<(), CallError> {
        let active = self.current_mut(handle)?;
        if !active.call.is_initiator() || !active.call.state.is_ringing() {
            return Err(CallError::invalid_state("accept_outgoing", &active.call.state));
        }
        if !active
            .call
            .matches(&active.call.account, &peer, &active.call.sid)
        {
            return Err(CallError::invalid_state("accept_outgoing", &peer));
        }
        let key = active.key_for(peer);
        if !active.targets.contains(&key) && !active.bound.iter().any(|(k, _)| k == &key) {
            active.targets.push(key);
        }
        if let Err(e) = self.ensure_media(handle).await {
            self.fail_call(handle, e.clone()).await;
            return Err(e);
        }
        self.advance().await;
        Ok(())
    }

    async fn end(&mut self, handle: &CallHandle) -> Result<(), CallError> {
        let Some(active) = self.current.as_ref().filter(|a| &a.call.handle == handle) else {
            debug!("Call {} already ended", handle);
            return Ok(());
        };
        let reason = local_end_reason(&active.call);
        if let Err(e) = self.telephony.request_end_call(handle).await {
            warn!("Telephony refused to end {}: {:?}; resetting anyway", handle, e);
        }
        self.reset(reason).await;
        Ok(())
    }

    async fn mute(&mut self, handle: &CallHandle, muted: bool) -> Result<(), CallError> {
        let active = self.current_mut(handle)?;
        if !active.call.state.is_established() {
            return Err(CallError::invalid_state("mute", &active.call.state));
        }
        self.telephony
            .request_mute(handle, muted)
            .await
            .map_err(|e| CallError::Telephony(e.to_string()))?;
        self.apply_mute(handle, muted).await;
        Ok(())
    }

    async fn apply_mute(&mut self, handle: &CallHandle, muted: bool) {
        let Ok(active) = self.current_mut(handle) else {
            return;
        };
        active.muted = muted;
        let pc = active.pc.clone();
        if active.call.state.is_connected() {
            let _ = active
                .call
                .apply_transition(CallTransition::MuteChanged { muted });
        }
        let call = active.call.clone();
        if let Some(pc) = pc {
            pc.set_audio_enabled(!muted).await;
        }
        debug!("Call {} muted: {}", handle, muted);
        self.publish(CallEvent::StateChanged(call));
    }

    async fn switch_camera(&mut self, handle: &CallHandle) -> Result<(), CallError> {
        let active = self.current_mut(handle)?;
        if !active.call.has_video() {
            return Err(CallError::invalid_state("switch_camera", "audio only"));
        }
        self.media
            .switch_camera()
            .await
            .map_err(negotiation_failed)
    }

    /// Start capture and create the peer connection if not done yet.
    async fn ensure_media(&mut self, handle: &CallHandle) -> Result<(), CallError> {
        let Some(active) = self
            .current
            .as_mut()
            .filter(|active| &active.call.handle == handle)
        else {
            return Err(CallError::NotFound(handle.to_string()));
        };
        if !active.capturing {
            self.media
                .start_capture(&active.call.media)
                .await
                .map_err(negotiation_failed)?;
            active.capturing = true;
        }
        if active.pc.is_none() {
            let (sink, events) = mpsc::unbounded_channel();
            forward_media_events(handle.clone(), events, self.command_tx.clone());
            let pc = self
                .media
                .create_peer_connection(&self.config.ice_servers, sink)
                .await
                .map_err(negotiation_failed)?;
            active.pc = Some(pc.clone());
            pc.add_local_tracks(&active.call.media)
                .await
                .map_err(negotiation_failed)?;
        }
        Ok(())
    }

    /// Start whatever negotiation step the current call is ready for.
    async fn advance(&mut self) {
        let Some(active) = self.current.as_mut() else {
            return;
        };
        let handle = active.call.handle.clone();
        match active.next_step() {
            Step::Idle => {}
            Step::CreateOffer(pc) => {
                debug!("Creating offer for {}", handle);
                self.spawn_completion(async move {
                    let result = create_local(pc.as_ref(), SdpType::Offer).await;
                    Command::OfferReady { handle, result }
                });
            }
            Step::CreateAnswer(pc, remote_sdp) => {
                debug!("Applying remote offer for {}", handle);
                self.spawn_completion(async move {
                    let result = match pc.set_remote_description(SdpType::Offer, &remote_sdp).await
                    {
                        Ok(()) => create_local(pc.as_ref(), SdpType::Answer).await,
                        Err(e) => Err(negotiation_failed(e)),
                    };
                    Command::AnswerReady { handle, result }
                });
            }
            Step::ApplyAnswer(pc, remote_sdp) => {
                debug!("Applying remote answer for {}", handle);
                self.spawn_completion(async move {
                    let result = pc
                        .set_remote_description(SdpType::Answer, &remote_sdp)
                        .await
                        .map_err(negotiation_failed);
                    Command::RemoteApplied { handle, result }
                });
            }
            Step::Initiate(offer, targets) => self.initiate_targets(&handle, offer, targets).await,
        }
        self.flush_local().await;
        self.flush_remote().await;
    }

    async fn initiate_targets(
        &mut self,
        handle: &CallHandle,
        offer: SessionDescription,
        targets: Vec<SessionKey>,
    ) {
        let mut last_error = None;
        for key in targets {
            match self.registry.initiate(key.clone(), offer.clone()).await {
                Ok(delivery) => {
                    self.watch(handle, key.clone(), delivery);
                    if let Ok(active) = self.current_mut(handle) {
                        active.bind(key);
                    }
                }
                Err(e) => {
                    warn!("Could not initiate {} with {}: {}", key.sid, key.peer, e);
                    last_error = Some(e);
                }
            }
        }
        let nothing_bound = self
            .current
            .as_ref()
            .is_some_and(|active| active.bound.is_empty());
        if nothing_bound && let Some(e) = last_error {
            self.fail_call(handle, e).await;
        }
    }

    /// Send local candidates to every bound session, in generation order.
    async fn flush_local(&mut self) {
        let Some(active) = self.current.as_mut() else {
            return;
        };
        let mut sends = Vec::new();
        for (key, sent) in active.bound.iter_mut() {
            for candidate in &active.local_candidates[*sent..] {
                sends.push((key.clone(), candidate.clone()));
            }
            *sent = active.local_candidates.len();
        }
        for (key, candidate) in sends {
            let sid = key.sid.clone();
            match self.registry.send_local_candidate(key, candidate).await {
                Ok(delivery) => log_delivery(delivery, "transport-info", sid),
                Err(e) => debug!("Local candidate for {} not sent: {}", sid, e),
            }
        }
    }

    /// Hand queued remote candidates to the media engine once the remote
    /// description is applied.
    async fn flush_remote(&mut self) {
        let Some(active) = self.current.as_mut() else {
            return;
        };
        if !active.remote_applied {
            return;
        }
        let Some(pc) = active.pc.clone() else {
            return;
        };
        let pending = std::mem::take(&mut active.remote_candidates);
        for remote in pending {
            if let Err(e) = pc.add_remote_candidate(remote.to_ice_candidate()).await {
                warn!(
                    "Media engine rejected candidate for {}: {:?}",
                    remote.content_name, e
                );
            }
        }
    }

    async fn on_offer_ready(
        &mut self,
        handle: &CallHandle,
        result: Result<SessionDescription, CallError>,
    ) {
        let Ok(active) = self.current_mut(handle) else {
            debug!("Discarding offer for stale call {}", handle);
            return;
        };
        active.negotiating = false;
        match result {
            Ok(offer) => {
                active.offer = Some(offer);
                self.advance().await;
            }
            Err(e) => self.fail_call(handle, e).await,
        }
    }

    async fn on_answer_ready(
        &mut self,
        handle: &CallHandle,
        result: Result<SessionDescription, CallError>,
    ) {
        let Ok(active) = self.current_mut(handle) else {
            debug!("Discarding answer for stale call {}", handle);
            return;
        };
        active.negotiating = false;
        let session = active.session.clone().ok_or_else(|| {
            CallError::SessionNotFound(active.call.sid.clone())
        });
        let (key, answer) = match (session, result) {
            (Ok(key), Ok(answer)) => (key, answer),
            (Err(e), _) | (_, Err(e)) => {
                self.fail_call(handle, e).await;
                return;
            }
        };
        match self.registry.accept(key.clone(), answer).await {
            Ok(delivery) => {
                self.watch(handle, key.clone(), delivery);
                if let Ok(active) = self.current_mut(handle) {
                    active.remote_applied = true;
                    active.bind(key);
                }
                self.flush_remote().await;
                self.flush_local().await;
            }
            Err(e) => self.fail_call(handle, e).await,
        }
    }

    async fn on_remote_applied(&mut self, handle: &CallHandle, result: Result<(), CallError>) {
        let Ok(active) = self.current_mut(handle) else {
            debug!("Discarding remote description result for stale call {}", handle);
            return;
        };
        active.negotiating = false;
        match result {
            Ok(()) => {
                active.remote_applied = true;
                self.flush_remote().await;
            }
            Err(e) => self.fail_call(handle, e).await,
        }
    }

    async fn on_delivery_failed(&mut self, handle: &CallHandle, key: SessionKey, error: CallError) {
        let Ok(active) = self.current_mut(handle) else {
            return;
        };
        active.targets.retain(|k| k != &key);
        active.bound.retain(|(k, _)| k != &key);
        if active.bound.is_empty() {
            self.fail_call(handle, error).await;
        } else {
            warn!("Dropping {} from call {}: {}", key.peer, handle, error);
        }
    }

    async fn on_ring_timeout(&mut self, handle: &CallHandle) {
        let ringing = self
            .current
            .as_ref()
            .is_some_and(|a| &a.call.handle == handle && a.call.state.is_ringing());
        if !ringing {
            return;
        }
        info!("Call {} was not answered in time", handle);
        self.telephony
            .report_call_ended(handle, EndedReason::Unanswered)
            .await;
        self.reset(TerminationReason::Timeout).await;
    }

    async fn on_media(&mut self, handle: &CallHandle, event: MediaEvent) {
        let Ok(active) = self.current_mut(handle) else {
            debug!("Media event for stale call {}: {:?}", handle, event);
            return;
        };
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                active.local_candidates.push(candidate);
                self.flush_local().await;
            }
            MediaEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                if active
                    .call
                    .apply_transition(CallTransition::MediaConnected)
                    .is_err()
                {
                    debug!("Call {} reconnected", handle);
                    return;
                }
                if active.muted {
                    let _ = active
                        .call
                        .apply_transition(CallTransition::MuteChanged { muted: true });
                }
                let call = active.call.clone();
                info!("Call {} connected", handle);
                if call.is_initiator() {
                    self.telephony.report_outgoing_connected(handle).await;
                }
                self.publish(CallEvent::StateChanged(call));
            }
            MediaEvent::ConnectionStateChanged(ConnectionState::Failed) => {
                let error = CallError::NegotiationFailed("connectivity checks failed".into());
                self.fail_with(handle, error, TerminationReason::ConnectivityError)
                    .await;
            }
            MediaEvent::ConnectionStateChanged(state) => {
                debug!("Call {} connection state {:?}", handle, state);
            }
            MediaEvent::RemoteTrackStarted { track_id, kind } => {
                self.publish(CallEvent::RemoteTrackStarted {
                    handle: handle.clone(),
                    track_id,
                    kind,
                });
            }
            MediaEvent::RemoteTrackStopped { track_id } => {
                self.publish(CallEvent::RemoteTrackStopped {
                    handle: handle.clone(),
                    track_id,
                });
            }
        }
    }

    async fn on_telephony(&mut self, action: TelephonyAction) {
        match action {
            TelephonyAction::PerformAnswer { handle } => {
                if let Err(e) = self.answer(&handle).await {
                    warn!("Could not answer {}: {}", handle, e);
                }
            }
            TelephonyAction::PerformStart { handle } => {
                if self.is_current(&handle) && let Err(e) = self.ensure_capture(&handle).await {
                    self.fail_call(&handle, e).await;
                }
            }
            TelephonyAction::PerformEnd { handle } => {
                if let Some(active) = self.current.as_ref().filter(|a| a.call.handle == handle) {
                    let reason = local_end_reason(&active.call);
                    self.reset(reason).await;
                }
            }
            TelephonyAction::PerformMute { handle, muted } => {
                self.apply_mute(&handle, muted).await;
            }
            TelephonyAction::ProviderReset => {
                if let Some(active) = &self.current {
                    warn!("Telephony provider reset, ending call {}", active.call.handle);
                    let reason = local_end_reason(&active.call);
                    self.reset(reason).await;
                }
            }
        }
    }

    /// The platform activated an outgoing call; capture can start before
    /// the peer picks up.
    async fn ensure_capture(&mut self, handle: &CallHandle) -> Result<(), CallError> {
        let active = self.current_mut(handle)?;
        if active.capturing {
            return Ok(());
        }
        let media = active.call.media.clone();
        self.media
            .start_capture(&media)
            .await
            .map_err(negotiation_failed)?;
        self.current_mut(handle)?.capturing = true;
        Ok(())
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingSession {
                key,
                style,
                media,
                description,
            } => self.on_incoming_session(key, style, media, description).await,
            SignalingEvent::RemoteDescription {
                key, description, ..
            } => {
                let Some(active) = self.active_for(&key) else {
                    debug!("Remote description for {} matches no call", key.sid);
                    self.drop_session(key, TerminationReason::GeneralError).await;
                    return;
                };
                active.session = Some(key);
                active.remote_description = Some(description);
                self.advance().await;
            }
            SignalingEvent::RemoteCandidates { key, candidates } => {
                let Some(active) = self.active_for(&key) else {
                    return;
                };
                active.remote_candidates.extend(candidates);
                self.flush_remote().await;
            }
            SignalingEvent::SessionAccepted { key } => {
                let Some(active) = self.active_for(&key) else {
                    debug!("Accepted session {} matches no call", key.sid);
                    self.drop_session(key, TerminationReason::Cancel).await;
                    return;
                };
                active.call.peer = key.peer.clone();
                active.targets.clear();
                active.bound.retain(|(k, _)| k == &key);
                active.session = Some(key);
                if active
                    .call
                    .apply_transition(CallTransition::RemoteAccepted)
                    .is_ok()
                {
                    let call = active.call.clone();
                    info!("Call {} accepted by {}", call.handle, call.peer);
                    self.publish(CallEvent::StateChanged(call));
                }
                self.advance().await;
            }
            SignalingEvent::Proceeded { key } => {
                let handle = self
                    .active_for(&key)
                    .filter(|active| active.call.is_initiator())
                    .map(|active| active.call.handle.clone());
                match handle {
                    Some(handle) => {
                        if let Err(e) = self.accept_outgoing(&handle, key.peer).await {
                            warn!("Could not continue call {}: {}", handle, e);
                        }
                    }
                    None => self.drop_session(key, TerminationReason::Cancel).await,
                }
            }
            SignalingEvent::SessionTerminated { key, reason } => {
                self.on_session_terminated(key, reason).await
            }
            SignalingEvent::PublishersChanged {
                account,
                room,
                sid,
                added,
                removed,
            } => {
                let Some(active) = self.current.as_mut() else {
                    return;
                };
                if !active.call.matches(&account, &room, &sid) {
                    return;
                }
                let handle = active.call.handle.clone();
                let Some(meet) = active.call.meet_mut() else {
                    return;
                };
                meet.remove_publishers(&removed);
                meet.add_publishers(added);
                let publishers = meet.publishers().to_vec();
                debug!("Meet {} has {} publishers", handle, publishers.len());
                self.publish(CallEvent::PublishersChanged { handle, publishers });
            }
        }
    }

    async fn on_incoming_session(
        &mut self,
        key: SessionKey,
        style: Style,
        media: Vec<MediaKind>,
        description: Option<SessionDescription>,
    ) {
        let call = Call::new_incoming(
            key.account.clone(),
            key.peer.clone(),
            key.sid.clone(),
            media,
        );
        match self.report_incoming(call).await {
            Ok(_) => {
                if let Some(active) = self.current.as_mut() {
                    active.style = style;
                    active.session = Some(key);
                    active.remote_description = description;
                }
            }
            Err(e) => {
                let reason = match e {
                    CallError::Conflict => TerminationReason::Busy,
                    _ => TerminationReason::Decline,
                };
                info!("Refusing {} from {}: {}", key.sid, key.peer, e);
                self.drop_session(key, reason).await;
            }
        }
    }

    async fn on_session_terminated(&mut self, key: SessionKey, reason: TerminationReason) {
        let Some(active) = self.active_for(&key) else {
            return;
        };
        active.targets.retain(|k| k != &key);
        active.bound.retain(|(k, _)| k != &key);
        let others_remain = active.call.is_initiator()
            && !active.call.state.is_established()
            && (!active.targets.is_empty() || !active.bound.is_empty());
        if others_remain {
            info!("{} left call {} ({:?})", key.peer, active.call.handle, reason);
            return;
        }
        let handle = active.call.handle.clone();
        let was_ringing = active.call.state.is_ringing();
        if let Some(ended) = EndedReason::from_termination(reason, was_ringing) {
            self.telephony.report_call_ended(&handle, ended).await;
        }
        self.reset(reason).await;
    }

    /// Terminate a session that has no call behind it.
    async fn drop_session(&self, key: SessionKey, reason: TerminationReason) {
        let sid = key.sid.clone();
        match self
            .registry
            .terminate(key.account, key.peer, key.sid, reason)
            .await
        {
            Ok(delivery) => log_delivery(delivery, "session-terminate", sid),
            Err(e) => warn!("Could not terminate {}: {}", sid, e),
        }
    }

    async fn fail_call(&mut self, handle: &CallHandle, error: CallError) {
        let reason = termination_for(&error);
        self.fail_with(handle, error, reason).await;
    }

    /// Report the call as failed and reset.
    async fn fail_with(
        &mut self,
        handle: &CallHandle,
        error: CallError,
        reason: TerminationReason,
    ) {
        if !self.is_current(handle) {
            return;
        }
        error!("Call {} failed: {}", handle, error);
        self.telephony
            .report_call_ended(handle, EndedReason::Failed)
            .await;
        self.publish(CallEvent::Failed {
            handle: handle.clone(),
            error,
        });
        self.reset(reason).await;
    }

    /// Tear down the current call. Every ending path comes through here and
    /// only the first one does any work.
    async fn reset(&mut self, reason: TerminationReason) {
        let Some(mut active) = self.current.take() else {
            return;
        };
        let sid = active.call.sid.clone();
        match self
            .registry
            .terminate(
                active.call.account.clone(),
                active.call.peer.clone(),
                sid.clone(),
                reason,
            )
            .await
        {
            Ok(delivery) => log_delivery(delivery, "session-terminate", sid),
            Err(e) => warn!("Could not terminate sessions of {}: {}", active.call.handle, e),
        }
        if let Some(pc) = active.pc.take() {
            pc.close().await;
        }
        if active.capturing {
            self.media.stop_capture().await;
        }
        if let Some(meet) = active.call.meet_mut() {
            meet.deactivate();
        }
        if let Err(e) = active
            .call
            .apply_transition(CallTransition::Ended { reason })
        {
            debug!("{}", e);
        }
        info!("Call {} ended ({:?})", active.call.handle, reason);
        self.publish(CallEvent::StateChanged(active.call));
    }
}

/// Cloneable front of the call manager.
#[derive(Clone)]
pub struct CallManagerHandle {
    tx: mpsc::Sender<Command>,
    registry: RegistryHandle,
    events: broadcast::Sender<CallEvent>,
}

impl CallManagerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).await?;
        rx.await?
    }

    /// Where the messaging client delivers inbound protocol events.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Fails with [`CallError::Conflict`] while another call is current and
    /// with [`CallError::Unauthorized`] without media permission.
    pub async fn report_incoming(&self, call: Call) -> Result<CallHandle, CallError> {
        self.request(|reply| Command::ReportIncoming { call, reply })
            .await
    }

    pub async fn report_outgoing(&self, call: Call) -> Result<CallHandle, CallError> {
        self.request(|reply| Command::ReportOutgoing { call, reply })
            .await
    }

    /// Place a call, ringing every capable resource of `peer`.
    pub async fn start_call(
        &self,
        account: BareJid,
        peer: Jid,
        media: Vec<MediaKind>,
    ) -> Result<CallHandle, CallError> {
        self.request(|reply| Command::StartCall {
            account,
            peer,
            media,
            reply,
        })
        .await
    }

    /// Join a meet through its room component.
    pub async fn start_meet(
        &self,
        account: BareJid,
        room: Jid,
        media: Vec<MediaKind>,
    ) -> Result<CallHandle, CallError> {
        self.request(|reply| Command::StartMeet {
            account,
            room,
            media,
            reply,
        })
        .await
    }

    pub async fn answer(&self, handle: &CallHandle) -> Result<(), CallError> {
        let handle = handle.clone();
        self.request(|reply| Command::Answer { handle, reply })
            .await
    }

    pub async fn accept_outgoing(&self, handle: &CallHandle, peer: Jid) -> Result<(), CallError> {
        let handle = handle.clone();
        self.request(|reply| Command::AcceptOutgoing {
            handle,
            peer,
            reply,
        })
        .await
    }

    /// End the call. Ending a call that is already over does nothing.
    pub async fn end(&self, handle: &CallHandle) -> Result<(), CallError> {
        let handle = handle.clone();
        self.request(|reply| Command::End { handle, reply }).await
    }

    pub async fn mute(&self, handle: &CallHandle, muted: bool) -> Result<(), CallError> {
        let handle = handle.clone();
        self.request(|reply| Command::Mute {
            handle,
            muted,
            reply,
        })
        .await
    }

    pub async fn switch_camera(&self, handle: &CallHandle) -> Result<(), CallError> {
        let handle = handle.clone();
        self.request(|reply| Command::SwitchCamera { handle, reply })
            .await
    }

    pub async fn current_call(&self) -> Result<Option<Call>, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::CurrentCall { reply }).await?;
        Ok(rx.await?)
    }

    /// Deliver a callback from the telephony service.
    pub async fn telephony(&self, action: TelephonyAction) -> Result<(), CallError> {
        self.tx.send(Command::Telephony(action)).await?;
        Ok(())
    }

    /// End any current call and stop both actors.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.tx.send(Command::Shutdown).await?;
        Ok(())
    }
}
