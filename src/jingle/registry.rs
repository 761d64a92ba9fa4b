//! Session table and the actor that owns it.
//!
//! All session mutation happens inside [`RegistryActor`]; everyone else
//! goes through a [`RegistryHandle`]. Events for the call manager leave on
//! an unbounded channel so the registry never waits on its consumer.

use super::action::{
    InboundEvent, MediaKind, MessageInitiationAction, OutboundAction, SignalingTransport,
    TerminationReason,
};
use super::outbox::{Delivery, Outbox};
use super::session::{RemoteCandidate, Session, SessionKey, SessionState, Style};
use crate::calls::Publisher;
use crate::config::CallsConfig;
use crate::error::CallError;
use crate::jid::{BareJid, Jid};
use crate::sdp::{Candidate, IceCandidate, Role, SessionDescription};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Flat table of live sessions.
///
/// Several resources of one peer may each hold a session, so keys are not
/// unique on the bare peer.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always creates; callers check [`find`](Self::find) first.
    pub fn open(&mut self, key: SessionKey, role: Role, style: Style) -> &mut Session {
        self.next_id += 1;
        let index = self.sessions.len();
        self.sessions
            .push(Session::new(self.next_id, key, role, style));
        &mut self.sessions[index]
    }

    fn position(&self, account: &BareJid, peer: &Jid, sid: Option<&str>) -> Option<usize> {
        let scoped = |s: &Session| {
            &s.key().account == account && sid.is_none_or(|sid| s.key().sid == sid)
        };
        self.sessions
            .iter()
            .position(|s| scoped(s) && &s.key().peer == peer)
            .or_else(|| {
                self.sessions.iter().position(|s| {
                    scoped(s) && !s.key().peer.has_resource() && s.key().peer.bare() == peer.bare()
                })
            })
    }

    /// Exact peer match first, then a session stored without a resource.
    pub fn find(&self, account: &BareJid, peer: &Jid, sid: Option<&str>) -> Option<&Session> {
        self.position(account, peer, sid)
            .map(|index| &self.sessions[index])
    }

    pub fn find_mut(
        &mut self,
        account: &BareJid,
        peer: &Jid,
        sid: Option<&str>,
    ) -> Option<&mut Session> {
        self.position(account, peer, sid)
            .map(|index| &mut self.sessions[index])
    }

    pub fn get(&self, id: u64) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id() == id)
    }

    pub fn close(&mut self, account: &BareJid, peer: &Jid, sid: &str) -> Option<Session> {
        let index = self.position(account, peer, Some(sid))?;
        Some(self.sessions.remove(index))
    }

    pub fn close_id(&mut self, id: u64) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.id() == id)?;
        Some(self.sessions.remove(index))
    }

    /// Ids of sessions sharing account, bare peer and sid with `id`.
    pub fn siblings(&self, id: u64) -> Vec<u64> {
        let Some(session) = self.get(id) else {
            return Vec::new();
        };
        self.sessions
            .iter()
            .filter(|s| s.id() != id && s.key().is_sibling_of(session.key()))
            .map(Session::id)
            .collect()
    }

    /// Ids of every session with `sid` on `account`, whatever the peer.
    pub fn by_sid(&self, account: &BareJid, sid: &str) -> Vec<u64> {
        self.sessions
            .iter()
            .filter(|s| &s.key().account == account && s.key().sid == sid)
            .map(Session::id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Read-only view of a session handed out of the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub role: Role,
    pub style: Style,
    pub state: SessionState,
    pub termination: Option<TerminationReason>,
    pub has_remote_description: bool,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            key: session.key().clone(),
            role: session.role(),
            style: session.style(),
            state: session.state(),
            termination: session.termination(),
            has_remote_description: session.remote_description().is_some(),
        }
    }
}

/// Notifications for the call manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// A peer wants to start a call. `description` is absent for a propose.
    IncomingSession {
        key: SessionKey,
        style: Style,
        media: Vec<MediaKind>,
        description: Option<SessionDescription>,
    },
    /// The remote description was committed on a session.
    RemoteDescription {
        key: SessionKey,
        role: Role,
        description: SessionDescription,
    },
    /// Remote candidates ready to hand to the media engine, in arrival order.
    RemoteCandidates {
        key: SessionKey,
        candidates: Vec<RemoteCandidate>,
    },
    /// The session won the race and is now the call's session.
    SessionAccepted { key: SessionKey },
    /// A peer resource picked up our propose.
    Proceeded { key: SessionKey },
    /// The session ended without a local request.
    SessionTerminated {
        key: SessionKey,
        reason: TerminationReason,
    },
    PublishersChanged {
        account: BareJid,
        room: Jid,
        sid: String,
        added: Vec<Publisher>,
        removed: Vec<Jid>,
    },
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

#[derive(Debug)]
pub enum RegistryCommand {
    Inbound(InboundEvent),
    Propose {
        account: BareJid,
        peer: BareJid,
        sid: String,
        media: Vec<MediaKind>,
        reply: Reply<Delivery>,
    },
    Initiate {
        key: SessionKey,
        description: SessionDescription,
        reply: Reply<Delivery>,
    },
    Accept {
        key: SessionKey,
        description: SessionDescription,
        reply: Reply<Delivery>,
    },
    Proceed {
        key: SessionKey,
        reply: Reply<Delivery>,
    },
    SendLocalCandidate {
        key: SessionKey,
        candidate: IceCandidate,
        reply: Reply<Delivery>,
    },
    /// Terminate every session with this account, bare peer and sid.
    Terminate {
        account: BareJid,
        peer: Jid,
        sid: String,
        reason: TerminationReason,
        reply: oneshot::Sender<Delivery>,
    },
    Find {
        account: BareJid,
        peer: Jid,
        sid: Option<String>,
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    Close {
        key: SessionKey,
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    ExpireDeferred {
        id: u64,
    },
    ExpireOrphan {
        id: u64,
    },
    Shutdown,
}

pub struct RegistryActor {
    config: CallsConfig,
    table: SessionRegistry,
    outboxes: HashMap<u64, Outbox>,
    transport: Arc<dyn SignalingTransport>,
    command_rx: mpsc::Receiver<RegistryCommand>,
    command_tx: mpsc::WeakSender<RegistryCommand>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
}

impl RegistryActor {
    /// Start the actor. The returned receiver carries events for the call manager.
    pub fn spawn(
        config: CallsConfig,
        transport: Arc<dyn SignalingTransport>,
    ) -> (RegistryHandle, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let actor = Self {
            config,
            table: SessionRegistry::new(),
            outboxes: HashMap::new(),
            transport,
            command_rx,
            command_tx: command_tx.downgrade(),
            event_tx,
        };
        tokio::spawn(actor.run());
        (RegistryHandle { tx: command_tx }, event_rx)
    }

    async fn run(mut self) {
        info!("Session registry started");
        while let Some(command) = self.command_rx.recv().await {
            match command {
                RegistryCommand::Inbound(event) => self.handle_inbound(event),
                RegistryCommand::Propose {
                    account,
                    peer,
                    sid,
                    media,
                    reply,
                } => {
                    let _ = reply.send(self.propose(account, peer, sid, media));
                }
                RegistryCommand::Initiate {
                    key,
                    description,
                    reply,
                } => {
                    let _ = reply.send(self.initiate(key, description));
                }
                RegistryCommand::Accept {
                    key,
                    description,
                    reply,
                } => {
                    let result = self.with_session(&key, |s| s.accept(description));
                    let _ = reply.send(result);
                }
                RegistryCommand::Proceed { key, reply } => {
                    let result = self.with_session(&key, Session::proceed);
                    let _ = reply.send(result);
                }
                RegistryCommand::SendLocalCandidate {
                    key,
                    candidate,
                    reply,
                } => {
                    let _ = reply.send(self.send_local_candidate(&key, candidate));
                }
                RegistryCommand::Terminate {
                    account,
                    peer,
                    sid,
                    reason,
                    reply,
                } => {
                    let _ = reply.send(self.terminate(&account, &peer, &sid, reason));
                }
                RegistryCommand::Find {
                    account,
                    peer,
                    sid,
                    reply,
                } => {
                    let info = self
                        .table
                        .find(&account, &peer, sid.as_deref())
                        .map(SessionInfo::from);
                    let _ = reply.send(info);
                }
                RegistryCommand::Close { key, reply } => {
                    let info = self
                        .id_of(&key)
                        .and_then(|id| self.remove(id))
                        .map(|s| SessionInfo::from(&s));
                    let _ = reply.send(info);
                }
                RegistryCommand::Len { reply } => {
                    let _ = reply.send(self.table.len());
                }
                RegistryCommand::ExpireDeferred { id } => self.expire_deferred(id),
                RegistryCommand::ExpireOrphan { id } => self.expire_orphan(id),
                RegistryCommand::Shutdown => break,
            }
        }
        info!("Session registry stopped");
    }

    fn id_of(&self, key: &SessionKey) -> Option<u64> {
        self.table
            .find(&key.account, &key.peer, Some(&key.sid))
            .map(Session::id)
    }

    fn emit(&self, event: SignalingEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Signaling event dropped: call manager gone");
        }
    }

    fn deliver(&mut self, id: u64, account: &BareJid, actions: Vec<OutboundAction>) -> Delivery {
        if actions.is_empty() {
            return Delivery::default();
        }
        let transport = &self.transport;
        self.outboxes
            .entry(id)
            .or_insert_with(|| Outbox::spawn(transport.clone()))
            .push_all(account, actions)
    }

    fn remove(&mut self, id: u64) -> Option<Session> {
        self.outboxes.remove(&id);
        self.table.close_id(id)
    }

    fn schedule(&self, after: Duration, command: RegistryCommand) {
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(command).await;
            }
        });
    }

    /// Run `op` on the session behind `key` and queue what it emits.
    fn with_session(
        &mut self,
        key: &SessionKey,
        op: impl FnOnce(&mut Session) -> Result<Vec<OutboundAction>, CallError>,
    ) -> Result<Delivery, CallError> {
        let id = self
            .id_of(key)
            .ok_or_else(|| CallError::SessionNotFound(key.sid.clone()))?;
        let session = self
            .table
            .get_mut(id)
            .ok_or_else(|| CallError::SessionNotFound(key.sid.clone()))?;
        let actions = op(session)?;
        Ok(self.deliver(id, &key.account, actions))
    }

    fn propose(
        &mut self,
        account: BareJid,
        peer: BareJid,
        sid: String,
        media: Vec<MediaKind>,
    ) -> Result<Delivery, CallError> {
        let peer = Jid::from(peer);
        if let Some(existing) = self.table.find(&account, &peer, Some(&sid)) {
            return Err(CallError::invalid_state("propose", existing.state()));
        }
        let session = self.table.open(
            SessionKey::new(account.clone(), peer, sid),
            Role::Initiator,
            Style::MessageInitiation,
        );
        let id = session.id();
        match session.propose(media) {
            Ok(actions) => {
                info!("Proposing call {} to {}", session.key().sid, session.key().peer);
                Ok(self.deliver(id, &account, actions))
            }
            Err(e) => {
                self.remove(id);
                Err(e)
            }
        }
    }

    fn initiate(
        &mut self,
        key: SessionKey,
        description: SessionDescription,
    ) -> Result<Delivery, CallError> {
        let id = match self.id_of(&key) {
            Some(id) => id,
            None => self
                .table
                .open(key.clone(), Role::Initiator, Style::Jingle)
                .id(),
        };
        let result = self
            .table
            .get_mut(id)
            .ok_or_else(|| CallError::SessionNotFound(key.sid.clone()))
            .and_then(|s| s.initiate(description));
        match result {
            Ok(actions) => {
                info!("Initiating session {} with {}", key.sid, key.peer);
                Ok(self.deliver(id, &key.account, actions))
            }
            Err(e) => {
                if self
                    .table
                    .get(id)
                    .is_some_and(|s| {
                        s.state() == SessionState::Created && s.style() == Style::Jingle
                    })
                {
                    self.remove(id);
                }
                Err(e)
            }
        }
    }

    fn send_local_candidate(
        &mut self,
        key: &SessionKey,
        candidate: IceCandidate,
    ) -> Result<Delivery, CallError> {
        let id = self
            .id_of(key)
            .ok_or_else(|| CallError::SessionNotFound(key.sid.clone()))?;
        let session = self
            .table
            .get_mut(id)
            .ok_or_else(|| CallError::SessionNotFound(key.sid.clone()))?;
        let deferred_before = session.deferred_local_candidates();
        let actions = session.send_local_candidate(candidate, Instant::now())?;
        if session.deferred_local_candidates() > deferred_before {
            debug!("Deferring local candidate for {}", key.sid);
            self.schedule(
                self.config.local_candidate_grace(),
                RegistryCommand::ExpireDeferred { id },
            );
        }
        Ok(self.deliver(id, &key.account, actions))
    }

    fn terminate(
        &mut self,
        account: &BareJid,
        peer: &Jid,
        sid: &str,
        reason: TerminationReason,
    ) -> Delivery {
        let ids: Vec<u64> = self
            .table
            .by_sid(account, sid)
            .into_iter()
            .filter(|id| {
                self.table
                    .get(*id)
                    .is_some_and(|s| s.key().peer.bare() == peer.bare())
            })
            .collect();
        let mut delivery = Delivery::default();
        for id in ids {
            let Some(session) = self.table.get_mut(id) else {
                continue;
            };
            let actions = session.terminate(reason);
            info!(
                "Terminating session {} with {} ({:?})",
                sid,
                session.key().peer,
                reason
            );
            delivery.merge(self.deliver(id, account, actions));
            self.remove(id);
        }
        delivery
    }

    /// Terminate the losers of a multi-resource race in the same step the
    /// winner is promoted.
    fn supersede_siblings(&mut self, winner: u64) {
        for id in self.table.siblings(winner) {
            let Some(session) = self.table.get_mut(id) else {
                continue;
            };
            let account = session.key().account.clone();
            debug!("Superseding session {} with {}", session.key().sid, session.key().peer);
            let actions = session.terminate(TerminationReason::Superseded);
            // Losers are gone before the next command is handled.
            drop(self.deliver(id, &account, actions));
            self.remove(id);
        }
    }

    /// Close a session and tell the call manager.
    fn end_remotely(&mut self, id: u64, reason: TerminationReason) {
        let Some(session) = self.table.get_mut(id) else {
            return;
        };
        if session.remote_terminated(reason) {
            let key = session.key().clone();
            info!("Session {} with {} ended: {:?}", key.sid, key.peer, reason);
            self.remove(id);
            self.emit(SignalingEvent::SessionTerminated { key, reason });
        }
    }

    fn expire_deferred(&mut self, id: u64) {
        let grace = self.config.local_candidate_grace();
        if let Some(session) = self.table.get_mut(id) {
            let dropped = session.expire_deferred(Instant::now(), grace);
            if dropped > 0 {
                warn!(
                    "Dropped {} local candidates for {}: no local description",
                    dropped,
                    session.key().sid
                );
            }
        }
    }

    fn expire_orphan(&mut self, id: u64) {
        let orphaned = self.table.get(id).is_some_and(|s| {
            s.state() == SessionState::Created
                && s.role() == Role::Responder
                && s.style() == Style::Jingle
        });
        if orphaned && let Some(session) = self.remove(id) {
            debug!(
                "Dropping orphan session {} with {}: no session-initiate arrived",
                session.key().sid,
                session.key().peer
            );
        }
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::SessionInitiate {
                account,
                from,
                sid,
                description,
            } => self.on_session_initiate(account, from, sid, description),
            InboundEvent::SessionAccept {
                account,
                from,
                sid,
                description,
            } => self.on_session_accept(account, from, sid, description),
            InboundEvent::TransportInfo {
                account,
                from,
                sid,
                content_name,
                candidates,
            } => self.on_transport_info(account, from, sid, content_name, candidates),
            InboundEvent::SessionTerminate {
                account,
                from,
                sid,
                reason,
            } => match self.table.find(&account, &from, Some(&sid)).map(Session::id) {
                Some(id) => self.end_remotely(id, reason),
                None => debug!("session-terminate for unknown session {} from {}", sid, from),
            },
            InboundEvent::MessageInitiation {
                account,
                from,
                id,
                action,
            } => self.on_message_initiation(account, from, id, action),
            InboundEvent::ContactAvailabilityChanged {
                account,
                peer,
                available,
            } => {
                if available {
                    return;
                }
                let ids: Vec<u64> = self
                    .table
                    .sessions
                    .iter()
                    // A single resource going away only ends sessions bound to it;
                    // bare-scoped sessions may still be ringing other resources.
                    .filter(|s| {
                        s.key().account == account
                            && if peer.has_resource() {
                                s.key().peer == peer
                            } else {
                                s.key().peer.bare() == peer.bare()
                            }
                    })
                    .map(Session::id)
                    .collect();
                if !ids.is_empty() {
                    info!("{} became unavailable, closing {} sessions", peer, ids.len());
                }
                for id in ids {
                    self.end_remotely(id, TerminationReason::Gone);
                }
            }
            InboundEvent::PublishersChanged {
                account,
                room,
                sid,
                added,
                removed,
            } => self.emit(SignalingEvent::PublishersChanged {
                account,
                room,
                sid,
                added,
                removed,
            }),
        }
    }

    fn on_session_initiate(
        &mut self,
        account: BareJid,
        from: Jid,
        sid: String,
        description: SessionDescription,
    ) {
        let id = match self.table.find(&account, &from, Some(&sid)) {
            Some(s) if s.state() == SessionState::Created && s.role() == Role::Responder => s.id(),
            Some(s) => {
                warn!(
                    "Ignoring session-initiate for {} from {} in state {:?}",
                    sid,
                    from,
                    s.state()
                );
                return;
            }
            None => self
                .table
                .open(
                    SessionKey::new(account, from.clone(), sid.clone()),
                    Role::Responder,
                    Style::Jingle,
                )
                .id(),
        };
        let Some(session) = self.table.get_mut(id) else {
            return;
        };
        let replayed = match session.remote_initiate(&from, description.clone()) {
            Ok(replayed) => replayed,
            Err(e) => {
                warn!("Rejecting session-initiate {} from {}: {}", sid, from, e);
                return;
            }
        };
        let key = session.key().clone();
        let style = session.style();
        info!("Incoming session-initiate {} from {}", sid, from);

        match style {
            Style::Jingle => self.emit(SignalingEvent::IncomingSession {
                key: key.clone(),
                style,
                media: MediaKind::from_description(&description),
                description: Some(description),
            }),
            Style::MessageInitiation => self.emit(SignalingEvent::RemoteDescription {
                key: key.clone(),
                role: Role::Responder,
                description,
            }),
        }
        if !replayed.is_empty() {
            self.emit(SignalingEvent::RemoteCandidates {
                key,
                candidates: replayed,
            });
        }
    }

    fn on_session_accept(
        &mut self,
        account: BareJid,
        from: Jid,
        sid: String,
        description: SessionDescription,
    ) {
        let Some(id) = self.table.find(&account, &from, Some(&sid)).map(Session::id) else {
            warn!("session-accept for unknown session {} from {}", sid, from);
            return;
        };
        let Some(session) = self.table.get_mut(id) else {
            return;
        };
        let replayed = match session.remote_accept(description.clone()) {
            Ok(replayed) => replayed,
            Err(e) => {
                warn!("Ignoring session-accept {} from {}: {}", sid, from, e);
                return;
            }
        };
        let key = session.key().clone();
        info!("Session {} accepted by {}", sid, from);

        self.supersede_siblings(id);
        self.emit(SignalingEvent::RemoteDescription {
            key: key.clone(),
            role: Role::Initiator,
            description,
        });
        self.emit(SignalingEvent::SessionAccepted { key: key.clone() });
        if !replayed.is_empty() {
            self.emit(SignalingEvent::RemoteCandidates {
                key,
                candidates: replayed,
            });
        }
    }

    fn on_transport_info(
        &mut self,
        account: BareJid,
        from: Jid,
        sid: String,
        content_name: String,
        candidates: Vec<Candidate>,
    ) {
        let id = match self.table.find(&account, &from, Some(&sid)) {
            Some(s) => s.id(),
            None => {
                debug!("Early transport-info {} from {}, buffering", sid, from);
                let id = self
                    .table
                    .open(
                        SessionKey::new(account, from.clone(), sid.clone()),
                        Role::Responder,
                        Style::Jingle,
                    )
                    .id();
                self.schedule(
                    self.config.orphan_session_timeout(),
                    RegistryCommand::ExpireOrphan { id },
                );
                id
            }
        };
        let Some(session) = self.table.get_mut(id) else {
            return;
        };
        let mut ready = Vec::new();
        for candidate in candidates {
            match session.add_remote_candidate(&content_name, candidate) {
                Ok(Some(remote)) => ready.push(remote),
                Ok(None) => {}
                Err(e) => warn!("Dropping candidate for {} from {}: {}", sid, from, e),
            }
        }
        if !ready.is_empty() {
            let key = session.key().clone();
            self.emit(SignalingEvent::RemoteCandidates {
                key,
                candidates: ready,
            });
        }
    }

    fn on_message_initiation(
        &mut self,
        account: BareJid,
        from: Jid,
        id: String,
        action: MessageInitiationAction,
    ) {
        let own = from.bare() == &account;
        debug!("{} for {} from {}", action.name(), id, from);

        match action {
            MessageInitiationAction::Propose { media } => {
                if own {
                    return;
                }
                if !self.table.by_sid(&account, &id).is_empty() {
                    debug!("Duplicate propose {} from {}", id, from);
                    return;
                }
                let session = self.table.open(
                    SessionKey::new(account, from.clone(), id.clone()),
                    Role::Responder,
                    Style::MessageInitiation,
                );
                session.remote_propose(media.clone());
                let key = session.key().clone();
                info!("Incoming propose {} from {}", id, from);
                self.emit(SignalingEvent::IncomingSession {
                    key,
                    style: Style::MessageInitiation,
                    media,
                    description: None,
                });
            }
            MessageInitiationAction::Accept | MessageInitiationAction::Reject if own => {
                let reason = if matches!(action, MessageInitiationAction::Accept) {
                    TerminationReason::AnsweredElsewhere
                } else {
                    TerminationReason::DeclinedElsewhere
                };
                let ids: Vec<u64> = self
                    .table
                    .by_sid(&account, &id)
                    .into_iter()
                    .filter(|session_id| {
                        self.table.get(*session_id).is_some_and(|s| {
                            s.role() == Role::Responder
                                && s.style() == Style::MessageInitiation
                                && s.state() == SessionState::Created
                                && !s.has_proceeded()
                        })
                    })
                    .collect();
                for session_id in ids {
                    self.end_remotely(session_id, reason);
                }
            }
            MessageInitiationAction::Accept => {
                debug!("Ignoring accept {} from peer {}", id, from);
            }
            MessageInitiationAction::Retract | MessageInitiationAction::Reject => {
                let reason = if matches!(action, MessageInitiationAction::Retract) {
                    TerminationReason::Cancel
                } else {
                    TerminationReason::Decline
                };
                match self.table.find(&account, &from, Some(&id)).map(Session::id) {
                    Some(session_id) => self.end_remotely(session_id, reason),
                    None => debug!("{} for unknown session {} from {}", action.name(), id, from),
                }
            }
            MessageInitiationAction::Proceed => {
                if own {
                    return;
                }
                let Some(session) = self.table.find_mut(&account, &from, Some(&id)) else {
                    warn!("proceed for unknown session {} from {}", id, from);
                    return;
                };
                if let Err(e) = session.remote_proceed(&from) {
                    warn!("Ignoring proceed {} from {}: {}", id, from, e);
                    return;
                }
                let key = session.key().clone();
                info!("{} proceeded with {}", from, id);
                self.emit(SignalingEvent::Proceeded { key });
            }
        }
    }
}

/// Cloneable front of the registry actor.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).await?;
        Ok(rx.await?)
    }

    /// Hand an event from the messaging client to the registry.
    pub async fn inbound(&self, event: InboundEvent) -> Result<(), CallError> {
        self.tx.send(RegistryCommand::Inbound(event)).await?;
        Ok(())
    }

    pub async fn propose(
        &self,
        account: BareJid,
        peer: BareJid,
        sid: String,
        media: Vec<MediaKind>,
    ) -> Result<Delivery, CallError> {
        self.request(|reply| RegistryCommand::Propose {
            account,
            peer,
            sid,
            media,
            reply,
        })
        .await?
    }

    /// Send our offer, opening an initiator session for `key` if needed.
    pub async fn initiate(
        &self,
        key: SessionKey,
        description: SessionDescription,
    ) -> Result<Delivery, CallError> {
        self.request(|reply| RegistryCommand::Initiate {
            key,
            description,
            reply,
        })
        .await?
    }

    pub async fn accept(
        &self,
        key: SessionKey,
        description: SessionDescription,
    ) -> Result<Delivery, CallError> {
        self.request(|reply| RegistryCommand::Accept {
            key,
            description,
            reply,
        })
        .await?
    }

    pub async fn proceed(&self, key: SessionKey) -> Result<Delivery, CallError> {
        self.request(|reply| RegistryCommand::Proceed { key, reply })
            .await?
    }

    pub async fn send_local_candidate(
        &self,
        key: SessionKey,
        candidate: IceCandidate,
    ) -> Result<Delivery, CallError> {
        self.request(|reply| RegistryCommand::SendLocalCandidate {
            key,
            candidate,
            reply,
        })
        .await?
    }

    pub async fn terminate(
        &self,
        account: BareJid,
        peer: Jid,
        sid: String,
        reason: TerminationReason,
    ) -> Result<Delivery, CallError> {
        self.request(|reply| RegistryCommand::Terminate {
            account,
            peer,
            sid,
            reason,
            reply,
        })
        .await
    }

    pub async fn find(
        &self,
        account: BareJid,
        peer: Jid,
        sid: Option<String>,
    ) -> Result<Option<SessionInfo>, CallError> {
        self.request(|reply| RegistryCommand::Find {
            account,
            peer,
            sid,
            reply,
        })
        .await
    }

    pub async fn close(&self, key: SessionKey) -> Result<Option<SessionInfo>, CallError> {
        self.request(|reply| RegistryCommand::Close { key, reply })
            .await
    }

    pub async fn len(&self) -> Result<usize, CallError> {
        self.request(|reply| RegistryCommand::Len { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.tx.send(RegistryCommand::Shutdown).await?;
        Ok(())
    }
}
