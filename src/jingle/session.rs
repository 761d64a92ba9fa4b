//! Per-peer signaling state machine.
//!
//! A [`Session`] performs no I/O. Every operation returns the outbound
//! actions it produced, in the order they must be delivered.

use super::action::{MediaKind, MessageInitiationAction, OutboundAction, TerminationReason};
use crate::error::CallError;
use crate::jid::{BareJid, Jid};
use crate::sdp::{Candidate, IceCandidate, Role, SessionDescription};
use log::{debug, warn};
use std::time::{Duration, Instant};

/// Protocol state of a session.
///
/// Responder path: `Created -> Initiated -> Accepted`.
/// Initiator path: `Created -> Initiating -> Accepted`.
/// Any non-terminal state may move to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initiating,
    Initiated,
    Accepted,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }
}

/// How the session was set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// Direct per-resource handshake.
    Jingle,
    /// Bare-addressed propose/proceed before the handshake.
    MessageInitiation,
}

/// Registry key of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub account: BareJid,
    pub peer: Jid,
    pub sid: String,
}

impl SessionKey {
    pub fn new(account: BareJid, peer: Jid, sid: impl Into<String>) -> Self {
        Self {
            account,
            peer,
            sid: sid.into(),
        }
    }

    /// Same account, bare peer and sid.
    pub fn is_sibling_of(&self, other: &SessionKey) -> bool {
        self.account == other.account
            && self.peer.bare() == other.peer.bare()
            && self.sid == other.sid
    }
}

/// A remote candidate resolved against the remote description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub content_name: String,
    pub m_line_index: u16,
    pub candidate: Candidate,
}

impl RemoteCandidate {
    pub fn to_ice_candidate(&self) -> IceCandidate {
        IceCandidate::new(self.candidate.clone())
            .with_sdp_mid(self.content_name.clone())
            .with_sdp_m_line_index(self.m_line_index)
    }
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    key: SessionKey,
    role: Role,
    style: Style,
    state: SessionState,
    termination: Option<TerminationReason>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_remote: Vec<(String, Candidate)>,
    deferred_local: Vec<(IceCandidate, Instant)>,
    proposed_media: Vec<MediaKind>,
    proposed: bool,
    proceeded: bool,
}

impl Session {
    pub fn new(id: u64, key: SessionKey, role: Role, style: Style) -> Self {
        Self {
            id,
            key,
            role,
            style,
            state: SessionState::Created,
            termination: None,
            local_description: None,
            remote_description: None,
            pending_remote: Vec::new(),
            deferred_local: Vec::new(),
            proposed_media: Vec::new(),
            proposed: false,
            proceeded: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn style(&self) -> Style {
        self.style
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn proposed_media(&self) -> &[MediaKind] {
        &self.proposed_media
    }

    pub fn has_proceeded(&self) -> bool {
        self.proceeded
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    pub fn deferred_local_candidates(&self) -> usize {
        self.deferred_local.len()
    }

    fn ensure(&self, operation: &'static str, ok: bool) -> Result<(), CallError> {
        if ok {
            Ok(())
        } else {
            Err(CallError::invalid_state(operation, self.state))
        }
    }

    /// Send our offer.
    pub fn initiate(
        &mut self,
        description: SessionDescription,
    ) -> Result<Vec<OutboundAction>, CallError> {
        self.ensure(
            "initiate",
            self.state == SessionState::Created
                && self.role == Role::Initiator
                && (self.style == Style::Jingle || self.proceeded),
        )?;
        let mut actions = vec![OutboundAction::SessionInitiate {
            to: self.key.peer.clone(),
            sid: self.key.sid.clone(),
            description: description.clone(),
        }];
        self.local_description = Some(description);
        self.state = SessionState::Initiating;
        actions.extend(self.flush_deferred());
        Ok(actions)
    }

    /// Send our answer to the remote offer.
    pub fn accept(
        &mut self,
        description: SessionDescription,
    ) -> Result<Vec<OutboundAction>, CallError> {
        self.ensure(
            "accept",
            self.state == SessionState::Initiated && self.role == Role::Responder,
        )?;
        let mut actions = vec![OutboundAction::SessionAccept {
            to: self.key.peer.clone(),
            sid: self.key.sid.clone(),
            description: description.clone(),
        }];
        self.local_description = Some(description);
        self.state = SessionState::Accepted;
        actions.extend(self.flush_deferred());
        Ok(actions)
    }

    /// Commit the remote offer and replay candidates that arrived before it.
    pub fn remote_initiate(
        &mut self,
        from: &Jid,
        description: SessionDescription,
    ) -> Result<Vec<RemoteCandidate>, CallError> {
        self.ensure(
            "remote_initiate",
            self.state == SessionState::Created && self.role == Role::Responder,
        )?;
        if !self.key.peer.has_resource() {
            self.key.peer = from.clone();
        }
        self.remote_description = Some(description);
        self.state = SessionState::Initiated;
        Ok(self.replay_remote())
    }

    /// Commit the remote answer and replay candidates that arrived before it.
    pub fn remote_accept(
        &mut self,
        description: SessionDescription,
    ) -> Result<Vec<RemoteCandidate>, CallError> {
        self.ensure(
            "remote_accept",
            self.state == SessionState::Initiating && self.role == Role::Initiator,
        )?;
        self.remote_description = Some(description);
        self.state = SessionState::Accepted;
        Ok(self.replay_remote())
    }

    /// Buffer a remote candidate, or resolve it when the remote description
    /// is already known.
    pub fn add_remote_candidate(
        &mut self,
        content_name: &str,
        candidate: Candidate,
    ) -> Result<Option<RemoteCandidate>, CallError> {
        self.ensure("add_remote_candidate", !self.state.is_terminal())?;
        match &self.remote_description {
            None => {
                self.pending_remote.push((content_name.to_string(), candidate));
                Ok(None)
            }
            Some(description) => resolve_remote(description, content_name, candidate).map(Some),
        }
    }

    fn replay_remote(&mut self) -> Vec<RemoteCandidate> {
        let Some(description) = &self.remote_description else {
            return Vec::new();
        };
        let pending = std::mem::take(&mut self.pending_remote);
        let mut ready = Vec::with_capacity(pending.len());
        for (content_name, candidate) in pending {
            match resolve_remote(description, &content_name, candidate) {
                Ok(remote) => ready.push(remote),
                Err(e) => warn!("Dropping buffered candidate for {}: {}", self.key.sid, e),
            }
        }
        if !ready.is_empty() {
            debug!("Replaying {} buffered candidates for {}", ready.len(), self.key.sid);
        }
        ready
    }

    /// Announce a locally gathered candidate.
    ///
    /// Until the local description is committed the candidate is deferred
    /// and goes out right after the offer or answer.
    pub fn send_local_candidate(
        &mut self,
        candidate: IceCandidate,
        now: Instant,
    ) -> Result<Vec<OutboundAction>, CallError> {
        self.ensure("send_local_candidate", !self.state.is_terminal())?;
        match &self.local_description {
            None => {
                self.deferred_local.push((candidate, now));
                Ok(Vec::new())
            }
            Some(description) => Ok(vec![self.transport_info(description, candidate)?]),
        }
    }

    /// Drop deferred local candidates older than `grace`.
    pub fn expire_deferred(&mut self, now: Instant, grace: Duration) -> usize {
        let before = self.deferred_local.len();
        self.deferred_local
            .retain(|(_, queued_at)| now.saturating_duration_since(*queued_at) < grace);
        before - self.deferred_local.len()
    }

    fn flush_deferred(&mut self) -> Vec<OutboundAction> {
        let Some(description) = &self.local_description else {
            return Vec::new();
        };
        let deferred = std::mem::take(&mut self.deferred_local);
        let mut actions = Vec::with_capacity(deferred.len());
        for (candidate, _) in deferred {
            match self.transport_info(description, candidate) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Dropping deferred candidate for {}: {}", self.key.sid, e),
            }
        }
        actions
    }

    fn transport_info(
        &self,
        description: &SessionDescription,
        candidate: IceCandidate,
    ) -> Result<OutboundAction, CallError> {
        let by_index = candidate
            .sdp_m_line_index
            .and_then(|index| description.contents.get(usize::from(index)));
        let content = match by_index {
            Some(content) => content,
            None => {
                let mid = candidate.sdp_mid.as_deref().unwrap_or_default();
                description
                    .resolve_content(mid)
                    .and_then(|index| description.contents.get(index))
                    .ok_or_else(|| CallError::UnknownContent(mid.to_string()))?
            }
        };
        Ok(OutboundAction::TransportInfo {
            to: self.key.peer.clone(),
            sid: self.key.sid.clone(),
            content_name: content.name.clone(),
            candidates: vec![candidate.candidate],
        })
    }

    /// Ring the peer's resources with a bare-addressed propose.
    pub fn propose(&mut self, media: Vec<MediaKind>) -> Result<Vec<OutboundAction>, CallError> {
        self.ensure(
            "propose",
            self.state == SessionState::Created
                && self.role == Role::Initiator
                && self.style == Style::MessageInitiation
                && !self.proposed,
        )?;
        self.proposed = true;
        self.proposed_media = media.clone();
        Ok(vec![OutboundAction::MessageInitiation {
            to: self.key.peer.to_bare().into(),
            id: self.key.sid.clone(),
            action: MessageInitiationAction::Propose { media },
        }])
    }

    /// Record an incoming propose.
    pub fn remote_propose(&mut self, media: Vec<MediaKind>) {
        self.proposed_media = media;
    }

    /// Accept a propose: silence our other resources, then tell the caller
    /// to go ahead with the handshake.
    pub fn proceed(&mut self) -> Result<Vec<OutboundAction>, CallError> {
        self.ensure(
            "proceed",
            self.state == SessionState::Created
                && self.role == Role::Responder
                && self.style == Style::MessageInitiation
                && !self.proceeded,
        )?;
        self.proceeded = true;
        Ok(vec![
            OutboundAction::MessageInitiation {
                to: self.key.account.clone().into(),
                id: self.key.sid.clone(),
                action: MessageInitiationAction::Accept,
            },
            OutboundAction::MessageInitiation {
                to: self.key.peer.clone(),
                id: self.key.sid.clone(),
                action: MessageInitiationAction::Proceed,
            },
        ])
    }

    /// The peer resource `from` picked up our propose.
    pub fn remote_proceed(&mut self, from: &Jid) -> Result<(), CallError> {
        self.ensure(
            "remote_proceed",
            self.state == SessionState::Created
                && self.role == Role::Initiator
                && self.style == Style::MessageInitiation
                && !self.proceeded,
        )?;
        self.proceeded = true;
        self.key.peer = from.clone();
        Ok(())
    }

    /// Withdraw our propose.
    pub fn retract(&mut self) -> Result<Vec<OutboundAction>, CallError> {
        self.ensure(
            "retract",
            self.style == Style::MessageInitiation && self.role == Role::Initiator,
        )?;
        Ok(self.terminate(TerminationReason::Cancel))
    }

    /// Refuse a propose.
    pub fn reject(&mut self) -> Result<Vec<OutboundAction>, CallError> {
        self.ensure(
            "reject",
            self.style == Style::MessageInitiation && self.role == Role::Responder,
        )?;
        Ok(self.terminate(TerminationReason::Decline))
    }

    pub fn decline(&mut self) -> Vec<OutboundAction> {
        self.terminate(TerminationReason::Decline)
    }

    /// End the session locally. Repeated calls emit nothing.
    pub fn terminate(&mut self, reason: TerminationReason) -> Vec<OutboundAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        let action = match (self.state, self.style) {
            (SessionState::Created, Style::MessageInitiation) if !self.proceeded => {
                let action = match self.role {
                    Role::Initiator if self.proposed => Some(MessageInitiationAction::Retract),
                    Role::Initiator => None,
                    Role::Responder => Some(MessageInitiationAction::Reject),
                };
                action.map(|action| OutboundAction::MessageInitiation {
                    to: self.key.peer.clone(),
                    id: self.key.sid.clone(),
                    action,
                })
            }
            (SessionState::Created, Style::Jingle) => None,
            _ => Some(OutboundAction::SessionTerminate {
                to: self.key.peer.clone(),
                sid: self.key.sid.clone(),
                reason,
            }),
        };
        self.state = SessionState::Terminated;
        self.termination = Some(reason);
        self.pending_remote.clear();
        self.deferred_local.clear();
        action.into_iter().collect()
    }

    /// The peer ended the session. Returns `false` if it already had.
    pub fn remote_terminated(&mut self, reason: TerminationReason) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Terminated;
        self.termination = Some(reason);
        self.pending_remote.clear();
        self.deferred_local.clear();
        true
    }
}

fn resolve_remote(
    description: &SessionDescription,
    content_name: &str,
    candidate: Candidate,
) -> Result<RemoteCandidate, CallError> {
    let index = description
        .resolve_content(content_name)
        .ok_or_else(|| CallError::UnknownContent(content_name.to_string()))?;
    let m_line_index =
        u16::try_from(index).map_err(|_| CallError::UnknownContent(content_name.to_string()))?;
    Ok(RemoteCandidate {
        content_name: description.contents[index].name.clone(),
        m_line_index,
        candidate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::{Content, RtpDescription, Senders};

    fn account() -> BareJid {
        "romeo@montague.lit".parse().unwrap()
    }

    fn peer() -> Jid {
        "juliet@capulet.lit/balcony".parse().unwrap()
    }

    fn description(names: &[&str]) -> SessionDescription {
        let contents = names
            .iter()
            .map(|name| Content {
                name: name.to_string(),
                creator: Role::Initiator,
                senders: Senders::Both,
                description: RtpDescription {
                    media: name.to_string(),
                    ..Default::default()
                },
                transport: None,
            })
            .collect();
        SessionDescription::new("1", contents, None)
    }

    fn candidate(foundation: &str) -> Candidate {
        Candidate::host(foundation, 2130706431, "10.0.0.1", 5000)
    }

    fn session(role: Role, style: Style) -> Session {
        Session::new(1, SessionKey::new(account(), peer(), "s1"), role, style)
    }

    #[test]
    fn test_candidate_before_description() {
        let mut s = session(Role::Responder, Style::Jingle);
        assert_eq!(s.add_remote_candidate("audio", candidate("1")).unwrap(), None);
        assert_eq!(s.pending_remote_candidates(), 1);

        let replayed = s.remote_initiate(&peer(), description(&["audio"])).unwrap();
        assert_eq!(
            replayed,
            vec![RemoteCandidate {
                content_name: "audio".into(),
                m_line_index: 0,
                candidate: candidate("1"),
            }]
        );
        assert_eq!(s.pending_remote_candidates(), 0);
        assert_eq!(s.state(), SessionState::Initiated);
    }

    #[test]
    fn test_buffered_replay_is_ordered_and_happens_once() {
        let mut s = session(Role::Initiator, Style::Jingle);
        s.initiate(description(&["audio", "video"])).unwrap();
        s.add_remote_candidate("video", candidate("1")).unwrap();
        s.add_remote_candidate("audio", candidate("2")).unwrap();
        s.add_remote_candidate("video", candidate("3")).unwrap();

        let replayed = s.remote_accept(description(&["audio", "video"])).unwrap();
        let order: Vec<_> = replayed
            .iter()
            .map(|r| (r.candidate.foundation.as_str(), r.m_line_index))
            .collect();
        assert_eq!(order, vec![("1", 1), ("2", 0), ("3", 1)]);

        let late = s.add_remote_candidate("audio", candidate("4")).unwrap().unwrap();
        assert_eq!(late.candidate.foundation, "4");
        assert_eq!(s.pending_remote_candidates(), 0);
    }

    #[test]
    fn test_positional_fallback_resolution() {
        let mut s = session(Role::Responder, Style::Jingle);
        s.remote_initiate(&peer(), description(&["0", "1"])).unwrap();
        let r = s.add_remote_candidate("1", candidate("1")).unwrap().unwrap();
        assert_eq!(r.m_line_index, 1);
        assert!(matches!(
            s.add_remote_candidate("screen", candidate("2")),
            Err(CallError::UnknownContent(_))
        ));

        let mut single = session(Role::Responder, Style::Jingle);
        single.remote_initiate(&peer(), description(&["a0"])).unwrap();
        let r = single.add_remote_candidate("audio", candidate("1")).unwrap().unwrap();
        assert_eq!((r.content_name.as_str(), r.m_line_index), ("a0", 0));
    }

    #[test]
    fn test_initiate_only_from_created() {
        let mut s = session(Role::Initiator, Style::Jingle);
        let actions = s.initiate(description(&["audio"])).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name(), "session-initiate");
        assert_eq!(s.state(), SessionState::Initiating);
        assert!(matches!(
            s.initiate(description(&["audio"])),
            Err(CallError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_accept_only_from_initiated() {
        let mut s = session(Role::Responder, Style::Jingle);
        assert!(s.accept(description(&["audio"])).is_err());
        s.remote_initiate(&peer(), description(&["audio"])).unwrap();
        let actions = s.accept(description(&["audio"])).unwrap();
        assert_eq!(actions[0].name(), "session-accept");
        assert_eq!(s.state(), SessionState::Accepted);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut s = session(Role::Initiator, Style::Jingle);
        s.initiate(description(&["audio"])).unwrap();
        let first = s.terminate(TerminationReason::Success);
        assert_eq!(
            first,
            vec![OutboundAction::SessionTerminate {
                to: peer(),
                sid: "s1".into(),
                reason: TerminationReason::Success,
            }]
        );
        assert!(s.terminate(TerminationReason::Success).is_empty());
        assert!(s.decline().is_empty());
        assert_eq!(s.termination(), Some(TerminationReason::Success));
        assert!(s.add_remote_candidate("audio", candidate("1")).is_err());
    }

    #[test]
    fn test_local_candidate_deferred_until_offer() {
        let mut s = session(Role::Initiator, Style::Jingle);
        let now = Instant::now();
        let c = IceCandidate::new(candidate("1")).with_sdp_m_line_index(1);
        assert!(s.send_local_candidate(c, now).unwrap().is_empty());
        assert_eq!(s.deferred_local_candidates(), 1);

        let actions = s.initiate(description(&["audio", "video"])).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            &actions[1],
            OutboundAction::TransportInfo { content_name, .. } if content_name == "video"
        ));

        let c = IceCandidate::new(candidate("2")).with_sdp_mid("audio");
        let actions = s.send_local_candidate(c, now).unwrap();
        assert!(matches!(
            &actions[0],
            OutboundAction::TransportInfo { content_name, .. } if content_name == "audio"
        ));
    }

    #[test]
    fn test_expire_deferred() {
        let mut s = session(Role::Initiator, Style::Jingle);
        let start = Instant::now();
        s.send_local_candidate(IceCandidate::new(candidate("1")), start)
            .unwrap();
        s.send_local_candidate(
            IceCandidate::new(candidate("2")),
            start + Duration::from_secs(2),
        )
        .unwrap();
        let dropped = s.expire_deferred(start + Duration::from_secs(3), Duration::from_secs(2));
        assert_eq!(dropped, 1);
        assert_eq!(s.deferred_local_candidates(), 1);
    }

    #[test]
    fn test_message_initiation_outgoing() {
        let key = SessionKey::new(account(), peer().to_bare().into(), "m1");
        let mut s = Session::new(1, key, Role::Initiator, Style::MessageInitiation);

        assert!(s.initiate(description(&["audio"])).is_err());
        let actions = s.propose(vec![MediaKind::Audio]).unwrap();
        assert_eq!(actions[0].to(), &Jid::from(peer().to_bare()));
        assert_eq!(actions[0].name(), "propose");

        s.remote_proceed(&peer()).unwrap();
        assert_eq!(s.key().peer, peer());
        let actions = s.initiate(description(&["audio"])).unwrap();
        assert_eq!(actions[0].to(), &peer());
    }

    #[test]
    fn test_retract_before_proceed() {
        let key = SessionKey::new(account(), peer().to_bare().into(), "m1");
        let mut s = Session::new(1, key, Role::Initiator, Style::MessageInitiation);
        s.propose(vec![MediaKind::Audio]).unwrap();
        let actions = s.retract().unwrap();
        assert_eq!(actions[0].name(), "retract");
        assert!(s.retract().unwrap().is_empty());
    }

    #[test]
    fn test_proceed_notifies_own_account_then_peer() {
        let mut s = session(Role::Responder, Style::MessageInitiation);
        s.remote_propose(vec![MediaKind::Audio, MediaKind::Video]);
        let actions = s.proceed().unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name(), "accept");
        assert_eq!(actions[0].to(), &Jid::from(account()));
        assert_eq!(actions[1].name(), "proceed");
        assert_eq!(actions[1].to(), &peer());
        assert!(s.proceed().is_err());

        let actions = s.terminate(TerminationReason::Decline);
        assert_eq!(actions[0].name(), "session-terminate");
    }

    #[test]
    fn test_reject_propose() {
        let mut s = session(Role::Responder, Style::MessageInitiation);
        let actions = s.reject().unwrap();
        assert_eq!(actions[0].name(), "reject");
        assert_eq!(s.state(), SessionState::Terminated);
    }

    #[test]
    fn test_remote_terminated_emits_nothing() {
        let mut s = session(Role::Responder, Style::Jingle);
        s.add_remote_candidate("audio", candidate("1")).unwrap();
        assert!(s.remote_terminated(TerminationReason::Gone));
        assert!(!s.remote_terminated(TerminationReason::Gone));
        assert!(s.terminate(TerminationReason::Cancel).is_empty());
        assert_eq!(s.pending_remote_candidates(), 0);
    }
}
