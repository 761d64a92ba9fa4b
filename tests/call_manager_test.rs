mod common;

use common::*;
use jingle_rust::calls::{
    Call, CallEvent, CallHandle, CallState, ConnectionState, MediaEvent, Publisher,
};
use jingle_rust::caps::Feature;
use jingle_rust::error::CallError;
use jingle_rust::jid::Jid;
use jingle_rust::jingle::{
    InboundEvent, MediaKind, MessageInitiationAction, OutboundAction, TerminationReason,
};
use jingle_rust::sdp::IceCandidate;
use std::time::Duration;

fn is_terminate(action: &OutboundAction) -> bool {
    matches!(action, OutboundAction::SessionTerminate { .. })
}

fn is_initiate(action: &OutboundAction) -> bool {
    matches!(action, OutboundAction::SessionInitiate { .. })
}

fn is_transport_info(action: &OutboundAction) -> bool {
    matches!(action, OutboundAction::TransportInfo { .. })
}

async fn session_initiate(h: &Harness, from: Jid, sid: &str) {
    h.handle
        .registry()
        .inbound(InboundEvent::SessionInitiate {
            account: account(),
            from,
            sid: sid.to_string(),
            description: audio_description("9"),
        })
        .await
        .unwrap();
}

async fn ringing_incoming(h: &mut Harness, from: Jid, sid: &str) -> CallHandle {
    session_initiate(h, from, sid).await;
    wait_for_call(&mut h.events, |c| c.state.is_ringing())
        .await
        .handle
}

async fn connected_incoming(h: &mut Harness, from: Jid, sid: &str) -> CallHandle {
    let handle = ringing_incoming(h, from, sid).await;
    h.handle.answer(&handle).await.unwrap();
    h.transport
        .wait_for(|a| matches!(a, OutboundAction::SessionAccept { .. }))
        .await;
    h.peer_connection()
        .await
        .emit(MediaEvent::ConnectionStateChanged(ConnectionState::Connected));
    wait_for_call(&mut h.events, |c| c.state.is_connected()).await;
    handle
}

#[tokio::test]
async fn test_only_one_current_call() {
    let _ = env_logger::builder().is_test(true).try_init();
    let h = Harness::new();

    let first = Call::new_incoming(account(), juliet("balcony"), "s1", vec![MediaKind::Audio]);
    let handle = h.handle.report_incoming(first).await.unwrap();

    let second = Call::new_incoming(account(), juliet("garden"), "s2", vec![MediaKind::Audio]);
    assert_eq!(
        h.handle.report_incoming(second).await,
        Err(CallError::Conflict)
    );
    let outgoing = Call::new_outgoing(account(), juliet_bare(), vec![MediaKind::Audio]);
    assert_eq!(
        h.handle.report_outgoing(outgoing).await,
        Err(CallError::Conflict)
    );
    assert_eq!(
        h.handle
            .start_call(account(), juliet_bare(), vec![MediaKind::Audio])
            .await,
        Err(CallError::Conflict)
    );

    let current = h.current().await.unwrap();
    assert_eq!(current.handle, handle);
    assert!(current.state.is_ringing());
    assert_eq!(h.telephony.count("incoming:"), 1);
}

#[tokio::test]
async fn test_incoming_without_permission_is_declined() {
    let _ = env_logger::builder().is_test(true).try_init();
    let h = Harness::new();
    h.media.deny_permission();

    let call = Call::new_incoming(account(), juliet("balcony"), "s0", vec![MediaKind::Audio]);
    assert_eq!(
        h.handle.report_incoming(call).await,
        Err(CallError::Unauthorized)
    );

    session_initiate(&h, juliet("balcony"), "s1").await;
    let declined = h.transport.wait_for(is_terminate).await;
    assert!(matches!(
        declined,
        OutboundAction::SessionTerminate {
            reason: TerminationReason::Decline,
            ..
        }
    ));
    assert!(h.current().await.is_none());
    assert_eq!(h.handle.registry().len().await.unwrap(), 0);
    assert_eq!(h.telephony.count("incoming:"), 0);
}

#[tokio::test]
async fn test_incoming_call_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();

    let handle = ringing_incoming(&mut h, juliet("balcony"), "s1").await;
    assert_eq!(h.telephony.count("incoming:"), 1);
    assert_eq!(h.handle.registry().len().await.unwrap(), 1);

    h.handle.answer(&handle).await.unwrap();
    let call = h.current().await.unwrap();
    assert!(matches!(call.state, CallState::Connecting { .. }));

    let accept = h
        .transport
        .wait_for(|a| matches!(a, OutboundAction::SessionAccept { .. }))
        .await;
    assert_eq!(accept.to(), &juliet("balcony"));
    assert_eq!(accept.sid(), "s1");
    assert!(h.media.log().starts_with(&[
        "capture".to_string(),
        "create_pc".to_string(),
        "add_tracks".to_string(),
        "set_remote:Offer".to_string(),
        "create_answer".to_string(),
        "set_local:Answer".to_string(),
    ]));

    h.peer_connection()
        .await
        .emit(MediaEvent::ConnectionStateChanged(ConnectionState::Connected));
    wait_for_call(&mut h.events, |c| c.state.is_connected()).await;

    h.handle.end(&handle).await.unwrap();
    assert!(h.current().await.is_none());
    assert_eq!(h.handle.registry().len().await.unwrap(), 0);

    let ended = wait_for_call(&mut h.events, |c| c.state.is_ended()).await;
    assert_eq!(ended.handle, handle);
    assert!(matches!(
        ended.state,
        CallState::Ended {
            reason: TerminationReason::Success,
            duration_secs: Some(_),
            ..
        }
    ));
    let terminate = h.transport.wait_for(is_terminate).await;
    assert!(matches!(
        terminate,
        OutboundAction::SessionTerminate {
            reason: TerminationReason::Success,
            ..
        }
    ));
    assert_eq!(h.media.count("close"), 1);
    assert_eq!(h.media.count("stop_capture"), 1);
    assert_eq!(h.telephony.count("end:"), 1);
}

#[tokio::test]
async fn test_remote_candidates_wait_for_local_answer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    let transport_info = |foundation: &str| InboundEvent::TransportInfo {
        account: account(),
        from: juliet("balcony"),
        sid: "s1".into(),
        content_name: "audio".into(),
        candidates: vec![candidate(foundation, 5000)],
    };

    // Candidate overtakes the offer.
    h.handle.registry().inbound(transport_info("c1")).await.unwrap();
    let handle = ringing_incoming(&mut h, juliet("balcony"), "s1").await;
    h.handle.registry().inbound(transport_info("c2")).await.unwrap();

    h.handle.answer(&handle).await.unwrap();
    wait_until(|| h.media.position("candidate:c2").is_some()).await;

    let answer = h.media.position("set_local:Answer").unwrap();
    let c1 = h.media.position("candidate:c1").unwrap();
    let c2 = h.media.position("candidate:c2").unwrap();
    assert!(answer < c1);
    assert!(c1 < c2);
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    let handle = ringing_incoming(&mut h, juliet("balcony"), "s1").await;

    let (first, second) = tokio::join!(h.handle.end(&handle), h.handle.end(&handle));
    first.unwrap();
    second.unwrap();

    let terminate = h.transport.wait_for(is_terminate).await;
    assert!(matches!(
        terminate,
        OutboundAction::SessionTerminate {
            reason: TerminationReason::Decline,
            ..
        }
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.count(is_terminate), 1);
    assert_eq!(h.telephony.count("end:"), 1);

    h.handle.end(&handle).await.unwrap();
    assert_eq!(h.telephony.count("end:"), 1);
    assert!(h.current().await.is_none());
}

#[tokio::test]
async fn test_busy_while_in_call() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    let first = connected_incoming(&mut h, juliet("balcony"), "s1").await;

    let nurse: Jid = "nurse@capulet.lit/kitchen".parse().unwrap();
    session_initiate(&h, nurse.clone(), "s2").await;

    let busy = h
        .transport
        .wait_for(|a| is_terminate(a) && a.sid() == "s2")
        .await;
    assert_eq!(busy.to(), &nurse);
    assert!(matches!(
        busy,
        OutboundAction::SessionTerminate {
            reason: TerminationReason::Busy,
            ..
        }
    ));

    let current = h.current().await.unwrap();
    assert_eq!(current.handle, first);
    assert!(current.state.is_connected());
    assert_eq!(h.handle.registry().len().await.unwrap(), 1);
    assert_eq!(h.telephony.count("incoming:"), 1);
}

#[tokio::test]
async fn test_outgoing_fan_out_first_accept_wins() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    h.advertise(&juliet("phone"), &[Feature::Audio]);
    h.advertise(&juliet("laptop"), &[Feature::Audio]);

    let handle = h
        .handle
        .start_call(account(), juliet_bare(), vec![MediaKind::Audio])
        .await
        .unwrap();
    wait_until(|| h.transport.count(is_initiate) == 2).await;
    assert_eq!(h.telephony.count("start:"), 1);
    let sid = h.current().await.unwrap().sid;

    // Trickled to every ringing resource.
    let pc = h.peer_connection().await;
    pc.emit(MediaEvent::LocalCandidate(
        IceCandidate::new(candidate("l1", 6000)).with_sdp_m_line_index(0),
    ));
    wait_until(|| h.transport.count(is_transport_info) == 2).await;

    h.handle
        .registry()
        .inbound(InboundEvent::SessionAccept {
            account: account(),
            from: juliet("phone"),
            sid: sid.clone(),
            description: audio_description("303"),
        })
        .await
        .unwrap();

    let call = wait_for_call(&mut h.events, |c| {
        matches!(c.state, CallState::Connecting { .. })
    })
    .await;
    assert_eq!(call.handle, handle);
    assert_eq!(call.peer, juliet("phone"));

    let superseded = h
        .transport
        .wait_for(|a| is_terminate(a) && a.to() == &juliet("laptop"))
        .await;
    assert!(matches!(
        superseded,
        OutboundAction::SessionTerminate {
            reason: TerminationReason::Superseded,
            ..
        }
    ));

    wait_until(|| h.media.position("set_remote:Answer").is_some()).await;
    assert!(h.media.position("set_local:Offer") < h.media.position("set_remote:Answer"));

    pc.emit(MediaEvent::LocalCandidate(
        IceCandidate::new(candidate("l2", 6001)).with_sdp_m_line_index(0),
    ));
    wait_until(|| h.transport.count(is_transport_info) == 3).await;
    let last = h
        .transport
        .sent()
        .into_iter()
        .filter(is_transport_info)
        .last()
        .unwrap();
    assert_eq!(last.to(), &juliet("phone"));

    pc.emit(MediaEvent::ConnectionStateChanged(ConnectionState::Connected));
    wait_for_call(&mut h.events, |c| c.state.is_connected()).await;
    wait_until(|| h.telephony.count("connected:") == 1).await;
}

#[tokio::test]
async fn test_outgoing_with_message_initiation() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    h.advertise(
        &juliet("phone"),
        &[Feature::Audio, Feature::MessageInitiation],
    );

    h.handle
        .start_call(account(), juliet_bare(), vec![MediaKind::Audio])
        .await
        .unwrap();
    let sid = h.current().await.unwrap().sid;

    let propose = h
        .transport
        .wait_for(|a| {
            matches!(
                a,
                OutboundAction::MessageInitiation {
                    action: MessageInitiationAction::Propose { .. },
                    ..
                }
            )
        })
        .await;
    assert_eq!(propose.to(), &juliet_bare());
    assert_eq!(h.media.count("create_pc"), 0);

    h.handle
        .registry()
        .inbound(InboundEvent::MessageInitiation {
            account: account(),
            from: juliet("phone"),
            id: sid.clone(),
            action: MessageInitiationAction::Proceed,
        })
        .await
        .unwrap();

    let initiate = h.transport.wait_for(is_initiate).await;
    assert_eq!(initiate.to(), &juliet("phone"));
    assert_eq!(initiate.sid(), sid);

    h.handle
        .registry()
        .inbound(InboundEvent::SessionAccept {
            account: account(),
            from: juliet("phone"),
            sid,
            description: audio_description("303"),
        })
        .await
        .unwrap();
    let call = wait_for_call(&mut h.events, |c| {
        matches!(c.state, CallState::Connecting { .. })
    })
    .await;
    assert_eq!(call.peer, juliet("phone"));
}

#[tokio::test]
async fn test_peer_declines_outgoing_call() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    h.advertise(&juliet("phone"), &[Feature::Audio]);

    let handle = h
        .handle
        .start_call(account(), juliet_bare(), vec![MediaKind::Audio])
        .await
        .unwrap();
    let initiate = h.transport.wait_for(is_initiate).await;

    h.handle
        .registry()
        .inbound(InboundEvent::SessionTerminate {
            account: account(),
            from: juliet("phone"),
            sid: initiate.sid().to_string(),
            reason: TerminationReason::Decline,
        })
        .await
        .unwrap();

    let ended = wait_for_call(&mut h.events, |c| c.state.is_ended()).await;
    assert_eq!(ended.handle, handle);
    assert!(h.current().await.is_none());
    assert!(
        h.telephony
            .log()
            .contains(&format!("ended:{}:RemoteEnded", handle))
    );
    assert_eq!(h.transport.count(is_terminate), 0);
    assert_eq!(h.media.count("close"), 1);
}

#[tokio::test]
async fn test_unreachable_peer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let h = Harness::new();
    h.advertise(&juliet("phone"), &[Feature::FileTransfer]);

    let result = h
        .handle
        .start_call(account(), juliet_bare(), vec![MediaKind::Audio])
        .await;
    assert!(matches!(result, Err(CallError::PeerUnreachable(_))));
    assert!(h.current().await.is_none());
    assert!(h.telephony.log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    let handle = ringing_incoming(&mut h, juliet("balcony"), "s1").await;

    tokio::time::sleep(Duration::from_secs(46)).await;

    assert!(h.current().await.is_none());
    assert!(
        h.telephony
            .log()
            .contains(&format!("ended:{}:Unanswered", handle))
    );
    let terminate = h.transport.wait_for(is_terminate).await;
    assert!(matches!(
        terminate,
        OutboundAction::SessionTerminate {
            reason: TerminationReason::Timeout,
            ..
        }
    ));
}

#[tokio::test]
async fn test_mute_connected_call() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    let handle = connected_incoming(&mut h, juliet("balcony"), "s1").await;

    h.handle.mute(&handle, true).await.unwrap();

    assert!(h.media.log().contains(&"audio:false".to_string()));
    assert!(
        h.telephony
            .log()
            .contains(&format!("mute:{}:true", handle))
    );
    let current = h.current().await.unwrap();
    assert!(matches!(current.state, CallState::Connected { muted: true, .. }));

    let stale = CallHandle::new("stale");
    assert!(matches!(
        h.handle.mute(&stale, false).await,
        Err(CallError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_meet_tracks_publishers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut h = Harness::new();
    let room: Jid = "focus@meet.capulet.lit".parse().unwrap();

    let handle = h
        .handle
        .start_meet(account(), room.clone(), vec![MediaKind::Audio])
        .await
        .unwrap();
    let initiate = h.transport.wait_for(is_initiate).await;
    assert_eq!(initiate.to(), &room);
    let sid = initiate.sid().to_string();

    h.handle
        .registry()
        .inbound(InboundEvent::PublishersChanged {
            account: account(),
            room: room.clone(),
            sid,
            added: vec![Publisher::new(juliet("a"), vec!["a1".into()])],
            removed: vec![],
        })
        .await
        .unwrap();

    let publishers = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(CallEvent::PublishersChanged { publishers, .. }) = h.events.recv().await {
                return publishers;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(publishers.len(), 1);
    assert_eq!(publishers[0].jid, juliet("a"));

    h.handle.end(&handle).await.unwrap();
    let ended = wait_for_call(&mut h.events, |c| c.state.is_ended()).await;
    assert!(!ended.meet().unwrap().is_active());
}

async fn contact_offline(h: &Harness, peer: Jid) {
    h.handle
        .registry()
        .inbound(InboundEvent::ContactAvailabilityChanged {
            account: account(),
            peer,
            available: false,
        })
        .await
        .unwrap();
}

/// One of two ringing resources goes offline, then the whole contact.
async fn ends_when_contact_leaves(mut h: Harness) {
    let handle = h.current().await.unwrap().handle;

    contact_offline(&h, juliet("laptop")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.registry().len().await.unwrap(), 1);
    let call = h.current().await.unwrap();
    assert_eq!(call.handle, handle);
    assert!(call.state.is_ringing());
    assert_eq!(h.telephony.count("ended:"), 0);

    contact_offline(&h, juliet_bare()).await;
    let call = wait_for_call(&mut h.events, |c| c.state.is_ended()).await;
    assert_eq!(call.handle, handle);
    assert!(matches!(
        call.state,
        CallState::Ended {
            reason: TerminationReason::Gone,
            ..
        }
    ));
    assert!(h.current().await.is_none());
    assert_eq!(h.handle.registry().len().await.unwrap(), 0);
    assert_eq!(h.telephony.count("ended:"), 1);
}

#[tokio::test]
async fn test_fan_out_survives_one_resource_going_offline() {
    let _ = env_logger::builder().is_test(true).try_init();
    let h = Harness::new();
    h.advertise(&juliet("phone"), &[Feature::Audio]);
    h.advertise(&juliet("laptop"), &[Feature::Audio]);

    h.handle
        .start_call(account(), juliet_bare(), vec![MediaKind::Audio])
        .await
        .unwrap();
    wait_until(|| h.transport.count(is_initiate) == 2).await;

    ends_when_contact_leaves(h).await;
}

#[tokio::test]
async fn test_propose_survives_one_resource_going_offline() {
    let _ = env_logger::builder().is_test(true).try_init();
    let h = Harness::new();
    for resource in ["phone", "laptop"] {
        h.advertise(
            &juliet(resource),
            &[Feature::Audio, Feature::MessageInitiation],
        );
    }

    h.handle
        .start_call(account(), juliet_bare(), vec![MediaKind::Audio])
        .await
        .unwrap();
    h.transport
        .wait_for(|a| matches!(a, OutboundAction::MessageInitiation { .. }))
        .await;

    ends_when_contact_leaves(h).await;
}
