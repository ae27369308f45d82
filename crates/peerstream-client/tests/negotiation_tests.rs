//! Negotiation Tests (peerstream-client)
//!
//! Tests for offer/answer sequencing between the rendezvous channel and the
//! peer session:
//! - Remote description and answer exchange
//! - Candidate buffering and ordering
//! - Offers queued behind an in-flight negotiation
//! - Negotiation failures and stale results after teardown
//! - Malformed and out-of-state messages

use peerstream_client::{SessionEvent, SessionState};
use peerstream_core::signaling::{IceServer, IceUrls};
use peerstream_core::{
    Flag, IceCandidate, InboundMessage, OutboundMessage, PeerConnectionOptions, Settings,
};
use peerstream_test_utils::{
    drain_events, settle, wait_for, PeerCall, TestSession, DEFAULT_CHECK_INTERVAL,
    DEFAULT_TIMEOUT,
};
use peerstream_transport::ConnectivityState;
use std::time::Duration;

fn candidate(n: u8) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

fn offer(sdp: &str) -> InboundMessage {
    InboundMessage::Offer {
        sdp: sdp.to_string(),
    }
}

// ============================================================================
// Offer / Answer
// ============================================================================

#[tokio::test]
async fn test_offer_sets_exact_description_and_answers() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;

    let sdp = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n";
    session.server.push(&offer(sdp));
    session.expect_state(SessionState::Negotiating).await;
    session
        .expect("sdp exchange", |e| *e == SessionEvent::SdpExchanged)
        .await;

    let peer = session.peers.latest().unwrap();
    assert_eq!(
        peer.calls(),
        vec![PeerCall::SetRemoteOffer(sdp.to_string()), PeerCall::CreateAnswer]
    );
    assert_eq!(
        session.server.sent_of_kind("answer"),
        vec![OutboundMessage::Answer {
            sdp: "answer-1".to_string()
        }]
    );
}

#[tokio::test]
async fn test_connectivity_moves_to_connected_once() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;
    let peer = session.negotiate("offer-1").await;

    peer.connect();
    session.expect_state(SessionState::Connected).await;
    session
        .expect("connected", |e| *e == SessionEvent::Connected)
        .await;

    peer.connect();
    let events = drain_events(&mut session.events, Duration::from_millis(50)).await;
    assert!(
        !events.contains(&SessionEvent::Connected),
        "second connected event in {:?}",
        events
    );
}

#[tokio::test]
async fn test_offer_without_config_creates_default_peer() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;
    session
        .server
        .push(&InboundMessage::StreamerList {
            ids: vec!["streamer-1".to_string()],
        });
    session.expect_state(SessionState::Subscribed).await;
    assert_eq!(session.peers.created(), 0);

    session.negotiate("offer-1").await;
    assert_eq!(session.peers.created(), 1);
    assert_eq!(session.peers.options(), vec![PeerConnectionOptions::default()]);
}

#[tokio::test]
async fn test_config_options_reach_peer_session() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;

    let options = PeerConnectionOptions {
        ice_servers: vec![IceServer {
            urls: IceUrls::One("stun:stun.example.org:19302".to_string()),
            username: None,
            credential: None,
        }],
        ..Default::default()
    };
    session.server.push(&InboundMessage::Config {
        peer_connection_options: options.clone(),
    });

    let peers = session.peers.clone();
    assert!(
        wait_for(
            move || {
                let peers = peers.clone();
                async move { peers.created() == 1 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
    assert_eq!(session.peers.options(), vec![options]);
}

#[tokio::test]
async fn test_force_turn_requests_relay_policy() {
    let settings = Settings::new();
    settings.set_flag(Flag::ForceTurn, true);
    let mut session = TestSession::start_with(settings, |builder| builder);
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;

    let options = session.peers.options();
    assert_eq!(options.len(), 1);
    assert!(options[0].relay_only());
}

// ============================================================================
// Candidates
// ============================================================================

#[tokio::test]
async fn test_candidates_before_offer_applied_after_answer_in_order() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;

    for n in 1..=3 {
        session.server.push(&InboundMessage::IceCandidate {
            candidate: candidate(n),
        });
    }
    settle().await;
    let peer = session.peers.latest().unwrap();
    assert!(peer.applied_candidates().is_empty());

    session.negotiate("offer-1").await;

    let watched = peer.clone();
    assert!(
        wait_for(
            move || {
                let watched = watched.clone();
                async move { watched.applied_candidates().len() == 3 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
    assert_eq!(
        peer.calls(),
        vec![
            PeerCall::SetRemoteOffer("offer-1".to_string()),
            PeerCall::CreateAnswer,
            PeerCall::AddCandidate(candidate(1)),
            PeerCall::AddCandidate(candidate(2)),
            PeerCall::AddCandidate(candidate(3)),
        ]
    );
}

#[tokio::test]
async fn test_candidates_after_answer_applied_directly() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;
    let peer = session.negotiate("offer-1").await;

    session.server.push(&InboundMessage::IceCandidate {
        candidate: candidate(7),
    });

    let watched = peer.clone();
    assert!(
        wait_for(
            move || {
                let watched = watched.clone();
                async move { watched.applied_candidates() == vec![candidate(7)] }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
}

#[tokio::test]
async fn test_candidate_during_answer_generation_waits() {
    let mut session = TestSession::start();
    session.peers.hold_answers(true);
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;

    session.server.push(&offer("offer-1"));
    let peer = session.peers.latest().unwrap();
    let watched = peer.clone();
    assert!(
        wait_for(
            move || {
                let watched = watched.clone();
                async move { watched.calls().contains(&PeerCall::CreateAnswer) }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );

    session.server.push(&InboundMessage::IceCandidate {
        candidate: candidate(1),
    });
    settle().await;
    assert!(peer.applied_candidates().is_empty());

    peer.release_answer();
    session
        .expect("sdp exchange", |e| *e == SessionEvent::SdpExchanged)
        .await;
    settle().await;
    assert_eq!(peer.applied_candidates(), vec![candidate(1)]);
}

#[tokio::test]
async fn test_local_candidates_forwarded() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;
    let peer = session.negotiate("offer-1").await;

    peer.gather_candidate(candidate(9));
    assert!(
        session
            .server
            .wait_for_sent("iceCandidate", 1, DEFAULT_TIMEOUT)
            .await
    );
    assert_eq!(
        session.server.sent_of_kind("iceCandidate"),
        vec![OutboundMessage::IceCandidate {
            candidate: candidate(9)
        }]
    );
}

#[tokio::test]
async fn test_peer_data_channels_opened() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;
    let peer = session.negotiate("offer-1").await;

    session.server.push(&InboundMessage::PeerDataChannels {
        send_stream_id: 2,
        recv_stream_id: 3,
    });

    let watched = peer.clone();
    assert!(
        wait_for(
            move || {
                let watched = watched.clone();
                async move {
                    watched
                        .calls()
                        .contains(&PeerCall::OpenNegotiatedChannels(2, 3))
                }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
}

// ============================================================================
// In-flight Offers
// ============================================================================

#[tokio::test]
async fn test_second_offer_queued_behind_first() {
    let mut session = TestSession::start();
    session.peers.hold_answers(true);
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;

    session.server.push(&offer("offer-1"));
    session.server.push(&offer("offer-2"));
    settle().await;

    let peer = session.peers.latest().unwrap();
    assert_eq!(
        peer.calls(),
        vec![
            PeerCall::SetRemoteOffer("offer-1".to_string()),
            PeerCall::CreateAnswer
        ]
    );

    peer.release_answer();
    session
        .expect("first exchange", |e| *e == SessionEvent::SdpExchanged)
        .await;
    peer.release_answer();
    session
        .expect("second exchange", |e| *e == SessionEvent::SdpExchanged)
        .await;

    assert_eq!(
        peer.calls(),
        vec![
            PeerCall::SetRemoteOffer("offer-1".to_string()),
            PeerCall::CreateAnswer,
            PeerCall::SetRemoteOffer("offer-2".to_string()),
            PeerCall::CreateAnswer,
        ]
    );
    assert_eq!(
        session.server.sent_of_kind("answer"),
        vec![
            OutboundMessage::Answer {
                sdp: "answer-1".to_string()
            },
            OutboundMessage::Answer {
                sdp: "answer-2".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_disconnect_mid_negotiation_discards_result() {
    let mut session = TestSession::start();
    session.peers.hold_answers(true);
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;

    session.server.push(&offer("offer-1"));
    session.expect_state(SessionState::Negotiating).await;
    let peer = session.peers.latest().unwrap();

    session.handle.disconnect().unwrap();
    session
        .expect("disconnected", |e| matches!(e, SessionEvent::Disconnected { .. }))
        .await;
    assert!(peer.is_closed());

    // Nothing from the superseded session may change state
    peer.release_answer();
    peer.connect();
    session.server.push(&InboundMessage::IceCandidate {
        candidate: candidate(1),
    });
    session.server.push(&offer("offer-2"));

    let events = drain_events(&mut session.events, Duration::from_millis(50)).await;
    assert!(events.is_empty(), "unexpected events {:?}", events);
    assert_eq!(session.handle.state(), SessionState::Disconnected);
    assert!(session.server.sent_of_kind("answer").is_empty());
    assert!(peer.applied_candidates().is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_rejected_offer_fails_session() {
    let mut session = TestSession::start();
    session.peers.fail_offers(true);
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;

    session.server.push(&offer("bad offer"));
    let failed = session
        .expect("failure", |e| matches!(e, SessionEvent::Failed { .. }))
        .await;
    let disconnected = session
        .expect("disconnected", |e| matches!(e, SessionEvent::Disconnected { .. }))
        .await;

    assert!(matches!(failed, SessionEvent::Failed { reason } if reason.contains("offer rejected")));
    assert!(matches!(
        disconnected,
        SessionEvent::Disconnected { abnormal: true, .. }
    ));
    assert_eq!(session.handle.state(), SessionState::Disconnected);
    assert!(session.peers.latest().unwrap().is_closed());
    assert!(session.server.sent_of_kind("answer").is_empty());
}

#[tokio::test]
async fn test_rejected_candidate_fails_session() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;
    session.subscribe_to(&["streamer-1"]).await;
    session.negotiate("offer-1").await;

    session.peers.fail_candidates(true);
    session.server.push(&InboundMessage::IceCandidate {
        candidate: candidate(1),
    });

    session
        .expect("failure", |e| matches!(e, SessionEvent::Failed { .. }))
        .await;
    session.expect_state(SessionState::Disconnected).await;
}

#[tokio::test]
async fn test_peer_creation_failure() {
    let mut session = TestSession::start();
    session.peers.fail_create(true);
    session.open_rendezvous().await;

    session.server.push(&InboundMessage::Config {
        peer_connection_options: PeerConnectionOptions::default(),
    });

    session
        .expect("failure", |e| matches!(e, SessionEvent::Failed { .. }))
        .await;
    session.expect_state(SessionState::Disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_failure_is_not_retried() {
    let mut session = TestSession::start();
    let peer = session.connect_fully().await;

    peer.set_connectivity(ConnectivityState::Failed);
    session
        .expect("failure", |e| matches!(e, SessionEvent::Failed { .. }))
        .await;
    session.expect_state(SessionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(session.server.connect_count(), 1);
    assert_eq!(session.handle.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_peer_closed_is_abnormal_disconnect() {
    let mut session = TestSession::start();
    let peer = session.connect_fully().await;

    peer.set_connectivity(ConnectivityState::Closed);
    let event = session
        .expect("disconnected", |e| matches!(e, SessionEvent::Disconnected { .. }))
        .await;
    assert!(matches!(event, SessionEvent::Disconnected { abnormal: true, .. }));
}

#[tokio::test]
async fn test_transient_disconnect_keeps_session() {
    let mut session = TestSession::start();
    let peer = session.connect_fully().await;

    peer.set_connectivity(ConnectivityState::Disconnected);
    settle().await;
    assert_eq!(session.handle.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_replaced_peer_session_events_ignored() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;

    let config = InboundMessage::Config {
        peer_connection_options: PeerConnectionOptions::default(),
    };
    session.server.push(&config);
    assert!(session.peers.wait_for_created(1, DEFAULT_TIMEOUT).await);
    let replaced = session.peers.session(0).unwrap();

    session.server.push(&config);
    assert!(session.peers.wait_for_created(2, DEFAULT_TIMEOUT).await);
    assert!(replaced.is_closed());

    replaced.open_data_channel();
    replaced.set_connectivity(ConnectivityState::Closed);
    settle().await;

    assert_eq!(session.handle.state(), SessionState::AwaitingStreamerList);
    assert!(!session.handle.status().data_channel_open);
    let events = drain_events(&mut session.events, Duration::from_millis(50)).await;
    assert!(
        !events.iter().any(|e| matches!(
            e,
            SessionEvent::Disconnected { .. } | SessionEvent::DataChannelOpen
        )),
        "unexpected events {:?}",
        events
    );

    // The replacement keeps driving the session
    session.server.push(&InboundMessage::StreamerList {
        ids: vec!["streamer-1".to_string()],
    });
    session.expect_state(SessionState::Subscribed).await;
    let live = session.negotiate("offer-1").await;
    assert_eq!(session.peers.created(), 2);
    assert!(!live.is_closed());

    live.connect();
    session
        .expect("connected", |e| *e == SessionEvent::Connected)
        .await;
}

// ============================================================================
// Malformed and Unexpected Messages
// ============================================================================

#[tokio::test]
async fn test_malformed_frames_dropped() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;

    session.server.push_raw("not json at all");
    session.server.push_raw(r#"{"type":"somethingElse"}"#);
    session.server.push_raw(r#"{"type":"offer"}"#);
    settle().await;
    assert_eq!(session.handle.state(), SessionState::AwaitingStreamerList);

    session.subscribe_to(&["streamer-1"]).await;
}

#[tokio::test]
async fn test_out_of_state_messages_dropped() {
    let mut session = TestSession::start();
    session.open_rendezvous().await;

    session.server.push(&offer("too early"));
    session.server.push(&InboundMessage::IceCandidate {
        candidate: candidate(1),
    });
    session.server.push(&InboundMessage::Answer {
        sdp: "answers are never inbound".to_string(),
    });
    settle().await;

    assert_eq!(session.handle.state(), SessionState::AwaitingStreamerList);
    assert_eq!(session.peers.created(), 0);
    assert!(session.server.sent_of_kind("answer").is_empty());
}
