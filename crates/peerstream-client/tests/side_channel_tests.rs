//! Side Channel Tests (peerstream-client)
//!
//! Tests for application messages over the peer data channel:
//! - Open handshake (initial settings, quality control)
//! - Outbound gating (channel open, console permission, input flags)
//! - Inbound dispatch (ownership, avg QP, latency results, keyboard command)
//! - Settings synchronisation in both directions

use bytes::Bytes;
use peerstream_client::SessionEvent;
use peerstream_core::datachannel::{
    encode_streamer_text, from_streamer, to_streamer, InputEvent, MouseButton,
};
use peerstream_core::{Flag, NumericParam, Settings};
use peerstream_test_utils::{
    drain_events, settle, wait_for, MockPeerSession, TestSession, DEFAULT_CHECK_INTERVAL,
    DEFAULT_TIMEOUT,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const PERMITTED: &str = r#"{"PixelStreaming":{"AllowPixelStreamingCommands":true,"DisableLatencyTest":false}}"#;

async fn wait_for_sent(peer: &Arc<MockPeerSession>, code: u8, count: usize) -> bool {
    let watched = peer.clone();
    wait_for(
        move || {
            let watched = watched.clone();
            async move { watched.sent_codes().iter().filter(|c| **c == code).count() >= count }
        },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await
}

/// Connected session with an open side channel and the open handshake cleared
async fn open_session(settings: Settings) -> (TestSession, Arc<MockPeerSession>) {
    let mut session = TestSession::start_with(settings, |builder| builder);
    let peer = session.connect_fully().await;
    session.open_side_channel(&peer).await;
    assert!(wait_for_sent(&peer, to_streamer::REQUEST_INITIAL_SETTINGS, 1).await);
    settle().await;
    peer.clear_sent();
    (session, peer)
}

async fn grant_console_commands(session: &mut TestSession, peer: &MockPeerSession) {
    peer.receive(encode_streamer_text(from_streamer::INITIAL_SETTINGS, PERMITTED));
    session
        .expect("initial settings", |e| {
            matches!(e, SessionEvent::InitialSettings(_))
        })
        .await;
}

// ============================================================================
// Open Handshake
// ============================================================================

#[tokio::test]
async fn test_open_requests_initial_settings_and_quality_control() {
    let mut session = TestSession::start();
    let peer = session.connect_fully().await;

    session.open_side_channel(&peer).await;
    assert!(wait_for_sent(&peer, to_streamer::REQUEST_QUALITY_CONTROL, 1).await);

    assert_eq!(
        peer.sent_codes(),
        vec![
            to_streamer::REQUEST_INITIAL_SETTINGS,
            to_streamer::REQUEST_QUALITY_CONTROL
        ]
    );
    assert!(session.handle.status().data_channel_open);
}

#[tokio::test]
async fn test_open_without_quality_control_flag() {
    let settings = Settings::new();
    settings.set_flag(Flag::IsQualityController, false);
    let mut session = TestSession::start_with(settings, |builder| builder);
    let peer = session.connect_fully().await;

    session.open_side_channel(&peer).await;
    assert!(wait_for_sent(&peer, to_streamer::REQUEST_INITIAL_SETTINGS, 1).await);
    settle().await;

    assert_eq!(peer.sent_codes(), vec![to_streamer::REQUEST_INITIAL_SETTINGS]);
}

// ============================================================================
// Outbound Gating
// ============================================================================

#[tokio::test]
async fn test_senders_are_noops_before_open() {
    let mut session = TestSession::start();
    let peer = session.connect_fully().await;

    session
        .handle
        .emit_ui_interaction(json!({"action": "jump"}))
        .unwrap();
    session
        .handle
        .emit_command(json!({"Resolution.Width": 1280}))
        .unwrap();
    session.handle.request_keyframe().unwrap();
    settle().await;

    assert!(peer.sent_data().is_empty());
}

#[tokio::test]
async fn test_senders_are_noops_after_close() {
    let (mut session, peer) = open_session(Settings::new()).await;

    peer.close_data_channel();
    settle().await;
    assert!(!session.handle.status().data_channel_open);

    session
        .handle
        .emit_ui_interaction(json!({"action": "jump"}))
        .unwrap();
    settle().await;
    assert!(peer.sent_data().is_empty());

    drain_events(&mut session.events, Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_ui_interaction_and_command_sent() {
    let (session, peer) = open_session(Settings::new()).await;

    session
        .handle
        .emit_ui_interaction(json!({"action": "jump"}))
        .unwrap();
    session
        .handle
        .emit_command(json!({"Resolution.Width": 1280}))
        .unwrap();
    session.handle.request_keyframe().unwrap();

    assert!(wait_for_sent(&peer, to_streamer::IFRAME_REQUEST, 1).await);
    assert_eq!(
        peer.sent_texts(to_streamer::UI_INTERACTION),
        vec![r#"{"action":"jump"}"#]
    );
    assert_eq!(
        peer.sent_texts(to_streamer::COMMAND),
        vec![r#"{"Resolution.Width":1280}"#]
    );
}

#[tokio::test]
async fn test_streaming_control_requests_sent() {
    let (session, peer) = open_session(Settings::new()).await;

    session.handle.request_fps().unwrap();
    session.handle.request_average_bitrate().unwrap();
    session.handle.start_streaming().unwrap();
    session.handle.stop_streaming().unwrap();
    session.handle.test_echo("hello").unwrap();

    assert!(wait_for_sent(&peer, to_streamer::TEST_ECHO, 1).await);
    assert_eq!(
        peer.sent_codes(),
        vec![
            to_streamer::FPS_REQUEST,
            to_streamer::AVERAGE_BITRATE_REQUEST,
            to_streamer::START_STREAMING,
            to_streamer::STOP_STREAMING,
            to_streamer::TEST_ECHO,
        ]
    );
    assert_eq!(peer.sent_texts(to_streamer::TEST_ECHO), vec!["hello"]);
}

#[tokio::test]
async fn test_console_command_requires_permission() {
    let (mut session, peer) = open_session(Settings::new()).await;

    session.handle.emit_console_command("stat fps").unwrap();
    session
        .handle
        .emit_command(json!({"ConsoleCommand": "stat unit"}))
        .unwrap();
    settle().await;
    assert!(peer.sent_texts(to_streamer::COMMAND).is_empty());

    grant_console_commands(&mut session, &peer).await;

    session.handle.emit_console_command("stat fps").unwrap();
    assert!(wait_for_sent(&peer, to_streamer::COMMAND, 1).await);
    assert_eq!(
        peer.sent_texts(to_streamer::COMMAND),
        vec![r#"{"ConsoleCommand":"stat fps"}"#]
    );
}

#[tokio::test]
async fn test_console_permission_denied_stays_suppressed() {
    let (mut session, peer) = open_session(Settings::new()).await;

    peer.receive(encode_streamer_text(
        from_streamer::INITIAL_SETTINGS,
        r#"{"PixelStreaming":{"AllowPixelStreamingCommands":false}}"#,
    ));
    session
        .expect("initial settings", |e| matches!(e, SessionEvent::InitialSettings(_)))
        .await;

    session.handle.emit_console_command("quit").unwrap();
    settle().await;
    assert!(peer.sent_texts(to_streamer::COMMAND).is_empty());
}

#[tokio::test]
async fn test_console_permission_reset_by_new_session() {
    let (mut session, peer) = open_session(Settings::new()).await;
    grant_console_commands(&mut session, &peer).await;

    session.handle.disconnect().unwrap();
    session
        .expect("disconnected", |e| matches!(e, SessionEvent::Disconnected { .. }))
        .await;

    let peer = session.connect_fully().await;
    session.open_side_channel(&peer).await;
    settle().await;
    peer.clear_sent();

    session.handle.emit_console_command("stat fps").unwrap();
    settle().await;
    assert!(peer.sent_texts(to_streamer::COMMAND).is_empty());
}

#[tokio::test]
async fn test_input_gated_by_flags() {
    let settings = Settings::new();
    let (session, peer) = open_session(settings.clone()).await;

    settings.set_flag(Flag::KeyboardInput, false);
    session
        .handle
        .emit_input(InputEvent::KeyDown {
            key_code: 65,
            repeat: false,
        })
        .unwrap();
    session
        .handle
        .emit_input(InputEvent::MouseDown {
            button: MouseButton::Main,
            x: 100,
            y: 200,
        })
        .unwrap();

    assert!(wait_for_sent(&peer, to_streamer::MOUSE_DOWN, 1).await);
    assert!(!peer.sent_codes().contains(&to_streamer::KEY_DOWN));

    settings.set_flag(Flag::KeyboardInput, true);
    session
        .handle
        .emit_input(InputEvent::KeyUp { key_code: 65 })
        .unwrap();
    assert!(wait_for_sent(&peer, to_streamer::KEY_UP, 1).await);
}

#[tokio::test]
async fn test_touch_input_gated_by_touch_flag() {
    let settings = Settings::new();
    settings.set_flag(Flag::TouchInput, false);
    let (session, peer) = open_session(settings).await;

    session
        .handle
        .emit_input(InputEvent::TouchStart(vec![]))
        .unwrap();
    session.handle.emit_input(InputEvent::MouseEnter).unwrap();

    assert!(wait_for_sent(&peer, to_streamer::MOUSE_ENTER, 1).await);
    assert!(!peer.sent_codes().contains(&to_streamer::TOUCH_START));
}

// ============================================================================
// Inbound Dispatch
// ============================================================================

#[tokio::test]
async fn test_input_control_ownership_events() {
    let (mut session, peer) = open_session(Settings::new()).await;

    peer.receive(Bytes::from_static(&[from_streamer::INPUT_CONTROL_OWNERSHIP, 1]));
    session
        .expect("ownership", |e| *e == SessionEvent::InputControlOwnership(true))
        .await;

    peer.receive(Bytes::from_static(&[from_streamer::INPUT_CONTROL_OWNERSHIP, 0]));
    session
        .expect("ownership", |e| *e == SessionEvent::InputControlOwnership(false))
        .await;
}

#[tokio::test]
async fn test_avg_qp_event() {
    let (mut session, peer) = open_session(Settings::new()).await;

    peer.receive(encode_streamer_text(from_streamer::VIDEO_ENCODER_AVG_QP, "27"));
    session
        .expect("avg qp", |e| *e == SessionEvent::VideoEncoderAvgQp(27))
        .await;
}

#[tokio::test]
async fn test_on_screen_keyboard_command() {
    let (mut session, peer) = open_session(Settings::new()).await;

    peer.receive(encode_streamer_text(
        from_streamer::COMMAND,
        r#"{"command":"onScreenKeyboard","showOnScreenKeyboard":true,"x":0.5,"y":0.25}"#,
    ));
    session
        .expect("keyboard", |e| {
            *e == SessionEvent::OnScreenKeyboard {
                show: true,
                x: 0.5,
                y: 0.25,
            }
        })
        .await;
}

#[tokio::test]
async fn test_response_event() {
    let (mut session, peer) = open_session(Settings::new()).await;

    peer.receive(encode_streamer_text(from_streamer::RESPONSE, "hello"));
    session
        .expect("response", |e| *e == SessionEvent::Response("hello".to_string()))
        .await;
}

#[tokio::test]
async fn test_malformed_side_channel_frame_dropped() {
    let (mut session, peer) = open_session(Settings::new()).await;

    peer.receive(Bytes::from_static(&[200, 1, 2, 3]));
    peer.receive(Bytes::new());
    peer.receive(encode_streamer_text(from_streamer::RESPONSE, "still alive"));

    session
        .expect("response", |e| {
            *e == SessionEvent::Response("still alive".to_string())
        })
        .await;
}

#[tokio::test]
async fn test_latency_test_round_trip() {
    let (mut session, peer) = open_session(Settings::new()).await;

    session.handle.request_latency_test().unwrap();
    assert!(wait_for_sent(&peer, to_streamer::LATENCY_TEST, 1).await);
    let payload = &peer.sent_texts(to_streamer::LATENCY_TEST)[0];
    assert!(payload.contains("StartTime"), "payload {}", payload);

    peer.receive(encode_streamer_text(
        from_streamer::LATENCY_TEST,
        r#"{"ReceiptTimeMs":100.0,"TransmissionTimeMs":130.0,"PreCaptureTimeMs":101.0,"PostCaptureTimeMs":105.0,"PreEncodeTimeMs":106.0,"PostEncodeTimeMs":120.0}"#,
    ));

    let event = session
        .expect("latency", |e| matches!(e, SessionEvent::LatencyTest(_)))
        .await;
    match event {
        SessionEvent::LatencyTest(results) => {
            assert_eq!(results.streamer_processing_ms, 30.0);
            assert_eq!(results.capture_ms, 4.0);
            assert_eq!(results.encode_ms, 14.0);
            assert!(results.round_trip_ms >= 0.0);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_latency_test_disabled_by_server() {
    let (mut session, peer) = open_session(Settings::new()).await;

    peer.receive(encode_streamer_text(
        from_streamer::INITIAL_SETTINGS,
        r#"{"PixelStreaming":{"AllowPixelStreamingCommands":true,"DisableLatencyTest":true}}"#,
    ));
    session
        .expect("initial settings", |e| matches!(e, SessionEvent::InitialSettings(_)))
        .await;

    session.handle.request_latency_test().unwrap();
    settle().await;
    assert!(!peer.sent_codes().contains(&to_streamer::LATENCY_TEST));
}

// ============================================================================
// Settings Synchronisation
// ============================================================================

#[tokio::test]
async fn test_initial_settings_applied_without_echo() {
    let settings = Settings::new();
    let (mut session, peer) = open_session(settings.clone()).await;

    peer.receive(encode_streamer_text(
        from_streamer::INITIAL_SETTINGS,
        r#"{"Encoder":{"MinQP":10,"MaxQP":40},"WebRTC":{"FPS":30,"MinBitrate":1000000,"MaxBitrate":20000000}}"#,
    ));
    session
        .expect("initial settings", |e| matches!(e, SessionEvent::InitialSettings(_)))
        .await;
    settle().await;

    assert_eq!(settings.numeric(NumericParam::MinQp), 10);
    assert_eq!(settings.numeric(NumericParam::MaxQp), 40);
    assert_eq!(settings.numeric(NumericParam::WebRtcFps), 30);
    assert_eq!(settings.numeric(NumericParam::WebRtcMinBitrate), 1000);
    assert_eq!(settings.numeric(NumericParam::WebRtcMaxBitrate), 20000);
    assert!(peer.sent_texts(to_streamer::COMMAND).is_empty());
}

#[tokio::test]
async fn test_local_numeric_changes_sent_as_commands() {
    let settings = Settings::new();
    let (_session, peer) = open_session(settings.clone()).await;

    settings.set_numeric(NumericParam::MinQp, 20);
    settings.set_numeric(NumericParam::WebRtcMaxBitrate, 5000);

    assert!(wait_for_sent(&peer, to_streamer::COMMAND, 2).await);
    assert_eq!(
        peer.sent_texts(to_streamer::COMMAND),
        vec![
            r#"{"Encoder.MinQP":20}"#.to_string(),
            r#"{"WebRTC.MaxBitrate":5000000}"#.to_string(),
        ]
    );
}

#[tokio::test]
async fn test_min_and_max_bitrate_independent() {
    let settings = Settings::new();
    let (_session, peer) = open_session(settings.clone()).await;

    settings.set_numeric(NumericParam::WebRtcMinBitrate, 700);

    assert!(wait_for_sent(&peer, to_streamer::COMMAND, 1).await);
    settle().await;
    assert_eq!(
        peer.sent_texts(to_streamer::COMMAND),
        vec![r#"{"WebRTC.MinBitrate":700000}"#.to_string()]
    );
    assert_eq!(settings.numeric(NumericParam::WebRtcMaxBitrate), 0);
}

#[tokio::test]
async fn test_quality_control_ownership_sync() {
    let settings = Settings::new();
    let (mut session, peer) = open_session(settings.clone()).await;

    // Server hands quality control to another client
    peer.receive(Bytes::from_static(&[from_streamer::QUALITY_CONTROL_OWNERSHIP, 0]));
    session
        .expect("ownership", |e| *e == SessionEvent::QualityControlOwnership(false))
        .await;
    settle().await;
    assert!(!settings.flag(Flag::IsQualityController));
    assert!(peer.sent_data().is_empty());

    // Wanting it back triggers a request
    settings.set_flag(Flag::IsQualityController, true);
    assert!(wait_for_sent(&peer, to_streamer::REQUEST_QUALITY_CONTROL, 1).await);

    peer.receive(Bytes::from_static(&[from_streamer::QUALITY_CONTROL_OWNERSHIP, 1]));
    session
        .expect("ownership", |e| *e == SessionEvent::QualityControlOwnership(true))
        .await;
    assert!(settings.flag(Flag::IsQualityController));
}
