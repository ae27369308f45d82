//! Side-channel protocol tests

use peerstream_core::datachannel::{
    encode_streamer_text, from_streamer, normalize_coord, to_streamer, MouseButton,
    StreamerCommand, Touch,
};
use peerstream_core::{Error, FromStreamer, InputEvent, ToStreamer};

fn utf16_payload(frame: &[u8]) -> String {
    let len = u16::from_le_bytes([frame[1], frame[2]]) as usize;
    let units: Vec<u16> = frame[3..3 + len * 2]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).unwrap()
}

// ============================================================================
// Outbound
// ============================================================================

#[test]
fn test_single_byte_requests() {
    let cases = [
        (ToStreamer::IFrameRequest, to_streamer::IFRAME_REQUEST),
        (
            ToStreamer::RequestQualityControl,
            to_streamer::REQUEST_QUALITY_CONTROL,
        ),
        (
            ToStreamer::RequestInitialSettings,
            to_streamer::REQUEST_INITIAL_SETTINGS,
        ),
        (ToStreamer::StartStreaming, to_streamer::START_STREAMING),
        (ToStreamer::StopStreaming, to_streamer::STOP_STREAMING),
    ];

    for (msg, code) in cases {
        let frame = msg.encode().expect("encode failed");
        assert_eq!(&frame[..], &[code], "{}", msg.kind());
    }
}

#[test]
fn test_command_descriptor_text() {
    let frame = ToStreamer::Command(r#"{"ConsoleCommand":"stat fps"}"#.to_string())
        .encode()
        .expect("encode failed");

    assert_eq!(frame[0], to_streamer::COMMAND);
    assert_eq!(utf16_payload(&frame), r#"{"ConsoleCommand":"stat fps"}"#);
}

#[test]
fn test_ui_interaction_text() {
    let frame = ToStreamer::UiInteraction("{\"Button\":\"Play\"}".to_string())
        .encode()
        .expect("encode failed");
    assert_eq!(frame[0], to_streamer::UI_INTERACTION);
    assert_eq!(utf16_payload(&frame), "{\"Button\":\"Play\"}");
}

#[test]
fn test_latency_test_carries_start_time() {
    let frame = ToStreamer::LatencyTest {
        start_time_ms: 1500.0,
    }
    .encode()
    .expect("encode failed");

    assert_eq!(frame[0], to_streamer::LATENCY_TEST);
    let json: serde_json::Value = serde_json::from_str(&utf16_payload(&frame)).unwrap();
    assert_eq!(json["StartTime"], 1500.0);
}

#[test]
fn test_keyboard_layout() {
    let down = ToStreamer::Input(InputEvent::KeyDown {
        key_code: 65,
        repeat: true,
    })
    .encode()
    .unwrap();
    assert_eq!(&down[..], &[to_streamer::KEY_DOWN, 65, 1]);

    let up = ToStreamer::Input(InputEvent::KeyUp { key_code: 65 })
        .encode()
        .unwrap();
    assert_eq!(&up[..], &[to_streamer::KEY_UP, 65]);

    let press = ToStreamer::Input(InputEvent::KeyPress { char_code: 0x263A })
        .encode()
        .unwrap();
    assert_eq!(&press[..], &[to_streamer::KEY_PRESS, 0x3A, 0x26]);
}

#[test]
fn test_mouse_layout() {
    let down = ToStreamer::Input(InputEvent::MouseDown {
        button: MouseButton::Secondary,
        x: 0x0102,
        y: 0x0304,
    })
    .encode()
    .unwrap();
    assert_eq!(
        &down[..],
        &[to_streamer::MOUSE_DOWN, 2, 0x02, 0x01, 0x04, 0x03]
    );

    let mv = ToStreamer::Input(InputEvent::MouseMove {
        x: 10,
        y: 20,
        dx: -1,
        dy: 2,
    })
    .encode()
    .unwrap();
    assert_eq!(
        &mv[..],
        &[to_streamer::MOUSE_MOVE, 10, 0, 20, 0, 0xff, 0xff, 2, 0]
    );

    let wheel = ToStreamer::Input(InputEvent::MouseWheel {
        delta: -120,
        x: normalize_coord(1.0),
        y: 0,
    })
    .encode()
    .unwrap();
    assert_eq!(wheel[0], to_streamer::MOUSE_WHEEL);
    assert_eq!(i16::from_le_bytes([wheel[1], wheel[2]]), -120);
    assert_eq!(u16::from_le_bytes([wheel[3], wheel[4]]), u16::MAX);

    let enter = ToStreamer::Input(InputEvent::MouseEnter).encode().unwrap();
    assert_eq!(&enter[..], &[to_streamer::MOUSE_ENTER]);
}

#[test]
fn test_touch_layout() {
    let touches = vec![
        Touch {
            x: 1,
            y: 2,
            id: 0,
            force: 255,
            valid: true,
        },
        Touch {
            x: 3,
            y: 4,
            id: 1,
            force: 0,
            valid: false,
        },
    ];
    let frame = ToStreamer::Input(InputEvent::TouchStart(touches))
        .encode()
        .unwrap();

    assert_eq!(frame[0], to_streamer::TOUCH_START);
    assert_eq!(frame[1], 2);
    assert_eq!(&frame[2..9], &[1, 0, 2, 0, 0, 255, 1]);
    assert_eq!(&frame[9..16], &[3, 0, 4, 0, 1, 0, 0]);
}

// ============================================================================
// Inbound
// ============================================================================

#[test]
fn test_decode_ownership() {
    assert_eq!(
        FromStreamer::decode(&[from_streamer::QUALITY_CONTROL_OWNERSHIP, 1]).unwrap(),
        FromStreamer::QualityControlOwnership(true)
    );
    assert_eq!(
        FromStreamer::decode(&[from_streamer::INPUT_CONTROL_OWNERSHIP, 0]).unwrap(),
        FromStreamer::InputControlOwnership(false)
    );
    assert!(FromStreamer::decode(&[from_streamer::INPUT_CONTROL_OWNERSHIP]).is_err());
}

#[test]
fn test_decode_initial_settings() {
    let json = r#"{
        "PixelStreaming": {"AllowPixelStreamingCommands": true, "DisableLatencyTest": false},
        "Encoder": {"TargetBitrate": -1, "MaxBitrate": 20000000, "MinQP": 0, "MaxQP": 51},
        "WebRTC": {"DegradationPref": "BALANCED", "FPS": 60, "MinBitrate": 100000, "MaxBitrate": 100000000, "LowQP": 25, "HighQP": 37},
        "ConfigOptions": {"HideUI": false}
    }"#;
    let frame = encode_streamer_text(from_streamer::INITIAL_SETTINGS, json);

    match FromStreamer::decode(&frame).expect("decode failed") {
        FromStreamer::InitialSettings(settings) => {
            assert!(settings.allows_console_commands());
            let encoder = settings.encoder.expect("encoder section");
            assert_eq!(encoder.max_qp, Some(51));
            let web_rtc = settings.web_rtc.expect("webrtc section");
            assert_eq!(web_rtc.fps, Some(60));
            assert_eq!(web_rtc.min_bitrate, Some(100_000));
            assert!(settings.config_options.is_some());
        }
        other => panic!("Expected InitialSettings, got {:?}", other),
    }
}

#[test]
fn test_initial_settings_without_permissions_denies_commands() {
    let frame = encode_streamer_text(from_streamer::INITIAL_SETTINGS, r#"{"Encoder":{}}"#);
    match FromStreamer::decode(&frame).expect("decode failed") {
        FromStreamer::InitialSettings(settings) => assert!(!settings.allows_console_commands()),
        other => panic!("Expected InitialSettings, got {:?}", other),
    }
}

#[test]
fn test_decode_avg_qp() {
    let frame = encode_streamer_text(from_streamer::VIDEO_ENCODER_AVG_QP, "27");
    assert_eq!(
        FromStreamer::decode(&frame).unwrap(),
        FromStreamer::VideoEncoderAvgQp(27)
    );

    let frame = encode_streamer_text(from_streamer::VIDEO_ENCODER_AVG_QP, "abc");
    assert!(matches!(
        FromStreamer::decode(&frame),
        Err(Error::MalformedMessage(_))
    ));
}

#[test]
fn test_decode_latency_test_results() {
    let json = r#"{"ReceiptTimeMs":1010,"TransmissionTimeMs":1030,"PreCaptureTimeMs":1012,"PostCaptureTimeMs":1015,"PreEncodeTimeMs":1016,"PostEncodeTimeMs":1026}"#;
    let frame = encode_streamer_text(from_streamer::LATENCY_TEST, json);

    let timings = match FromStreamer::decode(&frame).unwrap() {
        FromStreamer::LatencyTest(timings) => timings,
        other => panic!("Expected LatencyTest, got {:?}", other),
    };
    let results = timings.results(1000.0, 1080.0);

    assert_eq!(results.round_trip_ms, 80.0);
    assert_eq!(results.streamer_processing_ms, 20.0);
    assert_eq!(results.network_latency_ms, 60.0);
    assert_eq!(results.capture_ms, 3.0);
    assert_eq!(results.encode_ms, 10.0);
}

#[test]
fn test_decode_on_screen_keyboard_command() {
    let frame = encode_streamer_text(
        from_streamer::COMMAND,
        r#"{"command":"onScreenKeyboard","showOnScreenKeyboard":true,"x":0.5,"y":0.25}"#,
    );
    let text = match FromStreamer::decode(&frame).unwrap() {
        FromStreamer::Command(text) => text,
        other => panic!("Expected Command, got {:?}", other),
    };

    assert_eq!(
        StreamerCommand::parse(&text).unwrap(),
        StreamerCommand::OnScreenKeyboard {
            show: true,
            x: 0.5,
            y: 0.25
        }
    );
    assert!(matches!(
        StreamerCommand::parse(r#"{"command":"other"}"#).unwrap(),
        StreamerCommand::Other(_)
    ));
}

#[test]
fn test_decode_freeze_frame_header() {
    let frame = [from_streamer::FREEZE_FRAME, 0x10, 0x00, 0x00, 0x00, 0xff, 0xd8];
    assert_eq!(
        FromStreamer::decode(&frame).unwrap(),
        FromStreamer::FreezeFrame { size: 16 }
    );
    assert!(FromStreamer::decode(&[from_streamer::FREEZE_FRAME, 1]).is_err());
}

#[test]
fn test_truncated_ownership_reports_frame_length() {
    for code in [
        from_streamer::QUALITY_CONTROL_OWNERSHIP,
        from_streamer::INPUT_CONTROL_OWNERSHIP,
    ] {
        match FromStreamer::decode(&[code]) {
            Err(Error::BufferTooSmall { needed, have }) => {
                assert_eq!((needed, have), (2, 1), "code {}", code);
            }
            other => panic!("code {}: unexpected {:?}", code, other),
        }
    }
    assert_eq!(
        FromStreamer::decode(&[from_streamer::INPUT_CONTROL_OWNERSHIP, 0, 9]).unwrap(),
        FromStreamer::InputControlOwnership(false)
    );
}

#[test]
fn test_decode_unknown_and_empty() {
    assert!(matches!(
        FromStreamer::decode(&[200]),
        Err(Error::UnknownMessageType(200))
    ));
    assert!(matches!(
        FromStreamer::decode(&[]),
        Err(Error::BufferTooSmall { .. })
    ));
}
