//! Side-channel protocol
//!
//! Application messages carried over the reliable ordered data channel of the
//! peer session. Every frame starts with a one byte discriminator; integers are
//! little-endian and text is UTF-16LE.
//!
//! Outbound text payloads carry a `u16` length prefix (in UTF-16 code units).
//! Inbound text payloads run to the end of the frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::settings::Flag;
use crate::{Error, Result};

/// Message type codes sent to the streamer
pub mod to_streamer {
    pub const IFRAME_REQUEST: u8 = 0;
    pub const REQUEST_QUALITY_CONTROL: u8 = 1;
    pub const FPS_REQUEST: u8 = 2;
    pub const AVERAGE_BITRATE_REQUEST: u8 = 3;
    pub const START_STREAMING: u8 = 4;
    pub const STOP_STREAMING: u8 = 5;
    pub const LATENCY_TEST: u8 = 6;
    pub const REQUEST_INITIAL_SETTINGS: u8 = 7;
    pub const TEST_ECHO: u8 = 8;
    pub const UI_INTERACTION: u8 = 50;
    pub const COMMAND: u8 = 51;
    pub const KEY_DOWN: u8 = 60;
    pub const KEY_UP: u8 = 61;
    pub const KEY_PRESS: u8 = 62;
    pub const MOUSE_ENTER: u8 = 70;
    pub const MOUSE_LEAVE: u8 = 71;
    pub const MOUSE_DOWN: u8 = 72;
    pub const MOUSE_UP: u8 = 73;
    pub const MOUSE_MOVE: u8 = 74;
    pub const MOUSE_WHEEL: u8 = 75;
    pub const MOUSE_DOUBLE: u8 = 76;
    pub const TOUCH_START: u8 = 80;
    pub const TOUCH_END: u8 = 81;
    pub const TOUCH_MOVE: u8 = 82;
}

/// Message type codes received from the streamer
pub mod from_streamer {
    pub const QUALITY_CONTROL_OWNERSHIP: u8 = 0;
    pub const RESPONSE: u8 = 1;
    pub const COMMAND: u8 = 2;
    pub const FREEZE_FRAME: u8 = 3;
    pub const UNFREEZE_FRAME: u8 = 4;
    pub const VIDEO_ENCODER_AVG_QP: u8 = 5;
    pub const LATENCY_TEST: u8 = 6;
    pub const INITIAL_SETTINGS: u8 = 7;
    pub const INPUT_CONTROL_OWNERSHIP: u8 = 12;
}

/// Key in a command descriptor that marks it as a console command
pub const CONSOLE_COMMAND_KEY: &str = "ConsoleCommand";

/// Mouse button codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MouseButton {
    Main = 0,
    Auxiliary = 1,
    Secondary = 2,
    Fourth = 3,
    Fifth = 4,
}

/// One touch point of a touch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touch {
    pub x: u16,
    pub y: u16,
    pub id: u8,
    pub force: u8,
    pub valid: bool,
}

/// Keyboard, mouse and touch input forwarded to the streamer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    KeyDown { key_code: u8, repeat: bool },
    KeyUp { key_code: u8 },
    KeyPress { char_code: u16 },
    MouseEnter,
    MouseLeave,
    MouseDown { button: MouseButton, x: u16, y: u16 },
    MouseUp { button: MouseButton, x: u16, y: u16 },
    MouseDouble { button: MouseButton, x: u16, y: u16 },
    MouseMove { x: u16, y: u16, dx: i16, dy: i16 },
    MouseWheel { delta: i16, x: u16, y: u16 },
    TouchStart(Vec<Touch>),
    TouchEnd(Vec<Touch>),
    TouchMove(Vec<Touch>),
}

/// Map a coordinate in `0.0..=1.0` of the video surface onto the wire range
pub fn normalize_coord(value: f64) -> u16 {
    (value.clamp(0.0, 1.0) * u16::MAX as f64).round() as u16
}

/// Map a touch force in `0.0..=1.0` onto the wire range
pub fn normalize_force(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * u8::MAX as f64).round() as u8
}

impl InputEvent {
    /// The setting that enables this kind of input
    pub fn enabling_flag(&self) -> Flag {
        match self {
            InputEvent::KeyDown { .. } | InputEvent::KeyUp { .. } | InputEvent::KeyPress { .. } => {
                Flag::KeyboardInput
            }
            InputEvent::TouchStart(_) | InputEvent::TouchEnd(_) | InputEvent::TouchMove(_) => {
                Flag::TouchInput
            }
            _ => Flag::MouseInput,
        }
    }

    fn type_code(&self) -> u8 {
        match self {
            InputEvent::KeyDown { .. } => to_streamer::KEY_DOWN,
            InputEvent::KeyUp { .. } => to_streamer::KEY_UP,
            InputEvent::KeyPress { .. } => to_streamer::KEY_PRESS,
            InputEvent::MouseEnter => to_streamer::MOUSE_ENTER,
            InputEvent::MouseLeave => to_streamer::MOUSE_LEAVE,
            InputEvent::MouseDown { .. } => to_streamer::MOUSE_DOWN,
            InputEvent::MouseUp { .. } => to_streamer::MOUSE_UP,
            InputEvent::MouseDouble { .. } => to_streamer::MOUSE_DOUBLE,
            InputEvent::MouseMove { .. } => to_streamer::MOUSE_MOVE,
            InputEvent::MouseWheel { .. } => to_streamer::MOUSE_WHEEL,
            InputEvent::TouchStart(_) => to_streamer::TOUCH_START,
            InputEvent::TouchEnd(_) => to_streamer::TOUCH_END,
            InputEvent::TouchMove(_) => to_streamer::TOUCH_MOVE,
        }
    }

    fn encode_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.type_code());
        match self {
            InputEvent::KeyDown { key_code, repeat } => {
                buf.put_u8(*key_code);
                buf.put_u8(*repeat as u8);
            }
            InputEvent::KeyUp { key_code } => buf.put_u8(*key_code),
            InputEvent::KeyPress { char_code } => buf.put_u16_le(*char_code),
            InputEvent::MouseEnter | InputEvent::MouseLeave => {}
            InputEvent::MouseDown { button, x, y }
            | InputEvent::MouseUp { button, x, y }
            | InputEvent::MouseDouble { button, x, y } => {
                buf.put_u8(*button as u8);
                buf.put_u16_le(*x);
                buf.put_u16_le(*y);
            }
            InputEvent::MouseMove { x, y, dx, dy } => {
                buf.put_u16_le(*x);
                buf.put_u16_le(*y);
                buf.put_i16_le(*dx);
                buf.put_i16_le(*dy);
            }
            InputEvent::MouseWheel { delta, x, y } => {
                buf.put_i16_le(*delta);
                buf.put_u16_le(*x);
                buf.put_u16_le(*y);
            }
            InputEvent::TouchStart(touches)
            | InputEvent::TouchEnd(touches)
            | InputEvent::TouchMove(touches) => {
                let count = u8::try_from(touches.len()).map_err(|_| {
                    Error::EncodeError(format!("too many touches: {}", touches.len()))
                })?;
                buf.put_u8(count);
                for touch in touches {
                    buf.put_u16_le(touch.x);
                    buf.put_u16_le(touch.y);
                    buf.put_u8(touch.id);
                    buf.put_u8(touch.force);
                    buf.put_u8(touch.valid as u8);
                }
            }
        }
        Ok(())
    }
}

/// Messages sent to the streamer over the side channel
#[derive(Debug, Clone, PartialEq)]
pub enum ToStreamer {
    IFrameRequest,
    RequestQualityControl,
    FpsRequest,
    AverageBitrateRequest,
    StartStreaming,
    StopStreaming,
    /// Latency test request, `start_time_ms` is the local wall clock in milliseconds
    LatencyTest { start_time_ms: f64 },
    RequestInitialSettings,
    TestEcho(String),
    UiInteraction(String),
    Command(String),
    Input(InputEvent),
}

impl ToStreamer {
    /// Name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ToStreamer::IFrameRequest => "IFrameRequest",
            ToStreamer::RequestQualityControl => "RequestQualityControl",
            ToStreamer::FpsRequest => "FpsRequest",
            ToStreamer::AverageBitrateRequest => "AverageBitrateRequest",
            ToStreamer::StartStreaming => "StartStreaming",
            ToStreamer::StopStreaming => "StopStreaming",
            ToStreamer::LatencyTest { .. } => "LatencyTest",
            ToStreamer::RequestInitialSettings => "RequestInitialSettings",
            ToStreamer::TestEcho(_) => "TestEcho",
            ToStreamer::UiInteraction(_) => "UIInteraction",
            ToStreamer::Command(_) => "Command",
            ToStreamer::Input(_) => "Input",
        }
    }

    /// Encode to a side-channel frame
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            ToStreamer::IFrameRequest => buf.put_u8(to_streamer::IFRAME_REQUEST),
            ToStreamer::RequestQualityControl => buf.put_u8(to_streamer::REQUEST_QUALITY_CONTROL),
            ToStreamer::FpsRequest => buf.put_u8(to_streamer::FPS_REQUEST),
            ToStreamer::AverageBitrateRequest => buf.put_u8(to_streamer::AVERAGE_BITRATE_REQUEST),
            ToStreamer::StartStreaming => buf.put_u8(to_streamer::START_STREAMING),
            ToStreamer::StopStreaming => buf.put_u8(to_streamer::STOP_STREAMING),
            ToStreamer::LatencyTest { start_time_ms } => {
                buf.put_u8(to_streamer::LATENCY_TEST);
                let payload = serde_json::json!({ "StartTime": start_time_ms }).to_string();
                put_utf16(&mut buf, &payload)?;
            }
            ToStreamer::RequestInitialSettings => {
                buf.put_u8(to_streamer::REQUEST_INITIAL_SETTINGS)
            }
            ToStreamer::TestEcho(text) => {
                buf.put_u8(to_streamer::TEST_ECHO);
                put_utf16(&mut buf, text)?;
            }
            ToStreamer::UiInteraction(text) => {
                buf.put_u8(to_streamer::UI_INTERACTION);
                put_utf16(&mut buf, text)?;
            }
            ToStreamer::Command(text) => {
                buf.put_u8(to_streamer::COMMAND);
                put_utf16(&mut buf, text)?;
            }
            ToStreamer::Input(event) => event.encode_to(&mut buf)?,
        }
        Ok(buf.freeze())
    }
}

fn put_utf16(buf: &mut BytesMut, text: &str) -> Result<()> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = u16::try_from(units.len())
        .map_err(|_| Error::EncodeError(format!("text too long: {} code units", units.len())))?;
    buf.reserve(2 + units.len() * 2);
    buf.put_u16_le(len);
    for unit in units {
        buf.put_u16_le(unit);
    }
    Ok(())
}

fn read_utf16(payload: &[u8]) -> Result<String> {
    if payload.len() % 2 != 0 {
        return Err(Error::MalformedMessage(format!(
            "odd-length UTF-16 payload ({} bytes)",
            payload.len()
        )));
    }
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Flag byte following the message code
fn read_bool(frame: &[u8]) -> Result<bool> {
    frame.get(1).map(|b| *b != 0).ok_or(Error::BufferTooSmall {
        needed: 2,
        have: frame.len(),
    })
}

/// `PixelStreaming` section of the initial settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamingPermissions {
    #[serde(default)]
    pub allow_pixel_streaming_commands: bool,
    #[serde(default)]
    pub disable_latency_test: bool,
}

/// `Encoder` section of the initial settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    #[serde(rename = "TargetBitrate", default)]
    pub target_bitrate: Option<i64>,
    #[serde(rename = "MaxBitrate", default)]
    pub max_bitrate: Option<i64>,
    #[serde(rename = "MinQP", default)]
    pub min_qp: Option<i64>,
    #[serde(rename = "MaxQP", default)]
    pub max_qp: Option<i64>,
    #[serde(rename = "RateControl", default)]
    pub rate_control: Option<String>,
    #[serde(rename = "FillerData", default)]
    pub filler_data: Option<bool>,
    #[serde(rename = "MultiPass", default)]
    pub multi_pass: Option<String>,
}

/// `WebRTC` section of the initial settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebRtcSettings {
    #[serde(rename = "DegradationPref", default)]
    pub degradation_pref: Option<String>,
    #[serde(rename = "FPS", default)]
    pub fps: Option<i64>,
    #[serde(rename = "MinBitrate", default)]
    pub min_bitrate: Option<i64>,
    #[serde(rename = "MaxBitrate", default)]
    pub max_bitrate: Option<i64>,
    #[serde(rename = "LowQP", default)]
    pub low_qp: Option<i64>,
    #[serde(rename = "HighQP", default)]
    pub high_qp: Option<i64>,
}

/// Settings pushed by the streamer after `RequestInitialSettings`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialSettings {
    #[serde(rename = "PixelStreaming", default)]
    pub permissions: Option<StreamingPermissions>,
    #[serde(rename = "Encoder", default)]
    pub encoder: Option<EncoderSettings>,
    #[serde(rename = "WebRTC", default)]
    pub web_rtc: Option<WebRtcSettings>,
    #[serde(rename = "ConfigOptions", default)]
    pub config_options: Option<Map<String, Value>>,
}

impl InitialSettings {
    /// Whether the server allows console commands from this client
    pub fn allows_console_commands(&self) -> bool {
        self.permissions
            .as_ref()
            .map(|p| p.allow_pixel_streaming_commands)
            .unwrap_or(false)
    }
}

/// Streamer-side timestamps of a latency test (milliseconds)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyTestTimings {
    #[serde(default)]
    pub receipt_time_ms: f64,
    #[serde(default)]
    pub transmission_time_ms: f64,
    #[serde(default)]
    pub pre_capture_time_ms: f64,
    #[serde(default)]
    pub post_capture_time_ms: f64,
    #[serde(default)]
    pub pre_encode_time_ms: f64,
    #[serde(default)]
    pub post_encode_time_ms: f64,
}

/// Derived latency figures (milliseconds)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyTestResults {
    pub timings: LatencyTestTimings,
    pub round_trip_ms: f64,
    pub streamer_processing_ms: f64,
    pub network_latency_ms: f64,
    pub capture_ms: f64,
    pub encode_ms: f64,
}

impl LatencyTestTimings {
    /// Combine with the local send and receipt times of the test
    pub fn results(self, test_start_ms: f64, receipt_ms: f64) -> LatencyTestResults {
        let round_trip_ms = receipt_ms - test_start_ms;
        let streamer_processing_ms = self.transmission_time_ms - self.receipt_time_ms;
        LatencyTestResults {
            round_trip_ms,
            streamer_processing_ms,
            network_latency_ms: round_trip_ms - streamer_processing_ms,
            capture_ms: self.post_capture_time_ms - self.pre_capture_time_ms,
            encode_ms: self.post_encode_time_ms - self.pre_encode_time_ms,
            timings: self,
        }
    }
}

/// Structured form of a streamer `Command` payload
#[derive(Debug, Clone, PartialEq)]
pub enum StreamerCommand {
    OnScreenKeyboard { show: bool, x: f64, y: f64 },
    Other(Value),
}

impl StreamerCommand {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("command").and_then(Value::as_str) == Some("onScreenKeyboard") {
            return Ok(StreamerCommand::OnScreenKeyboard {
                show: value
                    .get("showOnScreenKeyboard")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                x: value.get("x").and_then(Value::as_f64).unwrap_or(0.0),
                y: value.get("y").and_then(Value::as_f64).unwrap_or(0.0),
            });
        }
        Ok(StreamerCommand::Other(value))
    }
}

/// Messages received from the streamer over the side channel
#[derive(Debug, Clone, PartialEq)]
pub enum FromStreamer {
    QualityControlOwnership(bool),
    Response(String),
    Command(String),
    /// First chunk of a freeze-frame image, `size` is the full image length
    FreezeFrame { size: u32 },
    UnfreezeFrame,
    VideoEncoderAvgQp(u32),
    LatencyTest(LatencyTestTimings),
    InitialSettings(InitialSettings),
    InputControlOwnership(bool),
}

impl FromStreamer {
    /// Decode a side-channel frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&code, payload) = frame
            .split_first()
            .ok_or(Error::BufferTooSmall { needed: 1, have: 0 })?;

        match code {
            from_streamer::QUALITY_CONTROL_OWNERSHIP => {
                Ok(FromStreamer::QualityControlOwnership(read_bool(frame)?))
            }
            from_streamer::INPUT_CONTROL_OWNERSHIP => {
                Ok(FromStreamer::InputControlOwnership(read_bool(frame)?))
            }
            from_streamer::RESPONSE => Ok(FromStreamer::Response(read_utf16(payload)?)),
            from_streamer::COMMAND => Ok(FromStreamer::Command(read_utf16(payload)?)),
            from_streamer::FREEZE_FRAME => {
                let mut rest = payload;
                if rest.remaining() < 4 {
                    return Err(Error::BufferTooSmall {
                        needed: 5,
                        have: frame.len(),
                    });
                }
                Ok(FromStreamer::FreezeFrame {
                    size: rest.get_u32_le(),
                })
            }
            from_streamer::UNFREEZE_FRAME => Ok(FromStreamer::UnfreezeFrame),
            from_streamer::VIDEO_ENCODER_AVG_QP => {
                let text = read_utf16(payload)?;
                let qp = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| Error::MalformedMessage(format!("avg QP {:?}: {}", text, e)))?;
                Ok(FromStreamer::VideoEncoderAvgQp(qp.max(0.0).round() as u32))
            }
            from_streamer::LATENCY_TEST => {
                let text = read_utf16(payload)?;
                Ok(FromStreamer::LatencyTest(serde_json::from_str(&text)?))
            }
            from_streamer::INITIAL_SETTINGS => {
                let text = read_utf16(payload)?;
                Ok(FromStreamer::InitialSettings(serde_json::from_str(&text)?))
            }
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// Encode text the way the streamer sends it (no length prefix), used by test doubles
pub fn encode_streamer_text(code: u8, text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + text.len() * 2);
    buf.put_u8(code);
    for unit in text.encode_utf16() {
        buf.put_u16_le(unit);
    }
    buf.freeze()
}
