//! Shared settings with change notification
//!
//! The embedding application owns one [`Settings`] instance and hands clones of it
//! to the components that read or observe it. Every effective write publishes a
//! [`SettingChange`]; writes that leave the value unchanged publish nothing.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{Error, Result};

/// Boolean settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Connect as soon as the application starts
    AutoConnect,
    /// Start playback as soon as the video track arrives
    AutoPlayVideo,
    /// Request quality-control ownership from the streamer
    IsQualityController,
    /// Only use relayed (TURN) candidates
    ForceTurn,
    KeyboardInput,
    MouseInput,
    TouchInput,
}

impl Flag {
    pub const ALL: [Flag; 7] = [
        Flag::AutoConnect,
        Flag::AutoPlayVideo,
        Flag::IsQualityController,
        Flag::ForceTurn,
        Flag::KeyboardInput,
        Flag::MouseInput,
        Flag::TouchInput,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Flag::AutoConnect => "AutoConnect",
            Flag::AutoPlayVideo => "AutoPlayVideo",
            Flag::IsQualityController => "ControlsQuality",
            Flag::ForceTurn => "ForceTURN",
            Flag::KeyboardInput => "KeyboardInput",
            Flag::MouseInput => "MouseInput",
            Flag::TouchInput => "TouchInput",
        }
    }

    pub fn default_value(self) -> bool {
        match self {
            Flag::AutoConnect | Flag::ForceTurn => false,
            Flag::AutoPlayVideo
            | Flag::IsQualityController
            | Flag::KeyboardInput
            | Flag::MouseInput
            | Flag::TouchInput => true,
        }
    }
}

/// Numeric settings, each clamped to its own range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericParam {
    WebRtcFps,
    /// Kilobits per second
    WebRtcMinBitrate,
    /// Kilobits per second
    WebRtcMaxBitrate,
    MinQp,
    MaxQp,
}

impl NumericParam {
    pub const ALL: [NumericParam; 5] = [
        NumericParam::WebRtcFps,
        NumericParam::WebRtcMinBitrate,
        NumericParam::WebRtcMaxBitrate,
        NumericParam::MinQp,
        NumericParam::MaxQp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NumericParam::WebRtcFps => "WebRTCFPS",
            NumericParam::WebRtcMinBitrate => "WebRTCMinBitrate",
            NumericParam::WebRtcMaxBitrate => "WebRTCMaxBitrate",
            NumericParam::MinQp => "MinQP",
            NumericParam::MaxQp => "MaxQP",
        }
    }

    pub fn default_value(self) -> i64 {
        match self {
            NumericParam::WebRtcFps => 60,
            NumericParam::WebRtcMinBitrate => 0,
            NumericParam::WebRtcMaxBitrate => 0,
            NumericParam::MinQp => 0,
            NumericParam::MaxQp => 51,
        }
    }

    /// Inclusive range of accepted values
    pub fn range(self) -> (i64, i64) {
        match self {
            NumericParam::WebRtcFps => (1, 999),
            NumericParam::WebRtcMinBitrate | NumericParam::WebRtcMaxBitrate => (0, 100_000),
            NumericParam::MinQp | NumericParam::MaxQp => (0, 51),
        }
    }
}

/// Text settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextParam {
    SignallingServerUrl,
    /// Preferred streamer, empty when unset
    StreamerId,
}

impl TextParam {
    pub const ALL: [TextParam; 2] = [TextParam::SignallingServerUrl, TextParam::StreamerId];

    pub fn name(self) -> &'static str {
        match self {
            TextParam::SignallingServerUrl => "ss",
            TextParam::StreamerId => "StreamerId",
        }
    }
}

macro_rules! impl_from_name {
    ($ty:ty) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                <$ty>::ALL
                    .iter()
                    .copied()
                    .find(|k| k.name().eq_ignore_ascii_case(s))
                    .ok_or_else(|| Error::InvalidSetting {
                        key: s.to_string(),
                        reason: "unknown setting".to_string(),
                    })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

impl_from_name!(Flag);
impl_from_name!(NumericParam);
impl_from_name!(TextParam);

/// Any setting key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    Flag(Flag),
    Numeric(NumericParam),
    Text(TextParam),
}

/// Who made a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// The embedding application
    Local,
    /// Applied from a message sent by the server
    Remote,
}

/// Notification published after a setting changed value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingChange {
    pub key: SettingKey,
    pub origin: ChangeOrigin,
}

#[derive(Debug)]
struct SettingsState {
    flags: HashMap<Flag, bool>,
    numbers: HashMap<NumericParam, i64>,
    text: HashMap<TextParam, String>,
}

impl Default for SettingsState {
    fn default() -> Self {
        Self {
            flags: Flag::ALL.iter().map(|f| (*f, f.default_value())).collect(),
            numbers: NumericParam::ALL
                .iter()
                .map(|p| (*p, p.default_value()))
                .collect(),
            text: TextParam::ALL.iter().map(|p| (*p, String::new())).collect(),
        }
    }
}

/// Shared settings handle; clones observe and mutate the same values
#[derive(Debug, Clone)]
pub struct Settings {
    state: Arc<RwLock<SettingsState>>,
    changes: broadcast::Sender<SettingChange>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Arc::new(RwLock::new(SettingsState::default())),
            changes,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.changes.subscribe()
    }

    pub fn flag(&self, flag: Flag) -> bool {
        self.state
            .read()
            .flags
            .get(&flag)
            .copied()
            .unwrap_or_else(|| flag.default_value())
    }

    pub fn set_flag(&self, flag: Flag, value: bool) {
        self.set_flag_from(flag, value, ChangeOrigin::Local);
    }

    pub fn set_flag_from(&self, flag: Flag, value: bool, origin: ChangeOrigin) {
        let changed = self.state.write().flags.insert(flag, value) != Some(value);
        if changed {
            self.publish(SettingKey::Flag(flag), origin);
        }
    }

    pub fn numeric(&self, param: NumericParam) -> i64 {
        self.state
            .read()
            .numbers
            .get(&param)
            .copied()
            .unwrap_or_else(|| param.default_value())
    }

    /// Set a numeric value, clamped into the parameter's range
    pub fn set_numeric(&self, param: NumericParam, value: i64) {
        self.set_numeric_from(param, value, ChangeOrigin::Local);
    }

    pub fn set_numeric_from(&self, param: NumericParam, value: i64, origin: ChangeOrigin) {
        let (min, max) = param.range();
        let value = value.clamp(min, max);
        let changed = self.state.write().numbers.insert(param, value) != Some(value);
        if changed {
            self.publish(SettingKey::Numeric(param), origin);
        }
    }

    pub fn text(&self, param: TextParam) -> String {
        self.state
            .read()
            .text
            .get(&param)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_text(&self, param: TextParam, value: impl Into<String>) {
        self.set_text_from(param, value, ChangeOrigin::Local);
    }

    pub fn set_text_from(&self, param: TextParam, value: impl Into<String>, origin: ChangeOrigin) {
        let value = value.into();
        let changed = {
            let mut state = self.state.write();
            let previous = state.text.insert(param, value.clone());
            previous.as_deref() != Some(value.as_str())
        };
        if changed {
            self.publish(SettingKey::Text(param), origin);
        }
    }

    /// Apply every entry of a settings document as local changes
    pub fn apply_file(&self, file: &SettingsFile) -> Result<()> {
        for (name, value) in &file.flags {
            self.set_flag(name.parse()?, *value);
        }
        for (name, value) in &file.numeric {
            self.set_numeric(name.parse()?, *value);
        }
        for (name, value) in &file.text {
            self.set_text(name.parse::<TextParam>()?, value.clone());
        }
        Ok(())
    }

    /// Build settings from a TOML document
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(document)?;
        let settings = Self::new();
        settings.apply_file(&file)?;
        Ok(settings)
    }

    fn publish(&self, key: SettingKey, origin: ChangeOrigin) {
        debug!("Setting {:?} changed ({:?})", key, origin);
        // No subscribers is not an error
        let _ = self.changes.send(SettingChange { key, origin });
    }
}

/// On-disk settings document
///
/// ```toml
/// [flags]
/// AutoConnect = true
///
/// [numeric]
/// WebRTCMinBitrate = 500
///
/// [text]
/// ss = "ws://localhost:80"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub flags: HashMap<String, bool>,
    #[serde(default)]
    pub numeric: HashMap<String, i64>,
    #[serde(default)]
    pub text: HashMap<String, String>,
}
