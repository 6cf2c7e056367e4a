// SPDX-License-Identifier: GPL-3.0-only
//! Display control protocols
//!
//! Each protocol reads and writes VCP-style feature values through a
//! different transport. Protocols report failures as `anyhow` errors; the
//! control layer turns those into fault counts.

pub mod backlight;
pub mod ddc_ci;
pub mod relay;

#[cfg(feature = "apple-hid-displays")]
pub mod apple_hid;

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

/// VCP feature codes
pub mod vcp {
    pub const FACTORY_RESET: u8 = 0x04;
    pub const RESTORE_COLOR_DEFAULTS: u8 = 0x08;
    pub const BRIGHTNESS: u8 = 0x10;
    pub const CONTRAST: u8 = 0x12;
    pub const RED_GAIN: u8 = 0x16;
    pub const GREEN_GAIN: u8 = 0x18;
    pub const BLUE_GAIN: u8 = 0x1A;
    pub const INPUT_SOURCE: u8 = 0x60;
    pub const AUDIO_VOLUME: u8 = 0x62;
    pub const AUDIO_MUTE: u8 = 0x8D;
    pub const POWER_MODE: u8 = 0xD6;

    pub const MUTE_ON: u16 = 1;
    pub const MUTE_OFF: u16 = 2;
    pub const POWER_ON: u16 = 1;
    pub const POWER_OFF: u16 = 5;

    /// Short path segment used by the LAN relay
    pub fn name(code: u8) -> String {
        match code {
            FACTORY_RESET => "reset".into(),
            RESTORE_COLOR_DEFAULTS => "reset_color".into(),
            BRIGHTNESS => "brightness".into(),
            CONTRAST => "contrast".into(),
            RED_GAIN => "red".into(),
            GREEN_GAIN => "green".into(),
            BLUE_GAIN => "blue".into(),
            INPUT_SOURCE => "input".into(),
            AUDIO_VOLUME => "volume".into(),
            AUDIO_MUTE => "mute".into(),
            POWER_MODE => "power".into(),
            other => format!("0x{other:02x}"),
        }
    }
}

/// Current and maximum value of a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureValue {
    pub current: u16,
    pub maximum: u16,
}

/// Common trait for all display control protocols
pub trait DisplayProtocol: std::fmt::Debug + Send {
    /// Get the unique identifier for this display
    fn id(&self) -> String;

    /// Get the human-readable name of this display
    fn name(&self) -> String;

    /// Read a feature (current and maximum value)
    fn read_feature(&mut self, code: u8) -> Result<FeatureValue>;

    /// Write a feature value
    fn write_feature(&mut self, code: u8, value: u16) -> Result<()>;

    /// Whether this transport can carry `code` at all
    fn supports_feature(&self, _code: u8) -> bool {
        true
    }
}

/// A protocol handle shared by the registry, backends and transitions
pub type SharedProtocol = Arc<Mutex<Box<dyn DisplayProtocol>>>;

pub fn shared(protocol: impl DisplayProtocol + 'static) -> SharedProtocol {
    Arc::new(Mutex::new(Box::new(protocol)))
}
