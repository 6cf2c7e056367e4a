// SPDX-License-Identifier: GPL-3.0-only
//! Display model
//!
//! A [`Display`] is the controller's view of one physical monitor: its stable
//! identity, capability flags, the values last applied to it and the user's
//! per-display settings. Hardware handles live next to it in the
//! [`registry::DisplayRegistry`], never inside it.

pub mod record;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::adaptive::ModeKey;
use crate::adaptive::clock::Schedule;
use crate::adaptive::curve::ModeCurves;
use crate::control::ChannelKind;
use crate::edid::EdidInfo;
use crate::error::{AppError, Result};

pub use registry::{DisplayEntry, DisplayRef, DisplayRegistry, SharedDisplay};

/// Volatile OS-assigned display handle (DRM connector id)
pub type DisplayId = u32;

/// Time after a (re)connection during which user nudges are not learned
const RECONNECT_LEARNING_GRACE: Duration = Duration::from_secs(5);

/// Physical link the display is attached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    DisplayPort,
    Hdmi,
    Dvi,
    Vga,
    Embedded,
    Usb,
    Virtual,
}

impl Transport {
    /// Map a DRM connector type prefix (`DP`, `HDMI-A`, `eDP`...) to a transport
    pub fn from_connector(connector: &str) -> Option<Self> {
        let kind = connector.rsplit_once('-').map(|(k, _)| k).unwrap_or(connector);
        match kind {
            "DP" => Some(Self::DisplayPort),
            "eDP" | "LVDS" | "DSI" => Some(Self::Embedded),
            "DVI-D" | "DVI-I" | "DVI-A" => Some(Self::Dvi),
            "VGA" => Some(Self::Vga),
            "Virtual" | "WRITEBACK" => Some(Self::Virtual),
            k if k.starts_with("HDMI") => Some(Self::Hdmi),
            k if k.starts_with("USB") => Some(Self::Usb),
            _ => None,
        }
    }
}

/// Identity signals used to reconcile live handles with persisted records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayIdentity {
    pub name: String,
    pub serial_number: Option<u32>,
    pub serial_text: Option<String>,
    pub product_id: Option<u16>,
    pub vendor_id: Option<u16>,
    pub year: Option<u16>,
    pub week: Option<u8>,
    /// Pixel geometry of the preferred mode
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub transport: Option<Transport>,
    /// Connector name such as `DP-2`, used when no EDID is available
    pub connector: Option<String>,
}

impl DisplayIdentity {
    pub fn from_edid(info: &EdidInfo) -> Self {
        Self {
            name: info.name.clone().unwrap_or_default(),
            serial_number: (info.serial_number != 0).then_some(info.serial_number),
            serial_text: info.serial_text.clone(),
            product_id: Some(info.product_id),
            vendor_id: Some(info.vendor_id),
            year: Some(info.year),
            week: Some(info.week),
            ..Default::default()
        }
    }

    /// Derive a serial that survives reboots and reconnects.
    ///
    /// Built from the EDID manufacturer/product/serial triple; falls back to
    /// the connector name for displays without usable EDID data.
    pub fn stable_serial(&self) -> String {
        let serial = self
            .serial_text
            .clone()
            .or_else(|| self.serial_number.map(|s| format!("{s:08X}")));

        match (self.vendor_id, self.product_id, serial) {
            (Some(vendor), Some(product), Some(serial)) => {
                format!("{vendor:04X}-{product:04X}-{serial}")
            }
            (Some(vendor), Some(product), None) => {
                let name = self.name.replace(' ', "_");
                format!("{vendor:04X}-{product:04X}-{name}")
            }
            _ => match &self.connector {
                Some(connector) => format!("connector-{connector}"),
                None => format!("name-{}", self.name.replace(' ', "_")),
            },
        }
    }
}

/// What the live hardware can do for a display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// DDC/CI answered on the cable
    pub has_hardware_protocol: bool,
    /// Vendor brightness service (Apple/LG USB HID, built-in backlight)
    pub native_brightness: bool,
    /// A LAN relay advertised this display
    pub has_relay: bool,
    pub supports_gamma: bool,
    pub is_builtin: bool,
}

/// Controllable properties that get transitions, debouncing and curves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    Brightness,
    Contrast,
    Volume,
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Property::Brightness => "brightness",
            Property::Contrast => "contrast",
            Property::Volume => "volume",
        };
        f.write_str(name)
    }
}

/// User allow-list of control channels.
///
/// Never reaches a state where every channel is disabled: software gamma is
/// the floor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnabledControls(BTreeMap<ChannelKind, bool>);

impl Default for EnabledControls {
    fn default() -> Self {
        Self(ChannelKind::PREFERENCE.iter().map(|k| (*k, true)).collect())
    }
}

impl EnabledControls {
    pub fn is_enabled(&self, kind: ChannelKind) -> bool {
        self.0.get(&kind).copied().unwrap_or(true)
    }

    pub fn enabled_count(&self) -> usize {
        ChannelKind::PREFERENCE
            .iter()
            .filter(|k| self.is_enabled(**k))
            .count()
    }

    /// Enable or disable a channel.
    ///
    /// Returns `false` (and leaves the map untouched apart from forcing gamma
    /// on) when the change would disable the last enabled channel.
    pub fn set(&mut self, kind: ChannelKind, enabled: bool) -> bool {
        if !enabled && self.is_enabled(kind) && self.enabled_count() == 1 {
            self.0.insert(ChannelKind::Gamma, true);
            return false;
        }
        self.0.insert(kind, enabled);
        true
    }

    /// Restore the gamma floor on a map that lost it (legacy records)
    pub fn repair(&mut self) -> bool {
        if self.enabled_count() == 0 {
            self.0.insert(ChannelKind::Gamma, true);
            return true;
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelKind, bool)> + '_ {
        ChannelKind::PREFERENCE.iter().map(|k| (*k, self.is_enabled(*k)))
    }
}

/// Per-display preferences persisted with the record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Writes take longer than the smooth step budget, skip smooth transitions
    pub slow_write: bool,
    pub locked_brightness_curve: bool,
    pub locked_contrast_curve: bool,
    /// User answered "never" to the fallback prompt
    pub never_fallback_control: bool,
    /// Fall back to gamma without asking
    pub always_fallback_control: bool,
    /// Reference display for Sync mode
    pub is_source: bool,
    /// Excluded from adaptive updates
    pub adaptive_paused: bool,
}

#[derive(Debug, Clone)]
pub struct Display {
    pub id: DisplayId,
    pub serial: String,
    pub name: String,
    pub active: bool,
    pub identity: DisplayIdentity,
    pub edid_uuid_patterns: Vec<String>,
    pub capabilities: Capabilities,

    pub brightness: u16,
    pub contrast: u16,
    pub volume: u16,
    pub input: u16,
    pub muted: bool,
    pub power_on: bool,
    pub red_gain: u16,
    pub green_gain: u16,
    pub blue_gain: u16,

    pub min_brightness: u16,
    pub max_brightness: u16,
    pub min_contrast: u16,
    pub max_contrast: u16,

    pub enabled_controls: EnabledControls,
    pub last_written_brightness: Option<u16>,
    pub last_written_contrast: Option<u16>,

    pub settings: DisplaySettings,
    pub curves: BTreeMap<ModeKey, ModeCurves>,
    pub schedules: Vec<Schedule>,
    pub relay_bus: Option<String>,

    pub connected_at: Option<Instant>,
}

impl Display {
    pub fn new(id: DisplayId, serial: impl Into<String>, identity: DisplayIdentity) -> Self {
        let name = if identity.name.is_empty() {
            identity
                .connector
                .clone()
                .unwrap_or_else(|| "Unknown display".to_string())
        } else {
            identity.name.clone()
        };
        Self {
            id,
            serial: serial.into(),
            name,
            active: true,
            identity,
            edid_uuid_patterns: Vec::new(),
            capabilities: Capabilities {
                supports_gamma: true,
                ..Default::default()
            },
            brightness: 50,
            contrast: 50,
            volume: 10,
            input: 0,
            muted: false,
            power_on: true,
            red_gain: 50,
            green_gain: 50,
            blue_gain: 50,
            min_brightness: 0,
            max_brightness: 100,
            min_contrast: 0,
            max_contrast: 100,
            enabled_controls: EnabledControls::default(),
            last_written_brightness: None,
            last_written_contrast: None,
            settings: DisplaySettings::default(),
            curves: BTreeMap::new(),
            schedules: Vec::new(),
            relay_bus: None,
            connected_at: Some(Instant::now()),
        }
    }

    pub fn clamp_brightness(&self, value: u16) -> u16 {
        value.clamp(self.min_brightness, self.max_brightness)
    }

    pub fn clamp_contrast(&self, value: u16) -> u16 {
        value.clamp(self.min_contrast, self.max_contrast)
    }

    /// `(min, max)` clamps for a property
    pub fn limits(&self, property: Property) -> (u16, u16) {
        match property {
            Property::Brightness => (self.min_brightness, self.max_brightness),
            Property::Contrast => (self.min_contrast, self.max_contrast),
            Property::Volume => (0, 100),
        }
    }

    pub fn value(&self, property: Property) -> u16 {
        match property {
            Property::Brightness => self.brightness,
            Property::Contrast => self.contrast,
            Property::Volume => self.volume,
        }
    }

    pub fn set_value(&mut self, property: Property, value: u16) {
        match property {
            Property::Brightness => self.brightness = value,
            Property::Contrast => self.contrast = value,
            Property::Volume => self.volume = value,
        }
    }

    pub fn set_last_written(&mut self, property: Property, value: u16) {
        match property {
            Property::Brightness => self.last_written_brightness = Some(value),
            Property::Contrast => self.last_written_contrast = Some(value),
            Property::Volume => {}
        }
    }

    /// Update the min/max clamps of a property, rejecting `min >= max`
    pub fn set_limits(&mut self, property: Property, min: u16, max: u16) -> Result<()> {
        if min >= max || max > 100 {
            return Err(AppError::InvalidRange {
                serial: self.serial.clone(),
                what: match property {
                    Property::Brightness => "brightness",
                    Property::Contrast => "contrast",
                    Property::Volume => "volume",
                },
                min,
                max,
            });
        }
        match property {
            Property::Brightness => {
                self.min_brightness = min;
                self.max_brightness = max;
                self.brightness = self.clamp_brightness(self.brightness);
            }
            Property::Contrast => {
                self.min_contrast = min;
                self.max_contrast = max;
                self.contrast = self.clamp_contrast(self.contrast);
            }
            Property::Volume => {}
        }
        for curves in self.curves.values_mut() {
            curves.rebound(property, min, max);
        }
        Ok(())
    }

    /// Reset clamps that are inverted or out of range back to `0..=100`.
    ///
    /// Returns whether anything had to be repaired.
    pub fn repair_limits(&mut self) -> bool {
        let mut repaired = false;
        for property in [Property::Brightness, Property::Contrast] {
            let (min, max) = self.limits(property);
            if min < max && max <= 100 {
                continue;
            }
            warn!(
                serial = %self.serial,
                %property,
                min,
                max,
                "Resetting invalid limits to 0-100"
            );
            match property {
                Property::Brightness => (self.min_brightness, self.max_brightness) = (0, 100),
                Property::Contrast => (self.min_contrast, self.max_contrast) = (0, 100),
                Property::Volume => {}
            }
            for curves in self.curves.values_mut() {
                curves.rebound(property, 0, 100);
            }
            repaired = true;
        }
        if repaired {
            self.brightness = self.clamp_brightness(self.brightness);
            self.contrast = self.clamp_contrast(self.contrast);
        }
        repaired
    }

    pub fn is_curve_locked(&self, property: Property) -> bool {
        match property {
            Property::Brightness => self.settings.locked_brightness_curve,
            Property::Contrast => self.settings.locked_contrast_curve,
            Property::Volume => true,
        }
    }

    pub fn curves_mut(&mut self, mode: ModeKey) -> &mut ModeCurves {
        let (min_b, max_b) = (self.min_brightness, self.max_brightness);
        let (min_c, max_c) = (self.min_contrast, self.max_contrast);
        self.curves
            .entry(mode)
            .or_insert_with(|| ModeCurves::new((min_b, max_b), (min_c, max_c)))
    }

    pub fn curves(&self, mode: ModeKey) -> Option<&ModeCurves> {
        self.curves.get(&mode)
    }

    /// Mark the display as (re)connected under a possibly new volatile id
    pub fn mark_connected(&mut self, id: DisplayId) {
        self.id = id;
        self.active = true;
        self.connected_at = Some(Instant::now());
    }

    pub fn recently_connected(&self) -> bool {
        self.connected_at
            .is_some_and(|at| at.elapsed() < RECONNECT_LEARNING_GRACE)
    }
}
