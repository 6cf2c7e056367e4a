// SPDX-License-Identifier: GPL-3.0-only
//! Feature-code backend shared by the native, hardware and relay channels
//!
//! All three channels speak VCP feature codes through a [`DisplayProtocol`];
//! they only differ in the capability flag that makes them available.
//!
//! Continuous values (brightness, contrast, volume, color gains) are `0..=100`
//! on this side and scaled onto the maximum each device reports.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::transition::check_slow_write;
use super::{ChannelKind, ColorGain, ControlBackend, ControlContext, write_property};
use crate::display::{Display, DisplayId, DisplayRef, Property};
use crate::protocols::{FeatureValue, SharedProtocol, vcp};

/// Device maxima learned per display, channel and feature code
#[derive(Clone, Default)]
pub struct FeatureMaxima(Arc<Mutex<HashMap<(DisplayId, ChannelKind, u8), u16>>>);

impl FeatureMaxima {
    pub fn get(&self, id: DisplayId, kind: ChannelKind, code: u8) -> Option<u16> {
        self.0.lock().get(&(id, kind, code)).copied()
    }

    fn remember(&self, id: DisplayId, kind: ChannelKind, code: u8, maximum: u16) {
        self.0.lock().insert((id, kind, code), maximum);
    }

    pub fn forget_display(&self, id: DisplayId) {
        self.0.lock().retain(|(display, _, _), _| *display != id);
    }
}

/// Codes whose values are scaled between `0..=100` and the device maximum
fn is_scaled(code: u8) -> bool {
    matches!(
        code,
        vcp::BRIGHTNESS
            | vcp::CONTRAST
            | vcp::AUDIO_VOLUME
            | vcp::RED_GAIN
            | vcp::GREEN_GAIN
            | vcp::BLUE_GAIN
    )
}

fn to_device(value: u16, maximum: u16) -> u16 {
    ((value.min(100) as u32 * maximum as u32 + 50) / 100) as u16
}

fn from_device(value: u16, maximum: u16) -> u16 {
    if maximum == 0 {
        return value.min(100);
    }
    let maximum = maximum as u32;
    (((value as u32).min(maximum) * 100 + maximum / 2) / maximum) as u16
}

#[derive(Clone)]
pub struct FeatureControl {
    kind: ChannelKind,
    display: DisplayRef,
    protocol: SharedProtocol,
    ctx: ControlContext,
}

impl FeatureControl {
    pub fn new(
        kind: ChannelKind,
        display: DisplayRef,
        protocol: SharedProtocol,
        ctx: ControlContext,
    ) -> Self {
        Self {
            kind,
            display,
            protocol,
            ctx,
        }
    }

    fn with_display<R>(&self, f: impl FnOnce(&Display) -> R) -> Option<R> {
        let display = self.display.upgrade()?;
        let guard = display.read();
        Some(f(&guard))
    }

    fn display_id(&self) -> Option<DisplayId> {
        self.with_display(|d| d.id)
    }

    fn read(&self, code: u8) -> Option<FeatureValue> {
        if !self.is_available() || !self.protocol.lock().supports_feature(code) {
            return None;
        }
        let id = self.display_id()?;
        let result = self.protocol.lock().read_feature(code);
        match result {
            Ok(value) => {
                debug!(display_id = id, channel = %self.kind, "Read {}={}/{}", vcp::name(code), value.current, value.maximum);
                if value.maximum > 0 {
                    self.ctx.maxima.remember(id, self.kind, code, value.maximum);
                }
                Some(value)
            }
            Err(e) => {
                debug!(display_id = id, channel = %self.kind, "Reading {} failed: {}", vcp::name(code), e);
                self.ctx.faults.record_read_failure(id, self.kind);
                None
            }
        }
    }

    fn write(&self, code: u8, value: u16) -> bool {
        if !self.is_available() || !self.protocol.lock().supports_feature(code) {
            return false;
        }
        let Some(id) = self.display_id() else {
            return false;
        };

        let started = Instant::now();
        let result = self.protocol.lock().write_feature(code, value);
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                debug!(display_id = id, channel = %self.kind, ?elapsed, "Wrote {}={}", vcp::name(code), value);
                if let Some(display) = self.display.upgrade() {
                    let mut display = display.write();
                    let was_slow = display.settings.slow_write;
                    check_slow_write(&mut display.settings.slow_write, elapsed);
                    if was_slow != display.settings.slow_write {
                        let slow = display.settings.slow_write;
                        info!(display_id = id, slow, "Write latency changed");
                    }
                }
                true
            }
            Err(e) => {
                debug!(display_id = id, channel = %self.kind, "Writing {}={} failed: {}", vcp::name(code), value, e);
                self.ctx.faults.record_write_failure(id, self.kind);
                false
            }
        }
    }

    /// Read a continuous value as `0..=100`
    fn read_percent(&self, code: u8) -> Option<u16> {
        self.read(code)
            .map(|v| if is_scaled(code) { from_device(v.current, v.maximum) } else { v.current })
    }

    /// Maximum of `code` on the device, probed once and then cached.
    ///
    /// A device that can't be read is assumed to use `0..=100`.
    fn device_maximum(&self, id: DisplayId, code: u8) -> u16 {
        if let Some(maximum) = self.ctx.maxima.get(id, self.kind, code) {
            return maximum;
        }
        let maximum = {
            let mut protocol = self.protocol.lock();
            if !protocol.supports_feature(code) {
                return 100;
            }
            protocol
                .read_feature(code)
                .ok()
                .map(|v| v.maximum)
                .filter(|m| *m > 0)
                .unwrap_or(100)
        };
        if maximum != 100 {
            debug!(display_id = id, channel = %self.kind, "{} maximum is {}", vcp::name(code), maximum);
        }
        self.ctx.maxima.remember(id, self.kind, code, maximum);
        maximum
    }

    /// Write a `0..=100` value scaled onto the device range
    fn write_percent(&self, code: u8, value: u16) -> bool {
        if !self.is_available() {
            return false;
        }
        let Some(id) = self.display_id() else {
            return false;
        };
        let maximum = self.device_maximum(id, code);
        self.write(code, to_device(value, maximum))
    }

    fn set_property(&self, property: Property, code: u8, value: u16, old: Option<u16>) -> bool {
        if !self.is_available() {
            return false;
        }
        let smooth = self.supports_smooth_transition(property);
        let writer = self.clone();
        write_property(
            &self.ctx,
            &self.display,
            property,
            value,
            old,
            smooth,
            move |v| writer.write_percent(code, v),
        )
    }

    pub fn read_gain(&self, gain: ColorGain) -> Option<u16> {
        self.read_percent(gain_code(gain))
    }

    pub fn write_gain(&self, gain: ColorGain, value: u16) -> bool {
        let accepted = self.write_percent(gain_code(gain), value);
        if accepted {
            if let Some(display) = self.display.upgrade() {
                let mut display = display.write();
                match gain {
                    ColorGain::Red => display.red_gain = value,
                    ColorGain::Green => display.green_gain = value,
                    ColorGain::Blue => display.blue_gain = value,
                }
            }
        }
        accepted
    }

    /// Restore the monitor's factory color settings
    pub fn reset_colors(&self) -> bool {
        self.write(vcp::RESTORE_COLOR_DEFAULTS, 1)
    }

    /// Clear fault streaks for this display and channel
    pub fn reset_state(&self) {
        if let Some(id) = self.display_id() {
            self.ctx.faults.reset(id, self.kind);
        }
    }
}

fn gain_code(gain: ColorGain) -> u8 {
    match gain {
        ColorGain::Red => vcp::RED_GAIN,
        ColorGain::Green => vcp::GREEN_GAIN,
        ColorGain::Blue => vcp::BLUE_GAIN,
    }
}

fn property_code(property: Property) -> u8 {
    match property {
        Property::Brightness => vcp::BRIGHTNESS,
        Property::Contrast => vcp::CONTRAST,
        Property::Volume => vcp::AUDIO_VOLUME,
    }
}

impl ControlBackend for FeatureControl {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        let kind = self.kind;
        self.with_display(|d| {
            let capable = match kind {
                ChannelKind::Native => d.capabilities.native_brightness || d.capabilities.is_builtin,
                ChannelKind::Hardware => d.capabilities.has_hardware_protocol,
                ChannelKind::Relay => d.capabilities.has_relay,
                ChannelKind::Gamma => d.capabilities.supports_gamma,
            };
            d.active && d.enabled_controls.is_enabled(kind) && capable
        })
        .unwrap_or(false)
    }

    fn is_responsive(&self) -> bool {
        match self.display_id() {
            Some(id) => self.ctx.faults.is_responsive(id, self.kind),
            None => false,
        }
    }

    fn get_brightness(&self) -> Option<u16> {
        self.read_percent(vcp::BRIGHTNESS)
    }

    fn get_contrast(&self) -> Option<u16> {
        self.read_percent(vcp::CONTRAST)
    }

    fn get_volume(&self) -> Option<u16> {
        self.read_percent(vcp::AUDIO_VOLUME)
    }

    fn get_input(&self) -> Option<u16> {
        self.read(vcp::INPUT_SOURCE).map(|v| v.current)
    }

    fn get_mute(&self) -> Option<bool> {
        self.read(vcp::AUDIO_MUTE).map(|v| v.current == vcp::MUTE_ON)
    }

    fn set_brightness(&self, value: u16, old: Option<u16>) -> bool {
        self.set_property(Property::Brightness, vcp::BRIGHTNESS, value, old)
    }

    fn set_contrast(&self, value: u16, old: Option<u16>) -> bool {
        self.set_property(Property::Contrast, vcp::CONTRAST, value, old)
    }

    fn set_volume(&self, value: u16) -> bool {
        self.write_percent(vcp::AUDIO_VOLUME, value)
    }

    fn set_mute(&self, muted: bool) -> bool {
        let value = if muted { vcp::MUTE_ON } else { vcp::MUTE_OFF };
        self.write(vcp::AUDIO_MUTE, value)
    }

    fn set_input(&self, input: u16) -> bool {
        self.write(vcp::INPUT_SOURCE, input)
    }

    fn set_power(&self, on: bool) -> bool {
        let value = if on { vcp::POWER_ON } else { vcp::POWER_OFF };
        self.write(vcp::POWER_MODE, value)
    }

    fn reset(&self) -> bool {
        if self.kind != ChannelKind::Hardware {
            return false;
        }
        self.write(vcp::FACTORY_RESET, 1)
    }

    fn supports_smooth_transition(&self, property: Property) -> bool {
        if !self.protocol.lock().supports_feature(property_code(property)) {
            return false;
        }
        self.with_display(|d| !d.settings.slow_write).unwrap_or(false)
    }
}

impl fmt::Debug for FeatureControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol.try_lock() {
            Some(protocol) => write!(f, "FeatureControl({}, {})", self.kind, protocol.id()),
            None => write!(f, "FeatureControl({}, busy)", self.kind),
        }
    }
}
