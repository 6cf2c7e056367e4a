// SPDX-License-Identifier: GPL-3.0-only
//! Software gamma backend
//!
//! Dims the picture by scaling the display's color lookup ramps. Works on every
//! display, so it is the floor every other channel falls back to. The ramps are
//! handed to a [`GammaSink`], which owns the actual compositor hook.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Result, bail};
use parking_lot::Mutex;

use super::{ChannelKind, ControlBackend, ControlContext, write_property};
use crate::display::{Display, DisplayId, DisplayRef, Property};

/// Samples per color channel
pub const GAMMA_SAMPLES: usize = 256;

/// Darkest scale the ramp reaches at brightness 0, so the screen stays legible
const MIN_GAMMA_SCALE: f32 = 0.08;

#[derive(Debug, Clone, PartialEq)]
pub struct GammaTable {
    pub red: Vec<f32>,
    pub green: Vec<f32>,
    pub blue: Vec<f32>,
}

impl GammaTable {
    /// `scale * x^exponent` sampled over `[0, 1]`
    pub fn ramp(scale: f32, exponent: f32) -> Self {
        let channel: Vec<f32> = (0..GAMMA_SAMPLES)
            .map(|i| {
                let x = i as f32 / (GAMMA_SAMPLES - 1) as f32;
                scale * x.powf(exponent)
            })
            .collect();
        Self {
            red: channel.clone(),
            green: channel.clone(),
            blue: channel,
        }
    }

    pub fn identity() -> Self {
        Self::ramp(1.0, 1.0)
    }

    /// Ramp emulating a hardware brightness/contrast pair
    pub fn for_values(brightness: u16, contrast: u16) -> Self {
        Self::ramp(brightness_scale(brightness), contrast_exponent(contrast))
    }
}

/// Perceptual brightness scale: `0.08 + 0.92 * (b/100)^0.8`
pub fn brightness_scale(brightness: u16) -> f32 {
    let b = brightness.min(100) as f32 / 100.0;
    MIN_GAMMA_SCALE + (1.0 - MIN_GAMMA_SCALE) * b.powf(0.8)
}

/// Ramp exponent for a contrast value; 50 is neutral
pub fn contrast_exponent(contrast: u16) -> f32 {
    0.5 + contrast.min(100) as f32 / 100.0
}

/// Compositor hook that loads gamma ramps onto a display.
///
/// Displays are passed by volatile id and DRM connector name; hooks that
/// talk to a compositor find the output by connector.
pub trait GammaSink: Send + Sync {
    /// Whether ramps can reach the display on `connector` right now
    fn can_drive(&self, _connector: Option<&str>) -> bool {
        true
    }

    fn apply(&self, id: DisplayId, connector: Option<&str>, table: &GammaTable) -> Result<()>;

    /// Put the display's original ramps back
    fn restore(&self, id: DisplayId, connector: Option<&str>) -> Result<()>;
}

/// Used when no compositor hook could be reached: no display can be dimmed
#[derive(Debug, Default)]
pub struct DetachedGammaSink;

impl GammaSink for DetachedGammaSink {
    fn can_drive(&self, _connector: Option<&str>) -> bool {
        false
    }

    fn apply(&self, id: DisplayId, _connector: Option<&str>, _table: &GammaTable) -> Result<()> {
        bail!("no gamma hook for display {id}")
    }

    fn restore(&self, _id: DisplayId, _connector: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Sink that only remembers the last table per display
#[derive(Debug, Default)]
pub struct MemoryGammaSink {
    applied: Mutex<HashMap<DisplayId, GammaTable>>,
}

impl MemoryGammaSink {
    pub fn applied(&self, id: DisplayId) -> Option<GammaTable> {
        self.applied.lock().get(&id).cloned()
    }
}

impl GammaSink for MemoryGammaSink {
    fn apply(&self, id: DisplayId, _connector: Option<&str>, table: &GammaTable) -> Result<()> {
        self.applied.lock().insert(id, table.clone());
        Ok(())
    }

    fn restore(&self, id: DisplayId, _connector: Option<&str>) -> Result<()> {
        self.applied.lock().remove(&id);
        Ok(())
    }
}

#[derive(Clone)]
pub struct GammaControl {
    display: DisplayRef,
    ctx: ControlContext,
}

impl GammaControl {
    pub fn new(display: DisplayRef, ctx: ControlContext) -> Self {
        Self { display, ctx }
    }

    fn with_display<R>(&self, f: impl FnOnce(&Display) -> R) -> Option<R> {
        let display = self.display.upgrade()?;
        let guard = display.read();
        Some(f(&guard))
    }

    /// Load the ramp for `property = value`, keeping the other property as is
    fn apply(&self, property: Property, value: u16) -> bool {
        if !self.is_available() {
            return false;
        }
        let Some((id, connector, brightness, contrast)) = self.with_display(|d| {
            let brightness = d.last_written_brightness.unwrap_or(d.brightness);
            let contrast = d.last_written_contrast.unwrap_or(d.contrast);
            (d.id, d.identity.connector.clone(), brightness, contrast)
        }) else {
            return false;
        };
        let table = match property {
            Property::Brightness => GammaTable::for_values(value, contrast),
            Property::Contrast => GammaTable::for_values(brightness, value),
            Property::Volume => return false,
        };
        match self.ctx.gamma_sink.apply(id, connector.as_deref(), &table) {
            Ok(()) => true,
            Err(e) => {
                warn!(display_id = id, "Applying gamma failed: {}", e);
                self.ctx.faults.record_write_failure(id, ChannelKind::Gamma);
                false
            }
        }
    }

    fn set_property(&self, property: Property, value: u16, old: Option<u16>) -> bool {
        if !self.is_available() {
            return false;
        }
        let writer = self.clone();
        write_property(
            &self.ctx,
            &self.display,
            property,
            value,
            old,
            true,
            move |v| writer.apply(property, v),
        )
    }

    /// Drop the software dimming and restore the original ramps
    pub fn restore(&self) -> bool {
        let Some((id, connector)) = self.with_display(|d| (d.id, d.identity.connector.clone()))
        else {
            return false;
        };
        match self.ctx.gamma_sink.restore(id, connector.as_deref()) {
            Ok(()) => true,
            Err(e) => {
                warn!(display_id = id, "Restoring gamma failed: {}", e);
                false
            }
        }
    }
}

impl ControlBackend for GammaControl {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Gamma
    }

    fn is_available(&self) -> bool {
        self.with_display(|d| {
            d.active
                && d.enabled_controls.is_enabled(ChannelKind::Gamma)
                && d.capabilities.supports_gamma
                && self.ctx.gamma_sink.can_drive(d.identity.connector.as_deref())
        })
        .unwrap_or(false)
    }

    fn is_responsive(&self) -> bool {
        self.with_display(|d| d.id)
            .is_some_and(|id| self.ctx.faults.is_responsive(id, ChannelKind::Gamma))
    }

    // Ramps can't be read back as a brightness, the cached value is the truth
    fn get_brightness(&self) -> Option<u16> {
        self.with_display(|d| d.brightness)
    }

    fn get_contrast(&self) -> Option<u16> {
        self.with_display(|d| d.contrast)
    }

    fn get_volume(&self) -> Option<u16> {
        None
    }

    fn get_input(&self) -> Option<u16> {
        None
    }

    fn get_mute(&self) -> Option<bool> {
        None
    }

    fn set_brightness(&self, value: u16, old: Option<u16>) -> bool {
        self.set_property(Property::Brightness, value, old)
    }

    fn set_contrast(&self, value: u16, old: Option<u16>) -> bool {
        self.set_property(Property::Contrast, value, old)
    }

    fn set_volume(&self, _value: u16) -> bool {
        false
    }

    fn set_mute(&self, _muted: bool) -> bool {
        false
    }

    fn set_input(&self, _input: u16) -> bool {
        false
    }

    fn set_power(&self, _on: bool) -> bool {
        false
    }

    fn reset(&self) -> bool {
        false
    }

    fn supports_smooth_transition(&self, property: Property) -> bool {
        property != Property::Volume
    }
}

impl fmt::Debug for GammaControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GammaControl")
    }
}
