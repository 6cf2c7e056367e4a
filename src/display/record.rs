// SPDX-License-Identifier: GPL-3.0-only
//! Persisted display records
//!
//! One record per display, stored under `display:<serial>`. Records outlive
//! the hardware: a disconnected monitor keeps its record so it re-binds to
//! the same settings when it comes back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Capabilities, Display, DisplayId, DisplayIdentity, DisplaySettings, EnabledControls};
use crate::adaptive::ModeKey;
use crate::adaptive::clock::Schedule;
use crate::adaptive::curve::ModeCurves;
use crate::error::{AppError, Result};
use crate::store::{self, KeyValueStore};

pub const RECORD_PREFIX: &str = "display:";

fn default_gain() -> u16 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayRecord {
    pub serial: String,
    /// Volatile id the display had when last seen; orders match tie-breaks
    pub last_id: DisplayId,
    pub name: String,
    pub identity: DisplayIdentity,
    #[serde(default)]
    pub edid_uuid_patterns: Vec<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub enabled_controls: EnabledControls,
    pub min_brightness: u16,
    pub max_brightness: u16,
    pub min_contrast: u16,
    pub max_contrast: u16,
    pub brightness: u16,
    pub contrast: u16,
    #[serde(default)]
    pub volume: u16,
    #[serde(default)]
    pub input: u16,
    #[serde(default = "default_gain")]
    pub red_gain: u16,
    #[serde(default = "default_gain")]
    pub green_gain: u16,
    #[serde(default = "default_gain")]
    pub blue_gain: u16,
    #[serde(default)]
    pub settings: DisplaySettings,
    #[serde(default)]
    pub curves: BTreeMap<ModeKey, ModeCurves>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub relay_bus: Option<String>,
}

impl DisplayRecord {
    pub fn key(&self) -> String {
        record_key(&self.serial)
    }

    /// Rebuild a display from its record under a new volatile id.
    ///
    /// Capabilities are left to the caller, who knows the live hardware.
    pub fn into_display(self, id: DisplayId) -> Display {
        let mut display = Display::new(id, self.serial, self.identity);
        display.name = self.name;
        display.edid_uuid_patterns = self.edid_uuid_patterns;
        display.capabilities = self.capabilities;
        display.enabled_controls = self.enabled_controls;
        display.min_brightness = self.min_brightness;
        display.max_brightness = self.max_brightness;
        display.min_contrast = self.min_contrast;
        display.max_contrast = self.max_contrast;
        display.brightness = self.brightness;
        display.contrast = self.contrast;
        display.volume = self.volume;
        display.input = self.input;
        display.red_gain = self.red_gain;
        display.green_gain = self.green_gain;
        display.blue_gain = self.blue_gain;
        display.settings = self.settings;
        display.curves = self.curves;
        display.schedules = self.schedules;
        display.relay_bus = self.relay_bus;
        display.enabled_controls.repair();
        display.repair_limits();
        display
    }
}

impl From<&Display> for DisplayRecord {
    fn from(display: &Display) -> Self {
        Self {
            serial: display.serial.clone(),
            last_id: display.id,
            name: display.name.clone(),
            identity: display.identity.clone(),
            edid_uuid_patterns: display.edid_uuid_patterns.clone(),
            capabilities: display.capabilities,
            enabled_controls: display.enabled_controls.clone(),
            min_brightness: display.min_brightness,
            max_brightness: display.max_brightness,
            min_contrast: display.min_contrast,
            max_contrast: display.max_contrast,
            brightness: display.brightness,
            contrast: display.contrast,
            volume: display.volume,
            input: display.input,
            red_gain: display.red_gain,
            green_gain: display.green_gain,
            blue_gain: display.blue_gain,
            settings: display.settings.clone(),
            curves: display.curves.clone(),
            schedules: display.schedules.clone(),
            relay_bus: display.relay_bus.clone(),
        }
    }
}

pub fn record_key(serial: &str) -> String {
    format!("{RECORD_PREFIX}{serial}")
}

pub fn save(store: &dyn KeyValueStore, display: &Display) -> Result<()> {
    let record = DisplayRecord::from(display);
    store::set_typed(store, &record.key(), &record)
}

pub fn load(store: &dyn KeyValueStore, serial: &str) -> Option<DisplayRecord> {
    store::get_typed(store, &record_key(serial))
}

pub fn remove(store: &dyn KeyValueStore, serial: &str) -> Result<()> {
    store.remove(&record_key(serial))
}

/// Every persisted record, ordered by last known id then serial.
///
/// Records that no longer deserialize are skipped with a warning.
pub fn load_all(store: &dyn KeyValueStore) -> Vec<DisplayRecord> {
    let mut records: Vec<DisplayRecord> = store
        .keys()
        .into_iter()
        .filter(|k| k.starts_with(RECORD_PREFIX))
        .filter_map(|key| {
            let value = store.get(&key)?;
            match serde_json::from_value::<DisplayRecord>(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key, error = %e, "Skipping unreadable display record");
                    None
                }
            }
        })
        .collect();
    records.sort_by(|a, b| a.last_id.cmp(&b.last_id).then_with(|| a.serial.cmp(&b.serial)));
    records
}

/// Validate the clamps of a record before it is written back by hand
pub fn validate(record: &DisplayRecord) -> Result<()> {
    for (what, min, max) in [
        ("brightness", record.min_brightness, record.max_brightness),
        ("contrast", record.min_contrast, record.max_contrast),
    ] {
        if min >= max {
            return Err(AppError::InvalidRange {
                serial: record.serial.clone(),
                what,
                min,
                max,
            });
        }
    }
    Ok(())
}
