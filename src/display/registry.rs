// SPDX-License-Identifier: GPL-3.0-only
//! Display registry
//!
//! Holds every known display (active or dormant) keyed by its stable serial,
//! together with the hardware handles enumerated for it. Backends only get a
//! [`DisplayRef`], so a removed display is dropped as soon as the registry
//! lets go of it.
//!
//! # Thread Safety
//!
//! The map and each display sit behind `parking_lot` locks. Background
//! watchers and transition threads read through the same accessors the
//! intents use; no lock is held across hardware I/O.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::{Display, DisplayId};
use crate::control::DisplayChannels;

pub type SharedDisplay = Arc<RwLock<Display>>;
pub type DisplayRef = Weak<RwLock<Display>>;

/// A display plus the hardware handles currently bound to it
#[derive(Clone)]
pub struct DisplayEntry {
    pub display: SharedDisplay,
    pub channels: DisplayChannels,
}

impl DisplayEntry {
    pub fn serial(&self) -> String {
        self.display.read().serial.clone()
    }

    pub fn downgrade(&self) -> DisplayRef {
        Arc::downgrade(&self.display)
    }
}

#[derive(Clone, Default)]
pub struct DisplayRegistry {
    entries: Arc<RwLock<BTreeMap<String, DisplayEntry>>>,
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `display.serial`
    pub fn insert(&self, display: Display, channels: DisplayChannels) -> DisplayEntry {
        let serial = display.serial.clone();
        let entry = DisplayEntry {
            display: Arc::new(RwLock::new(display)),
            channels,
        };
        self.entries.write().insert(serial, entry.clone());
        entry
    }

    /// Swap the hardware handles of an existing entry, keeping the display
    pub fn set_channels(&self, serial: &str, channels: DisplayChannels) -> Option<DisplayEntry> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(serial)?;
        entry.channels = channels;
        Some(entry.clone())
    }

    pub fn entry(&self, serial: &str) -> Option<DisplayEntry> {
        self.entries.read().get(serial).cloned()
    }

    pub fn get(&self, serial: &str) -> Option<SharedDisplay> {
        self.entries.read().get(serial).map(|e| e.display.clone())
    }

    pub fn remove(&self, serial: &str) -> Option<DisplayEntry> {
        let removed = self.entries.write().remove(serial);
        if removed.is_some() {
            info!(serial, "Display removed from registry");
        }
        removed
    }

    pub fn serials(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// All entries ordered by serial
    pub fn all(&self) -> Vec<DisplayEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Active entries ordered by volatile id
    pub fn active(&self) -> Vec<DisplayEntry> {
        let mut active: Vec<_> = self
            .entries
            .read()
            .values()
            .filter(|e| e.display.read().active)
            .cloned()
            .collect();
        active.sort_by_key(|e| e.display.read().id);
        active
    }

    pub fn by_id(&self, id: DisplayId) -> Option<DisplayEntry> {
        self.entries
            .read()
            .values()
            .find(|e| {
                let d = e.display.read();
                d.active && d.id == id
            })
            .cloned()
    }

    pub fn builtin(&self) -> Option<DisplayEntry> {
        self.active()
            .into_iter()
            .find(|e| e.display.read().capabilities.is_builtin)
    }

    /// The reference display for Sync mode
    pub fn source(&self) -> Option<DisplayEntry> {
        self.active()
            .into_iter()
            .find(|e| e.display.read().settings.is_source)
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }
}
