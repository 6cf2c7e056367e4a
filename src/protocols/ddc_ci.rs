// SPDX-License-Identifier: GPL-3.0-only
//! DDC/CI (Display Data Channel Command Interface) protocol implementation
//!
//! DDC/CI is a standard protocol for controlling monitors over I2C bus.
//! It's supported by most modern external monitors via the video cable.

use std::time::Duration;

use anyhow::{Result, anyhow};
use ddc_hi::{Ddc, Display};

use super::{DisplayProtocol, FeatureValue, vcp};

/// Attempts made while a freshly plugged monitor wakes up
const PROBE_ATTEMPTS: u32 = 5;

/// DDC/CI display implementation
pub struct DdcCiDisplay {
    display: Display,
    /// Stable serial derived from EDID; the I2C id changes across reboots
    stable_serial: Option<String>,
}

impl DdcCiDisplay {
    /// Create a new DDC/CI display wrapper
    pub fn new(display: Display) -> Self {
        Self {
            display,
            stable_serial: None,
        }
    }

    /// Enumerate all DDC/CI displays
    pub fn enumerate() -> Vec<Self> {
        Display::enumerate().into_iter().map(Self::new).collect()
    }

    /// Set the stable serial used to build the display ID
    pub fn set_stable_serial(&mut self, serial: Option<String>) {
        self.stable_serial = serial;
    }

    /// Raw EDID as reported over DDC, when the backend exposes it
    pub fn edid(&self) -> Option<&[u8]> {
        self.display.info.edid_data.as_deref()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.display.info.model_name.as_deref()
    }

    pub fn serial_text(&self) -> Option<&str> {
        self.display.info.serial_number.as_deref()
    }

    /// Wake the monitor and read brightness until it answers.
    ///
    /// Some monitors need a write before they answer reads after hotplug, so
    /// a read/write-back cycle runs first, then reads retry with a
    /// progressive delay.
    pub fn probe(&mut self) -> Result<FeatureValue> {
        match self.read_feature(vcp::BRIGHTNESS) {
            Ok(value) => {
                let _ = self.write_feature(vcp::BRIGHTNESS, value.current);
            }
            Err(_) => {
                // 50% neither blinds nor blacks out the user
                let _ = self.write_feature(vcp::BRIGHTNESS, 50);
            }
        }
        std::thread::sleep(Duration::from_millis(100));

        let mut last_error = None;
        for attempt in 1..=PROBE_ATTEMPTS {
            match self.read_feature(vcp::BRIGHTNESS) {
                Ok(value) => {
                    if attempt > 1 {
                        info!("DDC/CI display succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    debug!("DDC/CI attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < PROBE_ATTEMPTS {
                        let delay_ms = 50 + (attempt as u64 * 50);
                        std::thread::sleep(Duration::from_millis(delay_ms));
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("DDC/CI probe failed")))
    }
}

impl DisplayProtocol for DdcCiDisplay {
    fn id(&self) -> String {
        match &self.stable_serial {
            Some(serial) => format!("ddc-{}", serial),
            // Unstable across reboots
            None => self.display.info.id.clone(),
        }
    }

    fn name(&self) -> String {
        self.display.info.model_name.clone().unwrap_or_default()
    }

    fn read_feature(&mut self, code: u8) -> Result<FeatureValue> {
        let value = self.display.handle.get_vcp_feature(code)?;
        Ok(FeatureValue {
            current: value.value(),
            maximum: value.maximum(),
        })
    }

    fn write_feature(&mut self, code: u8, value: u16) -> Result<()> {
        self.display.handle.set_vcp_feature(code, value)?;
        Ok(())
    }
}

impl std::fmt::Debug for DdcCiDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DdcCiDisplay(id: {}, name: {})", self.id(), self.name())
    }
}
