// SPDX-License-Identifier: GPL-3.0-only
//! Apple HID display device implementation

use anyhow::{Context, Result, bail};
use hidapi::{HidApi, HidDevice};

use super::models::{NativeModel, find_model};
use super::INTERFACE_NUMBER;
use crate::protocols::{DisplayProtocol, FeatureValue, vcp};

/// HID feature report size in bytes
const REPORT_SIZE: usize = 7;

/// HID Report ID for brightness control
const REPORT_ID: u8 = 1;

/// Apple HID display controller
pub struct AppleHidDisplay {
    device: HidDevice,
    serial: String,
    product: String,
    model: &'static NativeModel,
}

impl AppleHidDisplay {
    pub fn new(
        device: HidDevice,
        serial: String,
        product: String,
        model: &'static NativeModel,
    ) -> Self {
        Self {
            device,
            serial,
            product,
            model,
        }
    }

    /// Enumerate all connected HID brightness displays
    pub fn enumerate(api: &HidApi) -> Vec<Self> {
        let mut displays = Vec::new();

        for device_info in api.device_list() {
            if device_info.interface_number() != INTERFACE_NUMBER {
                continue;
            }
            let Some(model) = find_model(device_info.vendor_id(), device_info.product_id()) else {
                continue;
            };

            debug!(
                "Found HID display: vendor={:#06x} product={:#06x} ({}) serial={:?}",
                model.vendor_id,
                model.product_id,
                model.name,
                device_info.serial_number()
            );

            match device_info.open_device(api) {
                Ok(device) => {
                    let serial = device_info.serial_number().unwrap_or("Unknown").to_string();
                    let product = device_info
                        .product_string()
                        .unwrap_or(model.name)
                        .to_string();

                    info!("Successfully opened {} (serial: {})", model.name, serial);
                    displays.push(Self::new(device, serial, product, model));
                }
                Err(e) => {
                    warn!(
                        "Failed to open {} (serial: {:?}): {}. \
                         This may be a permissions issue. On Linux, ensure udev rules are configured.",
                        model.name,
                        device_info.serial_number(),
                        e
                    );
                }
            }
        }

        if displays.is_empty() {
            debug!("No Apple HID displays found");
        }
        displays
    }

    pub fn model(&self) -> &'static NativeModel {
        self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn read_raw(&self) -> Result<u32> {
        let mut buf = [0u8; REPORT_SIZE];
        buf[0] = REPORT_ID;
        self.device
            .get_feature_report(&mut buf)
            .context("Failed to read HID feature report")?;
        Ok(u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]))
    }

    fn write_raw(&self, value: u32) -> Result<()> {
        let mut buf = [0u8; REPORT_SIZE];
        buf[0] = REPORT_ID;
        // Bytes 5-6 are padding
        buf[1..5].copy_from_slice(&value.to_le_bytes());
        self.device
            .send_feature_report(&buf)
            .context("Failed to send HID feature report")?;
        Ok(())
    }
}

impl DisplayProtocol for AppleHidDisplay {
    fn id(&self) -> String {
        format!("apple-hid-{}", self.serial)
    }

    fn name(&self) -> String {
        self.product.clone()
    }

    fn read_feature(&mut self, code: u8) -> Result<FeatureValue> {
        if code != vcp::BRIGHTNESS {
            bail!("{} has no feature {:#04x}", self.model.name, code);
        }
        let value = self.read_raw()?;
        let percentage = self.model.to_percentage(value);
        debug!(
            "{} {} brightness: {}% (protocol value: {})",
            self.model.name, self.serial, percentage, value
        );
        Ok(FeatureValue {
            current: percentage,
            maximum: 100,
        })
    }

    fn write_feature(&mut self, code: u8, value: u16) -> Result<()> {
        if code != vcp::BRIGHTNESS {
            bail!("{} has no feature {:#04x}", self.model.name, code);
        }
        let raw = self.model.to_protocol(value);
        self.write_raw(raw)?;
        debug!(
            "Set {} {} brightness to {}% (protocol value: {})",
            self.model.name,
            self.serial,
            value.min(100),
            raw
        );
        Ok(())
    }

    fn supports_feature(&self, code: u8) -> bool {
        code == vcp::BRIGHTNESS
    }
}

impl std::fmt::Debug for AppleHidDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AppleHidDisplay({} {})", self.model.name, self.serial)
    }
}
