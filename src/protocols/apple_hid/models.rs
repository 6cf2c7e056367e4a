// SPDX-License-Identifier: GPL-3.0-only
//! Displays with a native brightness service

use super::{APPLE_VENDOR_ID, LG_VENDOR_ID};

/// A display model whose brightness is driven through HID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeModel {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: &'static str,
    /// Minimum brightness protocol value (not physical nits)
    pub min_value: u32,
    /// Maximum brightness protocol value (not physical nits)
    pub max_value: u32,
}

impl NativeModel {
    pub fn range(&self) -> u32 {
        self.max_value - self.min_value
    }

    /// Convert percentage (0-100) to protocol value for this model
    pub fn to_protocol(&self, percentage: u16) -> u32 {
        let percentage = percentage.min(100) as u32;
        self.min_value + (self.range() * percentage) / 100
    }

    /// Convert protocol value to percentage (0-100) for this model
    pub fn to_percentage(&self, value: u32) -> u16 {
        if value <= self.min_value {
            return 0;
        }
        if value >= self.max_value {
            return 100;
        }
        let percentage = (value - self.min_value) as f64 / self.range() as f64 * 100.0;
        (percentage.round() as u16).min(100)
    }
}

pub const MODELS: &[NativeModel] = &[
    // 27" 5K, 600 nits
    NativeModel {
        vendor_id: APPLE_VENDOR_ID,
        product_id: 0x1114,
        name: "Apple Studio Display",
        min_value: 400,
        max_value: 60000,
    },
    // 32" 6K, 1600 nits peak
    NativeModel {
        vendor_id: APPLE_VENDOR_ID,
        product_id: 0x9243,
        name: "Apple Pro Display XDR",
        min_value: 400,
        max_value: 50000,
    },
    NativeModel {
        vendor_id: LG_VENDOR_ID,
        product_id: 0x9a63,
        name: "LG UltraFine 4K Display",
        min_value: 400,
        max_value: 50000,
    },
    NativeModel {
        vendor_id: LG_VENDOR_ID,
        product_id: 0x9a70,
        name: "LG UltraFine 5K Display",
        min_value: 400,
        max_value: 50000,
    },
];

pub fn find_model(vendor_id: u16, product_id: u16) -> Option<&'static NativeModel> {
    MODELS
        .iter()
        .find(|m| m.vendor_id == vendor_id && m.product_id == product_id)
}

/// Whether a display with this EDID name is one of the HID driven models.
///
/// EDID product codes of these panels don't match their USB product ids, so
/// enumeration correlates by name.
pub fn is_native_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("studio display")
        || name.contains("pro display xdr")
        || name.contains("ultrafine")
}
