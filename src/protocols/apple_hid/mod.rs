// SPDX-License-Identifier: GPL-3.0-only
//! Apple HID brightness control protocol
//!
//! This protocol is used by displays that expose brightness through a USB HID
//! feature report instead of DDC/CI:
//! - Apple Studio Display
//! - Apple Pro Display XDR
//! - LG UltraFine 4K/5K (co-developed with Apple)
//!
//! Based on the asdbctl implementation:
//! https://github.com/juliuszint/asdbctl

mod device;
pub mod models;

pub use device::AppleHidDisplay;
pub use models::{NativeModel, find_model};

/// Apple USB Vendor ID
pub const APPLE_VENDOR_ID: u16 = 0x05ac;

/// LG USB Vendor ID
pub const LG_VENDOR_ID: u16 = 0x043e;

/// USB Interface number for brightness control
pub const INTERFACE_NUMBER: i32 = 0x7;
