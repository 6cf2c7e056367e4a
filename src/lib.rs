// SPDX-License-Identifier: GPL-3.0-only
//! Adaptive monitor control
//!
//! Drives brightness, contrast, volume and input of attached displays through
//! whichever channel works for each display (DDC/CI over the cable, the USB HID
//! brightness service of Apple/LG displays, a DDC relay on the LAN, or a
//! software gamma ramp), and keeps those values in sync with an adaptive signal
//! such as ambient light, a reference display or the position of the sun.

#[macro_use]
extern crate tracing;

pub mod adaptive;
pub mod config;
pub mod control;
pub mod controller;
pub mod display;
pub mod edid;
pub mod enumeration;
pub mod error;
pub mod hotplug;
pub mod matcher;
pub mod migrations;
pub mod protocols;
pub mod store;
pub mod task;

pub use controller::DisplayController;
pub use error::{AppError, Result};
