// SPDX-License-Identifier: GPL-3.0-only
//! Display hotplug detection using udev
//!
//! One process per session owns the udev monitor; the others follow the
//! lock file it touches after every settled hotplug.

mod udev_monitor;
mod watcher;

pub use udev_monitor::UdevMonitor;
pub use watcher::{HotplugLock, RATE_LIMIT, SETTLE_DELAY, coalesce, lock_path, spawn};
