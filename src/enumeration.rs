// SPDX-License-Identifier: GPL-3.0-only
//! Live display topology
//!
//! Connectors come from DRM through udev; each one is then correlated with
//! the control handles found on the machine: DDC/CI buses, Apple/LG USB HID
//! brightness services, the kernel backlight of the built-in panel and the
//! displays advertised by LAN relays.

use std::path::Path;

use url::Url;

use crate::control::DisplayChannels;
use crate::display::{Capabilities, DisplayId, DisplayIdentity, Transport};
use crate::edid::{self, EdidInfo};
use crate::matcher::LiveIdentity;
use crate::protocols::backlight::Backlight;
use crate::protocols::ddc_ci::DdcCiDisplay;
use crate::protocols::relay::{self, RelayDisplay};
use crate::protocols::{self, DisplayProtocol};

#[cfg(feature = "apple-hid-displays")]
use crate::protocols::apple_hid::AppleHidDisplay;

/// Ids handed to handles that have no DRM connector
const DETACHED_ID_BASE: DisplayId = 10_000;

/// One display as found on the hardware right now
#[derive(Clone)]
pub struct LiveDisplay {
    pub id: DisplayId,
    pub identity: DisplayIdentity,
    /// Connector UUID derived from the EDID header
    pub uuid: Option<String>,
    /// Patterns new records store to recognise this display by UUID
    pub uuid_patterns: Vec<String>,
    pub capabilities: Capabilities,
    pub channels: DisplayChannels,
    pub relay_bus: Option<String>,
}

impl LiveDisplay {
    pub fn new(id: DisplayId, identity: DisplayIdentity) -> Self {
        Self {
            id,
            identity,
            uuid: None,
            uuid_patterns: Vec::new(),
            capabilities: Capabilities {
                supports_gamma: true,
                ..Default::default()
            },
            channels: DisplayChannels::default(),
            relay_bus: None,
        }
    }

    fn with_edid(mut self, info: &EdidInfo) -> Self {
        let uuids = info.possible_uuids();
        self.uuid = uuids.get(1).cloned();
        self.uuid_patterns = uuids;
        self
    }

    pub fn matcher_identity(&self) -> LiveIdentity {
        LiveIdentity {
            id: self.id,
            identity: self.identity.clone(),
            uuid: self.uuid.clone(),
        }
    }

    /// EDID-level identity comparison used to correlate handles
    fn same_panel(&self, info: &EdidInfo) -> bool {
        self.identity.vendor_id == Some(info.vendor_id)
            && self.identity.product_id == Some(info.product_id)
            && self.identity.serial_number.unwrap_or(0) == info.serial_number
    }

    fn same_name(&self, name: &str) -> bool {
        !name.is_empty() && self.identity.name.eq_ignore_ascii_case(name.trim())
    }
}

/// Source of the live topology
pub trait DisplayEnumerator: Send + Sync {
    fn enumerate(&self) -> Vec<LiveDisplay>;
}

/// Enumerates the real hardware. Blocking: run off the async workers.
#[derive(Debug, Clone, Default)]
pub struct SystemEnumerator {
    relay_endpoints: Vec<Url>,
}

impl SystemEnumerator {
    pub fn new(relay_endpoints: &[String]) -> Self {
        let relay_endpoints = relay_endpoints
            .iter()
            .filter_map(|endpoint| match Url::parse(endpoint) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(endpoint, "Ignoring relay endpoint: {}", e);
                    None
                }
            })
            .collect();
        Self { relay_endpoints }
    }
}

impl DisplayEnumerator for SystemEnumerator {
    fn enumerate(&self) -> Vec<LiveDisplay> {
        info!("=== START ENUMERATE ===");
        let mut displays = match drm_connectors() {
            Ok(displays) => displays,
            Err(e) => {
                error!("Failed to enumerate DRM connectors: {}", e);
                Vec::new()
            }
        };
        info!("Found {} connected DRM connector(s)", displays.len());

        attach_backlight(&mut displays, Backlight::enumerate());
        attach_ddc(&mut displays, probe_ddc(DdcCiDisplay::enumerate()));
        #[cfg(feature = "apple-hid-displays")]
        attach_hid(&mut displays);
        for base in &self.relay_endpoints {
            attach_relay(&mut displays, base);
        }

        info!("=== END ENUMERATE: {} display(s) ===", displays.len());
        displays
    }
}

fn next_detached_id(displays: &[LiveDisplay]) -> DisplayId {
    displays
        .iter()
        .map(|d| d.id + 1)
        .filter(|id| *id > DETACHED_ID_BASE)
        .max()
        .unwrap_or(DETACHED_ID_BASE + 1)
}

/// First `WIDTHxHEIGHT` line of a connector `modes` file
fn preferred_mode(modes: &str) -> Option<(u32, u32)> {
    let line = modes.lines().next()?;
    let (w, h) = line.trim().split_once('x')?;
    let h: String = h.chars().take_while(|c| c.is_ascii_digit()).collect();
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Connector name from a DRM sysname like `card1-DP-2`
fn connector_name(sysname: &str) -> Option<&str> {
    let (card, connector) = sysname.split_once('-')?;
    card.starts_with("card").then_some(connector)
}

fn read_connector(path: &Path, connector: &str, fallback_id: DisplayId) -> LiveDisplay {
    let id = std::fs::read_to_string(path.join("connector_id"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(fallback_id);

    let edid = std::fs::read(path.join("edid"))
        .ok()
        .filter(|bytes| !bytes.is_empty())
        .and_then(|bytes| match edid::parse(&bytes) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(connector, "Unreadable EDID: {}", e);
                None
            }
        });

    let mut identity = edid
        .as_ref()
        .map(DisplayIdentity::from_edid)
        .unwrap_or_default();
    identity.connector = Some(connector.to_string());
    identity.transport = Transport::from_connector(connector);
    if let Some((w, h)) = std::fs::read_to_string(path.join("modes"))
        .ok()
        .and_then(|m| preferred_mode(&m))
    {
        identity.width = Some(w);
        identity.height = Some(h);
    }

    let mut display = LiveDisplay::new(id, identity);
    if let Some(info) = &edid {
        display = display.with_edid(info);
    }
    display.capabilities.is_builtin = display.identity.transport == Some(Transport::Embedded);
    display
}

fn drm_connectors() -> std::io::Result<Vec<LiveDisplay>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("drm")?;

    let mut displays = Vec::new();
    for (index, device) in enumerator.scan_devices()?.enumerate() {
        let sysname = device.sysname().to_string_lossy().to_string();
        let Some(connector) = connector_name(&sysname) else {
            continue;
        };
        let connected = device
            .attribute_value("status")
            .is_some_and(|s| s.to_string_lossy().trim() == "connected");
        if !connected {
            continue;
        }
        let display = read_connector(device.syspath(), connector, index as DisplayId + 1);
        let (display_id, name) = (display.id, &display.identity.name);
        debug!(
            display_id,
            connector,
            name = %name,
            "Connected DRM connector"
        );
        displays.push(display);
    }
    displays.sort_by_key(|d| d.id);
    Ok(displays)
}

/// The kernel backlight drives the built-in panel
fn attach_backlight(displays: &mut [LiveDisplay], backlights: Vec<Backlight>) {
    let Some(backlight) = backlights.into_iter().next() else {
        return;
    };
    let Some(panel) = displays.iter_mut().find(|d| d.capabilities.is_builtin) else {
        debug!("Backlight without a built-in connector, ignoring");
        return;
    };
    info!(display_id = panel.id, "Built-in panel uses {}", backlight.id());
    panel.capabilities.native_brightness = true;
    panel.channels.native = Some(protocols::shared(backlight));
}

/// Wake every DDC/CI bus in parallel, keeping the ones that answer
fn probe_ddc(candidates: Vec<DdcCiDisplay>) -> Vec<DdcCiDisplay> {
    info!("Found {} DDC/CI display(s) total", candidates.len());
    std::thread::scope(|scope| {
        let handles: Vec<_> = candidates
            .into_iter()
            .map(|mut display| {
                scope.spawn(move || match display.probe() {
                    Ok(value) => {
                        if value.current == 0 {
                            let display_name = display.name();
                            warn!(
                                display_name = %display_name,
                                "Monitor reports 0% brightness - DDC/CI may be unreliable"
                            );
                        }
                        Some(display)
                    }
                    Err(e) => {
                        let display_name = display.name();
                        error!(
                            display_name = %display_name,
                            error = ?e,
                            "No DDC/CI answer - monitor may not support DDC/CI"
                        );
                        None
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|h| h.join().ok().flatten())
            .collect()
    })
}

fn attach_ddc(displays: &mut Vec<LiveDisplay>, ddc: Vec<DdcCiDisplay>) {
    for mut handle in ddc {
        let info = handle.edid().and_then(|bytes| edid::parse(bytes).ok());
        let model = handle.model_name().unwrap_or_default().to_string();

        let slot = displays.iter().position(|d| {
            !d.capabilities.has_hardware_protocol
                && match &info {
                    Some(info) => d.same_panel(info),
                    None => d.same_name(&model),
                }
        });
        let index = match slot {
            Some(index) => index,
            None => {
                let identity = match &info {
                    Some(info) => DisplayIdentity::from_edid(info),
                    None => DisplayIdentity {
                        name: model.clone(),
                        serial_text: handle.serial_text().map(str::to_string),
                        ..Default::default()
                    },
                };
                let mut display = LiveDisplay::new(next_detached_id(displays), identity);
                if let Some(info) = &info {
                    display = display.with_edid(info);
                }
                warn!(name = %model, "DDC/CI display without a DRM connector");
                displays.push(display);
                displays.len() - 1
            }
        };

        let display = &mut displays[index];
        handle.set_stable_serial(Some(display.identity.stable_serial()));
        let display_id = display.id;
        info!(display_id, protocol = %handle.id(), "DDC/CI channel attached");
        display.capabilities.has_hardware_protocol = true;
        display.channels.hardware = Some(protocols::shared(handle));
    }
}

#[cfg(feature = "apple-hid-displays")]
fn attach_hid(displays: &mut Vec<LiveDisplay>) {
    let api = match hidapi::HidApi::new() {
        Ok(api) => api,
        Err(e) => {
            warn!("HID API unavailable: {}", e);
            return;
        }
    };
    for handle in AppleHidDisplay::enumerate(&api) {
        let model = handle.model();
        let slot = displays.iter().position(|d| {
            !d.capabilities.native_brightness
                && (d.identity.name.to_lowercase().contains(&model.name.to_lowercase())
                    || crate::protocols::apple_hid::models::is_native_name(&d.identity.name))
        });
        let index = match slot {
            Some(index) => index,
            None => {
                let identity = DisplayIdentity {
                    name: model.name.to_string(),
                    serial_text: Some(handle.serial().to_string()).filter(|s| !s.is_empty()),
                    vendor_id: Some(model.vendor_id),
                    product_id: Some(model.product_id),
                    transport: Some(Transport::Usb),
                    ..Default::default()
                };
                displays.push(LiveDisplay::new(next_detached_id(displays), identity));
                displays.len() - 1
            }
        };
        let display = &mut displays[index];
        let display_id = display.id;
        info!(display_id, model = model.name, "USB HID brightness attached");
        display.capabilities.native_brightness = true;
        display.channels.native = Some(protocols::shared(handle));
    }
}

fn attach_relay(displays: &mut Vec<LiveDisplay>, base: &Url) {
    let listings = match relay::list_displays(base) {
        Ok(listings) => listings,
        Err(e) => {
            warn!(relay = %base, "Relay unavailable: {:#}", e);
            return;
        }
    };
    for listing in listings {
        let slot = displays.iter().position(|d| {
            !d.capabilities.has_relay
                && ((!listing.serial.is_empty()
                    && d.identity.serial_text.as_deref() == Some(listing.serial.as_str()))
                    || d.same_name(&listing.name))
        });
        let index = match slot {
            Some(index) => index,
            None => {
                let identity = DisplayIdentity {
                    name: listing.name.clone(),
                    serial_text: Some(listing.serial.clone()).filter(|s| !s.is_empty()),
                    ..Default::default()
                };
                let mut display = LiveDisplay::new(next_detached_id(displays), identity);
                display.capabilities.supports_gamma = false;
                displays.push(display);
                displays.len() - 1
            }
        };
        let display = &mut displays[index];
        let display_id = display.id;
        info!(display_id, relay = %base, bus = listing.bus, "Relay channel attached");
        display.capabilities.has_relay = true;
        display.relay_bus = Some(listing.bus.to_string());
        display.channels.relay = Some(protocols::shared(RelayDisplay::new(base.clone(), &listing)));
    }
}
