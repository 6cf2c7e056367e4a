// SPDX-License-Identifier: GPL-3.0-only
//! Hot-plug, persistence and channel fallback through the public API

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use adaptive_monitor_control::adaptive::{ModeKey, ModeSelection};
use adaptive_monitor_control::config::Config;
use adaptive_monitor_control::control::{ChannelKind, MemoryGammaSink, TransitionPolicy};
use adaptive_monitor_control::controller::{Collaborators, DisplayFilter};
use adaptive_monitor_control::display::DisplayIdentity;
use adaptive_monitor_control::enumeration::{DisplayEnumerator, LiveDisplay};
use adaptive_monitor_control::protocols::{self, DisplayProtocol, FeatureValue, vcp};
use adaptive_monitor_control::store::JsonFileStore;
use adaptive_monitor_control::{AppError, DisplayController};

/// Monitor answering DDC/CI from a shared register file
#[derive(Debug)]
struct Monitor {
    name: String,
    registers: Arc<Mutex<HashMap<u8, u16>>>,
}

impl DisplayProtocol for Monitor {
    fn id(&self) -> String {
        format!("i2c-{}", self.name)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn read_feature(&mut self, code: u8) -> Result<FeatureValue> {
        let current = self.registers.lock().get(&code).copied().unwrap_or(50);
        Ok(FeatureValue {
            current,
            maximum: 100,
        })
    }

    fn write_feature(&mut self, code: u8, value: u16) -> Result<()> {
        self.registers.lock().insert(code, value);
        Ok(())
    }
}

struct Desk {
    monitors: HashMap<&'static str, Arc<Mutex<HashMap<u8, u16>>>>,
    plugged: Mutex<Vec<(u32, &'static str, u32)>>,
}

impl Desk {
    fn new(plugged: Vec<(u32, &'static str, u32)>) -> Arc<Self> {
        let monitors = plugged
            .iter()
            .map(|(_, name, _)| (*name, Arc::new(Mutex::new(HashMap::new()))))
            .collect();
        Arc::new(Self {
            monitors,
            plugged: Mutex::new(plugged),
        })
    }

    fn register(&self, name: &str, code: u8) -> Option<u16> {
        self.monitors[name].lock().get(&code).copied()
    }
}

fn identity(name: &str, serial_number: u32) -> DisplayIdentity {
    DisplayIdentity {
        name: name.into(),
        serial_number: Some(serial_number),
        product_id: Some(0x4093),
        vendor_id: Some(0x10AC),
        year: Some(2019),
        ..Default::default()
    }
}

impl DisplayEnumerator for Desk {
    fn enumerate(&self) -> Vec<LiveDisplay> {
        self.plugged
            .lock()
            .iter()
            .map(|&(id, name, serial)| {
                let mut live = LiveDisplay::new(id, identity(name, serial));
                live.capabilities.has_hardware_protocol = true;
                live.channels.hardware = Some(protocols::shared(Monitor {
                    name: name.to_string(),
                    registers: self.monitors[name].clone(),
                }));
                live
            })
            .collect()
    }
}

fn manual() -> Config {
    Config {
        adaptive_mode: ModeSelection::Fixed(ModeKey::Manual),
        brightness_transition: TransitionPolicy::Instant,
        ..Default::default()
    }
}

fn open(desk: &Arc<Desk>, path: &std::path::Path) -> DisplayController {
    let store = Arc::new(JsonFileStore::open(path).unwrap());
    DisplayController::new(manual(), Collaborators::new(desk.clone(), store))
}

#[test]
fn test_unplugged_display_rebinds_with_its_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("displays.json");
    let desk = Desk::new(vec![(1, "DELL U2720Q", 1001), (2, "DELL P2419H", 2002)]);
    let dell = identity("DELL U2720Q", 1001).stable_serial();

    let controller = open(&desk, &path);
    controller.reset_display_list();
    assert_eq!(controller.registry().active_count(), 2);

    assert_eq!(controller.set_brightness(&DisplayFilter::Serial(dell.clone()), 30), 1);
    assert_eq!(desk.register("DELL U2720Q", vcp::BRIGHTNESS), Some(30));
    assert_eq!(desk.register("DELL P2419H", vcp::BRIGHTNESS), None);

    desk.plugged.lock().retain(|(_, name, _)| *name != "DELL U2720Q");
    controller.reset_display_list();
    assert_eq!(controller.registry().active_count(), 1);
    assert!(!controller.registry().get(&dell).unwrap().read().active);

    desk.plugged.lock().push((7, "DELL U2720Q", 1001));
    controller.reset_display_list();
    let display = controller.registry().get(&dell).unwrap();
    assert!(display.read().active);
    assert_eq!(display.read().id, 7);
    assert_eq!(display.read().brightness, 30);
    controller.cleanup();
    drop(controller);

    let restarted = open(&desk, &path);
    restarted.reset_display_list();
    let display = restarted.registry().get(&dell).unwrap();
    assert_eq!(display.read().brightness, 30);
    assert_eq!(restarted.registry().active_count(), 2);
}

#[test]
fn test_disabling_the_cable_falls_back_to_gamma() {
    let dir = tempfile::tempdir().unwrap();
    let desk = Desk::new(vec![(3, "LG 27UK850", 77)]);
    let serial = identity("LG 27UK850", 77).stable_serial();
    let sink = Arc::new(MemoryGammaSink::default());

    let store = Arc::new(JsonFileStore::open(dir.path().join("displays.json")).unwrap());
    let mut collaborators = Collaborators::new(desk.clone(), store);
    collaborators.gamma_sink = sink.clone();
    let controller = DisplayController::new(manual(), collaborators);
    controller.reset_display_list();

    controller
        .set_enabled_control(&serial, ChannelKind::Hardware, false)
        .unwrap();
    assert_eq!(controller.set_brightness(&DisplayFilter::All, 20), 1);
    assert!(sink.applied(3).is_some());
    assert_eq!(desk.register("LG 27UK850", vcp::BRIGHTNESS), None);

    for kind in [ChannelKind::Native, ChannelKind::Relay] {
        controller.set_enabled_control(&serial, kind, false).unwrap();
    }
    assert!(matches!(
        controller.set_enabled_control(&serial, ChannelKind::Gamma, false),
        Err(AppError::LastControl { .. })
    ));
}

#[test]
fn test_unknown_serial_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let desk = Desk::new(vec![(1, "DELL U2720Q", 1001)]);
    let controller = open(&desk, &dir.path().join("displays.json"));
    controller.reset_display_list();

    assert!(matches!(
        controller.reset_curve("nope", None),
        Err(AppError::DisplayNotFound(_))
    ));
    assert_eq!(controller.set_brightness(&DisplayFilter::Serial("nope".into()), 10), 0);
}
