// Copyright 2024 Jason Scurtu
// SPDX-License-Identifier: GPL-3.0-only

//! Configuration and record migration utilities
//!
//! Handles migrations between different config versions as the project evolves.

use crate::config::{APP_DIR, CONFIG_VERSION, Config};
use crate::display::record::{self, DisplayRecord, RECORD_PREFIX};
use crate::store::KeyValueStore;

/// Summary of what a migration pass touched
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub legacy_serials: Vec<String>,
    pub repaired: Vec<String>,
    pub config_upgraded: bool,
}

/// Serials from before stable identities were derived from EDID: bare
/// volatile numbers such as "22789".
fn is_legacy_serial(serial: &str) -> bool {
    !serial.is_empty() && serial.chars().all(|c| c.is_ascii_digit())
}

/// Bump the config version, returning whether anything changed
pub fn migrate_config(config: &mut Config) -> bool {
    if config.version >= CONFIG_VERSION {
        return false;
    }
    info!(from = config.version, to = CONFIG_VERSION, "Upgrading configuration");
    config.version = CONFIG_VERSION;
    true
}

/// Repair stored records and flag the ones keyed by legacy ids
pub fn migrate_records(store: &dyn KeyValueStore) -> MigrationReport {
    let mut report = MigrationReport::default();

    for key in store.keys() {
        let Some(serial) = key.strip_prefix(RECORD_PREFIX) else {
            continue;
        };
        if is_legacy_serial(serial) {
            report.legacy_serials.push(serial.to_string());
        }
    }

    for mut rec in record::load_all(store) {
        if !rec.enabled_controls.repair() {
            continue;
        }
        match crate::store::set_typed::<DisplayRecord>(store, &rec.key(), &rec) {
            Ok(()) => {
                info!(serial = %rec.serial, "Re-enabled gamma on a record with no enabled controls");
                report.repaired.push(rec.serial);
            }
            Err(e) => warn!(serial = %rec.serial, "Failed to repair record: {}", e),
        }
    }

    if !report.legacy_serials.is_empty() {
        warn_legacy(&report.legacy_serials);
    }
    report
}

/// Run every migration at startup
pub fn run(config: &mut Config, store: &dyn KeyValueStore) -> MigrationReport {
    let mut report = migrate_records(store);
    report.config_upgraded = migrate_config(config);
    report
}

fn warn_legacy(serials: &[String]) {
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("⚠️  DISPLAY RECORD UPDATE DETECTED");
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("");
    warn!("Display identities are now derived from EDID data.");
    warn!("These records use the old volatile ids and will not re-bind:");
    for serial in serials {
        warn!("  • {}", serial);
    }
    warn!("");
    warn!("Your displays will be recorded again under their new identity.");
    warn!("Curves and clamps learned under the old ids are not carried over.");
    warn!("");
    warn!("To start fresh, delete old records:");
    warn!("  rm -rf ~/.local/share/{}", APP_DIR);
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{Display, DisplayIdentity};
    use crate::store::MemoryStore;

    #[test]
    fn test_legacy_serial_detection() {
        assert!(is_legacy_serial("22789"));
        assert!(!is_legacy_serial("10AC-A0C4-ABC123"));
        assert!(!is_legacy_serial("connector-DP-1"));
        assert!(!is_legacy_serial(""));
    }

    #[test]
    fn test_repairs_records_with_every_channel_off() {
        let store = MemoryStore::new();
        record::save(&store, &Display::new(1, "22789", DisplayIdentity::default())).unwrap();
        record::save(&store, &Display::new(2, "10AC-A0C4-X", DisplayIdentity::default())).unwrap();

        let mut raw = store.get("display:10AC-A0C4-X").unwrap();
        raw["enabled_controls"] = serde_json::json!({
            "native": false, "hardware": false, "relay": false, "gamma": false
        });
        store.set("display:10AC-A0C4-X", raw).unwrap();

        let report = migrate_records(&store);
        assert_eq!(report.legacy_serials, vec!["22789".to_string()]);
        assert_eq!(report.repaired, vec!["10AC-A0C4-X".to_string()]);

        let repaired = record::load(&store, "10AC-A0C4-X").unwrap();
        assert_eq!(repaired.enabled_controls.enabled_count(), 1);
        assert!(migrate_records(&store).repaired.is_empty());
    }

    #[test]
    fn test_config_version_upgrade() {
        let mut config = Config {
            version: 1,
            ..Default::default()
        };
        assert!(migrate_config(&mut config));
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(!migrate_config(&mut config));
    }
}
