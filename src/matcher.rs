// SPDX-License-Identifier: GPL-3.0-only
//! Display identity reconciliation
//!
//! Binds the live handles of a fresh enumeration to persisted display records.
//! Signals are tried strongest first:
//!
//! 1. the stable serial derived from EDID
//! 2. a per-connector UUID matching a pattern stored on the record
//! 3. a full match of name, year, serial number and product id (or vendor id
//!    plus geometry)
//! 4. a score summed over the remaining signals, highest positive pair wins
//!
//! Inputs are sorted before matching, so the result does not depend on the
//! order in which hardware or records were listed.

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::display::record::DisplayRecord;
use crate::display::{DisplayId, DisplayIdentity};

/// Window within which serial numbers, product ids and geometry count as close
const CLOSENESS_WINDOW: i64 = 3;

/// A live handle as seen by the matcher
#[derive(Debug, Clone, PartialEq)]
pub struct LiveIdentity {
    pub id: DisplayId,
    pub identity: DisplayIdentity,
    /// Per-connector UUID, when the platform exposes one
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Serial,
    Uuid,
    Full,
    Scored(i32),
    /// No record fits, a new one is created
    New,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub id: DisplayId,
    pub serial: String,
    pub kind: MatchKind,
}

impl Binding {
    pub fn is_new(&self) -> bool {
        self.kind == MatchKind::New
    }
}

fn closeness(a: Option<i64>, b: Option<i64>) -> i32 {
    match (a, b) {
        (Some(a), Some(b)) => (CLOSENESS_WINDOW - (a - b).abs()).max(0) as i32,
        _ => 0,
    }
}

/// Signed similarity of a record and a live handle
pub fn score(record: &DisplayIdentity, live: &DisplayIdentity) -> i32 {
    let mut score = 0;
    if !record.name.is_empty() && !live.name.is_empty() {
        score += if record.name.eq_ignore_ascii_case(&live.name) { 1 } else { -1 };
    }
    score += closeness(
        record.serial_number.map(i64::from),
        live.serial_number.map(i64::from),
    );
    score += closeness(record.product_id.map(i64::from), live.product_id.map(i64::from));
    score += closeness(record.vendor_id.map(i64::from), live.vendor_id.map(i64::from));
    score += closeness(record.width.map(i64::from), live.width.map(i64::from));
    score += closeness(record.height.map(i64::from), live.height.map(i64::from));
    if let (Some(a), Some(b)) = (record.transport, live.transport) {
        score += if a == b { 1 } else { -1 };
    }
    score
}

/// All identifying fields agree
pub fn is_full_match(record: &DisplayIdentity, live: &DisplayIdentity) -> bool {
    let edid_match = !record.name.is_empty()
        && record.name == live.name
        && record.year.is_some()
        && record.year == live.year
        && record.serial_number.is_some()
        && record.serial_number == live.serial_number
        && record.product_id.is_some()
        && record.product_id == live.product_id;
    let geometry_match = record.vendor_id.is_some()
        && record.vendor_id == live.vendor_id
        && record.product_id.is_some()
        && record.product_id == live.product_id
        && record.width.is_some()
        && record.width == live.width
        && record.height == live.height
        && record.serial_number.is_some()
        && record.serial_number == live.serial_number;
    edid_match || geometry_match
}

/// Compiled UUID patterns; records are reconciled on every hotplug
static UUID_PATTERNS: Lazy<Mutex<HashMap<String, Option<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn uuid_matches(record: &DisplayRecord, uuid: &str) -> bool {
    let mut cache = UUID_PATTERNS.lock();
    record.edid_uuid_patterns.iter().any(|pattern| {
        let compiled = cache.entry(pattern.clone()).or_insert_with(|| {
            Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|e| warn!(serial = %record.serial, pattern, "Invalid UUID pattern: {}", e))
                .ok()
        });
        compiled.as_ref().is_some_and(|re| re.is_match(uuid))
    })
}

/// Match every live handle to a record or to a fresh serial
pub fn reconcile(records: &[DisplayRecord], live: &[LiveIdentity]) -> Vec<Binding> {
    let mut records: Vec<&DisplayRecord> = records.iter().collect();
    records.sort_by(|a, b| a.last_id.cmp(&b.last_id).then_with(|| a.serial.cmp(&b.serial)));
    let mut live: Vec<&LiveIdentity> = live.iter().collect();
    live.sort_by_key(|l| l.id);

    let mut bindings: Vec<Binding> = Vec::with_capacity(live.len());
    let mut taken: BTreeSet<usize> = BTreeSet::new();
    let mut pending: Vec<&LiveIdentity> = Vec::new();

    for handle in live {
        let serial = handle.identity.stable_serial();
        let hit = |pred: &dyn Fn(&DisplayRecord) -> bool| {
            records
                .iter()
                .enumerate()
                .find(|(i, r)| !taken.contains(i) && pred(r))
                .map(|(i, _)| i)
        };

        let found = hit(&|r| r.serial == serial)
            .map(|i| (i, MatchKind::Serial))
            .or_else(|| {
                let uuid = handle.uuid.as_deref()?;
                hit(&|r| uuid_matches(r, uuid)).map(|i| (i, MatchKind::Uuid))
            })
            .or_else(|| {
                hit(&|r| is_full_match(&r.identity, &handle.identity)).map(|i| (i, MatchKind::Full))
            });

        match found {
            Some((i, kind)) => {
                taken.insert(i);
                bindings.push(Binding {
                    id: handle.id,
                    serial: records[i].serial.clone(),
                    kind,
                });
            }
            None => pending.push(handle),
        }
    }

    // Greedy on the best remaining pair. Ties keep the first record, then the
    // lowest live id.
    loop {
        let mut best: Option<(i32, usize, usize)> = None;
        for (r, record) in records.iter().enumerate() {
            if taken.contains(&r) {
                continue;
            }
            for (l, handle) in pending.iter().enumerate() {
                let s = score(&record.identity, &handle.identity);
                if s > 0 && best.is_none_or(|(b, _, _)| s > b) {
                    best = Some((s, r, l));
                }
            }
        }
        let Some((s, r, l)) = best else {
            break;
        };
        let handle = pending.remove(l);
        taken.insert(r);
        debug!(id = handle.id, serial = %records[r].serial, score = s, "Matched display by score");
        bindings.push(Binding {
            id: handle.id,
            serial: records[r].serial.clone(),
            kind: MatchKind::Scored(s),
        });
    }

    let mut used: BTreeSet<String> = records.iter().map(|r| r.serial.clone()).collect();
    used.extend(bindings.iter().map(|b| b.serial.clone()));
    for handle in pending {
        let mut serial = handle.identity.stable_serial();
        if used.contains(&serial) {
            serial = format!("{serial}-{}", handle.id);
        }
        used.insert(serial.clone());
        bindings.push(Binding {
            id: handle.id,
            serial,
            kind: MatchKind::New,
        });
    }

    bindings.sort_by_key(|b| b.id);
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{Display, Transport};

    fn record(serial: &str, last_id: DisplayId, identity: DisplayIdentity) -> DisplayRecord {
        DisplayRecord::from(&Display::new(last_id, serial, identity))
    }

    fn live(id: DisplayId, identity: DisplayIdentity) -> LiveIdentity {
        LiveIdentity {
            id,
            identity,
            uuid: None,
        }
    }

    fn dell() -> DisplayIdentity {
        DisplayIdentity {
            name: "DELL U2717D".into(),
            serial_number: Some(314041),
            product_id: Some(23305),
            year: Some(2017),
            ..Default::default()
        }
    }

    #[test]
    fn test_scoring_scenario() {
        let stored = record("ABC", 1, dell());

        let strong = DisplayIdentity {
            year: Some(2019),
            ..dell()
        };
        let weak = DisplayIdentity {
            name: "dell u2717d".into(),
            serial_number: Some(314042),
            product_id: None,
            year: None,
            ..Default::default()
        };
        assert_eq!(score(&stored.identity, &strong), 7);
        assert_eq!(score(&stored.identity, &weak), 3);

        let bindings = reconcile(&[stored], &[live(4, weak), live(9, strong)]);
        let abc: Vec<_> = bindings.iter().filter(|b| b.serial == "ABC").collect();
        assert_eq!(abc.len(), 1);
        assert_eq!(abc[0].id, 9);
        assert_eq!(abc[0].kind, MatchKind::Scored(7));
        assert!(bindings.iter().find(|b| b.id == 4).unwrap().is_new());
    }

    #[test]
    fn test_score_of_two_loses() {
        let stored = record("ABC", 1, dell());
        let seven = DisplayIdentity {
            year: None,
            ..dell()
        };
        let two = DisplayIdentity {
            name: "Other".into(),
            serial_number: Some(314041),
            ..Default::default()
        };
        assert_eq!(score(&stored.identity, &two), 2);
        let bindings = reconcile(&[stored], &[live(1, two), live(2, seven)]);
        assert_eq!(bindings.iter().find(|b| b.serial == "ABC").unwrap().id, 2);
    }

    #[test]
    fn test_serial_match_first() {
        let identity = DisplayIdentity {
            vendor_id: Some(0x10AC),
            product_id: Some(0x5B09),
            serial_number: Some(314041),
            ..Default::default()
        };
        let serial = identity.stable_serial();
        let stored = record(&serial, 3, identity.clone());
        let bindings = reconcile(&[stored], &[live(7, identity)]);
        assert_eq!(
            bindings,
            vec![Binding {
                id: 7,
                serial,
                kind: MatchKind::Serial
            }]
        );
    }

    #[test]
    fn test_uuid_pattern_short_circuits() {
        let mut stored = record("XDR", 1, DisplayIdentity::default());
        stored.edid_uuid_patterns = vec!["06103eae-.*".into()];
        let handle = LiveIdentity {
            id: 5,
            identity: DisplayIdentity {
                name: "Pro Display XDR".into(),
                ..Default::default()
            },
            uuid: Some("06103eae-0000-0000-1234".into()),
        };
        let bindings = reconcile(&[stored], &[handle]);
        assert_eq!(bindings[0].serial, "XDR");
        assert_eq!(bindings[0].kind, MatchKind::Uuid);
    }

    #[test]
    fn test_full_match() {
        let stored = record("FULL", 1, dell());
        let bindings = reconcile(&[stored], &[live(2, dell())]);
        assert_eq!(bindings[0].kind, MatchKind::Full);
    }

    #[test]
    fn test_idempotent_and_order_independent() {
        let a = DisplayIdentity {
            name: "LG HDR 4K".into(),
            serial_number: Some(100),
            product_id: Some(30471),
            transport: Some(Transport::DisplayPort),
            ..Default::default()
        };
        let b = DisplayIdentity {
            name: "LG HDR 4K".into(),
            serial_number: Some(200),
            product_id: Some(30471),
            transport: Some(Transport::Hdmi),
            ..Default::default()
        };
        let records = vec![record("A", 1, a.clone()), record("B", 2, b.clone())];
        let handles = vec![live(11, b), live(10, a), live(12, dell())];

        let first = reconcile(&records, &handles);
        let mut reversed_records = records.clone();
        reversed_records.reverse();
        let mut reversed_handles = handles.clone();
        reversed_handles.reverse();
        let second = reconcile(&reversed_records, &reversed_handles);

        assert_eq!(first, second);
        assert_eq!(first, reconcile(&records, &handles));
        let serial_of = |id| first.iter().find(|b| b.id == id).unwrap().serial.clone();
        assert_eq!(serial_of(10), "A");
        assert_eq!(serial_of(11), "B");
        assert!(first.iter().find(|b| b.id == 12).unwrap().is_new());
    }

    #[test]
    fn test_duplicate_new_serials_get_id_suffix() {
        let identity = DisplayIdentity {
            connector: None,
            name: "Generic".into(),
            ..Default::default()
        };
        let bindings = reconcile(&[], &[live(1, identity.clone()), live(2, identity)]);
        assert_eq!(bindings[0].serial, "name-Generic");
        assert_eq!(bindings[1].serial, "name-Generic-2");
    }

    #[test]
    fn test_unmatched_records_stay_dormant() {
        let stored = record("GONE", 1, dell());
        let other = DisplayIdentity {
            name: "Other".into(),
            ..Default::default()
        };
        let bindings = reconcile(&[stored], &[live(3, other)]);
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].is_new());
    }
}
