// SPDX-License-Identifier: GPL-3.0-only
//! Consecutive fault counting per display and channel
//!
//! A channel stays responsive while both its read and write streaks are under
//! [`FAULT_THRESHOLD`]. Streaks only go back to zero through [`FaultTracker::reset`]
//! (user action) or [`FaultTracker::reset_display`] (reconnect); a successful
//! call in the middle of a streak leaves the counters untouched.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::ChannelKind;
use crate::display::DisplayId;

/// Consecutive failures after which a channel is considered non-responsive
pub const FAULT_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    pub consecutive_read_faults: u32,
    pub consecutive_write_faults: u32,
}

impl FaultCounters {
    pub fn is_responsive(&self) -> bool {
        self.consecutive_read_faults < FAULT_THRESHOLD
            && self.consecutive_write_faults < FAULT_THRESHOLD
    }
}

#[derive(Clone, Default)]
pub struct FaultTracker {
    counters: Arc<RwLock<HashMap<(DisplayId, ChannelKind), FaultCounters>>>,
}

impl std::fmt::Debug for FaultTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FaultTracker({} entries)", self.counters.read().len())
    }
}

impl FaultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read_failure(&self, id: DisplayId, kind: ChannelKind) -> u32 {
        let mut counters = self.counters.write();
        let entry = counters.entry((id, kind)).or_default();
        entry.consecutive_read_faults = entry.consecutive_read_faults.saturating_add(1);
        if entry.consecutive_read_faults == FAULT_THRESHOLD {
            warn!(display_id = id, channel = %kind, "Channel stopped answering reads");
        }
        entry.consecutive_read_faults
    }

    pub fn record_write_failure(&self, id: DisplayId, kind: ChannelKind) -> u32 {
        let mut counters = self.counters.write();
        let entry = counters.entry((id, kind)).or_default();
        entry.consecutive_write_faults = entry.consecutive_write_faults.saturating_add(1);
        if entry.consecutive_write_faults == FAULT_THRESHOLD {
            warn!(display_id = id, channel = %kind, "Channel stopped accepting writes");
        }
        entry.consecutive_write_faults
    }

    pub fn counters(&self, id: DisplayId, kind: ChannelKind) -> FaultCounters {
        self.counters
            .read()
            .get(&(id, kind))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_responsive(&self, id: DisplayId, kind: ChannelKind) -> bool {
        self.counters(id, kind).is_responsive()
    }

    /// Clear one channel of one display (explicit user reset)
    pub fn reset(&self, id: DisplayId, kind: ChannelKind) {
        self.counters.write().remove(&(id, kind));
    }

    /// Clear every channel of a display (reconnect or removal)
    pub fn reset_display(&self, id: DisplayId) {
        self.counters.write().retain(|(display, _), _| *display != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_write_faults_make_channel_unresponsive() {
        let tracker = FaultTracker::new();
        for _ in 0..4 {
            tracker.record_write_failure(5, ChannelKind::Hardware);
        }
        assert!(tracker.is_responsive(5, ChannelKind::Hardware));

        tracker.record_write_failure(5, ChannelKind::Hardware);
        assert!(!tracker.is_responsive(5, ChannelKind::Hardware));
        // Other channels and displays are independent
        assert!(tracker.is_responsive(5, ChannelKind::Relay));
        assert!(tracker.is_responsive(6, ChannelKind::Hardware));
    }

    #[test]
    fn test_read_faults_count_separately() {
        let tracker = FaultTracker::new();
        for _ in 0..FAULT_THRESHOLD {
            tracker.record_read_failure(1, ChannelKind::Native);
        }
        let counters = tracker.counters(1, ChannelKind::Native);
        assert_eq!(counters.consecutive_read_faults, 5);
        assert_eq!(counters.consecutive_write_faults, 0);
        assert!(!counters.is_responsive());
    }

    #[test]
    fn test_only_explicit_reset_clears() {
        let tracker = FaultTracker::new();
        for _ in 0..FAULT_THRESHOLD {
            tracker.record_write_failure(5, ChannelKind::Hardware);
        }
        tracker.reset(5, ChannelKind::Relay);
        assert!(!tracker.is_responsive(5, ChannelKind::Hardware));

        tracker.reset(5, ChannelKind::Hardware);
        assert!(tracker.is_responsive(5, ChannelKind::Hardware));
    }

    #[test]
    fn test_reset_display_clears_all_channels() {
        let tracker = FaultTracker::new();
        for _ in 0..FAULT_THRESHOLD {
            tracker.record_write_failure(2, ChannelKind::Hardware);
            tracker.record_read_failure(2, ChannelKind::Relay);
            tracker.record_read_failure(3, ChannelKind::Relay);
        }
        tracker.reset_display(2);
        assert!(tracker.is_responsive(2, ChannelKind::Hardware));
        assert!(tracker.is_responsive(2, ChannelKind::Relay));
        assert!(!tracker.is_responsive(3, ChannelKind::Relay));
    }
}
