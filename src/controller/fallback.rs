// SPDX-License-Identifier: GPL-3.0-only
//! Fallback to software gamma when a DDC channel stops answering

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::control::ChannelKind;

/// Minimum time between two prompts for the same display
pub const PROMPT_INTERVAL: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAnswer {
    /// Disable the unresponsive channel and continue on the next one
    Fallback,
    NotNow,
    /// Stop asking for this display
    Never,
}

/// Asks the user whether to give up on an unresponsive channel
#[cfg_attr(test, mockall::automock)]
pub trait FallbackPrompter: Send + Sync {
    fn ask(&self, display_name: &str, channel: ChannelKind) -> FallbackAnswer;
}

/// Headless prompter: logs and declines
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFallbackPrompter;

impl FallbackPrompter for LogFallbackPrompter {
    fn ask(&self, display_name: &str, channel: ChannelKind) -> FallbackAnswer {
        warn!(
            display_name,
            %channel,
            "Display stopped responding; enable always_fallback_control to switch to software gamma"
        );
        FallbackAnswer::NotNow
    }
}

/// Per-display prompt rate limit
#[derive(Debug, Default)]
pub struct PromptGate {
    last: Mutex<HashMap<String, Instant>>,
}

impl PromptGate {
    /// Take the prompt slot for `serial` if the last one is old enough
    pub fn try_acquire(&self, serial: &str, now: Instant) -> bool {
        let mut last = self.last.lock();
        match last.get(serial) {
            Some(at) if now.saturating_duration_since(*at) < PROMPT_INTERVAL => false,
            _ => {
                last.insert(serial.to_string(), now);
                true
            }
        }
    }

    pub fn forget(&self, serial: &str) {
        self.last.lock().remove(serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_allows_once_per_interval() {
        let gate = PromptGate::default();
        let start = Instant::now();
        assert!(gate.try_acquire("A", start));
        assert!(!gate.try_acquire("A", start + Duration::from_secs(60)));
        assert!(gate.try_acquire("B", start + Duration::from_secs(60)));
        assert!(gate.try_acquire("A", start + PROMPT_INTERVAL));

        gate.forget("A");
        assert!(gate.try_acquire("A", start + PROMPT_INTERVAL));
    }

    #[test]
    fn test_log_prompter_declines() {
        assert_eq!(
            LogFallbackPrompter.ask("DELL", ChannelKind::Hardware),
            FallbackAnswer::NotNow
        );
    }
}
