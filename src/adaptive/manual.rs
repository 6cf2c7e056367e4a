// SPDX-License-Identifier: GPL-3.0-only
//! Manual mode: values only change when the user asks

use std::sync::atomic::{AtomicBool, Ordering};

use super::{AdaptiveMode, ModeKey, SignalCallback, Target};
use crate::display::Display;

#[derive(Debug, Default)]
pub struct ManualMode {
    watching: AtomicBool,
}

impl ManualMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linear map of a 0-100 percentage onto `[min, max]`
    pub fn compute(percent: f64, min: u16, max: u16) -> u16 {
        let (lo, hi) = (min as f64, max as f64);
        let value = (percent.clamp(0.0, 100.0) / 100.0 * (hi - lo)).round() + lo;
        value.clamp(lo, hi) as u16
    }
}

impl AdaptiveMode for ManualMode {
    fn key(&self) -> ModeKey {
        ModeKey::Manual
    }

    fn available(&self) -> bool {
        true
    }

    fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    fn watch(&self, _on_signal: SignalCallback) -> bool {
        !self.watching.swap(true, Ordering::SeqCst)
    }

    fn stop_watching(&self) -> bool {
        self.watching.swap(false, Ordering::SeqCst)
    }

    fn input(&self) -> Option<f64> {
        None
    }

    fn last_input(&self) -> Option<f64> {
        None
    }

    fn compute(&self, _display: &Display, _input: f64) -> Option<Target> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_linear_compute() {
        assert_eq!(ManualMode::compute(0.0, 10, 90), 10);
        assert_eq!(ManualMode::compute(50.0, 10, 90), 50);
        assert_eq!(ManualMode::compute(100.0, 10, 90), 90);
        assert_eq!(ManualMode::compute(150.0, 0, 100), 100);
    }

    #[test]
    fn test_watch_is_idempotent() {
        let mode = ManualMode::new();
        assert!(mode.watch(Arc::new(|_| {})));
        assert!(!mode.watch(Arc::new(|_| {})));
        assert!(mode.stop_watching());
        assert!(!mode.stop_watching());
    }
}
