// SPDX-License-Identifier: GPL-3.0-only
//! Periodic watchers
//!
//! Three single-flight background ticks: control health, mode availability
//! and the focused application.

use std::time::{Duration, Instant};

use super::{DisplayController, FallbackAnswer};
use crate::adaptive::ModeKey;
use crate::control::{ChannelKind, ControlBackend};
use crate::display::DisplayEntry;
use crate::task::PeriodicTask;

pub const CONTROL_WATCH_INTERVAL: Duration = Duration::from_secs(15);
pub const MODE_WATCH_INTERVAL: Duration = Duration::from_secs(5);
pub const FOCUS_WATCH_INTERVAL: Duration = Duration::from_secs(1);

impl DisplayController {
    /// Start the watchers and the active mode. No-op when already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_watchers(&self) -> bool {
        let mut watchers = self.shared.watchers.lock();
        if !watchers.is_empty() {
            return false;
        }

        let weak = self.downgrade();
        watchers.extend(PeriodicTask::spawn("control-watcher", CONTROL_WATCH_INTERVAL, move || {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.check_controls();
            }
        }));
        let weak = self.downgrade();
        watchers.extend(PeriodicTask::spawn("mode-watcher", MODE_WATCH_INTERVAL, move || {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.check_mode();
            }
        }));
        let weak = self.downgrade();
        watchers.extend(PeriodicTask::spawn("focus-watcher", FOCUS_WATCH_INTERVAL, move || {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.check_focus();
            }
        }));
        let started = !watchers.is_empty();
        drop(watchers);

        self.shared.switcher.refresh();
        info!(mode = %self.mode_key(), "Watchers started");
        started
    }

    pub fn stop_watchers(&self) {
        let stopped = std::mem::take(&mut *self.shared.watchers.lock());
        if !stopped.is_empty() {
            debug!(count = stopped.len(), "Stopping watchers");
        }
    }

    /// Re-select the best channel of every display and deal with channels
    /// that stopped answering
    pub fn check_controls(&self) {
        for entry in self.shared.registry.active() {
            let control = self.control_for(&entry);
            let kind = control.kind();
            if kind.is_remote_protocol() && !control.is_responsive() {
                self.handle_unresponsive(&entry, kind);
            }
        }
    }

    fn handle_unresponsive(&self, entry: &DisplayEntry, kind: ChannelKind) {
        let (serial, name, settings) = {
            let display = entry.display.read();
            (display.serial.clone(), display.name.clone(), display.settings.clone())
        };
        warn!(serial = %serial, channel = %kind, "Display control is not responding");

        if settings.always_fallback_control {
            self.fall_back(&serial, kind);
            return;
        }
        if settings.never_fallback_control || self.shared.config.read().never_prompt_fallback {
            return;
        }
        if !self.shared.prompt_gate.try_acquire(&serial, Instant::now()) {
            return;
        }

        match self.shared.prompter.ask(&name, kind) {
            FallbackAnswer::Fallback => self.fall_back(&serial, kind),
            FallbackAnswer::NotNow => debug!(serial = %serial, "Fallback postponed"),
            FallbackAnswer::Never => {
                entry.display.write().settings.never_fallback_control = true;
                self.persist(entry);
            }
        }
    }

    fn fall_back(&self, serial: &str, kind: ChannelKind) {
        match self.set_enabled_control(serial, kind, false) {
            Ok(()) => info!(serial, channel = %kind, "Fell back from unresponsive channel"),
            Err(e) => warn!(serial, "Fallback failed: {}", e),
        }
    }

    /// Follow `auto` and mode availability
    pub fn check_mode(&self) {
        let before = self.mode_key();
        let after = self.shared.switcher.refresh();
        if before != after {
            self.adapt_all(true);
        }
    }

    /// React to the focused application changing
    pub fn check_focus(&self) {
        let app = self.shared.focus.focused_app();
        {
            let mut focused = self.shared.focused_app.lock();
            if *focused == app {
                return;
            }
            focused.clone_from(&app);
        }
        debug!(app = ?app, "Focused application changed");

        if self.mode_key() == ModeKey::Manual {
            self.apply_manual_exceptions();
        } else {
            self.adapt_all(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adaptive::ModeSelection;
    use crate::config::{AppException, Config};
    use crate::control::TransitionPolicy;
    use crate::controller::tests::{ScriptedEnumerator, ddc_display, identity};
    use crate::controller::{Collaborators, FocusLocator, MockFallbackPrompter};
    use crate::protocols::vcp;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct FocusScript(Mutex<Option<String>>);

    impl FocusLocator for FocusScript {
        fn focused_app(&self) -> Option<String> {
            self.0.lock().clone()
        }
    }

    fn manual() -> Config {
        Config {
            adaptive_mode: ModeSelection::Fixed(ModeKey::Manual),
            brightness_transition: TransitionPolicy::Instant,
            ..Default::default()
        }
    }

    fn with_prompter(config: Config, prompter: MockFallbackPrompter) -> DisplayController {
        let (live, state) = ddc_display(5, "DELL", 314041);
        state.fail_writes.store(true, Ordering::SeqCst);
        let enumerator = Arc::new(ScriptedEnumerator::default());
        *enumerator.displays.lock() = vec![live];
        let mut collaborators = Collaborators::new(enumerator, Arc::new(MemoryStore::new()));
        collaborators.prompter = Arc::new(prompter);
        let controller = DisplayController::new(config, collaborators);
        controller.reset_display_list();
        controller
    }

    fn break_channel(controller: &DisplayController) {
        for _ in 0..5 {
            controller
                .context()
                .faults
                .record_write_failure(5, ChannelKind::Hardware);
        }
    }

    #[test]
    fn test_unresponsive_channel_prompts_once() {
        let mut prompter = MockFallbackPrompter::new();
        prompter
            .expect_ask()
            .withf(|_, kind| *kind == ChannelKind::Hardware)
            .times(1)
            .returning(|_, _| FallbackAnswer::NotNow);
        let controller = with_prompter(manual(), prompter);
        break_channel(&controller);

        controller.check_controls();
        controller.check_controls();
    }

    #[test]
    fn test_fallback_answer_moves_to_gamma() {
        let mut prompter = MockFallbackPrompter::new();
        prompter
            .expect_ask()
            .times(1)
            .returning(|_, _| FallbackAnswer::Fallback);
        let controller = with_prompter(manual(), prompter);
        break_channel(&controller);

        controller.check_controls();
        let serial = identity("DELL", 314041).stable_serial();
        let entry = controller.registry().entry(&serial).unwrap();
        assert!(!entry.display.read().enabled_controls.is_enabled(ChannelKind::Hardware));
        assert_eq!(controller.control_for(&entry).kind(), ChannelKind::Gamma);
    }

    #[test]
    fn test_never_answer_is_remembered() {
        let mut prompter = MockFallbackPrompter::new();
        prompter
            .expect_ask()
            .times(1)
            .returning(|_, _| FallbackAnswer::Never);
        let controller = with_prompter(manual(), prompter);
        break_channel(&controller);

        controller.check_controls();
        controller.shared.prompt_gate.forget(&identity("DELL", 314041).stable_serial());
        controller.check_controls();
        let entry = controller.registry().active().remove(0);
        assert!(entry.display.read().settings.never_fallback_control);
    }

    #[test]
    fn test_opted_out_never_prompts() {
        let mut prompter = MockFallbackPrompter::new();
        prompter.expect_ask().times(0);
        let config = Config {
            never_prompt_fallback: true,
            ..manual()
        };
        let controller = with_prompter(config, prompter);
        break_channel(&controller);
        controller.check_controls();
    }

    #[test]
    fn test_always_fallback_skips_prompt() {
        let mut prompter = MockFallbackPrompter::new();
        prompter.expect_ask().times(0);
        let controller = with_prompter(manual(), prompter);
        let entry = controller.registry().active().remove(0);
        entry.display.write().settings.always_fallback_control = true;
        break_channel(&controller);

        controller.check_controls();
        assert_eq!(controller.control_for(&entry).kind(), ChannelKind::Gamma);
    }

    #[test]
    fn test_manual_app_preset_applies_and_restores() {
        let (live, state) = ddc_display(1, "A", 1);
        let enumerator = Arc::new(ScriptedEnumerator::default());
        *enumerator.displays.lock() = vec![live];
        let focus = Arc::new(FocusScript::default());
        let mut config = manual();
        config.app_exceptions.push(AppException {
            app: "mpv".into(),
            brightness: 90,
            contrast: 70,
            apply_builtin: false,
        });
        let mut collaborators = Collaborators::new(enumerator, Arc::new(MemoryStore::new()));
        collaborators.focus = focus.clone();
        let controller = DisplayController::new(config, collaborators);
        controller.reset_display_list();

        *focus.0.lock() = Some("mpv".into());
        controller.check_focus();
        assert!(state.writes.lock().contains(&(vcp::BRIGHTNESS, 90)));

        *focus.0.lock() = Some("firefox".into());
        controller.check_focus();
        assert_eq!(state.writes.lock().last(), Some(&(vcp::CONTRAST, 50)));
        let entry = controller.registry().active().remove(0);
        assert_eq!(entry.display.read().brightness, 50);
    }
}
