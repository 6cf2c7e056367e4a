// SPDX-License-Identifier: GPL-3.0-only
//! User and automation intents

use super::{DisplayController, offset_value};
use crate::adaptive::ModeKey;
use crate::adaptive::manual::ManualMode;
use crate::control::{ChannelKind, ColorGain, Control, ControlBackend};
use crate::display::{DisplayEntry, Property};
use crate::error::{AppError, Result};

/// Perceptually even brightness/volume steps of hardware OSDs
pub const FILLED_CHICLETS: [u16; 17] = [0, 6, 12, 19, 25, 31, 37, 44, 50, 56, 62, 69, 75, 81, 87, 94, 100];

/// Offset of one chiclet key press
pub const CHICLET_STEP: i32 = 6;

/// Which displays an intent applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayFilter {
    All,
    Builtin,
    /// Active display with the lowest id
    Main,
    /// Sync reference display
    Source,
    /// Display under the cursor
    Cursor,
    Serial(String),
}

impl DisplayFilter {
    /// Filters naming a display explicitly also reach the built-in panel
    fn targets_builtin(&self) -> bool {
        !matches!(self, DisplayFilter::All | DisplayFilter::Main)
    }
}

/// Value after a step of `offset`, snapped to the nearest chiclet when the
/// step is exactly one chiclet
pub fn chiclet_value(value: u16, offset: i32) -> i32 {
    let target = value as i32 + offset;
    if offset.abs() != CHICLET_STEP {
        return target;
    }

    // Ties go to the higher chiclet
    let mut index = 0;
    for (i, threshold) in FILLED_CHICLETS.iter().enumerate() {
        if (*threshold as i32 - target).abs() <= (FILLED_CHICLETS[index] as i32 - target).abs() {
            index = i;
        }
    }
    let backup = if offset < 0 {
        index.saturating_sub(1)
    } else {
        (index + 1).min(FILLED_CHICLETS.len() - 1)
    };
    let chiclet = FILLED_CHICLETS[index];
    if chiclet != value {
        chiclet as i32
    } else {
        FILLED_CHICLETS[backup] as i32
    }
}

impl DisplayController {
    /// Active displays selected by `filter`
    pub fn targets(&self, filter: &DisplayFilter) -> Vec<DisplayEntry> {
        let registry = &self.shared.registry;
        match filter {
            DisplayFilter::All => registry.active(),
            DisplayFilter::Builtin => registry.builtin().into_iter().collect(),
            DisplayFilter::Main => registry.active().into_iter().take(1).collect(),
            DisplayFilter::Source => registry.source().into_iter().collect(),
            DisplayFilter::Cursor => self
                .shared
                .cursor
                .cursor_display()
                .and_then(|id| registry.by_id(id))
                .into_iter()
                .collect(),
            DisplayFilter::Serial(serial) => registry
                .entry(serial)
                .filter(|e| e.display.read().active)
                .into_iter()
                .collect(),
        }
    }

    fn brightness_targets(&self, filter: &DisplayFilter) -> Vec<DisplayEntry> {
        let builtin_ok =
            filter.targets_builtin() || self.shared.config.read().hotkeys_affect_builtin;
        self.targets(filter)
            .into_iter()
            .filter(|e| builtin_ok || !e.display.read().capabilities.is_builtin)
            .collect()
    }

    /// Built-in panels have no contrast control
    fn contrast_targets(&self, filter: &DisplayFilter) -> Vec<DisplayEntry> {
        self.targets(filter)
            .into_iter()
            .filter(|e| !e.display.read().capabilities.is_builtin)
            .collect()
    }

    fn set_property(&self, targets: Vec<DisplayEntry>, property: Property, value: u16) -> usize {
        let mut written = 0;
        for entry in &targets {
            if self.write_value(entry, property, value, true) {
                written += 1;
            }
            self.persist(entry);
        }
        written
    }

    pub fn set_brightness(&self, filter: &DisplayFilter, value: u16) -> usize {
        self.set_property(self.brightness_targets(filter), Property::Brightness, value)
    }

    pub fn set_contrast(&self, filter: &DisplayFilter, value: u16) -> usize {
        self.set_property(self.contrast_targets(filter), Property::Contrast, value)
    }

    pub fn set_volume(&self, filter: &DisplayFilter, value: u16) -> usize {
        self.set_property(self.targets(filter), Property::Volume, value.min(100))
    }

    /// Coalesce slider bursts into one write per display and window
    fn set_debounced(&self, targets: Vec<DisplayEntry>, property: Property, value: u16) {
        for entry in targets {
            let weak = self.downgrade();
            let serial = entry.serial();
            self.shared
                .writes
                .submit((serial.clone(), property), value, move |value| {
                    let Some(controller) = Self::upgrade(&weak) else {
                        return;
                    };
                    if let Some(entry) = controller.shared.registry.entry(&serial) {
                        controller.write_value(&entry, property, value, true);
                        controller.persist(&entry);
                    }
                });
        }
    }

    pub fn set_brightness_debounced(&self, filter: &DisplayFilter, value: u16) {
        self.set_debounced(self.brightness_targets(filter), Property::Brightness, value);
    }

    pub fn set_contrast_debounced(&self, filter: &DisplayFilter, value: u16) {
        self.set_debounced(self.contrast_targets(filter), Property::Contrast, value);
    }

    /// Map `percent` linearly onto each display's brightness clamps
    pub fn set_brightness_percent(&self, filter: &DisplayFilter, percent: f64) -> usize {
        let mut written = 0;
        for entry in self.brightness_targets(filter) {
            let value = {
                let display = entry.display.read();
                let mut min = display.min_brightness;
                if display.capabilities.is_builtin && min == 0 {
                    // Keep the panel lit
                    min = 1;
                }
                ManualMode::compute(percent, min, display.max_brightness)
            };
            if self.write_value(&entry, Property::Brightness, value, true) {
                written += 1;
            }
            self.persist(&entry);
        }
        written
    }

    pub fn set_contrast_percent(&self, filter: &DisplayFilter, percent: f64) -> usize {
        let mut written = 0;
        for entry in self.contrast_targets(filter) {
            let value = {
                let display = entry.display.read();
                ManualMode::compute(percent, display.min_contrast, display.max_contrast)
            };
            if self.write_value(&entry, Property::Contrast, value, true) {
                written += 1;
            }
            self.persist(&entry);
        }
        written
    }

    fn adjust(&self, targets: Vec<DisplayEntry>, property: Property, offset: i32) -> usize {
        let mut written = 0;
        for entry in targets {
            let value = {
                let display = entry.display.read();
                let (min, max) = display.limits(property);
                chiclet_value(display.value(property), offset).clamp(min as i32, max as i32) as u16
            };
            if self.write_value(&entry, property, value, true) {
                written += 1;
            }
            self.persist(&entry);
        }
        written
    }

    pub fn adjust_brightness(&self, filter: &DisplayFilter, offset: i32) -> usize {
        self.adjust(self.brightness_targets(filter), Property::Brightness, offset)
    }

    pub fn adjust_contrast(&self, filter: &DisplayFilter, offset: i32) -> usize {
        self.adjust(self.contrast_targets(filter), Property::Contrast, offset)
    }

    pub fn adjust_volume(&self, filter: &DisplayFilter, offset: i32) -> usize {
        self.adjust(self.targets(filter), Property::Volume, offset)
    }

    pub fn toggle_mute(&self, filter: &DisplayFilter) -> usize {
        let mut toggled = 0;
        for entry in self.targets(filter) {
            let muted = !entry.display.read().muted;
            if self.control_for(&entry).set_mute(muted) {
                entry.display.write().muted = muted;
                toggled += 1;
            }
        }
        toggled
    }

    pub fn set_input(&self, filter: &DisplayFilter, input: u16) -> usize {
        let mut switched = 0;
        for entry in self.targets(filter) {
            if self.control_for(&entry).set_input(input) {
                entry.display.write().input = input;
                self.persist(&entry);
                switched += 1;
            }
        }
        switched
    }

    pub fn set_power(&self, filter: &DisplayFilter, on: bool) -> usize {
        let mut switched = 0;
        for entry in self.targets(filter) {
            if self.control_for(&entry).set_power(on) {
                entry.display.write().power_on = on;
                switched += 1;
            }
        }
        switched
    }

    /// Allow or forbid a channel; disabling the last enabled one is rejected
    /// and leaves software gamma enabled
    pub fn set_enabled_control(&self, serial: &str, kind: ChannelKind, enabled: bool) -> Result<()> {
        let entry = self.entry(serial)?;
        let accepted = entry.display.write().enabled_controls.set(kind, enabled);
        self.persist(&entry);
        if !accepted {
            warn!(serial, channel = %kind, "Refusing to disable the last enabled control");
            return Err(AppError::LastControl {
                serial: serial.to_string(),
                channel: kind.to_string(),
            });
        }
        info!(serial, channel = %kind, enabled, "Control channel toggled");
        self.control_for(&entry);
        Ok(())
    }

    fn set_limits(&self, serial: &str, property: Property, min: u16, max: u16) -> Result<()> {
        let entry = self.entry(serial)?;
        let (old, value) = {
            let mut display = entry.display.write();
            let old = display.value(property);
            display.set_limits(property, min, max)?;
            (old, display.value(property))
        };
        self.persist(&entry);
        if old != value {
            self.write_value(&entry, property, value, false);
        }
        Ok(())
    }

    pub fn set_brightness_limits(&self, serial: &str, min: u16, max: u16) -> Result<()> {
        self.set_limits(serial, Property::Brightness, min, max)
    }

    pub fn set_contrast_limits(&self, serial: &str, min: u16, max: u16) -> Result<()> {
        self.set_limits(serial, Property::Contrast, min, max)
    }

    /// Forget learned points of one mode, or of every mode
    pub fn reset_curve(&self, serial: &str, mode: Option<ModeKey>) -> Result<()> {
        let entry = self.entry(serial)?;
        {
            let mut display = entry.display.write();
            match mode {
                Some(mode) => display.curves_mut(mode).reset(),
                None => display.curves.values_mut().for_each(|c| c.reset()),
            }
        }
        info!(serial, ?mode, "Curve reset");
        self.persist(&entry);
        self.adapt(&entry, true);
        Ok(())
    }

    pub fn reset_faults(&self, serial: &str) -> Result<()> {
        let entry = self.entry(serial)?;
        let id = entry.display.read().id;
        self.shared.ctx.faults.reset_display(id);
        self.shared.prompt_gate.forget(serial);
        self.control_for(&entry);
        Ok(())
    }

    /// Factory reset through the hardware channel
    pub fn reset_display(&self, serial: &str) -> Result<bool> {
        let entry = self.entry(serial)?;
        let control = Control::build(
            ChannelKind::Hardware,
            &entry.display,
            &entry.channels,
            &self.shared.ctx,
        );
        if !control.is_available() {
            return Ok(false);
        }
        self.shared.ctx.transitions.stop_display(serial);
        let reset = control.reset();
        if reset {
            info!(serial, "Display reset to factory defaults");
            self.refresh_entry(&entry);
        }
        Ok(reset)
    }

    /// Write a color gain through the current feature channel. Gamma-driven
    /// displays have no gains.
    pub fn set_gain(&self, serial: &str, gain: ColorGain, value: u16) -> Result<bool> {
        let entry = self.entry(serial)?;
        let control = self.control_for(&entry);
        let Some(feature) = control.as_feature() else {
            return Ok(false);
        };
        let written = feature.write_gain(gain, value.min(100));
        if written {
            self.persist(&entry);
        }
        Ok(written)
    }

    /// Restore factory colors and read the gains back
    pub fn reset_colors(&self, serial: &str) -> Result<bool> {
        let entry = self.entry(serial)?;
        let control = self.control_for(&entry);
        let Some(feature) = control.as_feature() else {
            return Ok(false);
        };
        if !feature.reset_colors() {
            return Ok(false);
        }

        let gains = [ColorGain::Red, ColorGain::Green, ColorGain::Blue]
            .map(|gain| (gain, feature.read_gain(gain)));
        {
            let mut display = entry.display.write();
            for (gain, value) in gains {
                let Some(value) = value else { continue };
                match gain {
                    ColorGain::Red => display.red_gain = value,
                    ColorGain::Green => display.green_gain = value,
                    ColorGain::Blue => display.blue_gain = value,
                }
            }
        }
        self.persist(&entry);
        info!(serial, "Display colors reset");
        Ok(true)
    }

    /// Drop a display and its record
    pub fn remove_display(&self, serial: &str) -> Result<()> {
        let entry = self
            .shared
            .registry
            .remove(serial)
            .ok_or_else(|| AppError::DisplayNotFound(serial.to_string()))?;
        self.shared.ctx.transitions.stop_display(serial);
        self.shared.selector.forget(serial);
        self.shared.prompt_gate.forget(serial);
        let id = entry.display.read().id;
        self.shared.ctx.faults.reset_display(id);
        self.shared.ctx.maxima.forget_display(id);
        crate::display::record::remove(&*self.shared.store, serial)
    }

    /// Mark a display as the Sync reference; only one can be
    pub fn set_source(&self, serial: &str, is_source: bool) -> Result<()> {
        self.entry(serial)?;
        for entry in self.shared.registry.all() {
            let changed = {
                let mut display = entry.display.write();
                let wanted = display.serial == serial && is_source;
                std::mem::replace(&mut display.settings.is_source, wanted) != wanted
            };
            if changed {
                self.persist(&entry);
            }
        }
        Ok(())
    }

    pub fn set_adaptive_paused(&self, serial: &str, paused: bool) -> Result<()> {
        let entry = self.entry(serial)?;
        entry.display.write().settings.adaptive_paused = paused;
        self.persist(&entry);
        Ok(())
    }

    fn refresh_entry(&self, entry: &DisplayEntry) {
        let control = self.control_for(entry);
        let brightness = control.get_brightness();
        let contrast = control.get_contrast();
        let volume = control.get_volume();

        let mut display = entry.display.write();
        if let Some(value) = brightness {
            display.brightness = value;
        }
        if let Some(value) = contrast {
            display.contrast = value;
        }
        if let Some(value) = volume {
            display.volume = value;
        }
        let serial = &display.serial;
        debug!(
            serial = %serial,
            brightness = ?brightness,
            contrast = ?contrast,
            volume = ?volume,
            "Values read back"
        );
    }

    /// Read brightness, contrast and volume back from the hardware
    pub fn refresh_values(&self, filter: &DisplayFilter) {
        for entry in self.targets(filter) {
            self.refresh_entry(&entry);
        }
    }

    /// Apply or lift the focused application's exception in manual mode
    pub(super) fn apply_manual_exceptions(&self) {
        for entry in self.shared.registry.active() {
            let serial = entry.serial();
            match self.app_exception_for(&entry) {
                Some(app) => {
                    let (brightness, contrast) = {
                        let display = entry.display.read();
                        self.shared
                            .app_restore
                            .lock()
                            .entry(serial.clone())
                            .or_insert((display.brightness, display.contrast));
                        (
                            ManualMode::compute(
                                offset_value(0, app.brightness) as f64,
                                display.min_brightness,
                                display.max_brightness,
                            ),
                            ManualMode::compute(
                                offset_value(0, app.contrast) as f64,
                                display.min_contrast,
                                display.max_contrast,
                            ),
                        )
                    };
                    debug!(serial = %serial, app = %app.app, brightness, contrast, "Applying app preset");
                    self.write_value(&entry, Property::Brightness, brightness, false);
                    self.write_value(&entry, Property::Contrast, contrast, false);
                }
                None => {
                    let restore = self.shared.app_restore.lock().remove(&serial);
                    if let Some((brightness, contrast)) = restore {
                        self.write_value(&entry, Property::Brightness, brightness, false);
                        self.write_value(&entry, Property::Contrast, contrast, false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::ModeSelection;
    use crate::config::Config;
    use crate::control::TransitionPolicy;
    use crate::controller::tests::{controller, ddc_display, identity};
    use crate::protocols::vcp;

    fn manual() -> Config {
        Config {
            adaptive_mode: ModeSelection::Fixed(ModeKey::Manual),
            brightness_transition: TransitionPolicy::Instant,
            ..Default::default()
        }
    }

    #[test]
    fn test_chiclet_steps() {
        assert_eq!(chiclet_value(50, 6), 56);
        assert_eq!(chiclet_value(50, -6), 44);
        assert_eq!(chiclet_value(53, 6), 62);
        assert_eq!(chiclet_value(0, -6), 0);
        assert_eq!(chiclet_value(100, 6), 100);
        assert_eq!(chiclet_value(40, 3), 43);
        assert_eq!(chiclet_value(40, -10), 30);
    }

    #[test]
    fn test_adjust_clamps_to_limits() {
        let (a, state) = ddc_display(1, "A", 1);
        let (controller, _, _) = controller(vec![a], manual());
        controller.reset_display_list();
        let serial = identity("A", 1).stable_serial();
        controller.set_brightness_limits(&serial, 10, 60).unwrap();

        controller.set_brightness(&DisplayFilter::All, 58);
        controller.adjust_brightness(&DisplayFilter::All, CHICLET_STEP);
        assert_eq!(controller.registry().get(&serial).unwrap().read().brightness, 60);
        assert_eq!(state.writes.lock().last(), Some(&(vcp::BRIGHTNESS, 60)));
    }

    #[test]
    fn test_percent_maps_onto_clamps() {
        let (a, state) = ddc_display(1, "A", 1);
        let (controller, _, _) = controller(vec![a], manual());
        controller.reset_display_list();
        let serial = identity("A", 1).stable_serial();
        controller.set_contrast_limits(&serial, 20, 80).unwrap();

        assert_eq!(controller.set_contrast_percent(&DisplayFilter::Serial(serial), 50.0), 1);
        assert_eq!(state.writes.lock().last(), Some(&(vcp::CONTRAST, 50)));
    }

    #[test]
    fn test_invalid_limits_keep_previous_values() {
        let (a, _) = ddc_display(1, "A", 1);
        let (controller, _, _) = controller(vec![a], manual());
        controller.reset_display_list();
        let serial = identity("A", 1).stable_serial();
        controller.set_brightness_limits(&serial, 10, 90).unwrap();

        assert!(matches!(
            controller.set_brightness_limits(&serial, 70, 70),
            Err(AppError::InvalidRange { .. })
        ));
        let display = controller.registry().get(&serial).unwrap();
        assert_eq!((display.read().min_brightness, display.read().max_brightness), (10, 90));
    }

    #[test]
    fn test_builtin_skipped_by_all_filter() {
        let (mut panel, panel_state) = ddc_display(1, "Panel", 1);
        panel.capabilities.is_builtin = true;
        let (external, external_state) = ddc_display(2, "External", 2);
        let (controller, _, _) = controller(vec![panel, external], manual());
        controller.reset_display_list();

        assert_eq!(controller.set_brightness(&DisplayFilter::All, 30), 1);
        assert!(panel_state.writes.lock().is_empty());
        assert_eq!(*external_state.writes.lock(), vec![(vcp::BRIGHTNESS, 30)]);

        assert_eq!(controller.set_brightness(&DisplayFilter::Builtin, 30), 1);
        assert_eq!(*panel_state.writes.lock(), vec![(vcp::BRIGHTNESS, 30)]);
    }

    #[test]
    fn test_last_control_cannot_be_disabled() {
        let (a, _) = ddc_display(1, "A", 1);
        let (controller, _, _) = controller(vec![a], manual());
        controller.reset_display_list();
        let serial = identity("A", 1).stable_serial();

        for kind in [ChannelKind::Native, ChannelKind::Hardware, ChannelKind::Relay] {
            controller.set_enabled_control(&serial, kind, false).unwrap();
        }
        assert!(matches!(
            controller.set_enabled_control(&serial, ChannelKind::Gamma, false),
            Err(AppError::LastControl { .. })
        ));
        let display = controller.registry().get(&serial).unwrap();
        assert!(display.read().enabled_controls.is_enabled(ChannelKind::Gamma));
        assert_eq!(
            controller.control_for(&controller.registry().entry(&serial).unwrap()).kind(),
            ChannelKind::Gamma
        );
    }

    #[test]
    fn test_user_nudge_is_learned_in_adaptive_mode() {
        let (a, _) = ddc_display(1, "A", 1);
        let config = Config {
            adaptive_mode: ModeSelection::Fixed(ModeKey::Location),
            brightness_transition: TransitionPolicy::Instant,
            geolocation: Some(crate::config::Geolocation {
                latitude: 44.43,
                longitude: 26.10,
            }),
            ..Default::default()
        };
        let (controller, _, _) = controller(vec![a], config);
        controller.reset_display_list();
        let serial = identity("A", 1).stable_serial();
        controller.shared.switcher.current().input();

        // Within the reconnect grace nothing is learned
        controller.set_brightness(&DisplayFilter::All, 42);
        let display = controller.registry().get(&serial).unwrap();
        assert!(display
            .read()
            .curves(ModeKey::Location)
            .is_none_or(|c| c.brightness.is_empty()));

        display.write().connected_at = None;
        controller.set_brightness(&DisplayFilter::All, 42);
        let curves = display.read().curves(ModeKey::Location).cloned().unwrap();
        assert_eq!(curves.brightness.points().len(), 1);
        assert_eq!(curves.brightness.points()[0].1, 42.0);
    }

    #[test]
    fn test_remove_display_drops_record() {
        let (a, _) = ddc_display(1, "A", 1);
        let (controller, _, store) = controller(vec![a], manual());
        controller.reset_display_list();
        let serial = identity("A", 1).stable_serial();

        controller.remove_display(&serial).unwrap();
        assert!(controller.registry().get(&serial).is_none());
        assert!(crate::display::record::load(&*store, &serial).is_none());
        assert!(matches!(
            controller.remove_display(&serial),
            Err(AppError::DisplayNotFound(_))
        ));
    }

    #[test]
    fn test_refresh_reads_back_values() {
        let (a, state) = ddc_display(1, "A", 1);
        let (controller, _, _) = controller(vec![a], manual());
        controller.reset_display_list();
        state.values.lock().insert(vcp::BRIGHTNESS, 77);
        state.values.lock().insert(vcp::AUDIO_VOLUME, 12);

        controller.refresh_values(&DisplayFilter::Main);
        let entry = controller.registry().active().remove(0);
        assert_eq!(entry.display.read().brightness, 77);
        assert_eq!(entry.display.read().volume, 12);
    }

    #[test]
    fn test_reset_display_needs_hardware_channel() {
        let (a, state) = ddc_display(1, "A", 1);
        let (controller, _, _) = controller(vec![a], manual());
        controller.reset_display_list();
        let serial = identity("A", 1).stable_serial();

        assert!(controller.reset_display(&serial).unwrap());
        assert!(state.writes.lock().contains(&(vcp::FACTORY_RESET, 1)));

        controller
            .set_enabled_control(&serial, ChannelKind::Hardware, false)
            .unwrap();
        assert!(!controller.reset_display(&serial).unwrap());
    }

    #[test]
    fn test_color_gains_follow_the_feature_channel() {
        let (a, state) = ddc_display(1, "A", 1);
        let (controller, _, _) = controller(vec![a], manual());
        controller.reset_display_list();
        let serial = identity("A", 1).stable_serial();

        assert!(controller.set_gain(&serial, ColorGain::Green, 120).unwrap());
        assert!(state.writes.lock().contains(&(vcp::GREEN_GAIN, 100)));

        state.values.lock().insert(vcp::RED_GAIN, 47);
        assert!(controller.reset_colors(&serial).unwrap());
        assert!(state.writes.lock().contains(&(vcp::RESTORE_COLOR_DEFAULTS, 1)));
        let display = controller.registry().get(&serial).unwrap();
        assert_eq!(display.read().red_gain, 47);

        controller
            .set_enabled_control(&serial, ChannelKind::Hardware, false)
            .unwrap();
        assert!(!controller.set_gain(&serial, ColorGain::Red, 10).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_debounced_burst_writes_once() {
        let (a, state) = ddc_display(1, "A", 1);
        let (controller, _, _) = controller(vec![a], manual());
        controller.reset_display_list();

        for value in [20, 25, 31, 37] {
            controller.set_brightness_debounced(&DisplayFilter::All, value);
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(*state.writes.lock(), vec![(vcp::BRIGHTNESS, 37)]);
    }
}
