// SPDX-License-Identifier: GPL-3.0-only
//! Adaptive brightness engine
//!
//! Each [`AdaptiveMode`] turns an external signal (ambient light, a reference
//! display, the sun, the clock) into brightness/contrast targets per display.
//! [`ModeSwitcher`] guarantees a single mode is watching at any time.

pub mod clock;
pub mod curve;
pub mod location;
pub mod manual;
pub mod sensor;
pub mod solar;
pub mod sync;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::display::{Display, Property};
use crate::task::PeriodicTask;

pub use clock::ClockMode;
pub use location::LocationMode;
pub use manual::ManualMode;
pub use sensor::SensorMode;
pub use sync::SyncMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKey {
    Manual,
    Sync,
    Sensor,
    Location,
    Clock,
}

impl ModeKey {
    pub const ALL: [ModeKey; 5] = [
        ModeKey::Manual,
        ModeKey::Sync,
        ModeKey::Sensor,
        ModeKey::Location,
        ModeKey::Clock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModeKey::Manual => "manual",
            ModeKey::Sync => "sync",
            ModeKey::Sensor => "sensor",
            ModeKey::Location => "location",
            ModeKey::Clock => "clock",
        }
    }

    /// Modes whose curves learn from user adjustments
    pub fn learns(&self) -> bool {
        matches!(self, ModeKey::Sync | ModeKey::Sensor | ModeKey::Location)
    }
}

impl fmt::Display for ModeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which mode the user asked for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeSelection {
    #[default]
    Auto,
    #[serde(untagged)]
    Fixed(ModeKey),
}

/// Brightness/contrast a mode wants a display at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub brightness: u16,
    pub contrast: u16,
}

/// Invoked from a mode's watcher when its signal changed
pub type SignalCallback = Arc<dyn Fn(ModeKey) + Send + Sync>;

pub trait AdaptiveMode: Send + Sync {
    fn key(&self) -> ModeKey;

    fn available(&self) -> bool;

    fn is_watching(&self) -> bool;

    /// Start following the signal. Returns `false` if already watching.
    fn watch(&self, on_signal: SignalCallback) -> bool;

    /// Stop following the signal. Returns `false` if not watching.
    fn stop_watching(&self) -> bool;

    /// Read the signal now and remember it
    fn input(&self) -> Option<f64>;

    /// Signal remembered from the last read
    fn last_input(&self) -> Option<f64>;

    /// Targets for `display` at signal `input`
    fn compute(&self, display: &Display, input: f64) -> Option<Target>;
}

/// Map a `[0, 1]` signal onto `[min, max]` with a curve factor and an offset
pub fn compute_value(percent: f64, min: u16, max: u16, factor: f64, offset: i32) -> u16 {
    let (min, max) = (min as f64, max as f64);
    let mut value = if percent >= 1.0 {
        max
    } else if percent <= 0.0 {
        min
    } else {
        let v = ((percent * (max - min) + min) / 100.0).powf(factor) * 100.0;
        v.clamp(min, max)
    };
    if offset > 0 {
        value = (value + offset as f64).clamp(min, max);
    }
    value.round() as u16
}

/// Shared curve lookup of the signal-driven modes
pub(crate) fn curve_target(
    display: &Display,
    mode: ModeKey,
    input: f64,
    domain: (f64, f64),
    percent: impl Fn(f64) -> f64,
    factor: f64,
) -> Target {
    let value = |property: Property| {
        let (min, max) = display.limits(property);
        let default = |x: f64| compute_value(percent(x), min, max, factor, 0) as f64;
        match display.curves(mode).and_then(|c| c.curve(property)) {
            Some(curve) if !curve.is_empty() => curve.interpolate(input, domain, default),
            _ => default(input.clamp(domain.0, domain.1)).round() as u16,
        }
    };
    Target {
        brightness: value(Property::Brightness),
        contrast: value(Property::Contrast),
    }
}

/// Why a user adjustment was not learned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnSkip {
    ModeDoesNotLearn,
    CurveLocked,
    Paused,
    SourceDisplay,
    RecentlyConnected,
    NoInput,
}

/// Insert `value` at the mode's current `input` into the display's curve
pub fn learn(
    display: &mut Display,
    mode: ModeKey,
    property: Property,
    input: Option<f64>,
    value: u16,
) -> Result<(), LearnSkip> {
    if !mode.learns() || property == Property::Volume {
        return Err(LearnSkip::ModeDoesNotLearn);
    }
    if display.is_curve_locked(property) {
        return Err(LearnSkip::CurveLocked);
    }
    if display.settings.adaptive_paused {
        return Err(LearnSkip::Paused);
    }
    if mode == ModeKey::Sync && display.settings.is_source {
        return Err(LearnSkip::SourceDisplay);
    }
    if display.recently_connected() {
        return Err(LearnSkip::RecentlyConnected);
    }
    let input = input.ok_or(LearnSkip::NoInput)?;

    if let Some(curve) = display.curves_mut(mode).curve_mut(property) {
        curve.insert(input, value as f64);
        let serial = &display.serial;
        debug!(
            serial = %serial,
            mode = %mode,
            property = %property,
            input,
            value,
            "Learned curve point"
        );
    }
    Ok(())
}

/// Periodic signal polling shared by the modes
#[derive(Default)]
pub struct ModeWatch {
    task: Mutex<Option<PeriodicTask>>,
}

impl ModeWatch {
    pub fn is_watching(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn start<F>(&self, name: &str, interval: Duration, tick: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }
        *task = PeriodicTask::spawn(name, interval, tick);
        task.is_some()
    }

    pub fn stop(&self) -> bool {
        self.task.lock().take().is_some()
    }
}

/// Remembered signal; reports whether a new reading differs
#[derive(Default)]
pub struct LastInput(Mutex<Option<f64>>);

impl LastInput {
    pub fn get(&self) -> Option<f64> {
        *self.0.lock()
    }

    pub fn update(&self, value: Option<f64>) -> bool {
        let mut last = self.0.lock();
        let changed = *last != value;
        if value.is_some() {
            *last = value;
        }
        changed && value.is_some()
    }
}

/// All modes, one instance each
#[derive(Clone)]
pub struct ModeSet {
    pub manual: Arc<ManualMode>,
    pub sync: Arc<SyncMode>,
    pub sensor: Arc<SensorMode>,
    pub location: Arc<LocationMode>,
    pub clock: Arc<ClockMode>,
}

impl ModeSet {
    pub fn get(&self, key: ModeKey) -> Arc<dyn AdaptiveMode> {
        match key {
            ModeKey::Manual => self.manual.clone(),
            ModeKey::Sync => self.sync.clone(),
            ModeKey::Sensor => self.sensor.clone(),
            ModeKey::Location => self.location.clone(),
            ModeKey::Clock => self.clock.clone(),
        }
    }

    /// First available mode in order: external sensor, sync, internal
    /// sensor, location, manual
    pub fn auto_select(&self) -> ModeKey {
        if self.sensor.external_available() {
            ModeKey::Sensor
        } else if self.sync.available() {
            ModeKey::Sync
        } else if self.sensor.internal_available() {
            ModeKey::Sensor
        } else if self.location.available() {
            ModeKey::Location
        } else {
            ModeKey::Manual
        }
    }

    pub fn resolve(&self, selection: ModeSelection) -> ModeKey {
        match selection {
            ModeSelection::Auto => self.auto_select(),
            ModeSelection::Fixed(key) => key,
        }
    }
}

struct SwitcherState {
    current: ModeKey,
    selection: ModeSelection,
    last_non_manual: Option<ModeKey>,
    last_mode_was_auto: bool,
}

/// Owns the active mode and its watcher
pub struct ModeSwitcher {
    modes: ModeSet,
    on_signal: SignalCallback,
    state: Mutex<SwitcherState>,
}

impl ModeSwitcher {
    pub fn new(modes: ModeSet, selection: ModeSelection, on_signal: SignalCallback) -> Self {
        Self {
            modes,
            on_signal,
            state: Mutex::new(SwitcherState {
                current: ModeKey::Manual,
                selection,
                last_non_manual: None,
                last_mode_was_auto: selection == ModeSelection::Auto,
            }),
        }
    }

    pub fn modes(&self) -> &ModeSet {
        &self.modes
    }

    pub fn current_key(&self) -> ModeKey {
        self.state.lock().current
    }

    pub fn current(&self) -> Arc<dyn AdaptiveMode> {
        self.modes.get(self.current_key())
    }

    pub fn selection(&self) -> ModeSelection {
        self.state.lock().selection
    }

    /// Apply a selection: stop the old mode, then watch the new one if available
    pub fn select(&self, selection: ModeSelection) -> ModeKey {
        let key = self.modes.resolve(selection);
        let mut state = self.state.lock();
        state.selection = selection;
        self.switch_locked(&mut state, key);
        key
    }

    /// Re-evaluate `auto` and the availability of the current mode
    pub fn refresh(&self) -> ModeKey {
        let mut state = self.state.lock();
        let key = self.modes.resolve(state.selection);
        self.switch_locked(&mut state, key);
        key
    }

    fn switch_locked(&self, state: &mut SwitcherState, key: ModeKey) {
        let old = state.current;
        if old != key {
            self.modes.get(old).stop_watching();
            info!(from = %old, to = %key, "Switching adaptive mode");
            state.current = key;
            if key != ModeKey::Manual {
                state.last_non_manual = Some(key);
            }
        }

        let mode = self.modes.get(key);
        if mode.available() {
            mode.watch(self.on_signal.clone());
        } else {
            mode.stop_watching();
        }
    }

    /// Switch to manual, remembering how to come back
    pub fn disable(&self) {
        let mut state = self.state.lock();
        state.last_mode_was_auto = state.selection == ModeSelection::Auto;
        state.selection = ModeSelection::Fixed(ModeKey::Manual);
        self.switch_locked(&mut state, ModeKey::Manual);
    }

    /// Leave manual mode for `mode`, or whatever was active before `disable`
    pub fn enable(&self, mode: Option<ModeKey>) -> ModeKey {
        let mut state = self.state.lock();
        let selection = match (mode, state.last_non_manual) {
            (Some(key), _) => ModeSelection::Fixed(key),
            (None, _) if state.last_mode_was_auto => ModeSelection::Auto,
            (None, Some(key)) if self.modes.get(key).available() => ModeSelection::Fixed(key),
            (None, _) => ModeSelection::Auto,
        };
        let key = self.modes.resolve(selection);
        state.selection = selection;
        self.switch_locked(&mut state, key);
        key
    }

    pub fn toggle(&self) -> ModeKey {
        if self.current_key() == ModeKey::Manual {
            self.enable(None)
        } else {
            self.disable();
            ModeKey::Manual
        }
    }

    pub fn stop(&self) {
        for key in ModeKey::ALL {
            self.modes.get(key).stop_watching();
        }
    }
}
