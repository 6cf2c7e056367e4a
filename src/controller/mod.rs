// SPDX-License-Identifier: GPL-3.0-only
//! Display controller
//!
//! Root of the core. Owns the display registry, the shared control context
//! and the adaptive mode switcher; reconciles the live topology with the
//! persisted records and routes user intents to the selected backends.
//!
//! # Locking
//!
//! Display locks are only held to read or update fields. Backend calls go
//! through [`Control`], which takes its own short read locks, so no display
//! lock is held across hardware I/O. Topology refreshes are serialized by a
//! reentrant lock.

mod fallback;
mod intents;
mod watchers;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::adaptive::clock::ClockMode;
use crate::adaptive::location::LocationMode;
use crate::adaptive::manual::ManualMode;
use crate::adaptive::sensor::{HttpLightSensor, IioLightSensor, LuxSource, SensorMode};
use crate::adaptive::sync::{BrightnessSource, RegistrySource, SyncMode};
use crate::adaptive::{self, ModeKey, ModeSelection, ModeSet, ModeSwitcher, SignalCallback};
use crate::config::{AppException, Config};
use crate::control::debounce::Debouncer;
use crate::control::{
    Control, ControlBackend, ControlContext, ControlSelector, DetachedGammaSink, DisplayChannels,
    GammaSink, MemoryGammaSink,
};
use crate::display::record::{self, DisplayRecord};
use crate::display::{Display, DisplayEntry, DisplayId, DisplayRegistry, Property};
use crate::enumeration::{DisplayEnumerator, LiveDisplay, SystemEnumerator};
use crate::error::{AppError, Result};
use crate::matcher::{self, Binding, LiveIdentity};
use crate::store::{self, KeyValueStore};
use crate::task::PeriodicTask;

pub use fallback::{
    FallbackAnswer, FallbackPrompter, LogFallbackPrompter, PROMPT_INTERVAL, PromptGate,
};
pub use intents::{CHICLET_STEP, DisplayFilter, FILLED_CHICLETS, chiclet_value};
pub use watchers::{CONTROL_WATCH_INTERVAL, FOCUS_WATCH_INTERVAL, MODE_WATCH_INTERVAL};

#[cfg(test)]
pub use fallback::MockFallbackPrompter;

/// Coalescing window for topology refresh requests
pub const RESET_DEBOUNCE: Duration = Duration::from_millis(200);

/// Finds the display under the mouse cursor
pub trait CursorLocator: Send + Sync {
    fn cursor_display(&self) -> Option<DisplayId>;
}

/// Reports the application owning the focused window
pub trait FocusLocator: Send + Sync {
    fn focused_app(&self) -> Option<String>;
}

/// Locator for sessions that expose neither cursor nor focus
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocator;

impl CursorLocator for NoLocator {
    fn cursor_display(&self) -> Option<DisplayId> {
        None
    }
}

impl FocusLocator for NoLocator {
    fn focused_app(&self) -> Option<String> {
        None
    }
}

/// Everything the controller talks to outside the core
pub struct Collaborators {
    pub enumerator: Arc<dyn DisplayEnumerator>,
    pub store: Arc<dyn KeyValueStore>,
    pub gamma_sink: Arc<dyn GammaSink>,
    pub prompter: Arc<dyn FallbackPrompter>,
    pub cursor: Arc<dyn CursorLocator>,
    pub focus: Arc<dyn FocusLocator>,
    /// Sync references tried after the flagged source display
    pub sync_sources: Vec<Arc<dyn BrightnessSource>>,
    pub external_sensor: Option<Arc<dyn LuxSource>>,
    pub internal_sensor: Option<Arc<dyn LuxSource>>,
}

impl Collaborators {
    /// Ramps kept in memory, fallback prompts only logged
    pub fn new(enumerator: Arc<dyn DisplayEnumerator>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            enumerator,
            store,
            gamma_sink: Arc::new(MemoryGammaSink::default()),
            prompter: Arc::new(LogFallbackPrompter),
            cursor: Arc::new(NoLocator),
            focus: Arc::new(NoLocator),
            sync_sources: Vec::new(),
            external_sensor: None,
            internal_sensor: None,
        }
    }

    /// Real hardware, the configured network sensor and the machine's own
    /// light sensor
    pub fn system(config: &Config, store: Arc<dyn KeyValueStore>) -> Self {
        let mut collaborators = Self::new(
            Arc::new(SystemEnumerator::new(&config.relay_endpoints)),
            store,
        );
        collaborators.gamma_sink = system_gamma_sink();
        collaborators.external_sensor = config
            .external_sensor_url
            .as_ref()
            .map(|url| Arc::new(HttpLightSensor::new(url.clone())) as Arc<dyn LuxSource>);
        collaborators.internal_sensor =
            IioLightSensor::find().map(|sensor| Arc::new(sensor) as Arc<dyn LuxSource>);

        #[cfg(feature = "brightness-sync-daemon")]
        if let Some(source) = crate::adaptive::sync::CosmicDaemonSource::spawn() {
            collaborators.sync_sources.push(source);
        }
        collaborators
    }
}

/// Compositor gamma hook, or one that refuses every display when none is
/// reachable
fn system_gamma_sink() -> Arc<dyn GammaSink> {
    #[cfg(feature = "wlr-gamma")]
    match crate::control::wlr_gamma::WlrGammaSink::connect() {
        Ok(sink) => return Arc::new(sink),
        Err(e) => warn!("Software dimming unavailable: {:#}", e),
    }
    #[cfg(not(feature = "wlr-gamma"))]
    warn!("Built without wlr-gamma, software dimming is unavailable");
    Arc::new(DetachedGammaSink)
}

struct Shared {
    config: RwLock<Config>,
    registry: DisplayRegistry,
    ctx: ControlContext,
    selector: ControlSelector,
    switcher: ModeSwitcher,

    enumerator: Arc<dyn DisplayEnumerator>,
    store: Arc<dyn KeyValueStore>,
    prompter: Arc<dyn FallbackPrompter>,
    cursor: Arc<dyn CursorLocator>,
    focus: Arc<dyn FocusLocator>,

    prompt_gate: PromptGate,
    reset_lock: ReentrantMutex<()>,
    reset_debounce: Debouncer<(), ()>,
    writes: Debouncer<(String, Property), u16>,
    focused_app: Mutex<Option<String>>,
    /// Manual values to restore once an app exception loses focus
    app_restore: Mutex<HashMap<String, (u16, u16)>>,
    watchers: Mutex<Vec<PeriodicTask>>,
}

/// Cheap to clone; every clone drives the same displays
#[derive(Clone)]
pub struct DisplayController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DisplayController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayController")
            .field("displays", &self.shared.registry.count())
            .field("mode", &self.shared.switcher.current_key())
            .finish_non_exhaustive()
    }
}

impl DisplayController {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let config = config.sanitized();
        let registry = DisplayRegistry::new();
        let ctx = ControlContext::new(collaborators.gamma_sink, config.brightness_transition);

        let mut sync_sources: Vec<Arc<dyn BrightnessSource>> =
            vec![Arc::new(RegistrySource::new(registry.clone(), ctx.clone()))];
        sync_sources.extend(collaborators.sync_sources);
        let modes = ModeSet {
            manual: Arc::new(ManualMode::new()),
            sync: Arc::new(SyncMode::new(sync_sources, &config)),
            sensor: Arc::new(SensorMode::new(
                collaborators.external_sensor,
                collaborators.internal_sensor,
                &config,
            )),
            location: Arc::new(LocationMode::new(&config)),
            clock: Arc::new(ClockMode::new(&config)),
        };

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let on_signal: SignalCallback = Arc::new(move |key| {
                if let Some(controller) = Self::upgrade(&weak) {
                    controller.on_mode_signal(key);
                }
            });
            Shared {
                switcher: ModeSwitcher::new(modes, config.adaptive_mode, on_signal),
                config: RwLock::new(config),
                registry,
                ctx,
                selector: ControlSelector::new(),
                enumerator: collaborators.enumerator,
                store: collaborators.store,
                prompter: collaborators.prompter,
                cursor: collaborators.cursor,
                focus: collaborators.focus,
                prompt_gate: PromptGate::default(),
                reset_lock: ReentrantMutex::new(()),
                reset_debounce: Debouncer::new(RESET_DEBOUNCE),
                writes: Debouncer::new(crate::control::debounce::DEBOUNCE_WINDOW),
                focused_app: Mutex::new(None),
                app_restore: Mutex::new(HashMap::new()),
                watchers: Mutex::new(Vec::new()),
            }
        });
        Self { shared }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub fn registry(&self) -> &DisplayRegistry {
        &self.shared.registry
    }

    pub fn context(&self) -> &ControlContext {
        &self.shared.ctx
    }

    pub fn config(&self) -> Config {
        self.shared.config.read().clone()
    }

    /// Replace the configuration and re-tune the modes.
    ///
    /// The transition policy is fixed for the lifetime of the controller.
    pub fn update_config(&self, config: Config) {
        let config = config.sanitized();
        let modes = self.shared.switcher.modes();
        modes.sync.configure(&config);
        modes.sensor.configure(&config);
        modes.location.configure(&config);
        modes.clock.configure(&config);
        let selection = config.adaptive_mode;
        *self.shared.config.write() = config;

        // Watchers pick up new intervals on restart
        modes.get(self.mode_key()).stop_watching();
        self.shared.switcher.select(selection);
        self.adapt_all(true);
    }

    pub fn mode_key(&self) -> ModeKey {
        self.shared.switcher.current_key()
    }

    pub fn mode_selection(&self) -> ModeSelection {
        self.shared.switcher.selection()
    }

    /// Switch the adaptive mode and apply it right away
    pub fn select_mode(&self, selection: ModeSelection) -> ModeKey {
        let key = self.shared.switcher.select(selection);
        self.shared.config.write().adaptive_mode = selection;
        self.adapt_all(true);
        key
    }

    /// Leave manual mode
    pub fn enable(&self, mode: Option<ModeKey>) -> ModeKey {
        let key = self.shared.switcher.enable(mode);
        self.shared.config.write().adaptive_mode = self.shared.switcher.selection();
        self.adapt_all(true);
        key
    }

    /// Go manual, remembering how to come back
    pub fn disable(&self) {
        self.shared.switcher.disable();
        self.shared.config.write().adaptive_mode = self.shared.switcher.selection();
    }

    pub fn toggle(&self) -> ModeKey {
        if self.mode_key() == ModeKey::Manual {
            self.enable(None)
        } else {
            self.disable();
            ModeKey::Manual
        }
    }

    fn entry(&self, serial: &str) -> Result<DisplayEntry> {
        self.shared
            .registry
            .entry(serial)
            .ok_or_else(|| AppError::DisplayNotFound(serial.to_string()))
    }

    /// Backend currently driving `entry`, switching (and reapplying) if the
    /// best channel changed
    pub fn control_for(&self, entry: &DisplayEntry) -> Control {
        self.shared
            .selector
            .get_best_control(entry, &self.shared.ctx, true)
    }

    fn persist(&self, entry: &DisplayEntry) {
        let record = DisplayRecord::from(&*entry.display.read());
        if let Err(e) = store::set_typed(&*self.shared.store, &record.key(), &record) {
            warn!(serial = %record.serial, "Failed to persist display: {}", e);
        }
    }

    /// Clamp, store and write one property.
    ///
    /// With `learn` set, a non-manual mode records the new value against its
    /// current input on the display's curve.
    fn write_value(&self, entry: &DisplayEntry, property: Property, requested: u16, learn: bool) -> bool {
        let control = self.control_for(entry);
        let mode = self.mode_key();
        let input = (learn && mode.learns())
            .then(|| self.shared.switcher.current().last_input())
            .flatten();

        let (old, value) = {
            let mut display = entry.display.write();
            let (min, max) = display.limits(property);
            let value = requested.clamp(min, max);
            let old = display.value(property);
            display.set_value(property, value);
            if learn && mode != ModeKey::Manual {
                if let Err(skip) = adaptive::learn(&mut display, mode, property, input, value) {
                    let serial = &display.serial;
                    debug!(serial = %serial, ?skip, "User adjustment not learned");
                }
            }
            (old, value)
        };

        let accepted = match property {
            Property::Brightness => control.set_brightness(value, Some(old)),
            Property::Contrast => control.set_contrast(value, Some(old)),
            Property::Volume => control.set_volume(value),
        };
        if !accepted {
            debug!(channel = %control.kind(), %property, value, "Write not accepted");
        }
        accepted
    }

    fn app_exception_for(&self, entry: &DisplayEntry) -> Option<AppException> {
        let app = self.shared.focused_app.lock().clone()?;
        let exception = self.shared.config.read().app_exception(&app).cloned()?;
        let builtin = entry.display.read().capabilities.is_builtin;
        (!builtin || exception.apply_builtin).then_some(exception)
    }

    /// Apply the active mode to one display.
    ///
    /// Paused displays are skipped unless `force` is set, the Sync reference
    /// never follows itself, and nothing is written when the target equals
    /// the current values (again unless forced).
    pub fn adapt(&self, entry: &DisplayEntry, force: bool) -> bool {
        let key = self.mode_key();
        if key == ModeKey::Manual {
            return false;
        }
        let mode = self.shared.switcher.current();
        let Some(input) = mode.last_input().or_else(|| mode.input()) else {
            return false;
        };
        let exception = self.app_exception_for(entry);

        let (brightness, contrast) = {
            let display = entry.display.read();
            if !display.active
                || (display.settings.adaptive_paused && !force)
                || (key == ModeKey::Sync && display.settings.is_source)
            {
                return false;
            }
            let Some(target) = mode.compute(&display, input) else {
                return false;
            };
            let (brightness, contrast) = match &exception {
                Some(app) => (
                    offset_value(target.brightness, app.brightness),
                    offset_value(target.contrast, app.contrast),
                ),
                None => (target.brightness, target.contrast),
            };
            let brightness = display.clamp_brightness(brightness);
            let contrast = display.clamp_contrast(contrast);
            if !force && brightness == display.brightness && contrast == display.contrast {
                return false;
            }
            let serial = &display.serial;
            debug!(
                serial = %serial,
                mode = %key,
                input,
                brightness,
                contrast,
                "Adapting display"
            );
            (brightness, contrast)
        };

        let wrote_brightness = self.write_value(entry, Property::Brightness, brightness, false);
        let wrote_contrast = self.write_value(entry, Property::Contrast, contrast, false);
        wrote_brightness || wrote_contrast
    }

    /// Adapt every active display, returning how many were written
    pub fn adapt_all(&self, force: bool) -> usize {
        self.shared
            .registry
            .active()
            .iter()
            .filter(|entry| self.adapt(entry, force))
            .count()
    }

    fn on_mode_signal(&self, key: ModeKey) {
        if key == self.mode_key() {
            self.adapt_all(false);
        }
    }

    /// Schedule a topology refresh; bursts collapse into one
    pub fn request_reset(&self) {
        let weak = self.downgrade();
        self.shared.reset_debounce.submit((), (), move |()| {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.reset_display_list();
            }
        });
    }

    /// Re-enumerate the hardware and re-bind every live display to its record
    pub fn reset_display_list(&self) {
        let _guard = self.shared.reset_lock.lock();
        let live = self.shared.enumerator.enumerate();

        let mut records = record::load_all(&*self.shared.store);
        for entry in self.shared.registry.all() {
            let display = entry.display.read();
            if !records.iter().any(|r| r.serial == display.serial) {
                records.push(DisplayRecord::from(&*display));
            }
        }

        let identities: Vec<LiveIdentity> = live.iter().map(LiveDisplay::matcher_identity).collect();
        let bindings = matcher::reconcile(&records, &identities);

        let mut bound = HashSet::new();
        for binding in &bindings {
            let Some(live) = live.iter().find(|l| l.id == binding.id) else {
                continue;
            };
            self.bind(binding, live, &records);
            bound.insert(binding.serial.clone());
        }

        for entry in self.shared.registry.all() {
            let serial = entry.serial();
            if bound.contains(&serial) {
                continue;
            }
            let was_active = std::mem::replace(&mut entry.display.write().active, false);
            if was_active {
                info!(serial = %serial, "Display disconnected");
                self.shared.ctx.transitions.stop_display(&serial);
                self.shared.selector.forget(&serial);
                self.shared.registry.set_channels(&serial, DisplayChannels::default());
            }
        }

        for entry in self.shared.registry.active() {
            self.persist(&entry);
            self.control_for(&entry);
        }
        self.shared.switcher.refresh();
        info!(
            active = self.shared.registry.active_count(),
            known = self.shared.registry.count(),
            "Display list refreshed"
        );
    }

    fn bind(&self, binding: &Binding, live: &LiveDisplay, records: &[DisplayRecord]) {
        let registry = &self.shared.registry;
        let faults = &self.shared.ctx.faults;

        if let Some(entry) = registry.entry(&binding.serial) {
            let previous_id = {
                let mut display = entry.display.write();
                let previous = (!display.active || display.id != live.id).then_some(display.id);
                if previous.is_some() {
                    display.mark_connected(live.id);
                }
                refresh_from_live(&mut display, live);
                previous
            };
            registry.set_channels(&binding.serial, live.channels.clone());
            if let Some(previous) = previous_id {
                info!(serial = %binding.serial, display_id = live.id, "Display reconnected");
                faults.reset_display(previous);
                faults.reset_display(live.id);
                self.shared.ctx.maxima.forget_display(previous);
            }
            return;
        }

        let mut display = match records.iter().find(|r| r.serial == binding.serial) {
            Some(record) => record.clone().into_display(live.id),
            None => {
                info!(
                    serial = %binding.serial,
                    display_id = live.id,
                    name = %live.identity.name,
                    "New display"
                );
                Display::new(live.id, binding.serial.clone(), live.identity.clone())
            }
        };
        display.mark_connected(live.id);
        refresh_from_live(&mut display, live);
        faults.reset_display(live.id);
        debug!(serial = %binding.serial, kind = ?binding.kind, "Display bound");
        registry.insert(display, live.channels.clone());
    }

    /// Stop every watcher and transition, restore gamma ramps and persist
    pub fn cleanup(&self) {
        info!("Shutting down display controller");
        self.stop_watchers();
        self.shared.switcher.stop();
        self.shared.writes.cancel_all();
        self.shared.reset_debounce.cancel_all();
        self.shared.ctx.transitions.stop_all();

        for entry in self.shared.registry.active() {
            if let Control::Gamma(gamma) = self.control_for(&entry) {
                gamma.restore();
            }
            self.persist(&entry);
        }
    }
}

fn refresh_from_live(display: &mut Display, live: &LiveDisplay) {
    display.capabilities = live.capabilities;
    display.identity = live.identity.clone();
    display.relay_bus = live.relay_bus.clone();
    if display.edid_uuid_patterns.is_empty() {
        display.edid_uuid_patterns = live.uuid_patterns.clone();
    }
}

fn offset_value(value: u16, offset: i32) -> u16 {
    (value as i32 + offset).clamp(0, 100) as u16
}
