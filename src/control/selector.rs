// SPDX-License-Identifier: GPL-3.0-only
//! Best-channel selection per display

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ChannelKind, Control, ControlBackend, ControlContext, DisplayChannels, GammaControl};
use crate::display::{Display, DisplayEntry};

/// Whether `kind` can drive `display` with the handles it currently has
pub fn is_channel_available(display: &Display, channels: &DisplayChannels, kind: ChannelKind) -> bool {
    if !display.active || !display.enabled_controls.is_enabled(kind) {
        return false;
    }
    let caps = &display.capabilities;
    match kind {
        ChannelKind::Native => {
            (caps.native_brightness || caps.is_builtin) && channels.native.is_some()
        }
        ChannelKind::Hardware => caps.has_hardware_protocol && channels.hardware.is_some(),
        ChannelKind::Relay => caps.has_relay && channels.relay.is_some(),
        ChannelKind::Gamma => caps.supports_gamma,
    }
}

/// First available channel in preference order; gamma is the last resort even
/// when nothing reports available
pub fn best_channel(display: &Display, channels: &DisplayChannels) -> ChannelKind {
    ChannelKind::PREFERENCE
        .into_iter()
        .find(|kind| is_channel_available(display, channels, *kind))
        .unwrap_or(ChannelKind::Gamma)
}

/// Remembers which channel currently drives each display
#[derive(Default)]
pub struct ControlSelector {
    current: Mutex<HashMap<String, ChannelKind>>,
}

impl ControlSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the backend for a display.
    ///
    /// When the pick differs from the previous one and `reapply` is set, the
    /// display's current brightness and contrast are written through the new
    /// backend right away. Leaving the gamma channel restores the original
    /// ramps first.
    pub fn get_best_control(
        &self,
        entry: &DisplayEntry,
        ctx: &ControlContext,
        reapply: bool,
    ) -> Control {
        let (serial, kind) = {
            let display = entry.display.read();
            (display.serial.clone(), best_channel(&display, &entry.channels))
        };
        let control = Control::build(kind, &entry.display, &entry.channels, ctx);

        let previous = self.current.lock().insert(serial.clone(), kind);
        if let Some(previous) = previous.filter(|p| *p != kind) {
            info!(serial = %serial, from = %previous, to = %kind, "Switching control channel");

            if previous == ChannelKind::Gamma {
                GammaControl::new(Arc::downgrade(&entry.display), ctx.clone()).restore();
            }
            if reapply {
                let (brightness, contrast) = {
                    let display = entry.display.read();
                    (
                        display.clamp_brightness(display.brightness),
                        display.clamp_contrast(display.contrast),
                    )
                };
                control.set_brightness(brightness, None);
                control.set_contrast(contrast, None);
            }
        }
        control
    }

    pub fn current(&self, serial: &str) -> Option<ChannelKind> {
        self.current.lock().get(serial).copied()
    }

    pub fn forget(&self, serial: &str) {
        self.current.lock().remove(serial);
    }
}

impl std::fmt::Debug for ControlSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.current.lock().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::testing::FakeProtocol;
    use crate::control::{MemoryGammaSink, TransitionPolicy};
    use crate::display::{DisplayIdentity, DisplayRegistry};
    use crate::protocols::vcp;

    fn context() -> ControlContext {
        ControlContext::new(Arc::new(MemoryGammaSink::default()), TransitionPolicy::Instant)
    }

    #[test]
    fn test_preference_order() {
        let mut display = Display::new(1, "A", DisplayIdentity::default());
        let (ddc, _) = FakeProtocol::shared("ddc");
        let (hid, _) = FakeProtocol::shared("hid");
        let channels = DisplayChannels {
            native: Some(hid),
            hardware: Some(ddc),
            relay: None,
        };

        assert_eq!(best_channel(&display, &channels), ChannelKind::Gamma);

        display.capabilities.has_hardware_protocol = true;
        assert_eq!(best_channel(&display, &channels), ChannelKind::Hardware);

        display.capabilities.native_brightness = true;
        assert_eq!(best_channel(&display, &channels), ChannelKind::Native);

        display.enabled_controls.set(ChannelKind::Native, false);
        assert_eq!(best_channel(&display, &channels), ChannelKind::Hardware);

        display.active = false;
        assert_eq!(best_channel(&display, &channels), ChannelKind::Gamma);
    }

    #[test]
    fn test_capability_without_handle_is_unavailable() {
        let mut display = Display::new(1, "A", DisplayIdentity::default());
        display.capabilities.has_relay = true;
        assert!(!is_channel_available(&display, &DisplayChannels::default(), ChannelKind::Relay));
    }

    #[test]
    fn test_selection_is_stable_without_state_change() {
        let registry = DisplayRegistry::new();
        let mut display = Display::new(1, "A", DisplayIdentity::default());
        display.capabilities.has_hardware_protocol = true;
        let (ddc, state) = FakeProtocol::shared("ddc");
        let entry = registry.insert(
            display,
            DisplayChannels {
                hardware: Some(ddc),
                ..Default::default()
            },
        );
        let selector = ControlSelector::new();
        let ctx = context();

        let first = selector.get_best_control(&entry, &ctx, true);
        let second = selector.get_best_control(&entry, &ctx, true);
        assert_eq!(first.kind(), ChannelKind::Hardware);
        assert_eq!(second.kind(), first.kind());
        // First pick and an unchanged pick never reapply
        assert!(state.writes.lock().is_empty());
    }

    #[test]
    fn test_switch_reapplies_current_values() {
        let registry = DisplayRegistry::new();
        let mut display = Display::new(1, "A", DisplayIdentity::default());
        display.brightness = 35;
        display.contrast = 60;
        let (ddc, state) = FakeProtocol::shared("ddc");
        let entry = registry.insert(
            display,
            DisplayChannels {
                hardware: Some(ddc),
                ..Default::default()
            },
        );
        let selector = ControlSelector::new();
        let ctx = context();

        assert_eq!(selector.get_best_control(&entry, &ctx, true).kind(), ChannelKind::Gamma);

        entry.display.write().capabilities.has_hardware_protocol = true;
        let control = selector.get_best_control(&entry, &ctx, true);
        assert_eq!(control.kind(), ChannelKind::Hardware);
        assert_eq!(selector.current("A"), Some(ChannelKind::Hardware));
        assert_eq!(
            *state.writes.lock(),
            vec![(vcp::BRIGHTNESS, 35), (vcp::CONTRAST, 60)]
        );
    }
}
