// SPDX-License-Identifier: GPL-3.0-only
//! Control channels
//!
//! Every display can be driven through up to four channels. Each one is a
//! [`ControlBackend`]; [`Control`] is the tagged union the selector hands out.
//! Backends never return errors: a failed read is `None`, a failed write is
//! `false`, and both are counted by the [`fault::FaultTracker`].

pub mod debounce;
pub mod fault;
pub mod feature;
pub mod gamma;
pub mod selector;
pub mod transition;
#[cfg(feature = "wlr-gamma")]
pub mod wlr_gamma;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::display::{DisplayRef, Property, SharedDisplay};
use crate::protocols::SharedProtocol;

pub use fault::FaultTracker;
pub use feature::{FeatureControl, FeatureMaxima};
pub use gamma::{DetachedGammaSink, GammaControl, GammaSink, GammaTable, MemoryGammaSink};
pub use selector::ControlSelector;
pub use transition::{TransitionEngine, TransitionKey, TransitionPolicy, TransitionRequest};

/// The four ways a display can be controlled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Vendor brightness service (USB HID on Apple/LG, backlight on built-ins)
    Native,
    /// DDC/CI over the display cable
    Hardware,
    /// DDC/CI performed by a companion device on the LAN
    Relay,
    /// Software gamma ramp, always available as a last resort
    Gamma,
}

impl ChannelKind {
    /// Selection order, best first
    pub const PREFERENCE: [ChannelKind; 4] = [
        ChannelKind::Native,
        ChannelKind::Hardware,
        ChannelKind::Relay,
        ChannelKind::Gamma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Native => "native",
            ChannelKind::Hardware => "hardware",
            ChannelKind::Relay => "relay",
            ChannelKind::Gamma => "gamma",
        }
    }

    /// Channels that can stop answering and warrant a fallback prompt
    pub fn is_remote_protocol(&self) -> bool {
        matches!(self, ChannelKind::Hardware | ChannelKind::Relay)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Color gain channels (VCP 0x16/0x18/0x1A)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorGain {
    Red,
    Green,
    Blue,
}

/// Uniform capability interface implemented by every channel
pub trait ControlBackend: fmt::Debug + Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Display active, channel enabled by the user and capability present
    fn is_available(&self) -> bool;

    /// Fault counters are still under the threshold
    fn is_responsive(&self) -> bool;

    fn get_brightness(&self) -> Option<u16>;
    fn get_contrast(&self) -> Option<u16>;
    fn get_volume(&self) -> Option<u16>;
    fn get_input(&self) -> Option<u16>;
    fn get_mute(&self) -> Option<bool>;

    /// Write brightness; routes through a transition when `old` differs
    fn set_brightness(&self, value: u16, old: Option<u16>) -> bool;
    fn set_contrast(&self, value: u16, old: Option<u16>) -> bool;
    fn set_volume(&self, value: u16) -> bool;
    fn set_mute(&self, muted: bool) -> bool;
    fn set_input(&self, input: u16) -> bool;
    fn set_power(&self, on: bool) -> bool;

    /// Factory reset where the channel supports it
    fn reset(&self) -> bool;

    fn supports_smooth_transition(&self, property: Property) -> bool;
}

/// Hardware handles bound to one display
#[derive(Clone, Default)]
pub struct DisplayChannels {
    pub native: Option<SharedProtocol>,
    pub hardware: Option<SharedProtocol>,
    pub relay: Option<SharedProtocol>,
}

impl DisplayChannels {
    pub fn protocol(&self, kind: ChannelKind) -> Option<&SharedProtocol> {
        match kind {
            ChannelKind::Native => self.native.as_ref(),
            ChannelKind::Hardware => self.hardware.as_ref(),
            ChannelKind::Relay => self.relay.as_ref(),
            ChannelKind::Gamma => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.native.is_none() && self.hardware.is_none() && self.relay.is_none()
    }
}

impl fmt::Debug for DisplayChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayChannels")
            .field("native", &self.native.is_some())
            .field("hardware", &self.hardware.is_some())
            .field("relay", &self.relay.is_some())
            .finish()
    }
}

/// Shared services every backend needs
#[derive(Clone)]
pub struct ControlContext {
    pub faults: FaultTracker,
    pub maxima: FeatureMaxima,
    pub transitions: TransitionEngine,
    pub gamma_sink: Arc<dyn GammaSink>,
    pub policy: TransitionPolicy,
}

impl ControlContext {
    pub fn new(gamma_sink: Arc<dyn GammaSink>, policy: TransitionPolicy) -> Self {
        Self {
            faults: FaultTracker::new(),
            maxima: FeatureMaxima::default(),
            transitions: TransitionEngine::new(),
            gamma_sink,
            policy,
        }
    }
}

impl fmt::Debug for ControlContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlContext")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Write a brightness/contrast value, stepping through a transition when
/// `old` is known, differs from `value` and the channel allows smoothing.
///
/// `write` performs one hardware write. Accepted writes update the display's
/// last-written value; a direct write first stops any transition in flight
/// for the same property.
pub(crate) fn write_property<W>(
    ctx: &ControlContext,
    display: &DisplayRef,
    property: Property,
    value: u16,
    old: Option<u16>,
    smooth: bool,
    mut write: W,
) -> bool
where
    W: FnMut(u16) -> bool + Send + 'static,
{
    let Some(shared) = display.upgrade() else {
        return false;
    };
    let serial = shared.read().serial.clone();
    let key = TransitionKey::new(serial, property);

    let wants_transition = smooth
        && ctx.policy != TransitionPolicy::Instant
        && old.is_some_and(|old| old != value);

    if let (true, Some(old)) = (wants_transition, old) {
        let display = display.clone();
        ctx.transitions.smooth_transition(
            key,
            TransitionRequest::new(old, value, ctx.policy),
            write,
            move |written| {
                if let Some(display) = display.upgrade() {
                    display.write().set_last_written(property, written);
                }
            },
        );
        return true;
    }

    ctx.transitions.stop(&key);
    let accepted = write(value);
    if accepted {
        shared.write().set_last_written(property, value);
    }
    accepted
}

/// Backend selected for a display
#[derive(Debug, Clone)]
pub enum Control {
    Native(FeatureControl),
    Hardware(FeatureControl),
    Relay(FeatureControl),
    Gamma(GammaControl),
}

impl Control {
    /// Build the backend for `kind`, or the gamma backend when the display
    /// has no handle for that channel
    pub fn build(
        kind: ChannelKind,
        display: &SharedDisplay,
        channels: &DisplayChannels,
        ctx: &ControlContext,
    ) -> Self {
        let weak = Arc::downgrade(display);
        let feature = |protocol: &SharedProtocol| {
            FeatureControl::new(kind, weak.clone(), protocol.clone(), ctx.clone())
        };
        match (kind, channels.protocol(kind)) {
            (ChannelKind::Native, Some(p)) => Control::Native(feature(p)),
            (ChannelKind::Hardware, Some(p)) => Control::Hardware(feature(p)),
            (ChannelKind::Relay, Some(p)) => Control::Relay(feature(p)),
            _ => Control::Gamma(GammaControl::new(weak.clone(), ctx.clone())),
        }
    }

    fn backend(&self) -> &dyn ControlBackend {
        match self {
            Control::Native(c) | Control::Hardware(c) | Control::Relay(c) => c as &dyn ControlBackend,
            Control::Gamma(c) => c as &dyn ControlBackend,
        }
    }

    /// The DDC-style backend, for features only those channels have
    pub fn as_feature(&self) -> Option<&FeatureControl> {
        match self {
            Control::Native(c) | Control::Hardware(c) | Control::Relay(c) => Some(c),
            Control::Gamma(_) => None,
        }
    }
}

impl ControlBackend for Control {
    fn kind(&self) -> ChannelKind {
        match self {
            Control::Native(_) => ChannelKind::Native,
            Control::Hardware(_) => ChannelKind::Hardware,
            Control::Relay(_) => ChannelKind::Relay,
            Control::Gamma(_) => ChannelKind::Gamma,
        }
    }

    fn is_available(&self) -> bool {
        self.backend().is_available()
    }

    fn is_responsive(&self) -> bool {
        self.backend().is_responsive()
    }

    fn get_brightness(&self) -> Option<u16> {
        self.backend().get_brightness()
    }

    fn get_contrast(&self) -> Option<u16> {
        self.backend().get_contrast()
    }

    fn get_volume(&self) -> Option<u16> {
        self.backend().get_volume()
    }

    fn get_input(&self) -> Option<u16> {
        self.backend().get_input()
    }

    fn get_mute(&self) -> Option<bool> {
        self.backend().get_mute()
    }

    fn set_brightness(&self, value: u16, old: Option<u16>) -> bool {
        self.backend().set_brightness(value, old)
    }

    fn set_contrast(&self, value: u16, old: Option<u16>) -> bool {
        self.backend().set_contrast(value, old)
    }

    fn set_volume(&self, value: u16) -> bool {
        self.backend().set_volume(value)
    }

    fn set_mute(&self, muted: bool) -> bool {
        self.backend().set_mute(muted)
    }

    fn set_input(&self, input: u16) -> bool {
        self.backend().set_input(input)
    }

    fn set_power(&self, on: bool) -> bool {
        self.backend().set_power(on)
    }

    fn reset(&self) -> bool {
        self.backend().reset()
    }

    fn supports_smooth_transition(&self, property: Property) -> bool {
        self.backend().supports_smooth_transition(property)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable protocol shared by the control, selector and controller tests

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use anyhow::{Result, bail};
    use parking_lot::Mutex;

    use crate::protocols::{DisplayProtocol, FeatureValue, SharedProtocol};

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub values: Mutex<HashMap<u8, u16>>,
        pub writes: Mutex<Vec<(u8, u16)>>,
        pub fail_reads: AtomicBool,
        pub fail_writes: AtomicBool,
        pub read_calls: AtomicU32,
        /// Maxima other than 100 reported per code
        pub maxima: Mutex<HashMap<u8, u16>>,
    }

    #[derive(Debug)]
    pub struct FakeProtocol {
        pub name: String,
        pub state: Arc<FakeState>,
    }

    impl FakeProtocol {
        pub fn shared(name: &str) -> (SharedProtocol, Arc<FakeState>) {
            let state = Arc::new(FakeState::default());
            let protocol = FakeProtocol {
                name: name.to_string(),
                state: state.clone(),
            };
            (crate::protocols::shared(protocol), state)
        }
    }

    impl DisplayProtocol for FakeProtocol {
        fn id(&self) -> String {
            format!("fake-{}", self.name)
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        fn read_feature(&mut self, code: u8) -> Result<FeatureValue> {
            self.state.read_calls.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_reads.load(Ordering::SeqCst) {
                bail!("read timeout");
            }
            let current = self.state.values.lock().get(&code).copied().unwrap_or(0);
            let maximum = self.state.maxima.lock().get(&code).copied().unwrap_or(100);
            Ok(FeatureValue { current, maximum })
        }

        fn write_feature(&mut self, code: u8, value: u16) -> Result<()> {
            if self.state.fail_writes.load(Ordering::SeqCst) {
                bail!("write nack");
            }
            self.state.values.lock().insert(code, value);
            self.state.writes.lock().push((code, value));
            Ok(())
        }
    }
}
