// SPDX-License-Identifier: GPL-3.0-only
//! Sync mode
//!
//! Mirrors a reference brightness onto every other display. The reference is
//! either the display flagged as source (read through its best channel) or,
//! with the `brightness-sync-daemon` feature, the built-in panel brightness
//! published by the COSMIC settings daemon.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::{
    AdaptiveMode, LastInput, ModeKey, ModeWatch, SignalCallback, Target, curve_target,
};
use crate::config::Config;
use crate::control::selector::best_channel;
use crate::control::{Control, ControlBackend, ControlContext};
use crate::display::DisplayRegistry;
use crate::display::Display;

/// Provides the reference brightness as a 0-100 percentage
pub trait BrightnessSource: fmt::Debug + Send + Sync {
    fn name(&self) -> String;

    fn read_percent(&self) -> Option<f64>;
}

/// The registry's source display
#[derive(Clone)]
pub struct RegistrySource {
    registry: DisplayRegistry,
    ctx: ControlContext,
}

impl RegistrySource {
    pub fn new(registry: DisplayRegistry, ctx: ControlContext) -> Self {
        Self { registry, ctx }
    }
}

impl fmt::Debug for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RegistrySource")
    }
}

impl BrightnessSource for RegistrySource {
    fn name(&self) -> String {
        "source display".to_string()
    }

    fn read_percent(&self) -> Option<f64> {
        let entry = self.registry.source()?;
        let (kind, min, max) = {
            let display = entry.display.read();
            (
                best_channel(&display, &entry.channels),
                display.min_brightness,
                display.max_brightness,
            )
        };
        let control = Control::build(kind, &entry.display, &entry.channels, &self.ctx);
        let value = control.get_brightness()?;
        let span = (max - min).max(1) as f64;
        Some(((value.saturating_sub(min)) as f64 / span * 100.0).clamp(0.0, 100.0))
    }
}

#[cfg(feature = "brightness-sync-daemon")]
pub use daemon::CosmicDaemonSource;

#[cfg(feature = "brightness-sync-daemon")]
mod daemon {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use zbus::{Connection, proxy};

    use super::BrightnessSource;

    /// COSMIC Settings Daemon D-Bus proxy
    #[proxy(
        interface = "com.system76.CosmicSettingsDaemon",
        default_service = "com.system76.CosmicSettingsDaemon",
        default_path = "/com/system76/CosmicSettingsDaemon"
    )]
    trait CosmicSettingsDaemon {
        /// DisplayBrightness property
        #[zbus(property)]
        fn display_brightness(&self) -> zbus::Result<i32>;

        /// MaxDisplayBrightness property
        #[zbus(property)]
        fn max_display_brightness(&self) -> zbus::Result<i32>;
    }

    fn to_percent(brightness: i32, max: i32) -> Option<f64> {
        (max > 0).then(|| (brightness as f64 / max as f64 * 100.0).clamp(0.0, 100.0))
    }

    /// Built-in panel brightness as published by the settings daemon
    #[derive(Debug, Default)]
    pub struct CosmicDaemonSource {
        latest: Arc<Mutex<Option<f64>>>,
    }

    impl CosmicDaemonSource {
        /// Start following the daemon on the current tokio runtime
        pub fn spawn() -> Option<Arc<Self>> {
            let runtime = tokio::runtime::Handle::try_current().ok()?;
            let source = Arc::new(Self::default());
            let latest = source.latest.clone();
            runtime.spawn(async move {
                if let Err(e) = follow(latest.clone()).await {
                    warn!("Settings daemon brightness unavailable: {:#}", e);
                }
                *latest.lock() = None;
            });
            Some(source)
        }
    }

    async fn follow(latest: Arc<Mutex<Option<f64>>>) -> Result<()> {
        let connection = Connection::session()
            .await
            .context("Failed to connect to D-Bus session bus")?;
        let proxy = CosmicSettingsDaemonProxy::new(&connection)
            .await
            .context("Failed to create COSMIC Settings Daemon proxy")?;

        let max = proxy
            .max_display_brightness()
            .await
            .context("Failed to get max display brightness")?;
        let current = proxy.display_brightness().await.ok();
        *latest.lock() = current.and_then(|b| to_percent(b, max));
        info!(max, "Following COSMIC display brightness");

        let mut changes = proxy.receive_display_brightness_changed().await;
        while let Some(change) = changes.next().await {
            if let Ok(brightness) = change.get().await {
                debug!(brightness, "COSMIC brightness changed");
                *latest.lock() = to_percent(brightness, max);
            }
        }
        warn!("Brightness change stream ended");
        Ok(())
    }

    impl BrightnessSource for CosmicDaemonSource {
        fn name(&self) -> String {
            "cosmic-settings-daemon".to_string()
        }

        fn read_percent(&self) -> Option<f64> {
            *self.latest.lock()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_to_percent() {
            assert_eq!(to_percent(0, 0), None);
            assert_eq!(to_percent(50, 200), Some(25.0));
            assert_eq!(to_percent(300, 200), Some(100.0));
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncSettings {
    interval: Duration,
    factor: f64,
}

pub struct SyncMode {
    sources: Vec<Arc<dyn BrightnessSource>>,
    settings: RwLock<SyncSettings>,
    watch: ModeWatch,
    last: Arc<LastInput>,
}

impl SyncMode {
    /// `sources` are tried in order, first reading wins
    pub fn new(sources: Vec<Arc<dyn BrightnessSource>>, config: &Config) -> Self {
        Self {
            sources,
            settings: RwLock::new(Self::settings(config)),
            watch: ModeWatch::default(),
            last: Arc::new(LastInput::default()),
        }
    }

    fn settings(config: &Config) -> SyncSettings {
        SyncSettings {
            interval: Duration::from_secs(config.sync_poll_interval_secs),
            factor: config.curve_factors.get(ModeKey::Sync),
        }
    }

    /// Takes effect on the next `watch`
    pub fn configure(&self, config: &Config) {
        *self.settings.write() = Self::settings(config);
    }

    fn read(sources: &[Arc<dyn BrightnessSource>]) -> Option<f64> {
        sources.iter().find_map(|s| s.read_percent())
    }
}

impl AdaptiveMode for SyncMode {
    fn key(&self) -> ModeKey {
        ModeKey::Sync
    }

    fn available(&self) -> bool {
        Self::read(&self.sources).is_some()
    }

    fn is_watching(&self) -> bool {
        self.watch.is_watching()
    }

    fn watch(&self, on_signal: SignalCallback) -> bool {
        let sources = self.sources.clone();
        let last = self.last.clone();
        let interval = self.settings.read().interval;
        self.watch.start("sync-mode", interval, move || {
            if last.update(Self::read(&sources)) {
                on_signal(ModeKey::Sync);
            }
        })
    }

    fn stop_watching(&self) -> bool {
        self.watch.stop()
    }

    fn input(&self) -> Option<f64> {
        let percent = Self::read(&self.sources);
        self.last.update(percent);
        percent
    }

    fn last_input(&self) -> Option<f64> {
        self.last.get()
    }

    fn compute(&self, display: &Display, input: f64) -> Option<Target> {
        let factor = self.settings.read().factor;
        Some(curve_target(
            display,
            ModeKey::Sync,
            input,
            (0.0, 100.0),
            |x| x / 100.0,
            factor,
        ))
    }
}
