// SPDX-License-Identifier: GPL-3.0-only
//! Daemon configuration
//!
//! Global knobs live in `config.toml` under the XDG config directory.
//! Per-display state is not configuration: it is persisted as display records
//! through the key-value store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adaptive::clock::ClockTransition;
use crate::adaptive::{ModeKey, ModeSelection};
use crate::control::TransitionPolicy;
use crate::error::{AppError, Result};

pub const APP_DIR: &str = "adaptive-monitor-control";
pub const CONFIG_FILE: &str = "config.toml";
pub const CONFIG_VERSION: u64 = 2;

pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const MAX_POLL_INTERVAL_SECS: u64 = 300;

/// Latitude/longitude in degrees
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl Geolocation {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Exponent applied to each mode's default mapping
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct CurveFactors {
    pub sync: f64,
    pub sensor: f64,
    pub location: f64,
}

impl Default for CurveFactors {
    fn default() -> Self {
        Self {
            sync: 1.0,
            sensor: 0.5,
            location: 1.0,
        }
    }
}

impl CurveFactors {
    pub fn get(&self, mode: ModeKey) -> f64 {
        let factor = match mode {
            ModeKey::Sync => self.sync,
            ModeKey::Sensor => self.sensor,
            ModeKey::Location => self.location,
            ModeKey::Manual | ModeKey::Clock => 1.0,
        };
        if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            1.0
        }
    }
}

/// Brightness/contrast override while an application has focus.
///
/// Absolute values in manual mode, offsets in the adaptive modes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AppException {
    /// Application id as reported by the focus locator
    pub app: String,
    #[serde(default)]
    pub brightness: i32,
    #[serde(default)]
    pub contrast: i32,
    /// Also adjust the built-in panel
    #[serde(default)]
    pub apply_builtin: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    pub version: u64,
    pub adaptive_mode: ModeSelection,
    pub brightness_transition: TransitionPolicy,
    pub sync_poll_interval_secs: u64,
    pub sensor_poll_interval_secs: u64,
    /// HTTP endpoint of an external ambient light sensor
    pub external_sensor_url: Option<String>,
    pub geolocation: Option<Geolocation>,
    /// Minutes the daylight window extends past sunrise/sunset
    pub daylight_extension_minutes: u32,
    /// Minutes around solar noon held at full brightness
    pub noon_duration_minutes: u32,
    pub clock_transition: ClockTransition,
    pub curve_factors: CurveFactors,
    /// Base URLs of LAN DDC relays
    pub relay_endpoints: Vec<String>,
    pub hotkeys_affect_builtin: bool,
    pub never_prompt_fallback: bool,
    pub app_exceptions: Vec<AppException>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            adaptive_mode: ModeSelection::Auto,
            brightness_transition: TransitionPolicy::Smooth,
            sync_poll_interval_secs: 1,
            sensor_poll_interval_secs: 2,
            external_sensor_url: None,
            geolocation: None,
            daylight_extension_minutes: 30,
            noon_duration_minutes: 120,
            clock_transition: ClockTransition::default(),
            curve_factors: CurveFactors::default(),
            relay_endpoints: Vec::new(),
            hotkeys_affect_builtin: false,
            never_prompt_fallback: false,
            app_exceptions: Vec::new(),
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config("No XDG config directory".to_string()))?;
        Ok(dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load the config, falling back to defaults when the file is missing or
    /// malformed
    pub fn load(path: &Path) -> Self {
        match Self::read(path) {
            Ok(Some(config)) => config.sanitized(),
            Ok(None) => {
                info!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(e) => {
                error!(path = %path.display(), "Can't load config: {}", e);
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(toml::from_str(&text)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Clamp poll intervals and drop an out-of-range geolocation
    pub fn sanitized(mut self) -> Self {
        self.sync_poll_interval_secs = self
            .sync_poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        self.sensor_poll_interval_secs = self
            .sensor_poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        if self.geolocation.is_some_and(|g| !g.is_valid()) {
            warn!("Ignoring out of range geolocation {:?}", self.geolocation);
            self.geolocation = None;
        }
        self
    }

    pub fn app_exception(&self, app: &str) -> Option<&AppException> {
        self.app_exceptions.iter().find(|e| e.app == app)
    }
}
