// SPDX-License-Identifier: GPL-3.0-only
//! Location mode
//!
//! Follows the sun: the signal rises from 0 before sunrise to 1 ahead of
//! solar noon, holds through a noon plateau and falls back to 0 after sunset.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use parking_lot::RwLock;

use super::solar::{self, SunTimes};
use super::{
    AdaptiveMode, LastInput, ModeKey, ModeWatch, SignalCallback, Target, curve_target,
};
use crate::config::{Config, Geolocation};
use crate::display::Display;

const LOCATION_TICK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct LocationSettings {
    geolocation: Option<Geolocation>,
    daylight_extension: TimeDelta,
    noon_duration: TimeDelta,
    factor: f64,
}

impl LocationSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            geolocation: config.geolocation.filter(Geolocation::is_valid),
            daylight_extension: TimeDelta::minutes(config.daylight_extension_minutes as i64),
            noon_duration: TimeDelta::minutes(config.noon_duration_minutes as i64),
            factor: config.curve_factors.get(ModeKey::Location),
        }
    }
}

/// Ease in/out between 0 and 1
fn ease(t: f64) -> f64 {
    0.5 - 0.5 * (PI * t.clamp(0.0, 1.0)).cos()
}

fn progress(now: DateTime<Utc>, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let span = (to - from).num_seconds();
    if span <= 0 {
        return 1.0;
    }
    (now - from).num_seconds() as f64 / span as f64
}

/// Day signal in `[0, 1]` at `now` for the given sun times
fn day_signal(
    now: DateTime<Utc>,
    sun: &SunTimes,
    extension: TimeDelta,
    noon_duration: TimeDelta,
) -> f64 {
    let dawn = sun.sunrise - extension;
    let dusk = sun.sunset + extension;
    let half_plateau = noon_duration / 2;
    let plateau_start = (sun.noon - half_plateau).max(dawn);
    let plateau_end = (sun.noon + half_plateau).min(dusk);

    if now <= dawn || now >= dusk {
        0.0
    } else if now < plateau_start {
        ease(progress(now, dawn, plateau_start))
    } else if now <= plateau_end {
        1.0
    } else {
        1.0 - ease(progress(now, plateau_end, dusk))
    }
}

pub struct LocationMode {
    settings: Arc<RwLock<LocationSettings>>,
    watch: ModeWatch,
    last: Arc<LastInput>,
}

impl LocationMode {
    pub fn new(config: &Config) -> Self {
        Self {
            settings: Arc::new(RwLock::new(LocationSettings::from_config(config))),
            watch: ModeWatch::default(),
            last: Arc::new(LastInput::default()),
        }
    }

    pub fn configure(&self, config: &Config) {
        *self.settings.write() = LocationSettings::from_config(config);
    }

    pub fn sun_times(&self, now: DateTime<Utc>) -> Option<SunTimes> {
        let location = self.settings.read().geolocation?;
        solar::sun_times_around(now, location)
    }

    /// Day signal at `now`; `None` without a location or during polar day/night
    pub fn signal_at(&self, now: DateTime<Utc>) -> Option<f64> {
        signal(&self.settings, now)
    }
}

fn signal(settings: &RwLock<LocationSettings>, now: DateTime<Utc>) -> Option<f64> {
    let settings = *settings.read();
    let sun = solar::sun_times_around(now, settings.geolocation?)?;
    Some(day_signal(
        now,
        &sun,
        settings.daylight_extension,
        settings.noon_duration,
    ))
}

impl AdaptiveMode for LocationMode {
    fn key(&self) -> ModeKey {
        ModeKey::Location
    }

    fn available(&self) -> bool {
        self.settings.read().geolocation.is_some()
    }

    fn is_watching(&self) -> bool {
        self.watch.is_watching()
    }

    fn watch(&self, on_signal: SignalCallback) -> bool {
        let last = self.last.clone();
        let settings = self.settings.clone();
        self.watch.start("location-mode", LOCATION_TICK, move || {
            if last.update(signal(&settings, Utc::now())) {
                on_signal(ModeKey::Location);
            }
        })
    }

    fn stop_watching(&self) -> bool {
        self.watch.stop()
    }

    fn input(&self) -> Option<f64> {
        let signal = self.signal_at(Utc::now());
        self.last.update(signal);
        signal
    }

    fn last_input(&self) -> Option<f64> {
        self.last.get()
    }

    fn compute(&self, display: &Display, input: f64) -> Option<Target> {
        let factor = self.settings.read().factor;
        Some(curve_target(
            display,
            ModeKey::Location,
            input,
            (0.0, 1.0),
            |x| x,
            factor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::DisplayIdentity;
    use chrono::TimeZone;

    fn mode() -> LocationMode {
        let config = Config {
            geolocation: Some(Geolocation {
                latitude: 44.43,
                longitude: 26.10,
            }),
            daylight_extension_minutes: 30,
            noon_duration_minutes: 120,
            ..Default::default()
        };
        LocationMode::new(&config)
    }

    #[test]
    fn test_signal_over_the_day() {
        let mode = mode();
        let night = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2024, 6, 21, 5, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 6, 21, 10, 17, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 6, 21, 16, 0, 0).unwrap();

        assert_eq!(mode.signal_at(night), Some(0.0));
        assert_eq!(mode.signal_at(noon), Some(1.0));
        let morning = mode.signal_at(morning).unwrap();
        let evening = mode.signal_at(evening).unwrap();
        assert!(morning > 0.0 && morning < 1.0, "{morning}");
        assert!(evening > 0.0 && evening < 1.0, "{evening}");
    }

    fn mode_at(latitude: f64, longitude: f64) -> LocationMode {
        LocationMode::new(&Config {
            geolocation: Some(Geolocation {
                latitude,
                longitude,
            }),
            daylight_extension_minutes: 30,
            noon_duration_minutes: 120,
            ..Default::default()
        })
    }

    #[test]
    fn test_western_evening_is_still_daylight() {
        // San Francisco: sunset around 20:35 PDT (03:35 UTC the next day)
        let mode = mode_at(37.77, -122.42);
        let afternoon = Utc.with_ymd_and_hms(2024, 6, 21, 23, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 6, 22, 1, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 6, 22, 5, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 6, 22, 20, 10, 0).unwrap();

        let afternoon = mode.signal_at(afternoon).unwrap();
        let evening = mode.signal_at(evening).unwrap();
        assert!(afternoon > 0.0, "{afternoon}");
        assert!(evening > 0.0 && evening < afternoon, "{evening}");
        assert_eq!(mode.signal_at(night), Some(0.0));
        assert_eq!(mode.signal_at(noon), Some(1.0));

        let sun = mode.sun_times(Utc.with_ymd_and_hms(2024, 6, 22, 1, 0, 0).unwrap()).unwrap();
        assert!(sun.sunset > Utc.with_ymd_and_hms(2024, 6, 22, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_eastern_morning_is_daylight() {
        // Tokyo: 07:00 JST on June 22 is 22:00 UTC on June 21
        let mode = mode_at(35.68, 139.69);
        let morning = Utc.with_ymd_and_hms(2024, 6, 21, 22, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 6, 21, 15, 0, 0).unwrap();
        let morning = mode.signal_at(morning).unwrap();
        assert!(morning > 0.0 && morning < 1.0, "{morning}");
        assert_eq!(mode.signal_at(midnight), Some(0.0));
    }

    #[test]
    fn test_unavailable_without_location() {
        let mode = LocationMode::new(&Config::default());
        assert!(!mode.available());
        assert_eq!(mode.signal_at(Utc::now()), None);
    }

    #[test]
    fn test_compute_maps_signal_into_limits() {
        let mode = mode();
        let mut display = Display::new(1, "A", DisplayIdentity::default());
        display.min_brightness = 20;
        display.max_brightness = 80;
        let target = mode.compute(&display, 1.0).unwrap();
        assert_eq!(target.brightness, 80);
        let target = mode.compute(&display, 0.0).unwrap();
        assert_eq!(target.brightness, 20);
        assert_eq!(target.contrast, 0);
    }
}
