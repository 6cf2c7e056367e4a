// SPDX-License-Identifier: GPL-3.0-only
//! Clock mode
//!
//! Applies per-display schedules: at each scheduled time of day the display
//! goes to the schedule's brightness/contrast. Schedules are either a wall
//! clock time or an offset from sunrise, solar noon or sunset.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Timelike};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::solar::{self, SunTimes};
use super::{AdaptiveMode, LastInput, ModeKey, ModeWatch, SignalCallback, Target};
use crate::config::{Config, Geolocation};
use crate::display::Display;

pub const MAX_SCHEDULES: usize = 5;
const CLOCK_TICK: Duration = Duration::from_secs(30);
const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    #[default]
    Time,
    Sunrise,
    Sunset,
    Noon,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub kind: ScheduleKind,
    pub hour: u8,
    pub minute: u8,
    /// Offset before the solar event instead of after it
    #[serde(default)]
    pub negative: bool,
    pub brightness: u16,
    pub contrast: u16,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl Schedule {
    pub fn at(hour: u8, minute: u8, brightness: u16, contrast: u16) -> Self {
        Self {
            kind: ScheduleKind::Time,
            hour,
            minute,
            negative: false,
            brightness,
            contrast,
            enabled: true,
        }
    }

    /// Local minute of day the schedule fires on `date`
    pub fn minute_of_day(&self, date: NaiveDate, sun: Option<&SunTimes>) -> Option<u32> {
        let offset = self.hour as i64 * 60 + self.minute as i64;
        let event = match self.kind {
            ScheduleKind::Time => return Some(offset.rem_euclid(MINUTES_PER_DAY as i64) as u32),
            ScheduleKind::Sunrise => sun?.sunrise,
            ScheduleKind::Sunset => sun?.sunset,
            ScheduleKind::Noon => sun?.noon,
        };
        let local = event.with_timezone(&Local);
        let base = if local.date_naive() == date {
            (local.hour() * 60 + local.minute()) as i64
        } else {
            return None;
        };
        let signed = if self.negative { -offset } else { offset };
        Some((base + signed).clamp(0, MINUTES_PER_DAY as i64 - 1) as u32)
    }
}

/// How values move between schedules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockTransition {
    /// Jump at the scheduled time
    #[default]
    None,
    /// Glide over the last N minutes before the next schedule
    Minutes(u32),
    /// Glide over the whole interval between schedules
    Full,
}

/// Target at `minute` of a day given `(minute_of_day, schedule)` pairs
pub fn compute_at(
    schedules: &[(u32, &Schedule)],
    minute: u32,
    transition: ClockTransition,
) -> Option<(f64, f64)> {
    let mut sorted: Vec<_> = schedules.to_vec();
    sorted.sort_by_key(|(m, _)| *m);
    let (first, last) = (sorted.first()?, sorted.last()?);

    let prev = sorted
        .iter()
        .rev()
        .find(|(m, _)| *m <= minute)
        .unwrap_or(last);
    let next = sorted.iter().find(|(m, _)| *m > minute).unwrap_or(first);

    let values = |s: &Schedule| (s.brightness as f64, s.contrast as f64);
    if std::ptr::eq(prev.1, next.1) {
        return Some(values(prev.1));
    }

    let since = |from: u32, to: u32| (to + MINUTES_PER_DAY - from) % MINUTES_PER_DAY;
    let span = since(prev.0, next.0).max(1) as f64;
    let elapsed = since(prev.0, minute) as f64;
    let progress = match transition {
        ClockTransition::None => 0.0,
        ClockTransition::Full => elapsed / span,
        ClockTransition::Minutes(window) => {
            let remaining = span - elapsed;
            let window = (window as f64).min(span);
            if window > 0.0 && remaining <= window {
                1.0 - remaining / window
            } else {
                0.0
            }
        }
    };

    let (b0, c0) = values(prev.1);
    let (b1, c1) = values(next.1);
    Some((b0 + (b1 - b0) * progress, c0 + (c1 - c0) * progress))
}

struct ClockSettings {
    geolocation: Option<Geolocation>,
    transition: ClockTransition,
}

pub struct ClockMode {
    settings: RwLock<ClockSettings>,
    watch: ModeWatch,
    last: Arc<LastInput>,
}

impl ClockMode {
    pub fn new(config: &Config) -> Self {
        Self {
            settings: RwLock::new(ClockSettings {
                geolocation: config.geolocation,
                transition: config.clock_transition,
            }),
            watch: ModeWatch::default(),
            last: Arc::new(LastInput::default()),
        }
    }

    pub fn configure(&self, config: &Config) {
        let mut settings = self.settings.write();
        settings.geolocation = config.geolocation;
        settings.transition = config.clock_transition;
    }

    /// Target for `display` at a local time
    pub fn compute_at(&self, display: &Display, now: DateTime<Local>) -> Option<Target> {
        let settings = self.settings.read();
        let date = now.date_naive();
        let sun = settings
            .geolocation
            .and_then(|location| solar::sun_times(date, location));

        let resolved: Vec<(u32, &Schedule)> = display
            .schedules
            .iter()
            .filter(|s| s.enabled)
            .take(MAX_SCHEDULES)
            .filter_map(|s| Some((s.minute_of_day(date, sun.as_ref())?, s)))
            .collect();
        let minute = now.hour() * 60 + now.minute();
        let (brightness, contrast) = compute_at(&resolved, minute, settings.transition)?;

        Some(Target {
            brightness: display.clamp_brightness(brightness.round() as u16),
            contrast: display.clamp_contrast(contrast.round() as u16),
        })
    }
}

fn minute_now() -> f64 {
    let now = Local::now();
    (now.hour() * 60 + now.minute()) as f64
}

impl AdaptiveMode for ClockMode {
    fn key(&self) -> ModeKey {
        ModeKey::Clock
    }

    fn available(&self) -> bool {
        true
    }

    fn is_watching(&self) -> bool {
        self.watch.is_watching()
    }

    fn watch(&self, on_signal: SignalCallback) -> bool {
        let last = self.last.clone();
        self.watch.start("clock-mode", CLOCK_TICK, move || {
            last.update(Some(minute_now()));
            on_signal(ModeKey::Clock);
        })
    }

    fn stop_watching(&self) -> bool {
        self.watch.stop()
    }

    fn input(&self) -> Option<f64> {
        let minute = minute_now();
        self.last.update(Some(minute));
        Some(minute)
    }

    fn last_input(&self) -> Option<f64> {
        self.last.get()
    }

    fn compute(&self, display: &Display, _input: f64) -> Option<Target> {
        self.compute_at(display, Local::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::DisplayIdentity;
    use chrono::TimeZone;

    fn pairs(schedules: &[Schedule]) -> Vec<(u32, &Schedule)> {
        schedules
            .iter()
            .map(|s| (s.hour as u32 * 60 + s.minute as u32, s))
            .collect()
    }

    #[test]
    fn test_no_transition_holds_previous() {
        let schedules = [Schedule::at(8, 0, 80, 60), Schedule::at(20, 0, 20, 40)];
        let p = pairs(&schedules);
        assert_eq!(compute_at(&p, 12 * 60, ClockTransition::None), Some((80.0, 60.0)));
        // Before the first schedule of the day the last one still applies
        assert_eq!(compute_at(&p, 6 * 60, ClockTransition::None), Some((20.0, 40.0)));
        assert_eq!(compute_at(&p, 20 * 60, ClockTransition::None), Some((20.0, 40.0)));
    }

    #[test]
    fn test_full_transition_interpolates() {
        let schedules = [Schedule::at(8, 0, 80, 60), Schedule::at(20, 0, 20, 40)];
        let p = pairs(&schedules);
        assert_eq!(compute_at(&p, 14 * 60, ClockTransition::Full), Some((50.0, 50.0)));
        // Wraps around midnight: 20:00 -> 08:00 is 12 hours
        assert_eq!(compute_at(&p, 2 * 60, ClockTransition::Full), Some((50.0, 50.0)));
    }

    #[test]
    fn test_minutes_transition_window() {
        let schedules = [Schedule::at(8, 0, 80, 60), Schedule::at(20, 0, 20, 40)];
        let p = pairs(&schedules);
        let t = ClockTransition::Minutes(60);
        assert_eq!(compute_at(&p, 18 * 60, t), Some((80.0, 60.0)));
        assert_eq!(compute_at(&p, 19 * 60 + 30, t), Some((50.0, 50.0)));
    }

    #[test]
    fn test_single_schedule_and_empty() {
        let schedules = [Schedule::at(8, 0, 70, 50)];
        let p = pairs(&schedules);
        assert_eq!(compute_at(&p, 3 * 60, ClockTransition::Full), Some((70.0, 50.0)));
        assert_eq!(compute_at(&[], 3 * 60, ClockTransition::Full), None);
    }

    #[test]
    fn test_mode_clamps_and_skips_disabled() {
        let mode = ClockMode::new(&Config::default());
        let mut display = Display::new(1, "A", DisplayIdentity::default());
        display.max_brightness = 60;
        let mut off = Schedule::at(10, 0, 5, 5);
        off.enabled = false;
        display.schedules = vec![Schedule::at(7, 0, 90, 55), off];

        let now = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            mode.compute_at(&display, now),
            Some(Target {
                brightness: 60,
                contrast: 55
            })
        );
    }

    #[test]
    fn test_solar_schedule_needs_location() {
        let schedule = Schedule {
            kind: ScheduleKind::Sunset,
            ..Schedule::at(0, 30, 20, 50)
        };
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(schedule.minute_of_day(date, None), None);
    }

    #[test]
    fn test_transition_serde() {
        let t: ClockTransition = serde_json::from_str(r#"{"minutes":15}"#).unwrap();
        assert_eq!(t, ClockTransition::Minutes(15));
        let t: ClockTransition = serde_json::from_str(r#""full""#).unwrap();
        assert_eq!(t, ClockTransition::Full);
    }
}
