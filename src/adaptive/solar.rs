// SPDX-License-Identifier: GPL-3.0-only
//! Sunrise, solar noon and sunset (NOAA general solar position equations)

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use crate::config::Geolocation;

/// Zenith of the sun's upper limb at the horizon, refraction included
const HORIZON_ZENITH_DEG: f64 = 90.833;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunTimes {
    pub sunrise: DateTime<Utc>,
    pub noon: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
}

/// Calendar date of the mean solar day that contains `now` at `longitude`.
///
/// West of Greenwich the local evening already falls on the next UTC date,
/// so the UTC date alone picks the wrong sunrise/sunset pair.
pub fn solar_date(now: DateTime<Utc>, longitude: f64) -> NaiveDate {
    // The sun moves 1 degree of longitude every 4 minutes
    (now + Duration::seconds((longitude * 240.0).round() as i64)).date_naive()
}

/// Sun times of the solar day around `now`
pub fn sun_times_around(now: DateTime<Utc>, location: Geolocation) -> Option<SunTimes> {
    sun_times(solar_date(now, location.longitude), location)
}

/// Sun times for `date` at `location`, `None` during polar day or night
pub fn sun_times(date: NaiveDate, location: Geolocation) -> Option<SunTimes> {
    let days_in_year = if date.leap_year() { 366.0 } else { 365.0 };
    // Fractional year at noon
    let gamma = 2.0 * PI / days_in_year * (date.ordinal0() as f64);

    let eqtime = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());
    let decl = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    let lat = location.latitude.to_radians();
    let cos_ha = HORIZON_ZENITH_DEG.to_radians().cos() / (lat.cos() * decl.cos())
        - lat.tan() * decl.tan();
    if !(-1.0..=1.0).contains(&cos_ha) {
        return None;
    }
    let ha = cos_ha.acos().to_degrees();

    let midnight = date.and_hms_opt(0, 0, 0)?.and_utc();
    let at = |minutes: f64| midnight + Duration::seconds((minutes * 60.0).round() as i64);

    Some(SunTimes {
        sunrise: at(720.0 - 4.0 * (location.longitude + ha) - eqtime),
        noon: at(720.0 - 4.0 * location.longitude - eqtime),
        sunset: at(720.0 - 4.0 * (location.longitude - ha) - eqtime),
    })
}
