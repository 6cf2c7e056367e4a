// SPDX-License-Identifier: GPL-3.0-only
//! Learned input → output curves
//!
//! A [`DataPointCurve`] holds the corrections a user taught one display in one
//! mode. Points are kept monotonic: inserting a point removes every point that
//! would make the curve go the other way. Between points (and towards the ends
//! of the input domain) values are interpolated linearly, anchored on the
//! mode's default mapping.

use serde::{Deserialize, Serialize};

use crate::display::Property;

/// Most points a curve keeps; beyond this the nearest old point is evicted
pub const MAX_CURVE_POINTS: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointCurve {
    /// `(input, output)` sorted by input
    points: Vec<(f64, f64)>,
    pub min: u16,
    pub max: u16,
    /// Last output produced or learned; always within `[min, max]`
    pub last: u16,
}

impl DataPointCurve {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            points: Vec::new(),
            min,
            max,
            last: min,
        }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn set_last(&mut self, value: u16) {
        self.last = value.clamp(self.min, self.max);
    }

    /// Learn that `input` should produce `output`
    pub fn insert(&mut self, input: f64, output: f64) {
        if !input.is_finite() || !output.is_finite() {
            return;
        }
        let output = output.clamp(self.min as f64, self.max as f64);

        self.points.retain(|&(x, y)| {
            let conflicting = (x < input && y > output) || (x > input && y < output);
            !conflicting && x != input
        });

        if self.points.len() >= MAX_CURVE_POINTS {
            let nearest = self
                .points
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| (a.0 - input).abs().total_cmp(&(b.0 - input).abs()))
                .map(|(i, _)| i);
            if let Some(i) = nearest {
                self.points.remove(i);
            }
        }

        let at = self.points.partition_point(|&(x, _)| x < input);
        self.points.insert(at, (input, output));
        self.set_last(output.round() as u16);
    }

    /// Output for `input`, clamped to `[min, max]`.
    ///
    /// `domain` bounds the input; `default` is the mode's built-in mapping and
    /// anchors the curve at both ends of the domain.
    pub fn interpolate(&self, input: f64, domain: (f64, f64), default: impl Fn(f64) -> f64) -> u16 {
        let (lo, hi) = domain;
        let input = input.clamp(lo, hi);
        let (min, max) = (self.min as f64, self.max as f64);

        if self.points.is_empty() {
            return default(input).clamp(min, max).round() as u16;
        }

        let mut anchored = Vec::with_capacity(self.points.len() + 2);
        let (first_x, first_y) = self.points[0];
        if first_x > lo {
            anchored.push((lo, default(lo).clamp(min, max).min(first_y)));
        }
        anchored.extend_from_slice(&self.points);
        let (last_x, last_y) = self.points[self.points.len() - 1];
        if last_x < hi {
            anchored.push((hi, default(hi).clamp(min, max).max(last_y)));
        }

        let value = match anchored.iter().position(|&(x, _)| x >= input) {
            Some(0) => anchored[0].1,
            Some(i) => {
                let (x0, y0) = anchored[i - 1];
                let (x1, y1) = anchored[i];
                if x1 == x0 {
                    y1
                } else {
                    y0 + (y1 - y0) * (input - x0) / (x1 - x0)
                }
            }
            None => anchored[anchored.len() - 1].1,
        };
        value.clamp(min, max).round() as u16
    }

    pub fn reset(&mut self) {
        self.points.clear();
        self.last = self.min;
    }

    /// Move the output range to `[min, max]`, rescaling learned outputs
    pub fn rebound(&mut self, min: u16, max: u16) {
        let (old_min, old_max) = (self.min as f64, self.max as f64);
        let (new_min, new_max) = (min as f64, max as f64);
        let span = old_max - old_min;
        for point in &mut self.points {
            point.1 = if span > 0.0 {
                new_min + (point.1 - old_min) / span * (new_max - new_min)
            } else {
                new_min
            };
        }
        self.min = min;
        self.max = max;
        self.last = self.last.clamp(min, max);
    }
}

/// Brightness and contrast curves of one display in one mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeCurves {
    pub brightness: DataPointCurve,
    pub contrast: DataPointCurve,
}

impl ModeCurves {
    pub fn new(brightness: (u16, u16), contrast: (u16, u16)) -> Self {
        Self {
            brightness: DataPointCurve::new(brightness.0, brightness.1),
            contrast: DataPointCurve::new(contrast.0, contrast.1),
        }
    }

    pub fn curve(&self, property: Property) -> Option<&DataPointCurve> {
        match property {
            Property::Brightness => Some(&self.brightness),
            Property::Contrast => Some(&self.contrast),
            Property::Volume => None,
        }
    }

    pub fn curve_mut(&mut self, property: Property) -> Option<&mut DataPointCurve> {
        match property {
            Property::Brightness => Some(&mut self.brightness),
            Property::Contrast => Some(&mut self.contrast),
            Property::Volume => None,
        }
    }

    pub fn rebound(&mut self, property: Property, min: u16, max: u16) {
        if let Some(curve) = self.curve_mut(property) {
            curve.rebound(min, max);
        }
    }

    pub fn reset(&mut self) {
        self.brightness.reset();
        self.contrast.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(x: f64) -> f64 {
        x
    }

    #[test]
    fn test_empty_curve_uses_default() {
        let curve = DataPointCurve::new(10, 90);
        assert_eq!(curve.interpolate(50.0, (0.0, 100.0), linear), 50);
        assert_eq!(curve.interpolate(5.0, (0.0, 100.0), linear), 10);
        assert_eq!(curve.interpolate(500.0, (0.0, 100.0), linear), 90);
    }

    #[test]
    fn test_insert_keeps_curve_monotonic() {
        let mut curve = DataPointCurve::new(0, 100);
        curve.insert(100.0, 30.0);
        curve.insert(500.0, 60.0);
        curve.insert(900.0, 80.0);

        // Lower output at a higher input than 100 and 500 wipes them
        curve.insert(700.0, 20.0);
        assert_eq!(curve.points(), &[(700.0, 20.0), (900.0, 80.0)]);
        assert_eq!(curve.last, 20);
    }

    #[test]
    fn test_insert_replaces_same_input() {
        let mut curve = DataPointCurve::new(0, 100);
        curve.insert(10.0, 30.0);
        curve.insert(10.0, 35.0);
        assert_eq!(curve.points(), &[(10.0, 35.0)]);
    }

    #[test]
    fn test_interpolation_between_points_and_anchors() {
        let mut curve = DataPointCurve::new(0, 100);
        curve.insert(40.0, 20.0);
        curve.insert(60.0, 40.0);

        assert_eq!(curve.interpolate(50.0, (0.0, 100.0), linear), 30);
        // Anchor at 0 comes from the default, capped by the first point
        assert_eq!(curve.interpolate(0.0, (0.0, 100.0), linear), 0);
        assert_eq!(curve.interpolate(20.0, (0.0, 100.0), linear), 10);
        // Anchor at 100 is default(100) = 100
        assert_eq!(curve.interpolate(80.0, (0.0, 100.0), linear), 70);
    }

    #[test]
    fn test_capacity_evicts_nearest() {
        let mut curve = DataPointCurve::new(0, 100);
        for i in 0..MAX_CURVE_POINTS {
            curve.insert(i as f64 * 10.0, i as f64 * 2.0);
        }
        assert_eq!(curve.points().len(), MAX_CURVE_POINTS);

        curve.insert(51.0, 10.5);
        assert_eq!(curve.points().len(), MAX_CURVE_POINTS);
        assert!(curve.points().contains(&(51.0, 10.5)));
        assert!(!curve.points().contains(&(50.0, 10.0)));
    }

    #[test]
    fn test_outputs_clamped_and_rebound() {
        let mut curve = DataPointCurve::new(0, 100);
        curve.insert(10.0, 150.0);
        assert_eq!(curve.points(), &[(10.0, 100.0)]);
        assert_eq!(curve.last, 100);

        curve.rebound(0, 50);
        assert_eq!(curve.points(), &[(10.0, 50.0)]);
        assert_eq!(curve.last, 50);
        assert!(curve.last >= curve.min && curve.last <= curve.max);
    }
}
