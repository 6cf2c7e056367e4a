// SPDX-License-Identifier: GPL-3.0-only
//! Sensor mode
//!
//! Maps ambient light onto brightness. Lux comes from an external HTTP sensor
//! when one is configured and answering, otherwise from an IIO light sensor
//! built into the machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::{
    AdaptiveMode, LastInput, ModeKey, ModeWatch, SignalCallback, Target, curve_target,
};
use crate::config::Config;
use crate::display::Display;

/// Lux treated as full daylight
pub const MAX_LUX: f64 = 10_000.0;
const IIO_ROOT: &str = "/sys/bus/iio/devices";
const HTTP_SENSOR_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that measures ambient light
pub trait LuxSource: fmt::Debug + Send + Sync {
    fn name(&self) -> String;

    fn read_lux(&self) -> Option<f64>;
}

/// Perceptual default mapping of lux onto `[0, 1]`
pub fn lux_percent(lux: f64) -> f64 {
    ((1.0 + lux.max(0.0)).ln() / (1.0 + MAX_LUX).ln()).clamp(0.0, 1.0)
}

/// Ambient light sensor exposed through the Linux IIO subsystem
#[derive(Debug, Clone)]
pub struct IioLightSensor {
    device: PathBuf,
}

impl IioLightSensor {
    pub fn find() -> Option<Self> {
        Self::find_in(Path::new(IIO_ROOT))
    }

    /// First `iio:device*` under `root` with an illuminance channel
    pub fn find_in(root: &Path) -> Option<Self> {
        let mut devices: Vec<PathBuf> = std::fs::read_dir(root)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("iio:device"))
            })
            .collect();
        devices.sort();

        let device = devices.into_iter().find(|d| {
            d.join("in_illuminance_input").exists() || d.join("in_illuminance_raw").exists()
        })?;
        info!(device = %device.display(), "Found ambient light sensor");
        Some(Self { device })
    }

    fn read_value(&self, file: &str) -> Option<f64> {
        std::fs::read_to_string(self.device.join(file))
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

impl LuxSource for IioLightSensor {
    fn name(&self) -> String {
        format!("iio:{}", self.device.display())
    }

    fn read_lux(&self) -> Option<f64> {
        if let Some(lux) = self.read_value("in_illuminance_input") {
            return Some(lux);
        }
        let raw = self.read_value("in_illuminance_raw")?;
        let scale = self.read_value("in_illuminance_scale").unwrap_or(1.0);
        let offset = self.read_value("in_illuminance_offset").unwrap_or(0.0);
        Some((raw + offset) * scale)
    }
}

/// Network sensor answering with a lux number or `{"lux": n}`
pub struct HttpLightSensor {
    url: String,
    agent: ureq::Agent,
}

impl HttpLightSensor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(HTTP_SENSOR_TIMEOUT)
                .build(),
        }
    }
}

impl fmt::Debug for HttpLightSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpLightSensor")
            .field("url", &self.url)
            .finish()
    }
}

/// Lux from a sensor response body
pub fn parse_lux(body: &str) -> Option<f64> {
    let body = body.trim();
    if let Ok(lux) = body.parse::<f64>() {
        return Some(lux);
    }
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("lux")?.as_f64()
}

impl LuxSource for HttpLightSensor {
    fn name(&self) -> String {
        self.url.clone()
    }

    fn read_lux(&self) -> Option<f64> {
        let body = match self.agent.get(&self.url).call() {
            Ok(response) => response.into_string().ok()?,
            Err(e) => {
                debug!(url = %self.url, "Light sensor request failed: {}", e);
                return None;
            }
        };
        let lux = parse_lux(&body);
        if lux.is_none() {
            warn!(url = %self.url, "Unexpected light sensor response: {:?}", body);
        }
        lux.filter(|l| l.is_finite() && *l >= 0.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct SensorSettings {
    interval: Duration,
    factor: f64,
}

pub struct SensorMode {
    external: Option<Arc<dyn LuxSource>>,
    internal: Option<Arc<dyn LuxSource>>,
    settings: RwLock<SensorSettings>,
    watch: ModeWatch,
    last: Arc<LastInput>,
}

impl SensorMode {
    pub fn new(
        external: Option<Arc<dyn LuxSource>>,
        internal: Option<Arc<dyn LuxSource>>,
        config: &Config,
    ) -> Self {
        Self {
            external,
            internal,
            settings: RwLock::new(Self::settings(config)),
            watch: ModeWatch::default(),
            last: Arc::new(LastInput::default()),
        }
    }

    fn settings(config: &Config) -> SensorSettings {
        SensorSettings {
            interval: Duration::from_secs(config.sensor_poll_interval_secs),
            factor: config.curve_factors.get(ModeKey::Sensor),
        }
    }

    /// Takes effect on the next `watch`
    pub fn configure(&self, config: &Config) {
        *self.settings.write() = Self::settings(config);
    }

    pub fn external_available(&self) -> bool {
        self.external.as_ref().is_some_and(|s| s.read_lux().is_some())
    }

    pub fn internal_available(&self) -> bool {
        self.internal.as_ref().is_some_and(|s| s.read_lux().is_some())
    }

    fn read(external: &Option<Arc<dyn LuxSource>>, internal: &Option<Arc<dyn LuxSource>>) -> Option<f64> {
        external
            .as_ref()
            .and_then(|s| s.read_lux())
            .or_else(|| internal.as_ref().and_then(|s| s.read_lux()))
    }
}

impl AdaptiveMode for SensorMode {
    fn key(&self) -> ModeKey {
        ModeKey::Sensor
    }

    fn available(&self) -> bool {
        self.external_available() || self.internal_available()
    }

    fn is_watching(&self) -> bool {
        self.watch.is_watching()
    }

    fn watch(&self, on_signal: SignalCallback) -> bool {
        let (external, internal) = (self.external.clone(), self.internal.clone());
        let last = self.last.clone();
        let interval = self.settings.read().interval;
        self.watch.start("sensor-mode", interval, move || {
            if last.update(Self::read(&external, &internal)) {
                on_signal(ModeKey::Sensor);
            }
        })
    }

    fn stop_watching(&self) -> bool {
        self.watch.stop()
    }

    fn input(&self) -> Option<f64> {
        let lux = Self::read(&self.external, &self.internal);
        self.last.update(lux);
        lux
    }

    fn last_input(&self) -> Option<f64> {
        self.last.get()
    }

    fn compute(&self, display: &Display, input: f64) -> Option<Target> {
        let factor = self.settings.read().factor;
        Some(curve_target(
            display,
            ModeKey::Sensor,
            input,
            (0.0, MAX_LUX),
            lux_percent,
            factor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::tests::FixedLux;
    use crate::display::DisplayIdentity;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Some(Ok(mut stream)) = listener.incoming().next() {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() <= 2 {
                        break;
                    }
                }
                write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                )
                .unwrap();
            }
        });
        format!("http://127.0.0.1:{port}/lux")
    }

    #[test]
    fn test_lux_percent_curve() {
        assert_eq!(lux_percent(0.0), 0.0);
        assert!((lux_percent(MAX_LUX) - 1.0).abs() < 1e-9);
        assert_eq!(lux_percent(1e6), 1.0);
        assert!(lux_percent(100.0) > 0.4 && lux_percent(100.0) < 0.6);
    }

    #[test]
    fn test_parse_lux_bodies() {
        assert_eq!(parse_lux("312.5\n"), Some(312.5));
        assert_eq!(parse_lux(r#"{"lux": 40}"#), Some(40.0));
        assert_eq!(parse_lux("dark"), None);
    }

    #[test]
    fn test_iio_raw_with_scale() {
        let root = tempfile::tempdir().unwrap();
        let device = root.path().join("iio:device0");
        std::fs::create_dir(&device).unwrap();
        std::fs::write(device.join("in_illuminance_raw"), "200\n").unwrap();
        std::fs::write(device.join("in_illuminance_scale"), "0.5\n").unwrap();

        let sensor = IioLightSensor::find_in(root.path()).unwrap();
        assert_eq!(sensor.read_lux(), Some(100.0));

        std::fs::write(device.join("in_illuminance_input"), "42\n").unwrap();
        assert_eq!(sensor.read_lux(), Some(42.0));
    }

    #[test]
    fn test_iio_missing_device() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("iio:device0")).unwrap();
        assert!(IioLightSensor::find_in(root.path()).is_none());
    }

    #[test]
    fn test_http_sensor() {
        let url = serve_once(r#"{"lux": 250}"#);
        let sensor = HttpLightSensor::new(url);
        assert_eq!(sensor.read_lux(), Some(250.0));
    }

    #[test]
    fn test_external_preferred_over_internal() {
        let mode = SensorMode::new(
            Some(Arc::new(FixedLux(Some(800.0)))),
            Some(Arc::new(FixedLux(Some(5.0)))),
            &Config::default(),
        );
        assert!(mode.external_available());
        assert_eq!(mode.input(), Some(800.0));
        assert_eq!(mode.last_input(), Some(800.0));

        let mode = SensorMode::new(
            Some(Arc::new(FixedLux(None))),
            Some(Arc::new(FixedLux(Some(5.0)))),
            &Config::default(),
        );
        assert!(!mode.external_available());
        assert!(mode.internal_available());
        assert_eq!(mode.input(), Some(5.0));
    }

    #[test]
    fn test_learned_point_bends_the_mapping() {
        let mode = SensorMode::new(None, Some(Arc::new(FixedLux(Some(0.0)))), &Config::default());
        let mut display = Display::new(1, "A", DisplayIdentity::default());
        let dark = mode.compute(&display, 0.0).unwrap();
        let bright = mode.compute(&display, MAX_LUX).unwrap();
        assert_eq!(dark.brightness, 0);
        assert_eq!(bright.brightness, 100);

        display
            .curves_mut(ModeKey::Sensor)
            .brightness
            .insert(500.0, 30.0);
        assert_eq!(mode.compute(&display, 500.0).unwrap().brightness, 30);
    }
}
