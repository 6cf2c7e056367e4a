// SPDX-License-Identifier: GPL-3.0-only
//! Kernel backlight interface for built-in panels
//!
//! Laptop panels have no DDC/CI; their brightness lives under
//! `/sys/class/backlight/<device>/{brightness,max_brightness}`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use super::{DisplayProtocol, FeatureValue, vcp};

pub const SYSFS_BACKLIGHT: &str = "/sys/class/backlight";

#[derive(Debug)]
pub struct Backlight {
    path: PathBuf,
    max_brightness: u32,
}

impl Backlight {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let max_brightness = read_u32(&path.join("max_brightness"))?;
        if max_brightness == 0 {
            bail!("{} reports max_brightness 0", path.display());
        }
        Ok(Self {
            path,
            max_brightness,
        })
    }

    /// Every backlight device exposed by the kernel
    pub fn enumerate() -> Vec<Self> {
        Self::enumerate_in(Path::new(SYSFS_BACKLIGHT))
    }

    pub fn enumerate_in(root: &Path) -> Vec<Self> {
        let Ok(entries) = fs::read_dir(root) else {
            return Vec::new();
        };
        let mut devices: Vec<Self> = entries
            .flatten()
            .filter_map(|entry| match Self::open(entry.path()) {
                Ok(device) => Some(device),
                Err(e) => {
                    debug!("Skipping backlight {:?}: {}", entry.path(), e);
                    None
                }
            })
            .collect();
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        devices
    }

    fn to_percentage(&self, raw: u32) -> u16 {
        ((raw.min(self.max_brightness) as f64 / self.max_brightness as f64) * 100.0).round() as u16
    }

    fn to_raw(&self, percentage: u16) -> u32 {
        ((percentage.min(100) as f64 / 100.0) * self.max_brightness as f64).round() as u32
    }
}

fn read_u32(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    text.trim()
        .parse()
        .with_context(|| format!("parsing {}", path.display()))
}

impl DisplayProtocol for Backlight {
    fn id(&self) -> String {
        format!("backlight-{}", self.name())
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn read_feature(&mut self, code: u8) -> Result<FeatureValue> {
        if code != vcp::BRIGHTNESS {
            bail!("backlight has no feature {:#04x}", code);
        }
        let raw = read_u32(&self.path.join("brightness"))?;
        Ok(FeatureValue {
            current: self.to_percentage(raw),
            maximum: 100,
        })
    }

    fn write_feature(&mut self, code: u8, value: u16) -> Result<()> {
        if code != vcp::BRIGHTNESS {
            bail!("backlight has no feature {:#04x}", code);
        }
        let path = self.path.join("brightness");
        fs::write(&path, self.to_raw(value).to_string())
            .with_context(|| format!("writing {}", path.display()))
    }

    fn supports_feature(&self, code: u8) -> bool {
        code == vcp::BRIGHTNESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_backlight(root: &Path, name: &str, max: u32, current: u32) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("max_brightness"), format!("{max}\n")).unwrap();
        fs::write(dir.join("brightness"), format!("{current}\n")).unwrap();
        dir
    }

    #[test]
    fn test_read_write_scales_to_percent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = fake_backlight(tmp.path(), "intel_backlight", 19200, 9600);

        let mut backlight = Backlight::open(&dir).unwrap();
        assert_eq!(backlight.read_feature(vcp::BRIGHTNESS).unwrap().current, 50);

        backlight.write_feature(vcp::BRIGHTNESS, 25).unwrap();
        let raw = fs::read_to_string(dir.join("brightness")).unwrap();
        assert_eq!(raw, "4800");
        assert!(backlight.read_feature(vcp::CONTRAST).is_err());
    }

    #[test]
    fn test_enumerate_skips_broken_devices() {
        let tmp = tempfile::tempdir().unwrap();
        fake_backlight(tmp.path(), "acpi_video0", 100, 10);
        fake_backlight(tmp.path(), "broken", 0, 0);

        let found = Backlight::enumerate_in(tmp.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name(), "acpi_video0");
    }
}
