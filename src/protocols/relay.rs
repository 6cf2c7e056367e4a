// SPDX-License-Identifier: GPL-3.0-only
//! DDC relay on the local network
//!
//! Some machines can't reach a monitor's I2C bus directly (e.g. the monitor is
//! wired to a small board on the LAN). A relay speaks plain HTTP:
//!
//! - `GET /displays` lists `bus<TAB>name<TAB>serial` lines
//! - `GET /<bus>/<feature>` answers `current` or `current max`
//! - `GET /<bus>/<feature>/<value>` writes a value

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use url::Url;

use super::{DisplayProtocol, FeatureValue, vcp};

pub const RELAY_TIMEOUT: Duration = Duration::from_secs(2);
pub const RELAY_ATTEMPTS: u32 = 3;

/// A display advertised by a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayListing {
    pub bus: u32,
    pub name: String,
    pub serial: String,
}

pub struct RelayDisplay {
    base: Url,
    bus: u32,
    name: String,
    agent: ureq::Agent,
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(RELAY_TIMEOUT).build()
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut root = base.clone();
    if !root.path().ends_with('/') {
        let path = format!("{}/", root.path());
        root.set_path(&path);
    }
    root.join(path)
        .with_context(|| format!("building relay url {base} + {path}"))
}

fn get(agent: &ureq::Agent, url: &Url) -> Result<String> {
    let mut last_error = None;
    for attempt in 1..=RELAY_ATTEMPTS {
        match agent.get(url.as_str()).call() {
            Ok(response) => return Ok(response.into_string()?),
            Err(e) => {
                debug!("Relay request {} failed (attempt {}): {}", url, attempt, e);
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => anyhow!("relay {url}: {e}"),
        None => anyhow!("relay {url}: no attempts made"),
    })
}

/// Displays a relay currently advertises
pub fn list_displays(base: &Url) -> Result<Vec<RelayListing>> {
    let body = get(&agent(), &endpoint(base, "displays")?)?;
    Ok(parse_listing(&body))
}

fn parse_listing(body: &str) -> Vec<RelayListing> {
    body.lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let bus = parts.next()?.trim().parse().ok()?;
            let name = parts.next()?.trim().to_string();
            let serial = parts.next().unwrap_or_default().trim().to_string();
            Some(RelayListing { bus, name, serial })
        })
        .collect()
}

fn parse_value(body: &str) -> Result<FeatureValue> {
    let mut parts = body.split_whitespace();
    let current: u16 = match parts.next() {
        Some(text) => text.parse().with_context(|| format!("bad relay value {text:?}"))?,
        None => bail!("empty relay response"),
    };
    let maximum = match parts.next() {
        Some(text) => text.parse().with_context(|| format!("bad relay maximum {text:?}"))?,
        None => 100,
    };
    Ok(FeatureValue { current, maximum })
}

impl RelayDisplay {
    pub fn new(base: Url, listing: &RelayListing) -> Self {
        Self {
            base,
            bus: listing.bus,
            name: listing.name.clone(),
            agent: agent(),
        }
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }
}

impl DisplayProtocol for RelayDisplay {
    fn id(&self) -> String {
        format!("relay-{}-{}", self.base.host_str().unwrap_or("local"), self.bus)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn read_feature(&mut self, code: u8) -> Result<FeatureValue> {
        let url = endpoint(&self.base, &format!("{}/{}", self.bus, vcp::name(code)))?;
        parse_value(&get(&self.agent, &url)?)
    }

    fn write_feature(&mut self, code: u8, value: u16) -> Result<()> {
        let url = endpoint(
            &self.base,
            &format!("{}/{}/{}", self.bus, vcp::name(code), value),
        )?;
        get(&self.agent, &url)?;
        Ok(())
    }
}

impl std::fmt::Debug for RelayDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RelayDisplay({} bus {})", self.base, self.bus)
    }
}
