// SPDX-License-Identifier: GPL-3.0-only
//! Gamma ramps through the wlr-gamma-control Wayland protocol
//!
//! Outputs are matched to displays by connector name (`wl_output` v4). One
//! gamma control object stays alive per dimmed output; destroying it makes
//! the compositor load the original ramps again.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::{AsFd, FromRawFd};

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use wayland_client::protocol::{wl_output, wl_registry};
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle, delegate_noop};
use wayland_protocols_wlr::gamma_control::v1::client::zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1;
use wayland_protocols_wlr::gamma_control::v1::client::zwlr_gamma_control_v1::{
    self, ZwlrGammaControlV1,
};

use super::gamma::{GammaSink, GammaTable};
use crate::display::DisplayId;

struct Output {
    global: u32,
    proxy: wl_output::WlOutput,
    name: Option<String>,
}

enum RampSize {
    Pending,
    Ready(u32),
    Failed,
}

struct Ramp {
    control: ZwlrGammaControlV1,
    size: RampSize,
}

#[derive(Default)]
struct State {
    manager: Option<ZwlrGammaControlManagerV1>,
    outputs: Vec<Output>,
    ramps: HashMap<String, Ramp>,
}

struct Session {
    queue: EventQueue<State>,
    state: State,
}

impl Session {
    fn refresh(&mut self) -> Result<()> {
        self.queue
            .roundtrip(&mut self.state)
            .context("Wayland roundtrip")?;
        Ok(())
    }

    fn has_output(&self, connector: &str) -> bool {
        self.state
            .outputs
            .iter()
            .any(|o| o.name.as_deref() == Some(connector))
    }

    /// Ramp size of the output, creating its gamma control on first use
    fn ramp_size(&mut self, connector: &str) -> Result<u32> {
        if !self.state.ramps.contains_key(connector) {
            if !self.has_output(connector) {
                self.refresh()?;
            }
            let manager = self
                .state
                .manager
                .as_ref()
                .ok_or_else(|| anyhow!("no gamma control manager"))?;
            let output = self
                .state
                .outputs
                .iter()
                .find(|o| o.name.as_deref() == Some(connector))
                .ok_or_else(|| anyhow!("no Wayland output named {connector}"))?;
            let control =
                manager.get_gamma_control(&output.proxy, &self.queue.handle(), connector.to_string());
            self.state.ramps.insert(
                connector.to_string(),
                Ramp {
                    control,
                    size: RampSize::Pending,
                },
            );
            self.refresh()?;
        }

        match self.state.ramps.get(connector).map(|r| &r.size) {
            Some(RampSize::Ready(size)) => Ok(*size),
            Some(RampSize::Failed) => {
                if let Some(ramp) = self.state.ramps.remove(connector) {
                    ramp.control.destroy();
                }
                bail!("compositor refused gamma control for {connector}")
            }
            _ => bail!("no gamma size reported for {connector}"),
        }
    }
}

/// [`GammaSink`] backed by a wlroots-style compositor
pub struct WlrGammaSink {
    connection: Connection,
    session: Mutex<Session>,
}

impl WlrGammaSink {
    pub fn connect() -> Result<Self> {
        let connection =
            Connection::connect_to_env().context("connecting to the Wayland compositor")?;
        let queue = connection.new_event_queue();
        connection.display().get_registry(&queue.handle(), ());

        let mut session = Session {
            queue,
            state: State::default(),
        };
        // Globals first, then the output names they announce
        session.refresh()?;
        session.refresh()?;
        if session.state.manager.is_none() {
            bail!("compositor does not offer wlr-gamma-control");
        }
        info!(
            outputs = session.state.outputs.len(),
            "Connected to wlr-gamma-control"
        );

        Ok(Self {
            connection,
            session: Mutex::new(session),
        })
    }
}

impl GammaSink for WlrGammaSink {
    fn can_drive(&self, connector: Option<&str>) -> bool {
        let Some(connector) = connector else {
            return false;
        };
        let mut session = self.session.lock();
        if session.has_output(connector) {
            return true;
        }
        if let Err(e) = session.refresh() {
            warn!(connector, "Refreshing Wayland outputs failed: {:#}", e);
            return false;
        }
        session.has_output(connector)
    }

    fn apply(&self, id: DisplayId, connector: Option<&str>, table: &GammaTable) -> Result<()> {
        let connector = connector.ok_or_else(|| anyhow!("display {id} has no connector name"))?;
        let mut session = self.session.lock();
        let size = session.ramp_size(connector)?;
        let file = ramp_file(table, size as usize)?;
        if let Some(ramp) = session.state.ramps.get(connector) {
            ramp.control.set_gamma(file.as_fd());
        }
        // The fd must still be open when the request goes out
        self.connection.flush().context("sending gamma ramps")?;
        debug!(display_id = id, connector, size, "Applied gamma ramps");
        Ok(())
    }

    fn restore(&self, id: DisplayId, connector: Option<&str>) -> Result<()> {
        let Some(connector) = connector else {
            return Ok(());
        };
        let ramp = self.session.lock().state.ramps.remove(connector);
        if let Some(ramp) = ramp {
            ramp.control.destroy();
            self.connection.flush().context("releasing gamma control")?;
            debug!(display_id = id, connector, "Released gamma control");
        }
        Ok(())
    }
}

/// Resample a `[0, 1]` ramp to `size` 16-bit entries
fn resample(channel: &[f32], size: usize) -> Vec<u16> {
    if channel.is_empty() {
        return vec![0; size];
    }
    let last = (channel.len() - 1) as f32;
    (0..size)
        .map(|i| {
            let x = if size > 1 {
                i as f32 / (size - 1) as f32 * last
            } else {
                0.0
            };
            let lo = x.floor() as usize;
            let hi = (lo + 1).min(channel.len() - 1);
            let value = channel[lo] + (channel[hi] - channel[lo]) * (x - lo as f32);
            (value.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16
        })
        .collect()
}

/// Anonymous file holding the red, green and blue ramps back to back
fn ramp_file(table: &GammaTable, size: usize) -> Result<File> {
    // SAFETY: the name is a NUL-terminated literal and the flags are constants
    let fd = unsafe { libc::memfd_create(c"gamma-ramp".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("creating gamma ramp buffer");
    }
    // SAFETY: `fd` was just created and nothing else owns it
    let mut file = unsafe { File::from_raw_fd(fd) };

    let mut bytes = Vec::with_capacity(size * 3 * 2);
    for channel in [&table.red, &table.green, &table.blue] {
        for value in resample(channel, size) {
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
    }
    file.write_all(&bytes)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

impl Dispatch<wl_registry::WlRegistry, ()> for State {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match interface.as_str() {
                "wl_output" => {
                    let proxy =
                        registry.bind::<wl_output::WlOutput, _, _>(name, version.min(4), qh, name);
                    state.outputs.push(Output {
                        global: name,
                        proxy,
                        name: None,
                    });
                }
                "zwlr_gamma_control_manager_v1" => {
                    state.manager =
                        Some(registry.bind::<ZwlrGammaControlManagerV1, _, _>(name, 1, qh, ()));
                }
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => {
                let Some(index) = state.outputs.iter().position(|o| o.global == name) else {
                    return;
                };
                let output = state.outputs.remove(index);
                if let Some(ramp) = output
                    .name
                    .as_deref()
                    .and_then(|connector| state.ramps.remove(connector))
                {
                    ramp.control.destroy();
                }
                if output.proxy.version() >= 3 {
                    output.proxy.release();
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_output::WlOutput, u32> for State {
    fn event(
        state: &mut Self,
        _: &wl_output::WlOutput,
        event: wl_output::Event,
        global: &u32,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_output::Event::Name { name } = event {
            if let Some(output) = state.outputs.iter_mut().find(|o| o.global == *global) {
                output.name = Some(name);
            }
        }
    }
}

impl Dispatch<ZwlrGammaControlV1, String> for State {
    fn event(
        state: &mut Self,
        _: &ZwlrGammaControlV1,
        event: zwlr_gamma_control_v1::Event,
        connector: &String,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(ramp) = state.ramps.get_mut(connector) else {
            return;
        };
        match event {
            zwlr_gamma_control_v1::Event::GammaSize { size } => ramp.size = RampSize::Ready(size),
            zwlr_gamma_control_v1::Event::Failed => {
                warn!(connector, "Compositor revoked gamma control");
                ramp.size = RampSize::Failed;
            }
            _ => {}
        }
    }
}

delegate_noop!(State: ignore ZwlrGammaControlManagerV1);
