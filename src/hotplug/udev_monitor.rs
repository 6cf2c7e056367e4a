// SPDX-License-Identifier: GPL-3.0-only
use std::os::fd::AsRawFd;

/// Monitors udev for display hotplug events
///
/// This runs in a dedicated blocking thread because udev's MonitorSocket is not Send.
pub struct UdevMonitor {
    socket: udev::MonitorSocket,
}

/// Connector add/remove shows up as a change on the drm minor
pub(crate) fn is_display_event(kind: udev::EventType) -> bool {
    matches!(
        kind,
        udev::EventType::Add | udev::EventType::Remove | udev::EventType::Change
    )
}

impl UdevMonitor {
    pub fn new() -> Result<Self, std::io::Error> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem_devtype("drm", "drm_minor")?
            .listen()?;

        Ok(Self { socket })
    }

    /// Block on the socket, calling `callback` for each display event until
    /// it returns false or polling fails
    pub fn run<F>(self, mut callback: F) -> std::io::Error
    where
        F: FnMut() -> bool,
    {
        info!("Display hotplug monitoring started");
        let fd = self.socket.as_raw_fd();

        loop {
            let mut poll_fd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            // SAFETY: poll_fd is a valid pollfd for the lifetime of the call
            let ready = unsafe { libc::poll(&mut poll_fd, 1, -1) };
            if ready < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Poll error: {}", err);
                return err;
            }
            if ready == 0 {
                continue;
            }

            for event in self.socket.iter() {
                let kind = event.event_type();
                if !is_display_event(kind) {
                    continue;
                }
                debug!(event = ?kind, syspath = ?event.syspath(), "udev display event");
                if !callback() {
                    info!("Display hotplug monitoring stopped by callback");
                    return std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "Stopped by callback",
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_event_filter() {
        assert!(is_display_event(udev::EventType::Add));
        assert!(is_display_event(udev::EventType::Change));
        assert!(is_display_event(udev::EventType::Remove));
        assert!(!is_display_event(udev::EventType::Bind));
        assert!(!is_display_event(udev::EventType::Unknown));
    }
}
