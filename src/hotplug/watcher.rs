// SPDX-License-Identifier: GPL-3.0-only
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use super::udev_monitor::UdevMonitor;
use crate::config::APP_DIR;

/// Minimum spacing between two re-enumerations
pub const RATE_LIMIT: Duration = Duration::from_millis(1500);
/// DDC/CI needs a moment after a connector comes up
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

const PASSIVE_POLL: Duration = Duration::from_secs(2);
const PASSIVE_WINDOW: Duration = Duration::from_secs(10);

pub fn lock_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(format!("{APP_DIR}-hotplug.lock"))
}

/// Who gets to own the udev monitor
#[derive(Debug)]
pub enum HotplugLock {
    /// Holds the flock for as long as the file stays open
    Owner(File),
    /// Another process monitors; follow its lock file
    Passive,
}

impl HotplugLock {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        // SAFETY: the fd is owned by `file` and open for the call
        let locked = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if locked == 0 {
            return Ok(Self::Owner(file));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(Self::Passive)
        } else {
            Err(err)
        }
    }
}

/// Start hotplug detection on the current runtime
///
/// `on_change` runs once per settled burst of udev events. Returns `None`
/// outside a runtime.
pub fn spawn<F>(on_change: F) -> Option<JoinHandle<()>>
where
    F: Fn() + Send + Sync + 'static,
{
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(run(lock_path(), on_change)))
}

async fn run<F>(path: PathBuf, on_change: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let lock = match HotplugLock::acquire(&path) {
        Ok(lock) => lock,
        Err(e) => {
            error!("Failed to acquire hotplug lock: {}", e);
            return;
        }
    };

    let file = match lock {
        HotplugLock::Owner(file) => file,
        HotplugLock::Passive => {
            info!("Hotplug monitor already running in another instance, following its lock file");
            follow(&path, on_change).await;
            return;
        }
    };

    info!("Acquired hotplug monitor lock");
    let (tx, rx) = mpsc::channel(100);
    let spawned = std::thread::Builder::new()
        .name("hotplug-udev".into())
        .spawn(move || {
            let _lock_guard = file;
            let monitor = match UdevMonitor::new() {
                Ok(m) => m,
                Err(e) => {
                    error!("Failed to initialize display hotplug monitoring: {}", e);
                    return;
                }
            };
            monitor.run(|| match tx.try_send(()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            warn!("Display hotplug monitoring stopped");
        });
    if let Err(e) = spawned {
        error!("Failed to start hotplug thread: {}", e);
        return;
    }

    coalesce(rx, || {
        // Passive instances watch the mtime
        if let Err(e) = File::create(&path) {
            debug!("Failed to touch hotplug lock file: {}", e);
        }
        on_change();
    })
    .await;
    info!("Hotplug monitoring channel closed");
}

/// Collapse bursts of events into one call, spaced by at least
/// [`RATE_LIMIT`] and delayed by [`SETTLE_DELAY`]
pub async fn coalesce<F>(mut rx: mpsc::Receiver<()>, mut on_settled: F)
where
    F: FnMut(),
{
    let mut last: Option<Instant> = None;

    while rx.recv().await.is_some() {
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "Drained additional hotplug events");
        }

        if let Some(elapsed) = last.map(|at| at.elapsed())
            && elapsed < RATE_LIMIT
        {
            let wait = RATE_LIMIT - elapsed;
            debug!(?wait, "Rate limiting re-enumeration");
            sleep(wait).await;
        }
        sleep(SETTLE_DELAY).await;

        last = Some(Instant::now());
        info!("Hotplug settled, re-enumerating displays");
        on_settled();
    }
}

async fn follow<F: Fn()>(path: &Path, on_change: F) {
    loop {
        sleep(PASSIVE_POLL).await;

        let recent = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|elapsed| elapsed < PASSIVE_WINDOW);
        if recent {
            info!("Detected hotplug activity in another instance");
            on_change();
            sleep(PASSIVE_WINDOW).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_call() {
        let (tx, rx) = mpsc::channel(100);
        for _ in 0..5 {
            tx.try_send(()).unwrap();
        }
        drop(tx);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();
        coalesce(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= SETTLE_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_rate_limited() {
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            tx.send(()).await.unwrap();
            sleep(SETTLE_DELAY + Duration::from_millis(100)).await;
            tx.send(()).await.unwrap();
        });

        let times = Arc::new(Mutex::new(Vec::new()));
        let record = times.clone();
        coalesce(rx, move || record.lock().push(Instant::now())).await;

        let times = times.lock();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= RATE_LIMIT + SETTLE_DELAY);
    }

    #[test]
    fn test_second_instance_is_passive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotplug.lock");

        let owner = HotplugLock::acquire(&path).unwrap();
        assert!(matches!(owner, HotplugLock::Owner(_)));
        assert!(matches!(HotplugLock::acquire(&path).unwrap(), HotplugLock::Passive));

        drop(owner);
        assert!(matches!(HotplugLock::acquire(&path).unwrap(), HotplugLock::Owner(_)));
    }
}
