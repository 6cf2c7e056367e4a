// SPDX-License-Identifier: GPL-3.0-only
//! Scoped background tasks
//!
//! [`PeriodicTask`] runs a blocking tick on a fixed interval and is cancelled
//! when dropped. Ticks are single-flight: if the previous tick is still
//! running when the interval fires again, the new tick is skipped rather than
//! queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct PeriodicTask {
    name: String,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `interval` on the current tokio runtime.
    ///
    /// Returns `None` when called outside a runtime.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, tick: F) -> Option<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(task = %name, "No async runtime, periodic task not started");
                return None;
            }
        };

        let tick = Arc::new(tick);
        let busy = Arc::new(AtomicBool::new(false));
        let task_name = name.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick of a tokio interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if busy.swap(true, Ordering::SeqCst) {
                    debug!(task = %task_name, "Previous tick still running, skipping");
                    continue;
                }
                let tick = tick.clone();
                let busy = busy.clone();
                tokio::task::spawn_blocking(move || {
                    tick();
                    busy.store(false, Ordering::SeqCst);
                });
            }
        });

        debug!(task = %name, ?interval, "Periodic task started");
        Some(Self { name, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
        debug!(task = %self.name, "Periodic task stopped");
    }
}

/// Run the blocking `f` once after `delay`.
///
/// Uses the tokio runtime when there is one, a plain thread otherwise.
pub fn run_after<F>(delay: Duration, f: F)
where
    F: FnOnce() + Send + 'static,
{
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = tokio::task::spawn_blocking(f).await {
                    error!("Delayed task failed: {}", e);
                }
            });
        }
        Err(_) => {
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                f();
            });
        }
    }
}
