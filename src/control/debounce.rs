// SPDX-License-Identifier: GPL-3.0-only
//! Coalescing of rapid repeated writes
//!
//! The first submission for a key opens a window; later submissions inside
//! that window only replace the pending value. When the window closes the
//! most recent value is emitted exactly once. Superseded values are dropped,
//! never queued.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::task::run_after;

/// Window used for slider/scroll driven brightness and contrast writes
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

type Action<V> = Box<dyn FnOnce(V) + Send>;

pub struct Debouncer<K, V> {
    window: Duration,
    pending: Arc<Mutex<HashMap<K, (V, Action<V>)>>>,
}

impl<K, V> Clone for Debouncer<K, V> {
    fn clone(&self) -> Self {
        Self {
            window: self.window,
            pending: self.pending.clone(),
        }
    }
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit `value` for `key`; `action` runs with the last value of the window
    pub fn submit<F>(&self, key: K, value: V, action: F)
    where
        F: FnOnce(V) + Send + 'static,
    {
        let opened = {
            let mut pending = self.pending.lock();
            pending.insert(key.clone(), (value, Box::new(action))).is_none()
        };
        if !opened {
            return;
        }

        let pending = self.pending.clone();
        run_after(self.window, move || {
            let entry = pending.lock().remove(&key);
            if let Some((value, action)) = entry {
                action(value);
            }
        });
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Drop every pending value without emitting it
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::Property;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_emits_last_value_once() {
        let debouncer = Debouncer::new(DEBOUNCE_WINDOW);
        let writes = Arc::new(Mutex::new(Vec::new()));

        for value in [10u16, 20, 30, 45] {
            let writes = writes.clone();
            debouncer.submit(("A".to_string(), Property::Brightness), value, move |v| {
                writes.lock().push(v)
            });
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(*writes.lock(), vec![45]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_keys_are_independent() {
        let debouncer = Debouncer::new(DEBOUNCE_WINDOW);
        let writes = Arc::new(Mutex::new(Vec::new()));

        for (serial, property, value) in [
            ("A", Property::Brightness, 1u16),
            ("A", Property::Contrast, 2),
            ("B", Property::Brightness, 3),
            ("A", Property::Brightness, 4),
        ] {
            let writes = writes.clone();
            debouncer.submit((serial.to_string(), property), value, move |v| {
                writes.lock().push((serial, property, v))
            });
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut got = writes.lock().clone();
        got.sort();
        assert_eq!(
            got,
            vec![
                ("A", Property::Brightness, 4),
                ("A", Property::Contrast, 2),
                ("B", Property::Brightness, 3),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_window_after_emit() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let key = ("A".to_string(), Property::Brightness);

        let w = writes.clone();
        debouncer.submit(key.clone(), 1u16, move |v| w.lock().push(v));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!debouncer.is_pending(&key));

        let w = writes.clone();
        debouncer.submit(key.clone(), 2u16, move |v| w.lock().push(v));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(*writes.lock(), vec![1, 2]);
    }
}
