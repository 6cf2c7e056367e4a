// SPDX-License-Identifier: GPL-3.0-only
//! Stepped brightness/contrast transitions
//!
//! Each `(serial, property)` pair is either idle or has exactly one stepper
//! thread in flight. Starting a new transition takes the key over, stops the
//! running one, waits for its current write to finish, and continues from
//! the value that was really written last.
//!
//! Steppers run on their own threads because every step is a blocking
//! hardware round-trip (DDC/CI needs ~40ms between commands).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::display::Property;

/// Step budget for smooth transitions: a step that takes longer than this
/// makes the next steps bigger
pub const MAX_SMOOTH_STEP_TIME: Duration = Duration::from_millis(70);

/// Delay between single-unit steps of a slow transition
pub const SLOW_STEP_DELAY: Duration = Duration::from_millis(10);

/// Consecutive failed writes that abort a transition
pub const MAX_TRANSITION_FAULTS: u32 = 5;

/// How brightness/contrast changes are applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionPolicy {
    /// One write straight to the target
    Instant,
    /// Adaptive steps sized from observed write latency
    #[default]
    Smooth,
    /// Single-unit steps at a fixed interval
    Slow,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransitionKey {
    pub serial: String,
    pub property: Property,
}

impl TransitionKey {
    pub fn new(serial: impl Into<String>, property: Property) -> Self {
        Self {
            serial: serial.into(),
            property,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Completed,
    /// Superseded or stopped before reaching the target
    Cancelled,
    /// Gave up after [`MAX_TRANSITION_FAULTS`] consecutive failed writes
    Aborted,
}

/// Parameters of one transition
pub struct TransitionRequest {
    pub from: u16,
    pub to: u16,
    pub policy: TransitionPolicy,
    pub delay: Option<Duration>,
    pub on_start: Option<Box<dyn FnOnce() + Send>>,
}

impl TransitionRequest {
    pub fn new(from: u16, to: u16, policy: TransitionPolicy) -> Self {
        Self {
            from,
            to,
            policy,
            delay: None,
            on_start: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn on_start(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }
}

#[derive(Default)]
struct Completion {
    outcome: Mutex<Option<TransitionOutcome>>,
    done: Condvar,
}

impl Completion {
    fn finish(&self, outcome: TransitionOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> TransitionOutcome {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            self.done.wait(&mut outcome);
        }
        (*outcome).unwrap_or(TransitionOutcome::Cancelled)
    }
}

struct Flight {
    generation: u64,
    stop: Arc<AtomicBool>,
    last_written: Arc<Mutex<Option<u16>>>,
    completion: Arc<Completion>,
}

/// Handle to a started transition
pub struct TransitionHandle {
    from: u16,
    stop: Arc<AtomicBool>,
    completion: Arc<Completion>,
}

impl TransitionHandle {
    /// Value the transition actually started from after re-basing
    pub fn from(&self) -> u16 {
        self.from
    }

    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Block until the stepper finishes
    pub fn wait(&self) -> TransitionOutcome {
        self.completion.wait()
    }
}

#[derive(Clone, Default)]
pub struct TransitionEngine {
    flights: Arc<Mutex<HashMap<TransitionKey, Flight>>>,
    generation: Arc<AtomicU64>,
}

impl TransitionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, key: &TransitionKey) -> bool {
        self.flights.lock().contains_key(key)
    }

    /// Stop the transition for `key` and wait for its last write.
    ///
    /// Returns the value that transition actually wrote last, if any.
    pub fn stop(&self, key: &TransitionKey) -> Option<u16> {
        let flight = self.flights.lock().remove(key)?;
        flight.stop.store(true, Ordering::SeqCst);
        flight.completion.wait();
        let last = *flight.last_written.lock();
        last
    }

    /// Stop every transition of a display
    pub fn stop_display(&self, serial: &str) {
        let keys: Vec<_> = self
            .flights
            .lock()
            .keys()
            .filter(|k| k.serial == serial)
            .cloned()
            .collect();
        for key in keys {
            self.stop(&key);
        }
    }

    pub fn stop_all(&self) {
        let keys: Vec<_> = self.flights.lock().keys().cloned().collect();
        for key in keys {
            self.stop(&key);
        }
    }

    /// Start stepping from `request.from` to `request.to`.
    ///
    /// `write` performs one hardware write and reports whether it was
    /// accepted. `on_step` runs after every accepted write with the value
    /// written, on the stepper thread.
    pub fn smooth_transition<W, S>(
        &self,
        key: TransitionKey,
        request: TransitionRequest,
        write: W,
        on_step: S,
    ) -> TransitionHandle
    where
        W: FnMut(u16) -> bool + Send + 'static,
        S: FnMut(u16) + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let last_written = Arc::new(Mutex::new(None));
        let completion = Arc::new(Completion::default());

        // Claim the key before waiting, so a concurrent request supersedes
        // this one instead of running next to it
        let previous = self.flights.lock().insert(
            key.clone(),
            Flight {
                generation,
                stop: stop.clone(),
                last_written: last_written.clone(),
                completion: completion.clone(),
            },
        );

        let mut from = request.from;
        if let Some(previous) = previous {
            previous.stop.store(true, Ordering::SeqCst);
            previous.completion.wait();
            let last = *previous.last_written.lock();
            if let Some(last) = last {
                debug!(
                    serial = %key.serial,
                    property = %key.property,
                    stale_from = from,
                    from = last,
                    "Superseding in-flight transition"
                );
                from = last;
                // Whoever supersedes this flight before its first write
                // still rebases on the real hardware value
                let mut slot = last_written.lock();
                if slot.is_none() {
                    *slot = Some(last);
                }
            }
        }

        let handle = TransitionHandle {
            from,
            stop: stop.clone(),
            completion: completion.clone(),
        };

        let flights = self.flights.clone();
        let thread_key = key.clone();
        let TransitionRequest {
            to,
            policy,
            delay,
            on_start,
            ..
        } = request;

        let job = move || {
            if let Some(on_start) = on_start.filter(|_| !stop.load(Ordering::SeqCst)) {
                on_start();
            }
            let outcome = run_steps(from, to, policy, delay, &stop, &last_written, write, on_step);
            {
                let mut flights = flights.lock();
                if flights
                    .get(&thread_key)
                    .is_some_and(|f| f.generation == generation)
                {
                    flights.remove(&thread_key);
                }
            }
            completion.finish(outcome);
        };

        let spawned = std::thread::Builder::new()
            .name(format!("transition-{}-{}", key.serial, key.property))
            .spawn(job);
        if let Err(e) = spawned {
            // Nothing ran: release the slot so the next request can proceed
            error!("Failed to spawn transition thread: {}", e);
            let mut flights = self.flights.lock();
            if flights.get(&key).is_some_and(|f| f.generation == generation) {
                flights.remove(&key);
            }
            drop(flights);
            handle.completion.finish(TransitionOutcome::Aborted);
        }

        handle
    }
}

/// Toggle the per-display slow-write flag from an observed write latency
pub fn check_slow_write(slow_write: &mut bool, elapsed: Duration) {
    if !*slow_write && elapsed > MAX_SMOOTH_STEP_TIME * 2 {
        *slow_write = true;
    } else if *slow_write && elapsed < MAX_SMOOTH_STEP_TIME * 2 {
        *slow_write = false;
    }
}

#[allow(clippy::too_many_arguments)]
fn run_steps<W, S>(
    from: u16,
    to: u16,
    policy: TransitionPolicy,
    delay: Option<Duration>,
    stop: &AtomicBool,
    last_written: &Mutex<Option<u16>>,
    mut write: W,
    mut on_step: S,
) -> TransitionOutcome
where
    W: FnMut(u16) -> bool,
    S: FnMut(u16),
{
    let mut emit = |value: u16, faults: &mut u32| -> bool {
        if write(value) {
            *faults = 0;
            *last_written.lock() = Some(value);
            on_step(value);
            true
        } else {
            *faults += 1;
            false
        }
    };
    let mut faults = 0u32;

    if from == to || policy == TransitionPolicy::Instant {
        if stop.load(Ordering::SeqCst) {
            return TransitionOutcome::Cancelled;
        }
        return if emit(to, &mut faults) {
            TransitionOutcome::Completed
        } else {
            TransitionOutcome::Aborted
        };
    }

    let target = to as i32;
    let direction = if to > from { 1 } else { -1 };
    let mut current = from as i32;
    let mut step = 1i32;
    let pause = match policy {
        TransitionPolicy::Slow => Some(delay.unwrap_or(SLOW_STEP_DELAY)),
        _ => delay,
    };

    while current != target {
        if stop.load(Ordering::SeqCst) {
            return TransitionOutcome::Cancelled;
        }

        let next = if direction > 0 {
            (current + step).min(target)
        } else {
            (current - step).max(target)
        };

        let started = Instant::now();
        let accepted = emit(next as u16, &mut faults);
        let elapsed = started.elapsed();
        if !accepted && faults >= MAX_TRANSITION_FAULTS {
            warn!(
                from,
                to,
                at = next,
                "Aborting transition after {} consecutive failed writes",
                faults
            );
            return TransitionOutcome::Aborted;
        }
        current = next;

        if policy == TransitionPolicy::Smooth {
            let ratio = elapsed.as_nanos() / MAX_SMOOTH_STEP_TIME.as_nanos();
            step = ratio.clamp(1, 100) as i32;
        }
        if let Some(pause) = pause {
            if current != target {
                std::thread::sleep(pause);
            }
        }
    }

    if faults == 0 {
        TransitionOutcome::Completed
    } else {
        TransitionOutcome::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn recorder() -> (Arc<Mutex<Vec<u16>>>, impl FnMut(u16) -> bool + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |v| {
            sink.lock().push(v);
            true
        })
    }

    #[test]
    fn test_instant_is_single_write() {
        let engine = TransitionEngine::new();
        let (log, write) = recorder();
        let handle = engine.smooth_transition(
            TransitionKey::new("A", Property::Brightness),
            TransitionRequest::new(10, 80, TransitionPolicy::Instant),
            write,
            |_| {},
        );
        assert_eq!(handle.wait(), TransitionOutcome::Completed);
        assert_eq!(*log.lock(), vec![80]);
    }

    #[test]
    fn test_smooth_steps_reach_target_monotonically() {
        let engine = TransitionEngine::new();
        let (log, write) = recorder();
        let steps = Arc::new(Mutex::new(Vec::new()));
        let seen = steps.clone();
        let handle = engine.smooth_transition(
            TransitionKey::new("A", Property::Brightness),
            TransitionRequest::new(60, 40, TransitionPolicy::Smooth),
            write,
            move |v| seen.lock().push(v),
        );
        assert_eq!(handle.wait(), TransitionOutcome::Completed);

        let log = log.lock().clone();
        assert_eq!(log.last(), Some(&40));
        assert!(log.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(*steps.lock(), log);
        assert!(!engine.is_in_flight(&TransitionKey::new("A", Property::Brightness)));
    }

    #[test]
    fn test_aborts_after_five_failed_writes() {
        let engine = TransitionEngine::new();
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let handle = engine.smooth_transition(
            TransitionKey::new("A", Property::Contrast),
            TransitionRequest::new(0, 100, TransitionPolicy::Smooth),
            move |_| {
                *counter.lock() += 1;
                false
            },
            |_| panic!("no step may be reported for a rejected write"),
        );
        assert_eq!(handle.wait(), TransitionOutcome::Aborted);
        assert_eq!(*attempts.lock(), MAX_TRANSITION_FAULTS);
    }

    #[test]
    fn test_new_transition_rebases_on_last_written_value() {
        let engine = TransitionEngine::new();
        let key = TransitionKey::new("A", Property::Brightness);
        let log_a = Arc::new(Mutex::new(Vec::new()));
        let sink_a = log_a.clone();

        let first = engine.smooth_transition(
            key.clone(),
            TransitionRequest::new(0, 100, TransitionPolicy::Slow)
                .with_delay(Duration::from_millis(5)),
            move |v| {
                sink_a.lock().push(v);
                true
            },
            |_| {},
        );
        std::thread::sleep(Duration::from_millis(40));

        let (log_b, write_b) = recorder();
        // Caller still believes the display is at the stale original value
        let second = engine.smooth_transition(
            key.clone(),
            TransitionRequest::new(0, 50, TransitionPolicy::Instant),
            write_b,
            |_| {},
        );

        assert_eq!(first.wait(), TransitionOutcome::Cancelled);
        let last_a = *log_a.lock().last().unwrap();
        assert!(last_a > 0);
        assert_eq!(second.from(), last_a);
        assert_eq!(second.wait(), TransitionOutcome::Completed);
        assert_eq!(*log_b.lock(), vec![50]);
    }

    fn counting_writer(
        active: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    ) -> impl FnMut(u16) -> bool + Send + 'static {
        move |_| {
            let writers = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(writers, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            active.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_concurrent_requests_keep_one_writer_per_key() {
        let engine = TransitionEngine::new();
        let key = TransitionKey::new("A", Property::Brightness);
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let first = engine.smooth_transition(
            key.clone(),
            TransitionRequest::new(0, 100, TransitionPolicy::Slow)
                .with_delay(Duration::from_millis(5)),
            counting_writer(active.clone(), peak.clone()),
            |_| {},
        );
        std::thread::sleep(Duration::from_millis(20));

        let racers: Vec<_> = [30u16, 90]
            .into_iter()
            .map(|to| {
                let engine = engine.clone();
                let key = key.clone();
                let write = counting_writer(active.clone(), peak.clone());
                std::thread::spawn(move || {
                    engine.smooth_transition(
                        key,
                        TransitionRequest::new(0, to, TransitionPolicy::Slow)
                            .with_delay(Duration::from_millis(2)),
                        write,
                        |_| {},
                    )
                })
            })
            .collect();
        let handles: Vec<_> = racers.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(first.wait(), TransitionOutcome::Cancelled);
        let outcomes: Vec<_> = handles.iter().map(|h| h.wait()).collect();
        assert!(outcomes.contains(&TransitionOutcome::Completed), "{outcomes:?}");
        assert!(handles.iter().all(|h| h.from() > 0));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!engine.is_in_flight(&key));
    }

    #[test]
    fn test_stop_returns_last_written() {
        let engine = TransitionEngine::new();
        let key = TransitionKey::new("B", Property::Brightness);
        let (log, write) = recorder();
        let handle = engine.smooth_transition(
            key.clone(),
            TransitionRequest::new(0, 100, TransitionPolicy::Slow)
                .with_delay(Duration::from_millis(5)),
            write,
            |_| {},
        );
        std::thread::sleep(Duration::from_millis(30));
        let last = engine.stop(&key);
        assert_eq!(handle.wait(), TransitionOutcome::Cancelled);
        assert_eq!(last, log.lock().last().copied());
        assert!(engine.stop(&key).is_none());
    }

    #[test]
    fn test_on_start_runs_before_first_write() {
        let engine = TransitionEngine::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let handle = engine.smooth_transition(
            TransitionKey::new("C", Property::Brightness),
            TransitionRequest::new(1, 3, TransitionPolicy::Smooth)
                .on_start(move || o1.lock().push("start")),
            move |_| {
                o2.lock().push("write");
                true
            },
            |_| {},
        );
        handle.wait();
        assert_eq!(order.lock().first(), Some(&"start"));
    }

    #[test]
    fn test_check_slow_write_toggles() {
        let mut slow = false;
        check_slow_write(&mut slow, Duration::from_millis(200));
        assert!(slow);
        check_slow_write(&mut slow, Duration::from_millis(20));
        assert!(!slow);
    }
}
