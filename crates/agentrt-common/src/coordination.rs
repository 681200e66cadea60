//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Coordination lock serialising registry mutations and driver calls."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The coordination lock.
//!
//! Every registry mutation, every call into a protocol driver and every child-asset
//! callback runs inside a labelled critical section of one [`Coordinator`]. The lock
//! is reentrant: a driver reporting its connection status from inside `connect`
//! re-enters the same section on the same thread without deadlocking.
//!
//! Drivers must not hold a section across I/O. Socket reads and timers run on their
//! own tasks and only enter the coordinator to hand over their results.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;
use tracing::{trace, warn};

use crate::time::duration_to_micros;

/// Serialising primitive shared by the runtime and every driver session.
pub struct Coordinator {
    lock: ReentrantMutex<()>,
    warn_threshold: Duration,
    sections: AtomicU64,
}

impl Coordinator {
    pub fn new(warn_threshold: Duration) -> Self {
        Self {
            lock: ReentrantMutex::new(()),
            warn_threshold,
            sections: AtomicU64::new(0),
        }
    }

    /// Run `f` inside the labelled critical section.
    pub fn with_lock<F>(&self, label: &str, f: F)
    where
        F: FnOnce(),
    {
        self.with_lock_returning(label, f)
    }

    /// Run `f` inside the labelled critical section and hand back its result.
    pub fn with_lock_returning<R, F>(&self, label: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let requested = Instant::now();
        let _guard = self.lock.lock();
        let acquired = Instant::now();
        self.sections.fetch_add(1, Ordering::Relaxed);
        trace!(
            label,
            wait_us = duration_to_micros(acquired - requested),
            "coordination section entered"
        );

        let result = f();

        let held = acquired.elapsed();
        if held > self.warn_threshold {
            warn!(
                label,
                held_us = duration_to_micros(held),
                threshold_us = duration_to_micros(self.warn_threshold),
                "coordination section held past threshold"
            );
        }
        result
    }

    /// Number of critical sections entered since construction, nested ones included.
    pub fn sections_entered(&self) -> u64 {
        self.sections.load(Ordering::Relaxed)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("warn_threshold", &self.warn_threshold)
            .field("sections", &self.sections_entered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn nested_sections_do_not_deadlock() {
        let coordinator = Coordinator::default();
        let value = coordinator.with_lock_returning("outer", || {
            coordinator.with_lock_returning("inner", || 41) + 1
        });
        assert_eq!(value, 42);
        assert_eq!(coordinator.sections_entered(), 2);
    }

    #[test]
    fn sections_serialise_across_threads() {
        let coordinator = Arc::new(Coordinator::default());
        let counter = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|id| {
                let coordinator = coordinator.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        coordinator.with_lock("worker", || {
                            counter.lock().push(id);
                            counter.lock().push(id);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let entries = counter.lock();
        assert_eq!(entries.len(), 400);
        for pair in entries.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }
}
