//! Dispatches workflow events to registered observers.
//!
//! Grounded in style on `examples/jdsingh122918-forge/src/hooks/manager.rs`'s
//! registry-of-handlers shape; the per-observer isolation itself is this crate's own
//! answer to §4.6's "observer exceptions are logged and do not disrupt the emitter or
//! other observers" requirement — observers here are plain trait objects rather than
//! subprocesses, so isolation means catching `panic::catch_unwind` around each call
//! rather than the exception handling the teacher's subprocess hooks use.

use std::panic::{self, AssertUnwindSafe};

use crate::collaborators::{Event, EventObserver};

#[derive(Default)]
pub struct EventEmitter {
    observers: Vec<Box<dyn EventObserver>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        EventEmitter { observers: Vec::new() }
    }

    pub fn register(&mut self, observer: Box<dyn EventObserver>) {
        self.observers.push(observer);
    }

    /// Dispatches `event` to every registered observer. A panicking observer is caught
    /// and logged; it never prevents the remaining observers from running.
    pub fn emit(&self, event: &Event) {
        for observer in &self.observers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event)));
            if result.is_err() {
                tracing::warn!(
                    event_type = ?event.event_type,
                    session_id = %event.session_id,
                    "event observer panicked; continuing with remaining observers"
                );
            }
        }
    }
}
