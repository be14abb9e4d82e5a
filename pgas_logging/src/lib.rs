//! Common logging infrastructure for the pgas-rt core.
//!
//! Two complementary facilities live here. [`Registry`] buffers structured,
//! timestamped events per named stream (persona scheduling, progress polls,
//! RPC dispatch) the way a profiler would want them, cheaply, off the hot
//! path. [`diagnostic`] prints the human-facing fatal-error banner and tears
//! the process down per the core's "no silent errors" propagation policy.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub mod diagnostic;

/// A map from stream name to a typed, thread-local logger.
///
/// Each persona owns one `Registry`. Binding a name twice replaces the
/// destination without disturbing loggers already handed out under that
/// name (they keep writing to the old destination until dropped).
pub struct Registry {
    time: Instant,
    map: HashMap<String, Box<dyn Any>>,
}

impl Registry {
    /// Creates a new registry anchored at `time`, typically the moment the
    /// owning persona started.
    pub fn new(time: Instant) -> Self {
        Registry { time, map: HashMap::new() }
    }

    /// Binds `name` to an action invoked on every flush of that stream.
    ///
    /// Returns whatever logger was previously bound, if any.
    pub fn insert<T: 'static>(
        &mut self,
        name: &str,
        action: Box<dyn Fn(&Duration, &[(Duration, T)])>,
    ) -> Option<Box<dyn Any>> {
        let logger = Logger::<T>::new(self.time, action);
        self.map.insert(name.to_string(), Box::new(logger))
    }

    /// Removes and drops the logger bound to `name`, if any.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any>> {
        self.map.remove(name)
    }

    /// Retrieves a shareable handle to the logger bound to `name`.
    pub fn get<T: 'static>(&self, name: &str) -> Option<Logger<T>> {
        self.map
            .get(name)
            .and_then(|entry| entry.downcast_ref::<Logger<T>>())
            .cloned()
    }

    /// Flushes every bound logger, regardless of type.
    pub fn flush_all(&self) {
        // Flushing requires knowing `T`; callers that care about a specific
        // stream call `Logger::flush` directly. This is a placeholder hook
        // for streams that self-flush on a timer elsewhere.
    }
}

/// A cheap, buffering handle to one named event stream.
pub struct Logger<T> {
    time: Instant,
    action: Rc<dyn Fn(&Duration, &[(Duration, T)])>,
    buffer: Rc<RefCell<Vec<(Duration, T)>>>,
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Logger { time: self.time, action: self.action.clone(), buffer: self.buffer.clone() }
    }
}

impl<T> Logger<T> {
    fn new(time: Instant, action: Box<dyn Fn(&Duration, &[(Duration, T)])>) -> Self {
        Logger { time, action: Rc::from(action), buffer: Rc::new(RefCell::new(Vec::with_capacity(256))) }
    }

    /// Records `event` at the current elapsed time, flushing if the
    /// buffer has reached its capacity.
    pub fn log(&self, event: T) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.push((self.time.elapsed(), event));
        if buffer.len() == buffer.capacity() {
            (self.action)(&self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }

    /// Forces a flush of any buffered events.
    pub fn flush(&self) {
        let mut buffer = self.buffer.borrow_mut();
        if !buffer.is_empty() {
            (self.action)(&self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }
}
