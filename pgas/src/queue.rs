//! Intrusive FIFOs of executable records (design doc §4.C).
//!
//! Two shapes, both over a boxed trait object that knows how to run itself
//! exactly once and then drop itself — `Executable::execute_and_delete`
//! stands in for the original's `vtbl.execute_and_delete` pointer, with
//! Rust's vtable doing the dispatch instead of a hand-rolled one.
//!
//! [`SingleWriterFifo`] is owned outright by one persona and is only ever
//! touched from the thread that persona is active on: no synchronization.
//! [`ConcurrentFifo`] is the cross-thread path — any thread may enqueue an
//! LPC onto a persona it does not own; only the owning thread ever drains
//! it, matching the "others may enqueue but not execute" invariant.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A record that can be run exactly once, consuming itself.
pub trait Executable {
    /// Runs this record's effect and conceptually deletes it (in Rust: the
    /// `Box` is simply dropped after this returns).
    fn execute_and_delete(self: Box<Self>);
}

/// One entry in a queue: an opaque `Executable` plus nothing else, since
/// Rust's `Box<dyn Trait>` already carries the vtable the original stored
/// inline.
pub type Record = Box<dyn Executable>;

/// Single-producer, single-consumer FIFO owned by one persona.
///
/// `burst(n)` drains up to `n` entries, running each in enqueue order.
#[derive(Default)]
pub struct SingleWriterFifo {
    entries: VecDeque<Record>,
}

impl SingleWriterFifo {
    /// An empty queue.
    pub fn new() -> Self {
        SingleWriterFifo { entries: VecDeque::new() }
    }

    /// Enqueues `record` at the tail.
    pub fn enqueue(&mut self, record: Record) {
        self.entries.push_back(record);
    }

    /// `true` iff no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pops the head entry without running it, if any. Exposed so a caller
    /// that reaches this queue through a `RefCell` (the persona progress
    /// loop does) can pop-and-release-the-borrow before running the
    /// record, which is what lets the record re-enter and push a new
    /// entry onto this same queue without a runtime borrow panic.
    pub fn pop_front(&mut self) -> Option<Record> {
        self.entries.pop_front()
    }

    /// Runs up to `n` queued entries, in FIFO order. Returns the number
    /// actually run (fewer than `n` if the queue emptied first).
    pub fn burst(&mut self, n: usize) -> usize {
        let mut ran = 0;
        while ran < n {
            match self.entries.pop_front() {
                Some(record) => {
                    record.execute_and_delete();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Drains the whole queue, including entries enqueued by records that
    /// ran during this call — matching the progress engine's "drain fully"
    /// step, which must observe re-entrant enqueues in the same pass.
    pub fn drain_fully(&mut self) -> usize {
        let mut ran = 0;
        while let Some(record) = self.entries.pop_front() {
            record.execute_and_delete();
            ran += 1;
        }
        ran
    }
}

/// Multi-producer, single-consumer FIFO for cross-thread LPC delivery.
///
/// Any thread may call [`Self::push`]; only the thread draining it (the
/// persona's active thread) may call [`Self::drain_fully`].
#[derive(Default)]
pub struct ConcurrentFifo {
    entries: Mutex<VecDeque<Record>>,
}

// SAFETY: `Record = Box<dyn Executable>` is not `Send` by default — some
// records close over `Rc`-based state (`Promise<T>`, persona-local future
// internals) whose refcount is not atomic. That's sound here because a
// `Record` is handed across threads by exclusive move through `push`: the
// pushing thread retains no clone of anything inside it, and exactly one
// consumer thread (the persona's owner, draining via `drain_fully`) ever
// touches it afterward. The non-atomic refcounts inside a record are never
// observed from two threads at once, only handed off between them.
unsafe impl Send for ConcurrentFifo {}
unsafe impl Sync for ConcurrentFifo {}

impl ConcurrentFifo {
    /// An empty queue.
    pub fn new() -> Self {
        ConcurrentFifo { entries: Mutex::new(VecDeque::new()) }
    }

    /// Enqueues `record` at the tail. Safe to call from any thread.
    pub fn push(&self, record: Record) {
        self.entries.lock().unwrap().push_back(record);
    }

    /// `true` iff no entries are queued, as observed at the instant of the
    /// call.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Pops the head entry without running it, if any. Lets a caller that
    /// wants to move entries into a different queue (rather than execute
    /// them in place) do so, e.g. folding a persona's cross-thread mailbox
    /// into its same-thread queue before draining that instead.
    pub fn pop_front(&self) -> Option<Record> {
        self.entries.lock().unwrap().pop_front()
    }

    /// Drains every entry queued at the moment of the call, running each.
    /// Entries pushed concurrently by other threads during the drain may
    /// or may not be observed; callers that need a stronger guarantee
    /// call this in a loop until it reports zero.
    pub fn drain_fully(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.entries.lock().unwrap().pop_front();
            match next {
                Some(record) => {
                    record.execute_and_delete();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }
}
