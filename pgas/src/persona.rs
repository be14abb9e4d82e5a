//! Execution contexts and thread-local persona stacks (design doc §4.D).
//!
//! A persona owns two levels of LPC queue (internal, user) and the list of
//! in-flight handle-callbacks (HCBs) bound to outstanding transport
//! handles. It may be *active on* at most one thread at a time; other
//! threads may enqueue LPCs onto it (through a concurrent mailbox that the
//! progress engine folds into the local queue before draining) but must
//! never run its queues directly — that is reserved for whichever thread
//! currently has it on top of its persona stack.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

use pgas_transport::{EventHandle, Transport};
use smallvec::SmallVec;

use crate::queue::{ConcurrentFifo, Executable, Record, SingleWriterFifo};

/// Outcome of one attempt at a [`Persona::defer_with_transport`] entry.
pub enum Deferred {
    /// The work is finished; drop it.
    Done,
    /// Not ready yet; try again on this persona's next progress tick.
    Retry(Box<dyn FnOnce(&dyn Transport) -> Deferred>),
}

/// The two levels at which an LPC or a progress drain may operate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressLevel {
    /// Drains only the internal queue; used while discharging outstanding
    /// remote-completion obligations before finalize.
    Internal,
    /// Drains both the internal and user queues.
    User,
}

struct Hcb {
    handle: EventHandle,
    on_ready: Option<Record>,
    /// `remote_cx`, if this HCB has one bound: unlike `on_ready` (an
    /// [`Executable`], which never sees the transport), this runs with
    /// [`poll_hcbs`](Persona::poll_hcbs)'s own `&dyn Transport` so it can
    /// inject the tiny wire message `remote_cx` sinks need (design doc
    /// §4.H). Kept separate from `on_ready` rather than widening
    /// `Executable` itself, since every other `Executable` in this crate
    /// (plain LPCs, dormant continuations) never needs a transport.
    remote_cx: Option<Box<dyn FnOnce(&dyn Transport)>>,
}

/// Structured progress-engine events, handed to whatever
/// [`pgas_logging::Logger<ProgressEvent>`] a persona has bound via
/// [`Persona::set_logger`]. Mirrors how the teacher's own workers log
/// scheduling events without coupling the progress engine to any
/// particular sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// An in-flight HCB's transport handle was observed ready and its
    /// bound completion ran.
    HcbFired(EventHandle),
    /// A queue drain at `level` ran `count` LPCs (zero-count drains are not
    /// logged).
    LpcDrained { level: ProgressLevel, count: usize },
    /// The undischarged-remote-completion counter moved by `delta`
    /// (`+1` on open, `-1` on close).
    RemoteObligation { delta: i8 },
}

/// An execution context: LPC queues plus in-flight HCBs.
///
/// Reached through `Arc` so other threads can hold a reference long enough
/// to call [`Persona::enqueue_remote`]; every other method is documented as
/// callable only from the thread this persona is currently active on.
pub struct Persona {
    rank: usize,
    is_master: bool,
    internal_local: RefCell<SingleWriterFifo>,
    user_local: RefCell<SingleWriterFifo>,
    internal_remote: ConcurrentFifo,
    user_remote: ConcurrentFifo,
    hcbs: RefCell<Vec<Hcb>>,
    undischarged_remote: Cell<u64>,
    logger: RefCell<Option<pgas_logging::Logger<ProgressEvent>>>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce(&dyn Transport) -> Deferred>>>,
}

// SAFETY: the fields above are either `Sync` already (`ConcurrentFifo`,
// `Cell<u64>`'s reads under the invariant below) or are `RefCell`s that
// this module's public API only ever mutates from the thread the persona
// is currently active on (enforced by `Persona` only being reachable for
// mutation through `activate`'s stack discipline). A non-owning thread can
// only reach `enqueue_remote`, which never touches the `RefCell` fields.
// `logger` holds an `Rc`-based `pgas_logging::Logger`, which is why
// `Persona` is never given a `Send` impl alongside this one: nothing here
// needs to move a `Persona` between threads, only to share `&Persona`
// behind an `Arc`.
unsafe impl Sync for Persona {}

impl Persona {
    /// Creates a fresh persona for `rank`. `is_master` marks the one
    /// persona per process permitted to issue collective/transport-global
    /// calls.
    pub fn new(rank: usize, is_master: bool) -> Arc<Persona> {
        Arc::new(Persona {
            rank,
            is_master,
            internal_local: RefCell::new(SingleWriterFifo::new()),
            user_local: RefCell::new(SingleWriterFifo::new()),
            internal_remote: ConcurrentFifo::new(),
            user_remote: ConcurrentFifo::new(),
            hcbs: RefCell::new(Vec::new()),
            undischarged_remote: Cell::new(0),
            logger: RefCell::new(None),
            deferred: RefCell::new(VecDeque::new()),
        })
    }

    /// Binds `logger` as this persona's progress-event sink, replacing any
    /// logger bound previously. Purely diagnostic: nothing in the progress
    /// engine's behavior depends on whether a logger is bound.
    pub fn set_logger(&self, logger: pgas_logging::Logger<ProgressEvent>) {
        *self.logger.borrow_mut() = Some(logger);
    }

    pub(crate) fn log(&self, event: ProgressEvent) {
        if let Some(logger) = self.logger.borrow().as_ref() {
            logger.log(event);
        }
    }

    /// The rank this persona belongs to.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// `true` for the one persona per process permitted to make
    /// collective or transport-global calls.
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// Schedules `record` on this persona's queue at `level`, from the
    /// thread currently driving this persona (including reentrantly, from
    /// within a record that is itself running).
    pub fn enqueue_local(&self, level: ProgressLevel, record: Record) {
        match level {
            ProgressLevel::Internal => self.internal_local.borrow_mut().enqueue(record),
            ProgressLevel::User => self.user_local.borrow_mut().enqueue(record),
        }
    }

    /// Schedules `record` on this persona from a thread that does not (and
    /// may never) have this persona active. The record is observed by the
    /// owning thread's next progress drain, not run here.
    pub fn enqueue_remote(&self, level: ProgressLevel, record: Record) {
        match level {
            ProgressLevel::Internal => self.internal_remote.push(record),
            ProgressLevel::User => self.user_remote.push(record),
        }
    }

    /// Registers a handle-callback: when `handle` is observed ready by the
    /// progress engine, `on_ready` runs exactly once.
    pub fn add_hcb(&self, handle: EventHandle, on_ready: Record) {
        self.hcbs.borrow_mut().push(Hcb { handle, on_ready: Some(on_ready), remote_cx: None });
    }

    /// Like [`Self::add_hcb`], but additionally runs `remote_cx` once
    /// `handle` is observed ready, with the transport the progress engine
    /// polled it through — for completions that need to send a message
    /// rather than just run locally (design doc §4.H's `remote_cx`).
    pub fn add_hcb_with_remote_cx(&self, handle: EventHandle, on_ready: Record, remote_cx: Box<dyn FnOnce(&dyn Transport)>) {
        self.hcbs.borrow_mut().push(Hcb { handle, on_ready: Some(on_ready), remote_cx: Some(remote_cx) });
    }

    /// Number of HCBs still awaiting transport completion.
    pub fn hcb_count(&self) -> usize {
        self.hcbs.borrow().len()
    }

    /// `true` iff this persona has user-level work, internal-level work,
    /// in-flight HCBs, undischarged remote-completion obligations, or
    /// deferred transport work still waiting to retry.
    pub fn progress_required(&self) -> bool {
        !self.user_local.borrow().is_empty()
            || !self.user_remote.is_empty()
            || !self.internal_local.borrow().is_empty()
            || !self.internal_remote.is_empty()
            || !self.hcbs.borrow().is_empty()
            || self.undischarged_remote.get() > 0
            || !self.deferred.borrow().is_empty()
    }

    /// Queues `f` to run against the transport on this persona's next
    /// progress tick. If `f` returns [`Deferred::Retry`], the replacement
    /// closure it carries is queued again instead — the mechanism a
    /// completion that must keep checking some condition (rather than wait
    /// on a single transport handle, what [`Self::add_hcb`] is for) uses to
    /// "block" without actually stalling the thread driving progress.
    pub fn defer_with_transport(&self, f: Box<dyn FnOnce(&dyn Transport) -> Deferred>) {
        self.deferred.borrow_mut().push_back(f);
    }

    /// Runs every deferred entry once against `transport`, re-queuing any
    /// that asks to retry. Entries queued by a `Retry` are not visited
    /// again in this same call, so a continuously-retrying entry cannot
    /// spin this call forever.
    pub(crate) fn drain_deferred(&self, transport: &dyn Transport) -> usize {
        let pending: Vec<_> = self.deferred.borrow_mut().drain(..).collect();
        let ran = pending.len();
        for f in pending {
            match f(transport) {
                Deferred::Done => {}
                Deferred::Retry(next) => self.deferred.borrow_mut().push_back(next),
            }
        }
        ran
    }

    /// Increments the undischarged-remote-completion counter by one. Called
    /// when an operation's bundle requests a `remote_cx` completion.
    pub fn remote_obligation_opened(&self) {
        self.undischarged_remote.set(self.undischarged_remote.get() + 1);
        self.log(ProgressEvent::RemoteObligation { delta: 1 });
    }

    /// Decrements the undischarged-remote-completion counter by one.
    /// Called once the AM carrying the remote-state has been injected.
    pub fn remote_obligation_closed(&self) {
        let n = self.undischarged_remote.get();
        debug_assert!(n > 0, "remote obligation closed without a matching open");
        self.undischarged_remote.set(n.saturating_sub(1));
        self.log(ProgressEvent::RemoteObligation { delta: -1 });
    }

    /// Folds any mailbox entries pushed by other threads into this
    /// persona's local queues. Called by the progress engine before
    /// draining, from the thread this persona is active on.
    pub(crate) fn absorb_remote_queues(&self) {
        while let Some(record) = self.internal_remote.pop_front() {
            self.internal_local.borrow_mut().enqueue(record);
        }
        while let Some(record) = self.user_remote.pop_front() {
            self.user_local.borrow_mut().enqueue(record);
        }
    }

    pub(crate) fn internal_queue(&self) -> &RefCell<SingleWriterFifo> {
        &self.internal_local
    }

    pub(crate) fn user_queue(&self) -> &RefCell<SingleWriterFifo> {
        &self.user_local
    }

    /// Tests every in-flight HCB against the transport, running (and
    /// removing) every one that has become ready. Returns the number that
    /// fired.
    pub(crate) fn poll_hcbs(&self, transport: &dyn pgas_transport::Transport) -> usize {
        let mut ready = Vec::new();
        {
            let mut hcbs = self.hcbs.borrow_mut();
            let mut i = 0;
            while i < hcbs.len() {
                if transport.event_test(hcbs[i].handle) {
                    let entry = hcbs.swap_remove(i);
                    ready.push(entry);
                } else {
                    i += 1;
                }
            }
        }
        let fired = ready.len();
        for mut entry in ready {
            self.log(ProgressEvent::HcbFired(entry.handle));
            if let Some(record) = entry.on_ready.take() {
                record.execute_and_delete();
            }
            if let Some(remote_cx) = entry.remote_cx.take() {
                remote_cx(transport);
            }
        }
        fired
    }
}

/// Thread-local stack of personas this thread currently has active, the
/// top of which receives LPCs scheduled from this thread and governs
/// `progress_required`.
pub struct PersonaScope;

thread_local! {
    // Most call sites nest at most a handful of personas (the master plus
    // whatever `DistObject`/team helper briefly activates something else);
    // `SmallVec` keeps that common case off the heap entirely, the same
    // tradeoff the original makes for its own small, usually-shallow
    // activation stack.
    static PERSONA_STACK: RefCell<SmallVec<[Arc<Persona>; 4]>> = RefCell::new(SmallVec::new());
}

impl PersonaScope {
    /// Pushes `persona` onto this thread's stack, returning a guard that
    /// pops it on drop.
    pub fn activate(persona: Arc<Persona>) -> PersonaGuard {
        PERSONA_STACK.with(|stack| stack.borrow_mut().push(persona));
        PersonaGuard { _private: () }
    }

    /// The persona on top of this thread's stack, if any.
    pub fn top() -> Option<Arc<Persona>> {
        PERSONA_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Every persona on this thread's stack, top first.
    pub fn stack() -> Vec<Arc<Persona>> {
        PERSONA_STACK.with(|stack| stack.borrow().iter().rev().cloned().collect())
    }

    /// `true` iff `persona` is this thread's innermost active persona.
    pub fn active_with_caller(persona: &Persona) -> bool {
        PERSONA_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|top| std::ptr::eq(top.as_ref(), persona))
                .unwrap_or(false)
        })
    }
}

/// RAII guard popping its persona off the thread-local stack on drop.
pub struct PersonaGuard {
    _private: (),
}

impl Drop for PersonaGuard {
    fn drop(&mut self) {
        PERSONA_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
