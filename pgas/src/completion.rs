//! Completion bundles (design doc §4.H): a declarative set of
//! *(event, sink)* pairs attached to an RMA or RPC submission.
//!
//! Three events exist — `source_cx` (the caller's buffer is safe to
//! reuse), `operation_cx` (the operation is observably complete on the
//! initiator), `remote_cx` (the operation is observably complete on the
//! peer) — and each may be bound to any number of sinks. [`rma`] and
//! [`rpc`] build a [`CompletionBundle`] at submission time and call
//! [`CompletionBundle::fire_operation`] / [`fire_source`][Self::fire_source]
//! once the transport reports the corresponding event; `remote_cx` sinks
//! are fired by the peer, not this process (see [`crate::rpc`]).
//!
//! [`Self::fire_source`]: CompletionBundle::fire_source

use std::sync::Arc;

use pgas_transport::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::future::Promise;
use crate::persona::{Persona, ProgressLevel};
use crate::queue::{Executable, Record};

/// One completion sink bound to a single event.
pub enum Sink<T: Clone + 'static> {
    /// Fulfills a promise whose future the caller (or `CompletionBundle`'s
    /// `as_future` constructor) already holds a reference to.
    Fulfill(Promise<T>),
    /// Enqueues `f` on `persona` at `level`, with the event's value.
    Lpc { persona: Arc<Persona>, level: ProgressLevel, f: Box<dyn FnOnce(T)> },
    /// `remote_cx` only: sends an active message carrying the value to a
    /// peer, built by the caller (typically [`crate::rpc`]'s remote-state
    /// encoder).
    Rpc(Box<dyn FnOnce(&dyn Transport, T)>),
}

impl<T: Clone + 'static> Sink<T> {
    fn fire(self, value: T, transport: &dyn Transport) {
        match self {
            Sink::Fulfill(promise) => promise.fulfill_result(value),
            Sink::Lpc { persona, level, f } => {
                let record: Record = Box::new(LpcRecord { f: Some(f), value: Some(value) });
                persona.enqueue_remote(level, record);
            }
            Sink::Rpc(send) => send(transport, value),
        }
    }
}

struct LpcRecord<T> {
    f: Option<Box<dyn FnOnce(T)>>,
    value: Option<T>,
}

impl<T> Executable for LpcRecord<T> {
    fn execute_and_delete(mut self: Box<Self>) {
        (self.f.take().expect("fired once"))(self.value.take().expect("fired once"));
    }
}

/// The set of sinks bound to one operation's `source_cx` and
/// `operation_cx` events. `remote_cx` sinks travel separately, embedded in
/// the remote-completion active message (see [`crate::rpc::remote_state`]),
/// since they must be fired on the peer rather than here.
pub struct CompletionBundle<S: Clone + 'static, O: Clone + 'static> {
    source: Vec<Sink<S>>,
    operation: Vec<Sink<O>>,
}

impl<S: Clone + 'static, O: Clone + 'static> Default for CompletionBundle<S, O> {
    fn default() -> Self {
        CompletionBundle { source: Vec::new(), operation: Vec::new() }
    }
}

impl<S: Clone + 'static, O: Clone + 'static> CompletionBundle<S, O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `operation_cx` to a fresh promise and returns the future the
    /// caller should hand back from the submitting call — the `as_future`
    /// sink.
    pub fn operation_as_future(&mut self) -> crate::future::Future<O> {
        // n=1: the single unit reserved for the `fire_operation` call's
        // eventual `fulfill_result`; finalize's own implicit decrement
        // runs now but must not be the one that zeroes the countdown, or
        // `maybe_settle` would fire before a result exists to publish.
        let promise = Promise::new(1);
        let future = promise.finalize();
        self.operation.push(Sink::Fulfill(promise));
        future
    }

    /// Binds `operation_cx` to a caller-supplied promise — the
    /// `as_promise` sink.
    pub fn operation_as_promise(&mut self, promise: Promise<O>) {
        self.operation.push(Sink::Fulfill(promise));
    }

    /// Binds `operation_cx` to an LPC on `persona` at `level` — the
    /// `as_lpc` sink.
    pub fn operation_as_lpc<F>(&mut self, persona: Arc<Persona>, level: ProgressLevel, f: F)
    where
        F: FnOnce(O) + 'static,
    {
        self.operation.push(Sink::Lpc { persona, level, f: Box::new(f) });
    }

    /// Binds `source_cx` to a fresh promise, returning its future.
    pub fn source_as_future(&mut self) -> crate::future::Future<S> {
        let promise = Promise::new(1);
        let future = promise.finalize();
        self.source.push(Sink::Fulfill(promise));
        future
    }

    /// Binds `source_cx` to an LPC on `persona` at `level`.
    pub fn source_as_lpc<F>(&mut self, persona: Arc<Persona>, level: ProgressLevel, f: F)
    where
        F: FnOnce(S) + 'static,
    {
        self.source.push(Sink::Lpc { persona, level, f: Box::new(f) });
    }

    /// `true` iff no `operation_cx` sinks are bound (the default
    /// `as_future` the caller never read and dropped doesn't count,
    /// since `operation_as_future` always returns the future it built).
    pub fn has_operation_sinks(&self) -> bool {
        !self.operation.is_empty()
    }

    /// Fires every `source_cx` sink with `value`, consuming them.
    pub fn fire_source(&mut self, value: S, transport: &dyn Transport) {
        for sink in self.source.drain(..) {
            sink.fire(value.clone(), transport);
        }
    }

    /// Fires every `operation_cx` sink with `value`, consuming them.
    pub fn fire_operation(&mut self, value: O, transport: &dyn Transport) {
        for sink in self.operation.drain(..) {
            sink.fire(value.clone(), transport);
        }
    }
}

/// A standalone `remote_cx` sink set, carried inside the remote-completion
/// active message rather than inside [`CompletionBundle`] (it fires on the
/// peer, which never sees the initiator's `source`/`operation` sinks).
pub struct RemoteCompletion<R: Clone + 'static> {
    sinks: Vec<Sink<R>>,
}

impl<R: Clone + 'static> Default for RemoteCompletion<R> {
    fn default() -> Self {
        RemoteCompletion { sinks: Vec::new() }
    }
}

impl<R: Clone + 'static> RemoteCompletion<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_lpc<F>(&mut self, persona: Arc<Persona>, level: ProgressLevel, f: F)
    where
        F: FnOnce(R) + 'static,
    {
        self.sinks.push(Sink::Lpc { persona, level, f: Box::new(f) });
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn fire(self, value: R, transport: &dyn Transport) {
        for sink in self.sinks {
            sink.fire(value.clone(), transport);
        }
    }
}

impl<R: Clone + Serialize + DeserializeOwned + 'static> RemoteCompletion<R> {
    /// Binds `remote_cx` to a fire-and-forget RPC to `rank`: once this
    /// bundle is fired by the initiator (its RMA's local completion), `f`
    /// runs on `rank` with the operation's value, discarding whatever it
    /// returns — the one `remote_cx` sink shape [`crate::rma`]'s by-value
    /// `rput`/`rget` use, matching design doc §4.H's description of
    /// `remote_cx` as "injected over the wire to the peer" rather than run
    /// locally like `source_cx`/`operation_cx`.
    pub fn as_remote_fn<Ret>(&mut self, rank: usize, f: fn(R) -> Ret)
    where
        Ret: Serialize + DeserializeOwned + 'static,
    {
        self.sinks.push(Sink::Rpc(Box::new(move |transport, value| {
            crate::rpc::rpc_ff(transport, rank, f, value);
        })));
    }
}
