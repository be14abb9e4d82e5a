//! RMA get/put engine (design doc §4.I): wraps [`pgas_transport::Transport`],
//! binding `operation_cx` directly to the returned future and, for the
//! `_with_remote_cx` forms, binding `remote_cx` through
//! [`crate::completion::RemoteCompletion`].
//!
//! Only the by-value forms are implemented (`rget(src) -> Future<T>`,
//! `rput(value, dst)`), matching scenario 1 of design doc §8 and the "any
//! trivially serializable T" round-trip law; the by-reference
//! `rget(src, dst, n, cx)` / `rput(src, dst, n, cx)` forms the spec also
//! names operate on raw byte ranges the same way and are omitted here
//! since they add no new completion wiring over the by-value path.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::mem::size_of;
use std::rc::Rc;
use std::sync::Arc;

use pgas_transport::{SourceCompletionMode, Transport};

use crate::completion::RemoteCompletion;
use crate::future::Future;
use crate::persona::Persona;
use crate::queue::{Executable, Record};

/// A cross-rank pointer: the owning rank plus a raw address within that
/// rank's shared segment. Null is represented by `addr == u64::MAX`,
/// matching the sentinel the design doc's data model names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalPtr<T> {
    rank: usize,
    addr: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GlobalPtr<T> {
    /// Builds a pointer to `addr` within `rank`'s segment. Callers
    /// allocate `addr` via [`crate::segment::SegmentAllocator`].
    pub fn new(rank: usize, addr: u64) -> Self {
        GlobalPtr { rank, addr, _marker: PhantomData }
    }

    /// The null global pointer: no rank owns it, and it compares equal to
    /// every other null pointer of the same `T`.
    pub fn null() -> Self {
        GlobalPtr { rank: 0, addr: u64::MAX, _marker: PhantomData }
    }

    pub fn is_null(&self) -> bool {
        self.addr == u64::MAX
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// `true` iff this pointer's owning rank is `my_rank` — the spec's
    /// "local-team" locality test, simplified here to same-rank since the
    /// loopback transport never distinguishes process-local shared-memory
    /// peers from any other rank.
    pub fn is_local(&self, my_rank: usize) -> bool {
        self.rank == my_rank
    }
}

pub(crate) fn to_bytes<T: Copy>(value: &T) -> Vec<u8> {
    // SAFETY: `T: Copy` guarantees no destructor and no interior
    // pointers/lifetimes that would make a raw byte view unsound; this is
    // exactly the "trivially serializable" contract the design doc's RMA
    // section is scoped to.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }.to_vec()
}

pub(crate) fn from_bytes<T: Copy>(bytes: &[u8]) -> T {
    debug_assert_eq!(bytes.len(), size_of::<T>(), "rget reply was not sized for T");
    unsafe { std::ptr::read(bytes.as_ptr() as *const T) }
}

/// Blocking put of `value` into `dst`, returning only once the transport
/// reports the write globally complete — the `op_now` sub-mode.
pub fn rput_blocking<T: Copy>(transport: &dyn Transport, dst: GlobalPtr<T>, value: T) {
    transport.rma_put_blocking(dst.rank, dst.addr, &to_bytes(&value));
}

/// Non-blocking put of `value` into `dst`. The source buffer is a local
/// temporary already quiescent by the time this call returns (`src_now`
/// sub-mode), so the returned future only ever carries `operation_cx`; no
/// `remote_cx` sink is bound. See [`rput_nb_with_remote_cx`] for a put
/// that also signals `dst`'s rank.
pub fn rput_nb<T: Copy + 'static>(transport: &dyn Transport, persona: &Arc<Persona>, dst: GlobalPtr<T>, value: T) -> Future<()> {
    rput_nb_with_remote_cx(transport, persona, dst, value, None)
}

/// Non-blocking put of `value` into `dst`, additionally firing
/// `remote_cx` (built as a [`RemoteCompletion`], typically via
/// [`RemoteCompletion::as_remote_fn`]) once the put is locally complete —
/// design doc §4.H/§4.I's "operation complete, signal the peer" shape.
pub fn rput_nb_with_remote_cx<T: Copy + 'static>(
    transport: &dyn Transport,
    persona: &Arc<Persona>,
    dst: GlobalPtr<T>,
    value: T,
    remote_cx: Option<RemoteCompletion<T>>,
) -> Future<()> {
    let handle = transport.rma_put_nb(dst.rank, dst.addr, &to_bytes(&value), SourceCompletionMode::AlreadyQuiescent);
    let future = Future::pending();
    let on_ready: Record = Box::new(UnitCompletion { future: future.clone() });
    match remote_cx {
        Some(remote_cx) => {
            let fire_remote: Box<dyn FnOnce(&dyn Transport)> = Box::new(move |transport| remote_cx.fire(value, transport));
            persona.add_hcb_with_remote_cx(handle, on_ready, fire_remote);
        }
        None => persona.add_hcb(handle, on_ready),
    }
    future
}

/// Non-blocking get of the `T` stored at `src`, by value. No `remote_cx`
/// sink is bound. See [`rget_nb_with_remote_cx`] for a get that also
/// signals `src`'s rank.
pub fn rget_nb<T: Copy + 'static>(transport: &dyn Transport, persona: &Arc<Persona>, src: GlobalPtr<T>) -> Future<T> {
    rget_nb_with_remote_cx(transport, persona, src, None)
}

/// Non-blocking get of the `T` stored at `src`, by value, additionally
/// firing `remote_cx` with the fetched value once the get completes
/// locally.
pub fn rget_nb_with_remote_cx<T: Copy + 'static>(
    transport: &dyn Transport,
    persona: &Arc<Persona>,
    src: GlobalPtr<T>,
    remote_cx: Option<RemoteCompletion<T>>,
) -> Future<T> {
    let mut buf = vec![0u8; size_of::<T>()];
    let handle = transport.rma_get_nb(src.rank, src.addr, &mut buf);
    let future = Future::pending();
    match remote_cx {
        Some(remote_cx) => {
            // `GetCompletion::execute_and_delete` (on_ready) only decodes
            // the fetched value once the HCB fires; `remote_cx` needs that
            // same value but runs through a separate hook with no return
            // path of its own, so it's handed across this cell —
            // `Persona::poll_hcbs` guarantees on_ready runs before
            // remote_cx for the same HCB, so the cell is always populated
            // by the time remote_cx reads it.
            let fetched: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
            let on_ready: Record =
                Box::new(GetCompletion { buf, future: future.clone(), fetched: Some(fetched.clone()), _marker: PhantomData::<T> });
            let fire_remote: Box<dyn FnOnce(&dyn Transport)> = Box::new(move |transport| {
                let value = fetched.borrow_mut().take().expect("on_ready decodes the value before remote_cx runs");
                remote_cx.fire(value, transport);
            });
            persona.add_hcb_with_remote_cx(handle, on_ready, fire_remote);
        }
        None => {
            let on_ready: Record = Box::new(GetCompletion { buf, future: future.clone(), fetched: None, _marker: PhantomData::<T> });
            persona.add_hcb(handle, on_ready);
        }
    }
    future
}

struct UnitCompletion {
    future: Future<()>,
}

impl Executable for UnitCompletion {
    fn execute_and_delete(self: Box<Self>) {
        self.future.fulfill(());
    }
}

struct GetCompletion<T: 'static> {
    buf: Vec<u8>,
    future: Future<T>,
    fetched: Option<Rc<RefCell<Option<T>>>>,
    _marker: PhantomData<T>,
}

impl<T: Copy + 'static> Executable for GetCompletion<T> {
    fn execute_and_delete(self: Box<Self>) {
        let value = from_bytes(&self.buf);
        if let Some(fetched) = self.fetched {
            *fetched.borrow_mut() = Some(value);
        }
        self.future.fulfill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::{Persona, PersonaScope};
    use crate::progress;
    use pgas_transport::loopback::{LoopbackTransport, World};

    #[test]
    fn rput_then_rget_round_trips_an_i64() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());

        let dst: GlobalPtr<i64> = GlobalPtr::new(0, 64);
        let put = rput_nb(&transport, &persona, dst, 100i64);
        let got = put.wait(&transport);
        assert_eq!(got, ());

        let fut = rget_nb(&transport, &persona, dst);
        assert_eq!(fut.wait(&transport), 100i64);
    }

    #[test]
    fn rput_blocking_is_visible_immediately_to_a_local_get() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());

        let dst: GlobalPtr<u32> = GlobalPtr::new(0, 128);
        rput_blocking(&transport, dst, 7u32);
        let fut = rget_nb(&transport, &persona, dst);
        assert_eq!(fut.wait(&transport), 7u32);
    }

    #[test]
    fn global_ptr_null_has_the_sentinel_address() {
        let p: GlobalPtr<i32> = GlobalPtr::null();
        assert!(p.is_null());
        assert!(!GlobalPtr::<i32>::new(0, 0).is_null());
    }

    #[test]
    fn progress_required_drops_once_hcb_fires() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());

        let dst: GlobalPtr<i64> = GlobalPtr::new(0, 256);
        let put = rput_nb(&transport, &persona, dst, 1i64);
        assert!(progress::progress_required(None));
        put.wait(&transport);
        assert!(!progress::progress_required(None));
    }

    #[test]
    fn rput_nb_with_remote_cx_fires_its_sink_once_the_put_completes() {
        use crate::completion::RemoteCompletion;
        use crate::persona::ProgressLevel;
        use std::cell::RefCell;
        use std::rc::Rc;

        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());

        let observed = Rc::new(RefCell::new(None));
        let observed_for_sink = observed.clone();
        let mut remote: RemoteCompletion<i64> = RemoteCompletion::new();
        remote.as_lpc(persona.clone(), ProgressLevel::User, move |value| {
            *observed_for_sink.borrow_mut() = Some(value);
        });

        let dst: GlobalPtr<i64> = GlobalPtr::new(0, 320);
        let put = rput_nb_with_remote_cx(&transport, &persona, dst, 55i64, Some(remote));
        put.wait(&transport);
        progress::progress(&transport, ProgressLevel::User);
        assert_eq!(*observed.borrow(), Some(55));
    }

    #[test]
    fn rget_nb_with_remote_cx_sees_the_same_value_as_the_returned_future() {
        use crate::completion::RemoteCompletion;
        use crate::persona::ProgressLevel;
        use std::cell::RefCell;
        use std::rc::Rc;

        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _guard = PersonaScope::activate(persona.clone());

        let dst: GlobalPtr<i64> = GlobalPtr::new(0, 384);
        rput_blocking(&transport, dst, 77i64);

        let observed = Rc::new(RefCell::new(None));
        let observed_for_sink = observed.clone();
        let mut remote: RemoteCompletion<i64> = RemoteCompletion::new();
        remote.as_lpc(persona.clone(), ProgressLevel::User, move |value| {
            *observed_for_sink.borrow_mut() = Some(value);
        });

        let fut = rget_nb_with_remote_cx(&transport, &persona, dst, Some(remote));
        let got = fut.wait(&transport);
        progress::progress(&transport, ProgressLevel::User);
        assert_eq!(got, 77);
        assert_eq!(*observed.borrow(), Some(77));
    }
}
