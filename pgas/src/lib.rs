//! A partitioned-global-address-space runtime for SPMD distributed-memory
//! programs (design doc §1), modeled on `original_source`'s public API:
//! one [`Context`] per rank wrapping a master [`Persona`], a world
//! [`Team`], and a per-rank shared-heap [`segment::SegmentAllocator`].
//!
//! Program structure mirrors design doc §6: [`init`] is collective and
//! returns a [`Context`]; the caller drives RMA, RPC, and collective calls
//! against it; [`Context::finalize`] is collective and requires every
//! outstanding obligation already discharged.

pub mod config;
mod dormant;
mod completion;
pub mod error;
pub mod future;
pub mod persona;
pub mod progress;
pub mod queue;
pub mod rma;
pub mod rpc;
mod segment;
pub mod team;

use std::cell::RefCell;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use pgas_transport::{EventHandle, Transport};

pub use error::BadAlloc;
pub use future::{Future, Promise};
pub use persona::{Persona, PersonaGuard, PersonaScope, ProgressLevel};
pub use rma::GlobalPtr;
pub use segment::SegmentAllocator;
pub use team::{AtomicDomain, DistObject, Team, SPLIT_SCRATCH_RESERVED_BYTES};

/// A running rank's handle onto the runtime: its master persona, its
/// world team, and its shared-heap allocator. Built by [`init`], consumed
/// by [`Context::finalize`].
///
/// Holds the [`PersonaGuard`] that keeps the master persona active on this
/// thread for the `Context`'s whole lifetime — the single-threaded-per-rank
/// model design doc §4.D assumes, and the one this crate's loopback tests
/// all run under (one OS thread per rank).
pub struct Context {
    _guard: PersonaGuard,
    persona: Arc<Persona>,
    world_team: Team,
    heap: RefCell<SegmentAllocator>,
}

impl Context {
    /// The rank this context belongs to.
    pub fn rank(&self) -> usize {
        self.persona.rank()
    }

    /// This rank's master persona.
    pub fn persona(&self) -> &Arc<Persona> {
        &self.persona
    }

    /// The implicit team spanning every rank in the job.
    pub fn world_team(&self) -> &Team {
        &self.world_team
    }

    /// Allocates `size` bytes aligned to `align` from this rank's shared
    /// heap, returning the offset suitable for [`GlobalPtr::new`]. The
    /// nothrow form: exhaustion is reported as `Err(BadAlloc)`, not a
    /// fatal error.
    pub fn alloc_raw(&self, size: usize, align: usize) -> Result<u64, BadAlloc> {
        self.heap.borrow_mut().allocate(size, align).map(|off| off as u64)
    }

    /// Allocates room for one `T` in this rank's shared heap and returns a
    /// pointer to it, local to this rank. The nothrow form; see
    /// [`Context::alloc_or_fatal`] for the throwing one.
    pub fn alloc<T>(&self) -> Result<GlobalPtr<T>, BadAlloc> {
        let addr = self.alloc_raw(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        Ok(GlobalPtr::new(self.rank(), addr))
    }

    /// Like [`Context::alloc_raw`], but raises a fatal error and aborts
    /// the process on exhaustion instead of returning `Err` — the
    /// throwing allocation shape `original_source`'s `upcxx::new_<T>`
    /// defaults to (its nothrow form takes an explicit `std::nothrow_t`
    /// tag; [`Context::alloc_raw`]/[`Context::alloc`] are that tag's
    /// equivalent here).
    pub fn alloc_raw_or_fatal(&self, size: usize, align: usize) -> u64 {
        self.alloc_raw(size, align).unwrap_or_else(|err| {
            let origin = pgas_logging::diagnostic::Origin::here(Some(self.rank()));
            pgas_logging::diagnostic::fatal_error(&origin, err)
        })
    }

    /// Like [`Context::alloc`], but raises a fatal error and aborts the
    /// process on exhaustion. See [`Context::alloc_raw_or_fatal`].
    pub fn alloc_or_fatal<T>(&self) -> GlobalPtr<T> {
        let addr = self.alloc_raw_or_fatal(std::mem::size_of::<T>(), std::mem::align_of::<T>());
        GlobalPtr::new(self.rank(), addr)
    }

    /// Frees a pointer previously returned by [`Context::alloc`] on this
    /// same rank.
    pub fn dealloc<T>(&self, ptr: GlobalPtr<T>) {
        debug_assert_eq!(ptr.rank(), self.rank(), "dealloc: pointer does not belong to this rank's heap");
        self.heap.borrow_mut().deallocate(ptr.addr() as usize);
    }

    /// Non-blocking put, bound to this context's persona. See
    /// [`rma::rput_nb`].
    pub fn rput_nb<T: Copy + 'static>(&self, transport: &dyn Transport, dst: GlobalPtr<T>, value: T) -> Future<()> {
        rma::rput_nb(transport, &self.persona, dst, value)
    }

    /// Blocking put. See [`rma::rput_blocking`].
    pub fn rput_blocking<T: Copy>(&self, transport: &dyn Transport, dst: GlobalPtr<T>, value: T) {
        rma::rput_blocking(transport, dst, value)
    }

    /// Non-blocking get, bound to this context's persona. See
    /// [`rma::rget_nb`].
    pub fn rget_nb<T: Copy + 'static>(&self, transport: &dyn Transport, src: GlobalPtr<T>) -> Future<T> {
        rma::rget_nb(transport, &self.persona, src)
    }

    /// RPC with a return value, bound to this context's persona. See
    /// [`rpc::rpc`].
    pub fn rpc<Args, R>(&self, transport: &dyn Transport, rank: usize, f: fn(Args) -> R, args: Args) -> Future<R>
    where
        Args: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + Clone + 'static,
    {
        rpc::rpc(transport, &self.persona, rank, f, args)
    }

    /// Fire-and-forget RPC, bound to this context's persona. See
    /// [`rpc::rpc_ff`].
    pub fn rpc_ff<Args, R>(&self, transport: &dyn Transport, rank: usize, f: fn(Args) -> R, args: Args) -> EventHandle
    where
        Args: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + 'static,
    {
        rpc::rpc_ff(transport, rank, f, args)
    }

    /// Drains every waiting inbound active message and every ready
    /// handle-callback, LPC, and remote-completion obligation on this
    /// rank's master persona — the unit of work a hand-rolled progress
    /// loop repeats until [`Context::progress_required`] goes false.
    pub fn progress(&self, transport: &dyn Transport) -> bool {
        progress::progress(transport, ProgressLevel::User)
    }

    /// `true` iff this rank's master persona has outstanding work:
    /// pending LPCs, in-flight HCBs, or undischarged remote-completion
    /// obligations.
    pub fn progress_required(&self) -> bool {
        progress::progress_required(None)
    }

    /// Spins [`Context::progress`] until [`Context::progress_required`] is
    /// false. Collective only insofar as callers on other ranks must keep
    /// progressing too, or this rank's outstanding remote obligations (AM
    /// replies it is owed) will never arrive.
    pub fn discharge(&self, transport: &dyn Transport) {
        while self.progress_required() {
            self.progress(transport);
        }
    }

    /// Ends this rank's participation in the job. Collective: every rank
    /// must call `finalize` before any of them may safely assume the
    /// program state each is holding about the others is final.
    ///
    /// Per design doc §6, finalize must follow `discharge` and collective
    /// destruction of every team and atomic domain this rank created; the
    /// world team and master persona (the only two this crate ever builds
    /// implicitly) are dropped here, along with this context's shared-heap
    /// allocator.
    ///
    /// # Panics
    ///
    /// Panics if called while [`Context::progress_required`] is still
    /// true — finalize-before-discharge is a precondition violation, not a
    /// recoverable error, matching design doc §7's treatment of
    /// precondition violations.
    pub fn finalize(self) {
        assert!(
            !self.progress_required(),
            "finalize: called with outstanding progress obligations; call discharge first"
        );
        // `_guard` drops here, popping the master persona off this
        // thread's stack so a later `init` on the same thread starts
        // clean — this is what makes multiple init/finalize cycles on one
        // thread safe to run back to back.
    }
}

/// Starts this rank's participation in the job: builds its master
/// persona, activates it on the calling thread, and builds the implicit
/// world team spanning every rank `transport` knows about.
///
/// Collective: every rank in the job must call `init` (this call performs
/// no network traffic itself, but the team it builds assumes every peer
/// will too before issuing any collective against it).
pub fn init(transport: &dyn Transport) -> Context {
    let persona = Persona::new(transport.rank(), true);
    let guard = PersonaScope::activate(persona.clone());
    let world_team = Team::world(transport);
    let (_, segment_bytes) = transport.shared_segment(transport.rank());
    let mut allocator = SegmentAllocator::new(segment_bytes);
    // Carve out `Team::split`'s scratch mailbox before any application
    // allocation can land on it; never freed, so address 0 never comes
    // back out of `alloc`.
    allocator
        .allocate(team::SPLIT_SCRATCH_RESERVED_BYTES, 1)
        .expect("segment has room for the split scratch mailbox");
    let heap = RefCell::new(allocator);
    Context { _guard: guard, persona, world_team, heap }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgas_transport::loopback::{LoopbackTransport, World};

    #[test]
    fn init_activates_master_persona_on_the_calling_thread() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let ctx = init(&transport);
        assert_eq!(ctx.rank(), 0);
        assert!(PersonaScope::active_with_caller(ctx.persona()));
        assert!(ctx.persona().is_master());
        ctx.finalize();
        assert!(PersonaScope::top().is_none());
    }

    #[test]
    fn alloc_and_dealloc_round_trip_through_rma() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let ctx = init(&transport);

        let ptr: GlobalPtr<i64> = ctx.alloc().expect("segment has room");
        ctx.rput_blocking(&transport, ptr, 123i64);
        let got = ctx.rget_nb(&transport, ptr).wait(&transport);
        assert_eq!(got, 123);
        ctx.dealloc(ptr);

        ctx.finalize();
    }

    #[test]
    fn alloc_or_fatal_succeeds_when_the_heap_has_room() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let ctx = init(&transport);

        let ptr: GlobalPtr<i64> = ctx.alloc_or_fatal();
        ctx.rput_blocking(&transport, ptr, 9i64);
        assert_eq!(ctx.rget_nb(&transport, ptr).wait(&transport), 9);
        ctx.dealloc(ptr);
        ctx.finalize();
    }

    #[test]
    fn finalize_panics_if_progress_is_still_required() {
        let world = World::new(1, 4096);
        let transport = LoopbackTransport::new(0, world);
        let ctx = init(&transport);
        ctx.persona().remote_obligation_opened();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ctx.finalize()));
        assert!(result.is_err());
    }

    #[test]
    fn two_ranks_run_a_collective_barrier_through_init() {
        let world = World::new(2, 4096);
        let handles: Vec<_> = (0..2)
            .map(|r| {
                let world = world.clone();
                std::thread::spawn(move || {
                    let transport = LoopbackTransport::new(r, world);
                    let ctx = init(&transport);
                    assert_eq!(ctx.world_team().size(), 2);
                    ctx.world_team().barrier(&transport, ctx.persona());
                    ctx.finalize();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
