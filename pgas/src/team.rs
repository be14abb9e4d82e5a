//! Team, dist-object, and atomic-domain layer (design doc §4.K).
//!
//! A [`Team`] is an ordered rank group; every collective call below is a
//! thin wrapper over [`pgas_transport::Transport`]'s collective methods,
//! translating this crate's `Future`-based completion model onto the
//! transport's handle-based one the same way [`crate::rma`] does for
//! point-to-point RMA.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use pgas_digest::Digest;
use pgas_transport::{Datatype, ReduceOp, TeamHandle, Transport};

use crate::dormant::DormantLpc;
use crate::future::{Future, Promise};
use crate::persona::{Deferred, Persona, ProgressLevel};
use crate::queue::Executable;
use crate::rma::{from_bytes, to_bytes};
use crate::rpc;

/// An ordered rank group over which collectives are defined (design doc
/// glossary "Team"). Teams are created collectively; every participating
/// rank computes the same `id` independently via [`Digest::eat`], so no
/// negotiation is needed to agree on team identity.
#[derive(Clone)]
pub struct Team {
    handle: TeamHandle,
    id: Digest,
    rank: usize,
    members: Arc<Vec<usize>>,
    next_collective: std::rc::Rc<std::cell::Cell<u64>>,
}

impl Team {
    /// The implicit team spanning every rank in the job.
    pub fn world(transport: &dyn Transport) -> Team {
        let size = transport.world_size();
        Team {
            handle: TeamHandle(0),
            id: pgas_digest::ZERO.eat(size as u64, 0),
            rank: transport.rank(),
            members: Arc::new((0..size).collect()),
            next_collective: std::rc::Rc::new(std::cell::Cell::new(0)),
        }
    }

    pub fn handle(&self) -> TeamHandle {
        self.handle
    }

    pub fn id(&self) -> Digest {
        self.id
    }

    /// This rank's position within the team (not its global rank).
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// The global rank backing team-local rank `team_rank`.
    pub fn global_rank(&self, team_rank: usize) -> usize {
        self.members[team_rank]
    }

    /// Derives a fresh sub-id for one collective call, distinct from every
    /// other collective (including concurrent ones) this team has issued.
    pub fn next_collective_id(&self) -> Digest {
        let n = self.next_collective.get();
        self.next_collective.set(n + 1);
        self.id.eat(n, 0)
    }

    /// Splits `self` collectively: every rank supplies a `color` (`None`
    /// excludes it from the result) and a `key` ranking members within
    /// their color group. Every rank must call this with the same parent
    /// team and must reach it without intervening collectives on `self`.
    ///
    /// Uses each rank's own shared segment as a scratch mailbox (address
    /// [`SPLIT_SCRATCH_BASE`]) the same way [`pgas_transport::loopback`]'s
    /// own broadcast/reduce reuse segment address 0 — a loopback
    /// convenience, not a production wire protocol; a real transport would
    /// reserve this range through the segment allocator instead of a fixed
    /// offset.
    pub fn split(&self, transport: &dyn Transport, color: Option<i64>, key: i64) -> Option<Team> {
        let participates = if color.is_some() { 1i64 } else { 0 };
        let payload = to_bytes(&(participates, color.unwrap_or(0), key));
        transport.rma_put_blocking(self.global_rank(self.rank), SPLIT_SCRATCH_BASE, &payload);

        let barrier = transport.coll_barrier_nb(self.handle);
        while !transport.event_test(barrier) {}

        let mut entries: Vec<(usize, i64, i64)> = Vec::with_capacity(self.members.len());
        for (team_rank, &global) in self.members.iter().enumerate() {
            let mut buf = vec![0u8; std::mem::size_of::<(i64, i64, i64)>()];
            let h = transport.rma_get_nb(global, SPLIT_SCRATCH_BASE, &mut buf);
            while !transport.event_test(h) {}
            let (participates, color, key): (i64, i64, i64) = from_bytes(&buf);
            if participates != 0 {
                entries.push((team_rank, color, key));
            }
        }

        let my_color = color?;
        let mut group: Vec<(usize, i64, i64)> = entries.into_iter().filter(|&(_, c, _)| c == my_color).collect();
        group.sort_by_key(|&(team_rank, _, key)| (key, team_rank));
        let members: Vec<usize> = group.iter().map(|&(team_rank, _, _)| self.global_rank(team_rank)).collect();
        let new_rank = group.iter().position(|&(team_rank, _, _)| team_rank == self.rank)?;

        Some(Team {
            handle: self.handle,
            id: self.next_collective_id().eat(my_color as u64, 0),
            rank: new_rank,
            members: Arc::new(members),
            next_collective: std::rc::Rc::new(std::cell::Cell::new(0)),
        })
    }

    /// Non-blocking barrier over this team.
    pub fn barrier_async(&self, transport: &dyn Transport, persona: &Arc<Persona>) -> Future<()> {
        let handle = transport.coll_barrier_nb(self.handle);
        let future = Future::pending();
        persona.add_hcb(handle, Box::new(UnitCompletion { future: future.clone() }));
        future
    }

    /// Blocks the calling thread, spinning progress, until every member has
    /// called this.
    pub fn barrier(&self, transport: &dyn Transport, persona: &Arc<Persona>) {
        self.barrier_async(transport, persona).wait(transport)
    }

    /// Broadcasts `value` from `root` (a team-local rank) to every member.
    pub fn broadcast<T: Copy + 'static>(&self, transport: &dyn Transport, persona: &Arc<Persona>, root: usize, value: T) -> Future<T> {
        let mut buf = to_bytes(&value);
        let handle = transport.coll_broadcast_nb(self.handle, root, &mut buf);
        let future = Future::pending();
        persona.add_hcb(handle, Box::new(BufCompletion { buf, future: future.clone(), _marker: std::marker::PhantomData::<T> }));
        future
    }

    /// Reduces `value` with `op` across every member, delivering the result
    /// to `root` (a team-local rank) only.
    pub fn reduce_to_one<T: Copy + 'static>(
        &self,
        transport: &dyn Transport,
        persona: &Arc<Persona>,
        root: usize,
        value: T,
        dt: Datatype,
        op: ReduceOp,
    ) -> Future<T> {
        let src = to_bytes(&value);
        let mut dst = vec![0u8; src.len()];
        let handle = transport.coll_reduce_to_one_nb(self.handle, root, &mut dst, &src, dt, op);
        let future = Future::pending();
        persona.add_hcb(handle, Box::new(BufCompletion { buf: dst, future: future.clone(), _marker: std::marker::PhantomData::<T> }));
        future
    }

    /// Reduces `value` with `op` across every member, delivering the result
    /// to every member.
    pub fn reduce_to_all<T: Copy + 'static>(
        &self,
        transport: &dyn Transport,
        persona: &Arc<Persona>,
        value: T,
        dt: Datatype,
        op: ReduceOp,
    ) -> Future<T> {
        let src = to_bytes(&value);
        let mut dst = vec![0u8; src.len()];
        let handle = transport.coll_reduce_to_all_nb(self.handle, &mut dst, &src, dt, op);
        let future = Future::pending();
        persona.add_hcb(handle, Box::new(BufCompletion { buf: dst, future: future.clone(), _marker: std::marker::PhantomData::<T> }));
        future
    }
}

/// Segment address reserved for [`Team::split`]'s scratch mailbox.
const SPLIT_SCRATCH_BASE: u64 = 0;

/// Bytes at the low end of every rank's segment that [`Team::split`]'s
/// scratch mailbox may touch, starting at [`SPLIT_SCRATCH_BASE`]. Public so
/// [`crate::init`] can carve this range out of the shared-heap allocator
/// before handing the rest to application allocations — otherwise a
/// `Context::alloc` could be handed address 0 and collide with a concurrent
/// `split`.
pub const SPLIT_SCRATCH_RESERVED_BYTES: usize = 64;

struct UnitCompletion {
    future: Future<()>,
}

impl Executable for UnitCompletion {
    fn execute_and_delete(self: Box<Self>) {
        self.future.fulfill(());
    }
}

struct BufCompletion<T: 'static> {
    buf: Vec<u8>,
    future: Future<T>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy + 'static> Executable for BufCompletion<T> {
    fn execute_and_delete(self: Box<Self>) {
        self.future.fulfill(from_bytes(&self.buf));
    }
}

thread_local! {
    // Process-wide (per design doc glossary "Registry") in the sense that
    // matters here: one loopback rank is one thread, and every dist-object
    // this rank owns lives in its own address space, which this thread-local
    // map stands in for. Only this rank's own code ever mutates its entry.
    static DIST_OBJECT_REGISTRY: RefCell<HashMap<Digest, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// A value replicated across a team, fetchable from any member by id
/// (design doc glossary "Dist object").
///
/// `fetch` is implemented as an RPC to a fixed trampoline function, which
/// means `T` must be nameable as a plain `fn(_) -> T` return type — in
/// practice any `Copy + Serialize + DeserializeOwned + 'static` payload,
/// matching [`crate::rma`]'s "trivially serializable" scope.
pub struct DistObject<T: Copy + serde::Serialize + serde::de::DeserializeOwned + 'static> {
    id: Digest,
    members: Arc<Vec<usize>>,
    value: T,
}

impl<T: Copy + serde::Serialize + serde::de::DeserializeOwned + 'static> DistObject<T> {
    /// Constructs a dist-object collectively over `team`: every member must
    /// call this the same number of times, in the same order, so that
    /// `team.next_collective_id()` derives matching ids everywhere.
    pub fn new(team: &Team, value: T) -> Self {
        let id = team.next_collective_id();
        DIST_OBJECT_REGISTRY.with(|r| {
            r.borrow_mut().insert(id, Box::new(value));
        });
        DistObject { id, members: team.members.clone(), value }
    }

    /// This rank's own representative value, without any RPC.
    pub fn local(&self) -> T {
        self.value
    }

    /// Fetches the representative value held by `team_rank`'s member of
    /// the team this object was constructed over.
    ///
    /// Only `self.id` — a [`Digest`], never the dist-object itself —
    /// crosses the wire; the callee restores its own local representative
    /// through [`DIST_OBJECT_REGISTRY`], blocking on a future-of-presence
    /// if its own `DistObject::new` for this id hasn't run yet (the
    /// registration race), per [`dist_object_fetch_executor`].
    pub fn fetch(&self, transport: &dyn Transport, persona: &Arc<Persona>, team_rank: usize) -> Future<T> {
        let global_rank = self.members[team_rank];
        dist_object_fetch::<T>(transport, persona, global_rank, self.id)
    }
}

impl<T: Copy + serde::Serialize + serde::de::DeserializeOwned + 'static> Drop for DistObject<T> {
    fn drop(&mut self) {
        DIST_OBJECT_REGISTRY.with(|r| {
            r.borrow_mut().remove(&self.id);
        });
    }
}

/// Issues the fetch active message directly (rather than through
/// [`rpc::rpc`]) since the callee may not be able to answer inline — see
/// [`dist_object_fetch_executor`].
fn dist_object_fetch<T>(transport: &dyn Transport, persona: &Arc<Persona>, rank: usize, id: Digest) -> Future<T>
where
    T: Copy + serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    // n=1: the unit reserved for the reply active message's eventual
    // fulfillment, delivered through the dormant LPC below.
    let promise: Promise<T> = Promise::new(1);
    let future = promise.finalize();

    let obligation_persona = persona.clone();
    let dormant = DormantLpc::new_function(persona.clone(), ProgressLevel::User, move |value: T| {
        obligation_persona.remote_obligation_closed();
        promise.fulfill_result(value);
    });
    let dormant_addr = dormant.into_wire_address();

    let executor_offset = rpc::fn_to_offset(dist_object_fetch_executor::<T> as usize);
    let body = bincode::serialize(&(persona.rank(), dormant_addr, id)).expect("dist_object fetch payload encodes");
    let am = rpc::encode_command(executor_offset, &body);

    persona.remote_obligation_opened();
    transport.am_master(rank, &am);
    future
}

/// Number of progress ticks a fetch will retry a registry miss before
/// concluding the id can never register and raising a fatal error. Chosen
/// generously relative to how many ticks a realistic registration race in
/// this crate's own tests resolves within (collective dist-object
/// construction is always a handful of calls ahead, never bounded by
/// network latency the way the original's `when_here()` must tolerate).
const MAX_FETCH_RETRIES: u32 = 4096;

/// Callee-side active message executor for [`DistObject::fetch`]. Looks up
/// `id` in this rank's own [`DIST_OBJECT_REGISTRY`]; if the local
/// `DistObject::new` for this id hasn't run yet, defers the reply rather
/// than failing immediately — the "future-of-presence" the registration
/// race requires — retrying on this persona's own progress ticks until
/// either the registration appears or [`MAX_FETCH_RETRIES`] is exhausted.
fn dist_object_fetch_executor<T>(body: &[u8], transport: &dyn Transport, persona: &Arc<Persona>)
where
    T: Copy + serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    let (from, dormant_addr, id): (usize, u64, Digest) = bincode::deserialize(body).expect("dist_object fetch payload decodes");
    if let Deferred::Retry(next) = try_fetch_reply::<T>(from, dormant_addr, id, 0, transport) {
        persona.defer_with_transport(next);
    }
}

fn try_fetch_reply<T>(from: usize, dormant_addr: u64, id: Digest, attempt: u32, transport: &dyn Transport) -> Deferred
where
    T: Copy + serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    let found = DIST_OBJECT_REGISTRY.with(|r| {
        r.borrow().get(&id).map(|boxed| {
            *boxed
                .downcast_ref::<T>()
                .expect("dist_object fetch: registered value has a different type than the fetcher's T")
        })
    });
    match found {
        Some(value) => {
            rpc::reply_to_dormant(transport, from, dormant_addr, value);
            Deferred::Done
        }
        None if attempt < MAX_FETCH_RETRIES => {
            Deferred::Retry(Box::new(move |transport| try_fetch_reply::<T>(from, dormant_addr, id, attempt + 1, transport)))
        }
        None => {
            let origin = pgas_logging::diagnostic::Origin::here(None);
            pgas_logging::diagnostic::fatal_error(&origin, "dist_object fetch: no local representative ever registered for this id")
        }
    }
}

/// A collectively-constructed handle over `(opset, datatype, team)`
/// permitting atomic fetch-and-op RMA against any member's segment
/// (design doc glossary/§4.K "Atomic domain").
pub struct AtomicDomain {
    dt: Datatype,
    ops: Vec<ReduceOp>,
}

impl AtomicDomain {
    /// Constructs a domain permitting exactly `ops` over `dt`-sized
    /// elements. Construction itself need not be collective at this layer
    /// (no transport-side state is allocated), though real PGAS runtimes
    /// typically make it so to let the transport pre-register routing.
    pub fn new(dt: Datatype, ops: Vec<ReduceOp>) -> Self {
        AtomicDomain { dt, ops }
    }

    /// Issues a fetch-and-op at `addr` in `rank`'s segment, returning the
    /// pre-op value once the transport reports it complete.
    ///
    /// # Panics
    ///
    /// Panics if `op` is not in this domain's permitted set — a
    /// precondition violation, matching the design doc's "fixed at
    /// construction" invariant.
    pub fn op_nb<T: Copy + 'static>(
        &self,
        transport: &dyn Transport,
        persona: &Arc<Persona>,
        rank: usize,
        addr: u64,
        op: ReduceOp,
        operand: T,
    ) -> Future<T> {
        assert!(self.ops.contains(&op), "atomic_op_nb: {op:?} is not in this domain's permitted op set");
        let operand_bytes = to_bytes(&operand);
        let mut result = vec![0u8; operand_bytes.len()];
        let handle = transport.atomic_op_nb(rank, addr, self.dt, op, &operand_bytes, &mut result);
        let future = Future::pending();
        persona.add_hcb(handle, Box::new(BufCompletion { buf: result, future: future.clone(), _marker: std::marker::PhantomData::<T> }));
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::{Persona, PersonaScope};
    use pgas_transport::loopback::{LoopbackTransport, World};

    #[test]
    fn world_team_has_every_rank_as_a_member() {
        let world = World::new(4, 4096);
        let t = LoopbackTransport::new(2, world);
        let team = Team::world(&t);
        assert_eq!(team.size(), 4);
        assert_eq!(team.rank(), 2);
        assert_eq!(team.global_rank(2), 2);
    }

    #[test]
    fn reduce_to_all_max_matches_scenario_2() {
        let world = World::new(4, 4096);
        let handles: Vec<_> = (0..4)
            .map(|r| {
                let world = world.clone();
                std::thread::spawn(move || {
                    let t = LoopbackTransport::new(r, world);
                    let persona = Persona::new(r, true);
                    let _g = PersonaScope::activate(persona.clone());
                    let team = Team::world(&t);
                    team.reduce_to_all(&t, &persona, r as i64, Datatype::I64, ReduceOp::Max).wait(&t)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 3);
        }
    }

    #[test]
    fn broadcast_delivers_roots_value_to_every_member() {
        let world = World::new(3, 4096);
        let handles: Vec<_> = (0..3)
            .map(|r| {
                let world = world.clone();
                std::thread::spawn(move || {
                    let t = LoopbackTransport::new(r, world);
                    let persona = Persona::new(r, true);
                    let _g = PersonaScope::activate(persona.clone());
                    let team = Team::world(&t);
                    let value: i64 = if r == 0 { 99 } else { 0 };
                    team.broadcast(&t, &persona, 0, value).wait(&t)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 99);
        }
    }

    #[test]
    fn split_groups_ranks_by_color_and_orders_by_key() {
        let world = World::new(4, 4096);
        let handles: Vec<_> = (0..4)
            .map(|r| {
                let world = world.clone();
                std::thread::spawn(move || {
                    let t = LoopbackTransport::new(r, world);
                    let team = Team::world(&t);
                    let color = (r % 2) as i64;
                    let key = -(r as i64);
                    let sub = team.split(&t, Some(color), key).expect("every rank participates");
                    (r, color, sub.size(), sub.global_rank(sub.rank()))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (global_rank, color, sub_size, self_global) in &results {
            assert_eq!(*sub_size, 2);
            assert_eq!(*self_global, *global_rank);
            assert_eq!(*color, (*global_rank % 2) as i64);
        }
    }

    #[test]
    fn dist_object_fetch_matches_scenario_6() {
        let world = World::new(2, 4096);
        let handles: Vec<_> = (0..2)
            .map(|r| {
                let world = world.clone();
                std::thread::spawn(move || {
                    let t = LoopbackTransport::new(r, world);
                    let persona = Persona::new(r, true);
                    let _g = PersonaScope::activate(persona.clone());
                    let team = Team::world(&t);
                    let value: i32 = if r == 0 { 7 } else { 0 };
                    let d = DistObject::new(&team, value);

                    if r == 1 {
                        let future = d.fetch(&t, &persona, 0);
                        loop {
                            while let Some(payload) = t.try_recv_am() {
                                rpc::dispatch(&payload, &t, &persona);
                            }
                            if future.is_ready() {
                                break future.peek().unwrap();
                            }
                        }
                    } else {
                        // Rank 0 must keep answering AMs until rank 1 is done.
                        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
                        while std::time::Instant::now() < deadline {
                            while let Some(payload) = t.try_recv_am() {
                                rpc::dispatch(&payload, &t, &persona);
                            }
                            std::thread::yield_now();
                        }
                        0
                    }
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[1], 7);
    }

    #[test]
    fn dist_object_fetch_defers_until_registration_appears_then_resolves() {
        let world = World::new(1, 4096);
        let t = LoopbackTransport::new(0, world);
        let persona = Persona::new(0, true);
        let _g = PersonaScope::activate(persona.clone());

        let team = Team::world(&t);
        let id = team.next_collective_id();

        // The fetch AM "arrives" (here, loops back to this same rank)
        // before this rank's own `DistObject::new` for `id` has run.
        let future: Future<i32> = dist_object_fetch::<i32>(&t, &persona, 0, id);
        while let Some(payload) = t.try_recv_am() {
            rpc::dispatch(&payload, &t, &persona);
        }
        assert!(!future.is_ready());
        assert!(persona.progress_required());

        // Registration arrives; the next progress tick's deferred retry
        // should find it and fire the reply.
        DIST_OBJECT_REGISTRY.with(|r| {
            r.borrow_mut().insert(id, Box::new(42i32));
        });
        persona.drain_deferred(&t);
        while let Some(payload) = t.try_recv_am() {
            rpc::dispatch(&payload, &t, &persona);
        }
        assert_eq!(future.wait(&t), 42);
    }
}
