//! An in-process, multi-thread `Transport` used by tests and examples.
//!
//! Every rank is an OS thread inside the same process. Shared segments are
//! plain `Vec<u8>` behind a mutex per rank (so `rma_get`/`rma_put` are just
//! slice copies), active messages travel over one `std::sync::mpsc` channel
//! per destination rank, and collectives are implemented directly against
//! the shared [`World`] rather than delegated further. Every non-blocking
//! call finishes its work immediately and hands back a handle that needs a
//! configurable number of `event_test` polls before it reports ready; this
//! keeps the core's progress engine and HCB plumbing honestly exercised
//! even though there is no real network latency to wait out.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};

use pgas_bytes::Bytes;
use pgas_logging::Logger;

use crate::logging::{ActiveMessageEvent, CollectiveEvent, CollectiveKind, RmaEvent, TransportEvent};
use crate::{Datatype, EventHandle, ReduceOp, SourceCompletionMode, TeamHandle, Transport};

/// How many `event_test` polls a freshly-submitted handle needs before it
/// reports ready. `0` means "completes in-line", matching the transport's
/// allowance for immediate completion.
const POLL_LATENCY: u32 = 2;

struct Segment {
    bytes: Mutex<Vec<u8>>,
}

/// State shared by every rank's [`LoopbackTransport`] handle.
pub struct World {
    size: usize,
    segments: Vec<Segment>,
    am_senders: Vec<Sender<Bytes>>,
    am_receivers: Vec<Mutex<Receiver<Bytes>>>,
    pending: Mutex<HashMap<u64, u32>>,
    next_handle: AtomicU64,
    barrier: Barrier,
    // One registered team beyond the implicit world team, keyed by id; a
    // loopback job only ever needs `TeamHandle(0)` (the world) and whatever
    // the test registers via `register_team`, since real subteam routing
    // belongs to a production transport, not this stand-in.
    teams: Mutex<HashMap<u32, Vec<usize>>>,
}

impl World {
    /// Builds shared state for `size` ranks, each starting with a
    /// `segment_bytes`-byte shared segment.
    pub fn new(size: usize, segment_bytes: usize) -> Arc<World> {
        let mut am_senders = Vec::with_capacity(size);
        let mut am_receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = channel();
            am_senders.push(tx);
            am_receivers.push(Mutex::new(rx));
        }
        let segments = (0..size).map(|_| Segment { bytes: Mutex::new(vec![0u8; segment_bytes]) }).collect();
        let mut teams = HashMap::new();
        teams.insert(0u32, (0..size).collect());
        Arc::new(World {
            size,
            segments,
            am_senders,
            am_receivers,
            pending: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            barrier: Barrier::new(size),
            teams: Mutex::new(teams),
        })
    }

    fn fresh_handle(&self) -> EventHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().unwrap().insert(id, POLL_LATENCY);
        EventHandle(id)
    }

    fn members(&self, team: TeamHandle) -> Vec<usize> {
        self.teams.lock().unwrap().get(&team.0).cloned().unwrap_or_default()
    }

    /// Registers a subteam's membership so `coll_*` calls against it know
    /// which ranks participate. Collective over the world team (id `0`) by
    /// construction; tests that split need not call this for the root.
    pub fn register_team(&self, id: u32, members: Vec<usize>) {
        self.teams.lock().unwrap().insert(id, members);
    }
}

/// One rank's view of a [`World`].
pub struct LoopbackTransport {
    rank: usize,
    world: Arc<World>,
    logger: RefCell<Option<Logger<TransportEvent>>>,
}

// SAFETY: `logger` holds an `Rc`-based `pgas_logging::Logger`, which is not
// `Send`/`Sync` on its own. Every `LoopbackTransport` is constructed inside
// the OS thread that runs as its rank (see `initialize::LoopbackConfiguration::execute`)
// and never handed to another thread afterward — only the `Arc<World>` it
// wraps genuinely crosses threads, and that field's real synchronization is
// unaffected by this impl. No other thread ever observes or clones this
// instance's `logger`, so its `Rc` refcount is never touched concurrently.
unsafe impl Send for LoopbackTransport {}
unsafe impl Sync for LoopbackTransport {}

impl LoopbackTransport {
    /// Binds rank `rank` to `world`.
    pub fn new(rank: usize, world: Arc<World>) -> Self {
        LoopbackTransport { rank, world, logger: RefCell::new(None) }
    }

    /// Binds `logger` as this transport's event sink, replacing any logger
    /// bound previously. Submissions log before returning their handle;
    /// completions are not logged here since `event_test` has no event of
    /// its own to attach one to.
    pub fn set_logger(&self, logger: Logger<TransportEvent>) {
        *self.logger.borrow_mut() = Some(logger);
    }

    fn log(&self, event: TransportEvent) {
        if let Some(logger) = self.logger.borrow().as_ref() {
            logger.log(event);
        }
    }

    /// Blocks until every rank in the world has called this once. Used by
    /// tests that need ranks to reach a consistent point before asserting
    /// on each other's state, independent of any collective under test.
    pub fn sync(&self) {
        self.world.barrier.wait();
    }
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world.size
    }

    fn rma_get_nb(&self, src_rank: usize, src_addr: u64, dst: &mut [u8]) -> EventHandle {
        let segment = self.world.segments[src_rank].bytes.lock().unwrap();
        let start = src_addr as usize;
        dst.copy_from_slice(&segment[start..start + dst.len()]);
        drop(segment);
        let handle = self.world.fresh_handle();
        self.log(TransportEvent::Rma(RmaEvent { is_get: true, peer: src_rank, len: dst.len(), handle }));
        handle
    }

    fn rma_put_nb(&self, dst_rank: usize, dst_addr: u64, src: &[u8], _mode: SourceCompletionMode) -> EventHandle {
        let mut segment = self.world.segments[dst_rank].bytes.lock().unwrap();
        let start = dst_addr as usize;
        segment[start..start + src.len()].copy_from_slice(src);
        drop(segment);
        let handle = self.world.fresh_handle();
        self.log(TransportEvent::Rma(RmaEvent { is_get: false, peer: dst_rank, len: src.len(), handle }));
        handle
    }

    fn rma_put_blocking(&self, dst_rank: usize, dst_addr: u64, src: &[u8]) {
        let mut segment = self.world.segments[dst_rank].bytes.lock().unwrap();
        let start = dst_addr as usize;
        segment[start..start + src.len()].copy_from_slice(src);
    }

    fn am_master(&self, rank: usize, payload: &[u8]) -> EventHandle {
        self.world.am_senders[rank].send(Bytes::from(payload.to_vec())).expect("loopback peer receiver dropped");
        let handle = self.world.fresh_handle();
        self.log(TransportEvent::ActiveMessage(ActiveMessageEvent { dst_rank: rank, payload_len: payload.len(), handle }));
        handle
    }

    fn coll_barrier_nb(&self, team: TeamHandle) -> EventHandle {
        let handle = self.world.fresh_handle();
        self.log(TransportEvent::Collective(CollectiveEvent { team, kind: CollectiveKind::Barrier, handle }));
        handle
    }

    fn coll_broadcast_nb(&self, team: TeamHandle, root: usize, buf: &mut [u8]) -> EventHandle {
        let members = self.world.members(team);
        debug_assert!(members.contains(&self.rank));
        if self.rank != root {
            let segment = self.world.segments[root].bytes.lock().unwrap();
            // The loopback broadcast reuses the root's shared segment as a
            // mailbox at a fixed offset within it (address 0) since there
            // is no real network broadcast primitive to delegate to.
            buf.copy_from_slice(&segment[0..buf.len()]);
        } else {
            let mut segment = self.world.segments[root].bytes.lock().unwrap();
            segment[0..buf.len()].copy_from_slice(buf);
        }
        let handle = self.world.fresh_handle();
        self.log(TransportEvent::Collective(CollectiveEvent { team, kind: CollectiveKind::Broadcast { root }, handle }));
        handle
    }

    fn coll_reduce_to_one_nb(
        &self,
        team: TeamHandle,
        root: usize,
        dst: &mut [u8],
        src: &[u8],
        dt: Datatype,
        op: ReduceOp,
    ) -> EventHandle {
        let members = self.world.members(team);
        // Collect every member's contribution by re-reading their segment
        // mailbox at address `size_of(dt)` — a loopback shortcut, not a
        // production wire protocol.
        let width = dt.size();
        {
            let mut segment = self.world.segments[self.rank].bytes.lock().unwrap();
            segment[width..width + src.len()].copy_from_slice(src);
        }
        self.world.barrier.wait();
        if self.rank == root {
            let mut acc = src.to_vec();
            for &member in &members {
                if member == self.rank { continue; }
                let segment = self.world.segments[member].bytes.lock().unwrap();
                let contribution = segment[width..width + src.len()].to_vec();
                acc = reduce_bytes(&acc, &contribution, dt, op);
            }
            dst.copy_from_slice(&acc);
        }
        self.world.barrier.wait();
        let handle = self.world.fresh_handle();
        self.log(TransportEvent::Collective(CollectiveEvent {
            team,
            kind: CollectiveKind::Reduce { root: Some(root), dt, op },
            handle,
        }));
        handle
    }

    fn coll_reduce_to_all_nb(
        &self,
        team: TeamHandle,
        dst: &mut [u8],
        src: &[u8],
        dt: Datatype,
        op: ReduceOp,
    ) -> EventHandle {
        let members = self.world.members(team);
        let width = dt.size();
        {
            let mut segment = self.world.segments[self.rank].bytes.lock().unwrap();
            segment[width..width + src.len()].copy_from_slice(src);
        }
        self.world.barrier.wait();
        let mut acc = src.to_vec();
        for &member in &members {
            if member == self.rank { continue; }
            let segment = self.world.segments[member].bytes.lock().unwrap();
            let contribution = segment[width..width + src.len()].to_vec();
            acc = reduce_bytes(&acc, &contribution, dt, op);
        }
        dst.copy_from_slice(&acc);
        self.world.barrier.wait();
        let handle = self.world.fresh_handle();
        self.log(TransportEvent::Collective(CollectiveEvent {
            team,
            kind: CollectiveKind::Reduce { root: None, dt, op },
            handle,
        }));
        handle
    }

    fn atomic_op_nb(&self, rank: usize, addr: u64, dt: Datatype, op: ReduceOp, operand: &[u8], result: &mut [u8]) -> EventHandle {
        let width = dt.size();
        let start = addr as usize;
        let mut segment = self.world.segments[rank].bytes.lock().unwrap();
        let old = segment[start..start + width].to_vec();
        let new = reduce_bytes(&old, operand, dt, op);
        segment[start..start + width].copy_from_slice(&new);
        result.copy_from_slice(&old);
        drop(segment);
        self.world.fresh_handle()
    }

    fn event_test(&self, handle: EventHandle) -> bool {
        let mut pending = self.world.pending.lock().unwrap();
        match pending.get_mut(&handle.0) {
            None => true,
            Some(remaining) => {
                if *remaining == 0 {
                    true
                } else {
                    *remaining -= 1;
                    false
                }
            }
        }
    }

    fn shared_segment(&self, rank: usize) -> (usize, usize) {
        // The loopback transport never exposes raw pointers across threads;
        // callers within this process address segments through `rank`
        // alone, so the "address" half of a loopback global pointer is
        // simply an offset into `World::segments[rank]`.
        let segment = self.world.segments[rank].bytes.lock().unwrap();
        (0, segment.len())
    }

    fn try_recv_am(&self) -> Option<Bytes> {
        self.world.am_receivers[self.rank].lock().unwrap().try_recv().ok()
    }
}

fn reduce_bytes(a: &[u8], b: &[u8], dt: Datatype, op: ReduceOp) -> Vec<u8> {
    macro_rules! combine {
        ($ty:ty, $from:ident, $to:ident) => {{
            let av = <$ty>::$from(a.try_into().unwrap());
            let bv = <$ty>::$from(b.try_into().unwrap());
            let rv = apply_op(av, bv, op);
            rv.$to().to_vec()
        }};
    }
    match dt {
        Datatype::I32 => combine!(i32, from_ne_bytes, to_ne_bytes),
        Datatype::U32 => combine!(u32, from_ne_bytes, to_ne_bytes),
        Datatype::I64 => combine!(i64, from_ne_bytes, to_ne_bytes),
        Datatype::U64 => combine!(u64, from_ne_bytes, to_ne_bytes),
        Datatype::F32 => {
            let av = f32::from_ne_bytes(a.try_into().unwrap());
            let bv = f32::from_ne_bytes(b.try_into().unwrap());
            apply_op_float(av, bv, op).to_ne_bytes().to_vec()
        }
        Datatype::F64 => {
            let av = f64::from_ne_bytes(a.try_into().unwrap());
            let bv = f64::from_ne_bytes(b.try_into().unwrap());
            apply_op_float(av, bv, op).to_ne_bytes().to_vec()
        }
    }
}

trait Integral: Copy + PartialOrd + std::ops::Add<Output = Self> + std::ops::Mul<Output = Self>
    + std::ops::BitAnd<Output = Self> + std::ops::BitOr<Output = Self> + std::ops::BitXor<Output = Self> {}
impl Integral for i32 {}
impl Integral for u32 {}
impl Integral for i64 {}
impl Integral for u64 {}

fn apply_op<T: Integral>(a: T, b: T, op: ReduceOp) -> T {
    match op {
        ReduceOp::Add => a + b,
        ReduceOp::Mul => a * b,
        ReduceOp::Min => if a < b { a } else { b },
        ReduceOp::Max => if a > b { a } else { b },
        ReduceOp::And => a & b,
        ReduceOp::Or => a | b,
        ReduceOp::Xor => a ^ b,
        ReduceOp::User(id) => panic!("loopback transport has no combine function registered for user op {id}"),
    }
}

fn apply_op_float<T: Copy + PartialOrd + std::ops::Add<Output = T> + std::ops::Mul<Output = T>>(a: T, b: T, op: ReduceOp) -> T {
    match op {
        ReduceOp::Add => a + b,
        ReduceOp::Mul => a * b,
        ReduceOp::Min => if a < b { a } else { b },
        ReduceOp::Max => if a > b { a } else { b },
        ReduceOp::And | ReduceOp::Or | ReduceOp::Xor => panic!("bitwise ops are undefined over floating point"),
        ReduceOp::User(id) => panic!("loopback transport has no combine function registered for user op {id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn a_bound_logger_observes_rma_and_am_submissions() {
        let world = World::new(2, 4096);
        let t0 = LoopbackTransport::new(0, world.clone());
        let t1 = LoopbackTransport::new(1, world);

        let mut registry = pgas_logging::Registry::new(std::time::Instant::now());
        let events = Rc::new(StdRefCell::new(Vec::new()));
        let sink = events.clone();
        registry.insert::<TransportEvent>(
            "transport",
            Box::new(move |_elapsed, batch| sink.borrow_mut().extend(batch.iter().map(|(_, e)| *e))),
        );
        let logger = registry.get::<TransportEvent>("transport").expect("just inserted");
        t0.set_logger(logger.clone());

        let src = 9i64.to_ne_bytes();
        t0.rma_put_nb(1, 0, &src, SourceCompletionMode::AlreadyQuiescent);
        t0.am_master(1, b"hello");
        logger.flush();

        let logged = events.borrow();
        assert!(logged.iter().any(|e| matches!(e, TransportEvent::Rma(RmaEvent { is_get: false, peer: 1, len: 8, .. }))));
        assert!(logged
            .iter()
            .any(|e| matches!(e, TransportEvent::ActiveMessage(ActiveMessageEvent { dst_rank: 1, payload_len: 5, .. }))));

        // Rank 1 never bound a logger, so nothing it submits is logged.
        let _ = t1.rank();
    }

    #[test]
    fn put_then_get_round_trips() {
        let world = World::new(2, 4096);
        let t0 = LoopbackTransport::new(0, world.clone());
        let t1 = LoopbackTransport::new(1, world);
        let src = 42i64.to_ne_bytes();
        let h = t0.rma_put_nb(1, 0, &src, SourceCompletionMode::AlreadyQuiescent);
        while !t0.event_test(h) {}
        let mut dst = [0u8; 8];
        let h = t1.rma_get_nb(1, 0, &mut dst);
        while !t1.event_test(h) {}
        assert_eq!(i64::from_ne_bytes(dst), 42);
    }

    #[test]
    fn atomic_op_nb_returns_pre_op_value_and_applies_op() {
        let world = World::new(1, 4096);
        let t = LoopbackTransport::new(0, world);
        let zero = 0i64.to_ne_bytes();
        t.rma_put_blocking(0, 512, &zero);

        let mut old = [0u8; 8];
        let h = t.atomic_op_nb(0, 512, Datatype::I64, ReduceOp::Add, &7i64.to_ne_bytes(), &mut old);
        while !t.event_test(h) {}
        assert_eq!(i64::from_ne_bytes(old), 0);

        let mut dst = [0u8; 8];
        let h = t.rma_get_nb(0, 512, &mut dst);
        while !t.event_test(h) {}
        assert_eq!(i64::from_ne_bytes(dst), 7);

        let mut old2 = [0u8; 8];
        let h = t.atomic_op_nb(0, 512, Datatype::I64, ReduceOp::Add, &3i64.to_ne_bytes(), &mut old2);
        while !t.event_test(h) {}
        assert_eq!(i64::from_ne_bytes(old2), 7);
    }

    #[test]
    fn reduce_to_all_max_over_four_ranks() {
        let world = World::new(4, 4096);
        let handles: Vec<_> = (0..4)
            .map(|r| {
                let world = world.clone();
                std::thread::spawn(move || {
                    let t = LoopbackTransport::new(r, world);
                    let src = (r as i64).to_ne_bytes();
                    let mut dst = [0u8; 8];
                    let h = t.coll_reduce_to_all_nb(TeamHandle(0), &mut dst, &src, Datatype::I64, ReduceOp::Max);
                    while !t.event_test(h) {}
                    i64::from_ne_bytes(dst)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 3);
        }
    }
}
