//! The transport-facing interface the pgas-rt core assumes, plus an
//! in-process loopback implementation used by tests and examples.
//!
//! The real network transport — RDMA verbs, GASNet, a vendor SHMEM layer —
//! is explicitly out of scope for the core: the core only ever calls
//! through the [`Transport`] trait below. This crate also ships
//! [`loopback::LoopbackTransport`], a same-process, multi-thread stand-in
//! that implements the trait over shared memory and `std::sync::mpsc`
//! channels, which is what the core's own test suite runs against.
//!
//! # Examples
//!
//! ```
//! use pgas_transport::initialize::LoopbackConfiguration;
//! use pgas_transport::Transport;
//!
//! let guards = LoopbackConfiguration::new(2).execute(|transport| {
//!     transport.rank()
//! }).expect("loopback spins up fine");
//!
//! let mut ranks: Vec<usize> = guards.join().into_iter().map(Result::unwrap).collect();
//! ranks.sort();
//! assert_eq!(ranks, vec![0, 1]);
//! ```

pub mod initialize;
pub mod loopback;
pub mod logging;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque handle returned by every non-blocking transport submission.
///
/// Handles are only ever tested with [`Transport::event_test`] or passed
/// back to the transport that minted them; the core never inspects their
/// internals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventHandle(pub u64);

/// Opaque handle identifying a rank group ("team") at the transport level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamHandle(pub u32);

/// Scalar element type carried by a collective or atomic operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// IEEE-754 single precision.
    F32,
    /// IEEE-754 double precision.
    F64,
}

impl Datatype {
    /// Size in bytes of one element of this type.
    pub fn size(&self) -> usize {
        match self {
            Datatype::I32 | Datatype::U32 | Datatype::F32 => 4,
            Datatype::I64 | Datatype::U64 | Datatype::F64 => 8,
        }
    }
}

/// A reduction operator, either one of the transport's built-ins or a
/// user-supplied combine function identified by an opaque id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Built-in associative add.
    Add,
    /// Built-in associative multiply.
    Mul,
    /// Built-in min.
    Min,
    /// Built-in max.
    Max,
    /// Built-in bitwise and (integer types only).
    And,
    /// Built-in bitwise or (integer types only).
    Or,
    /// Built-in bitwise xor (integer types only).
    Xor,
    /// User-defined op, identified by an id registered out of band; real
    /// transports call back into the core's combine function for each
    /// pairwise reduction.
    User(u32),
}

/// How the source buffer of an `rput` should be treated once submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceCompletionMode {
    /// The source is copied or otherwise made safe to reuse immediately;
    /// the transport still issues a `source_cx` completion asynchronously.
    SeparateHandle,
    /// Source completion is folded into operation completion; no
    /// standalone `source_cx` event is issued.
    DeferToOperation,
    /// The caller asserts the source buffer is already quiescent (e.g. it
    /// was just allocated) and no completion bookkeeping is needed.
    AlreadyQuiescent,
}

/// Everything the core needs from the network layer.
///
/// Every method is non-blocking except `rma_put_blocking`, used by the
/// `op_now` put sub-mode. The core polls completions exclusively through
/// [`Transport::event_test`]; there is no callback or interrupt path.
pub trait Transport: Send + Sync {
    /// This process's rank within the job.
    fn rank(&self) -> usize;
    /// Total number of ranks in the job.
    fn world_size(&self) -> usize;

    /// Issues a non-blocking get of `dst.len()` bytes from `src_addr` on
    /// `src_rank` into `dst`.
    fn rma_get_nb(&self, src_rank: usize, src_addr: u64, dst: &mut [u8]) -> EventHandle;

    /// Issues a non-blocking put of `src` into `dst_addr` on `dst_rank`.
    fn rma_put_nb(&self, dst_rank: usize, dst_addr: u64, src: &[u8], mode: SourceCompletionMode) -> EventHandle;

    /// Performs a put and blocks the calling thread until it is globally
    /// complete (the `op_now` sub-mode).
    fn rma_put_blocking(&self, dst_rank: usize, dst_addr: u64, src: &[u8]);

    /// Delivers `payload` as an active message to `rank`'s master persona.
    fn am_master(&self, rank: usize, payload: &[u8]) -> EventHandle;

    /// Non-blocking barrier over `team`.
    fn coll_barrier_nb(&self, team: TeamHandle) -> EventHandle;

    /// Non-blocking broadcast of `buf` (already holding the root's value)
    /// from `root` to every member of `team`.
    fn coll_broadcast_nb(&self, team: TeamHandle, root: usize, buf: &mut [u8]) -> EventHandle;

    /// Non-blocking reduction of `src` into `dst` on `root` only.
    fn coll_reduce_to_one_nb(
        &self,
        team: TeamHandle,
        root: usize,
        dst: &mut [u8],
        src: &[u8],
        dt: Datatype,
        op: ReduceOp,
    ) -> EventHandle;

    /// Non-blocking reduction of `src` into `dst`, delivered to every
    /// member of `team`.
    fn coll_reduce_to_all_nb(
        &self,
        team: TeamHandle,
        dst: &mut [u8],
        src: &[u8],
        dt: Datatype,
        op: ReduceOp,
    ) -> EventHandle;

    /// Non-blocking fetch-and-op on `dt`-sized bytes at `addr` in `rank`'s
    /// segment: applies `op` with `operand` against the current value,
    /// writes the new value back, and copies the *pre-op* value into
    /// `result` (callers that only want the op's side effect may pass a
    /// scratch buffer and ignore it). Atomic with respect to every other
    /// `atomic_op_nb` against the same address on a transport that
    /// implements this correctly; ordinary `rma_get`/`rma_put` against the
    /// same address race with it exactly as the original leaves undefined.
    fn atomic_op_nb(&self, rank: usize, addr: u64, dt: Datatype, op: ReduceOp, operand: &[u8], result: &mut [u8]) -> EventHandle;

    /// Polls `handle`; returns `true` exactly once it has become ready and
    /// forever after.
    fn event_test(&self, handle: EventHandle) -> bool;

    /// Base address and size, in this process's address space, of the
    /// given rank's shared segment — meaningful only when `rank` is a
    /// local (shared-memory) peer.
    fn shared_segment(&self, rank: usize) -> (usize, usize);

    /// Drains one inbound active message addressed to this rank's master
    /// persona, if any is waiting. Called by the progress engine.
    ///
    /// Returned as [`pgas_bytes::Bytes`] rather than a fresh `Vec<u8>`
    /// because a real transport's receive path hands back a region carved
    /// out of one shared staging allocation per poll cycle, not an
    /// independent heap buffer per message.
    fn try_recv_am(&self) -> Option<pgas_bytes::Bytes>;
}

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt#{}", self.0)
    }
}
