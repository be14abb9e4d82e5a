//! Event types a [`Transport`](crate::Transport) implementation may log
//! through [`pgas_logging::Logger`] for diagnostic tracing of wire traffic.
//!
//! The loopback transport does not log by default — these types exist so a
//! caller can wire up a `Logger<TransportEvent>` around a transport handle
//! the same way the core wires one up for persona and progress events.

use serde::{Deserialize, Serialize};

use crate::{Datatype, EventHandle, ReduceOp, TeamHandle};

/// Identifies the rank and side (local submitter vs remote target) a
/// transport event concerns.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct TransportSetup {
    /// Rank that owns the logged transport handle.
    pub rank: usize,
    /// Total ranks in the job, for context when rendering a trace.
    pub world_size: usize,
}

/// A loggable transport-level event.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum TransportEvent {
    /// An RMA get or put was submitted.
    Rma(RmaEvent),
    /// An active message was sent or delivered.
    ActiveMessage(ActiveMessageEvent),
    /// A collective was submitted.
    Collective(CollectiveEvent),
    /// A previously returned handle was observed ready.
    Completion(EventHandle),
}

/// An RMA submission.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct RmaEvent {
    /// `true` for get, `false` for put.
    pub is_get: bool,
    /// The peer rank the operation addresses.
    pub peer: usize,
    /// Length of the transferred region, in bytes.
    pub len: usize,
    /// Handle the submission returned.
    pub handle: EventHandle,
}

/// An active-message submission.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct ActiveMessageEvent {
    /// Destination rank's master persona.
    pub dst_rank: usize,
    /// Size of the serialized payload, in bytes.
    pub payload_len: usize,
    /// Handle the submission returned.
    pub handle: EventHandle,
}

/// A collective submission.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct CollectiveEvent {
    /// Team the collective runs over.
    pub team: TeamHandle,
    /// Which collective kind was submitted.
    pub kind: CollectiveKind,
    /// Handle the submission returned.
    pub handle: EventHandle,
}

/// Distinguishes the built-in collective kinds a transport supports.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum CollectiveKind {
    /// A barrier.
    Barrier,
    /// A broadcast from `root`.
    Broadcast {
        /// Root rank of the broadcast.
        root: usize,
    },
    /// A reduction, to one rank or to all, over `dt` with `op`.
    Reduce {
        /// `Some(root)` for reduce-to-one, `None` for reduce-to-all.
        root: Option<usize>,
        /// Element type being reduced.
        dt: Datatype,
        /// Combine operator applied.
        op: ReduceOp,
    },
}
