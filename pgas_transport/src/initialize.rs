//! Spins up a [`loopback::LoopbackTransport`](crate::loopback::LoopbackTransport)
//! job: one OS thread per rank, all sharing one [`World`](crate::loopback::World).

use std::any::Any;
use std::sync::Arc;
use std::thread;

use crate::loopback::{LoopbackTransport, World};

/// Default size, in bytes, of each rank's loopback shared segment.
const DEFAULT_SEGMENT_BYTES: usize = 1 << 20;

/// Describes a loopback job: how many ranks, and how big each rank's shared
/// segment is.
pub struct LoopbackConfiguration {
    size: usize,
    segment_bytes: usize,
}

impl LoopbackConfiguration {
    /// A job of `size` ranks, each with the default segment size.
    pub fn new(size: usize) -> Self {
        LoopbackConfiguration { size, segment_bytes: DEFAULT_SEGMENT_BYTES }
    }

    /// Overrides the default shared-segment size.
    pub fn with_segment_bytes(mut self, segment_bytes: usize) -> Self {
        self.segment_bytes = segment_bytes;
        self
    }

    /// Parses a loopback job out of command-line arguments: `-n`/`--ranks`
    /// sets the rank count (default 1) and `-s`/`--segment-bytes` overrides
    /// the shared-segment size. Unrecognized flags are ignored rather than
    /// rejected, since `args` is typically a whole binary's `argv` and most
    /// of it belongs to the program, not the loopback harness.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut opts = getopts::Options::new();
        opts.optopt("n", "ranks", "number of loopback ranks", "N");
        opts.optopt("s", "segment-bytes", "shared segment size in bytes", "BYTES");
        let matches = match opts.parse(args) {
            Ok(matches) => matches,
            Err(_) => return LoopbackConfiguration::new(1),
        };
        let size = matches.opt_str("n").and_then(|v| v.parse().ok()).unwrap_or(1);
        let mut config = LoopbackConfiguration::new(size);
        if let Some(bytes) = matches.opt_str("s").and_then(|v| v.parse().ok()) {
            config = config.with_segment_bytes(bytes);
        }
        config
    }

    /// Spawns one thread per rank, each running `func` against its own
    /// [`LoopbackTransport`], and returns a guard that joins them.
    pub fn execute<T, F>(self, func: F) -> Result<WorkerGuards<T>, String>
    where
        T: Send + 'static,
        F: Fn(LoopbackTransport) -> T + Send + Sync + 'static,
    {
        let world = World::new(self.size, self.segment_bytes);
        let logic = Arc::new(func);
        let mut guards = Vec::with_capacity(self.size);
        for rank in 0..self.size {
            let clone = logic.clone();
            let world = world.clone();
            guards.push(
                thread::Builder::new()
                    .name(format!("pgas-rank-{rank}"))
                    .spawn(move || {
                        let transport = LoopbackTransport::new(rank, world);
                        (*clone)(transport)
                    })
                    .map_err(|e| format!("{e:?}"))?,
            );
        }
        Ok(WorkerGuards { guards, _others: Box::new(()) })
    }
}

/// Join handles for a loopback job's worker threads.
pub struct WorkerGuards<T: Send + 'static> {
    guards: Vec<thread::JoinHandle<T>>,
    _others: Box<dyn Any>,
}

impl<T: Send + 'static> WorkerGuards<T> {
    /// Waits on every rank's thread and collects its result.
    pub fn join(mut self) -> Vec<Result<T, String>> {
        self.guards
            .drain(..)
            .map(|guard| guard.join().map_err(|e| format!("{e:?}")))
            .collect()
    }
}

impl<T: Send + 'static> Drop for WorkerGuards<T> {
    fn drop(&mut self) {
        for guard in self.guards.drain(..) {
            let _ = guard.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;

    #[test]
    fn four_ranks_see_consistent_world_size() {
        let guards = LoopbackConfiguration::new(4).execute(|t| (t.rank(), t.world_size())).unwrap();
        let results = guards.join();
        let mut ranks: Vec<usize> = results.into_iter().map(|r| {
            let (rank, world_size) = r.unwrap();
            assert_eq!(world_size, 4);
            rank
        }).collect();
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    #[cfg(feature = "getopts")]
    fn from_args_parses_rank_count_and_segment_bytes() {
        let args = vec!["-n".to_string(), "3".to_string(), "--segment-bytes".to_string(), "2048".to_string()];
        let config = LoopbackConfiguration::from_args(args);
        assert_eq!(config.size, 3);
        assert_eq!(config.segment_bytes, 2048);
    }

    #[test]
    #[cfg(feature = "getopts")]
    fn from_args_defaults_to_one_rank_when_unset() {
        let config = LoopbackConfiguration::from_args(Vec::<String>::new());
        assert_eq!(config.size, 1);
    }
}
