//! Environment-driven configuration (design doc §3, §6).
//!
//! `os_env::<T>(name, default)` reads and parses an environment variable,
//! falling back to `default` when it is unset, and reports the resolved
//! value (and whether it was defaulted) through [`tracing`]. This mirrors
//! `original_source/src/os_env.hpp`'s `upcxx::os_env`, with `FromStr`
//! standing in for the original's `istringstream` round-trip.

use std::fmt::Display;
use std::str::FromStr;

use pgas_transport::initialize::{LoopbackConfiguration, WorkerGuards};
use pgas_transport::loopback::LoopbackTransport;

/// Reads `name` from the environment, parsing it as `T`; returns `default`
/// if the variable is unset or fails to parse.
pub fn os_env<T>(name: &str, default: T) -> T
where
    T: FromStr + Display + Clone,
{
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => {
                tracing::debug!(target: "pgas::config", name, value = %value, defaulted = false, "resolved configuration value");
                value
            }
            Err(_) => {
                tracing::warn!(target: "pgas::config", name, raw, "failed to parse environment variable, using default");
                default
            }
        },
        Err(_) => {
            tracing::debug!(target: "pgas::config", name, value = %default, defaulted = true, "resolved configuration value");
            default
        }
    }
}

/// Shared-heap size, in bytes, for this rank's segment. Recognised
/// environment variable: `PGAS_SHARED_HEAP_SIZE`. Defaults to 64 MiB,
/// matching the scale the original implementation's default targets.
pub fn shared_heap_size() -> usize {
    os_env("PGAS_SHARED_HEAP_SIZE", 64 * 1024 * 1024)
}

/// Whether verbose diagnostic logging is requested. Recognised
/// environment variable: `PGAS_VERBOSE`.
pub fn verbose() -> bool {
    os_env("PGAS_VERBOSE", false)
}

/// Worker-thread count used by hybrid (thread + loopback-process) test
/// configurations. Recognised environment variable: `PGAS_WORKER_THREADS`.
pub fn worker_threads() -> usize {
    os_env("PGAS_WORKER_THREADS", 1)
}

/// Builds and runs a loopback job sized entirely from the environment:
/// [`worker_threads`] ranks, each given a [`shared_heap_size`]-byte shared
/// segment. The environment-driven counterpart to constructing a
/// [`LoopbackConfiguration`] by hand, matching how `original_source`
/// resolves a job's rank count and per-rank shared-heap size from its
/// environment ahead of `upcxx::init()` rather than taking them as
/// explicit call-site arguments.
pub fn loopback_job_from_env<T, F>(func: F) -> Result<WorkerGuards<T>, String>
where
    T: Send + 'static,
    F: Fn(LoopbackTransport) -> T + Send + Sync + 'static,
{
    LoopbackConfiguration::new(worker_threads()).with_segment_bytes(shared_heap_size()).execute(func)
}
