//! Fatal-error banner and process teardown.
//!
//! The core never has a recoverable error channel below precondition
//! assertions and shared-heap exhaustion (see the error handling design):
//! once the transport or an invariant check decides a job cannot continue,
//! it prints a banner naming the rank, host, source location, and cause,
//! then aborts the process. Nothing upstream can catch this and keep going,
//! matching the transport's own `fatal_error` contract.

use std::fmt;

/// Identifies the rank and host a fatal error was raised from.
#[derive(Clone, Debug)]
pub struct Origin {
    /// Rank that raised the error, if the runtime had progressed far enough
    /// to know its identity.
    pub rank: Option<usize>,
    /// Hostname of the process, best-effort.
    pub host: String,
}

impl Origin {
    /// Captures the current host name via the environment; falls back to
    /// `"unknown-host"` if it cannot be determined.
    pub fn here(rank: Option<usize>) -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown-host".to_string());
        Origin { rank, host }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rank {
            Some(rank) => write!(f, "rank {} on {}", rank, self.host),
            None => write!(f, "(rank unknown) on {}", self.host),
        }
    }
}

/// Prints the fatal-error banner and aborts the process.
///
/// `location` is typically `#[track_caller]`'s `Location::caller()` or a
/// fixed string naming the failing component. This function never returns.
#[track_caller]
pub fn fatal_error(origin: &Origin, cause: impl fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(
        target: "pgas::fatal",
        %origin,
        %location,
        %cause,
        "fatal error, terminating job"
    );
    eprintln!(
        "==== pgas-rt fatal error ====\n\
         origin:   {origin}\n\
         location: {location}\n\
         cause:    {cause}\n\
         =============================="
    );
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::Origin;

    #[test]
    fn origin_formats_with_rank() {
        let origin = Origin { rank: Some(3), host: "node-a".to_string() };
        assert_eq!(format!("{origin}"), "rank 3 on node-a");
    }
}
