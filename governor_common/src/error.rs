//! Error types shared by the runtime crates.

use thiserror::Error;

/// Reason a single device failed during a transition.
///
/// The executor collects one of these per failed device and the machine
/// message enumerates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MoveFailure {
    /// One or more underlying PVs are not live.
    #[error("DISCONNECTED")]
    Disconnected,

    /// Motor controller reports the axis unhomed.
    #[error("NOT_HOMED")]
    NotHomed,

    /// The per-device timeout lapsed without the move completing.
    #[error("TIMEOUT")]
    Timeout,

    /// Motion finished outside the target window, or the demand was
    /// outside the driver's own limits.
    #[error("MISSED_TARGET")]
    MissedTarget,
}

/// Top-level error type for the Governor runtime.
#[derive(Debug, Error)]
pub enum GovernorError {
    /// Configuration loading or validation failed.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// A command was refused; the machine state is unchanged.
    #[error("command rejected: {0}")]
    CommandRejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_labels_match_bus_vocabulary() {
        assert_eq!(MoveFailure::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(MoveFailure::NotHomed.to_string(), "NOT_HOMED");
        assert_eq!(MoveFailure::Timeout.to_string(), "TIMEOUT");
        assert_eq!(MoveFailure::MissedTarget.to_string(), "MISSED_TARGET");
    }
}
