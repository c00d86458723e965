//! Per-operation state machine.
//!
//! ```text
//! Idle -> SessionAcquired -> StagingCreated -> Loaded -> Locked -> Merged
//!      -> Committed | RolledBack -> SessionReleased
//! ```
//!
//! Any failure jumps straight to `RolledBack`. Errors raised while a phase is
//! in progress are tagged with that phase.

use std::fmt;

/// Phase of a single synchronization operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Idle,
    SessionAcquired,
    StagingCreated,
    Loaded,
    Locked,
    Merged,
    Committed,
    RolledBack,
    SessionReleased,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::SessionAcquired => "session_acquired",
            SyncPhase::StagingCreated => "staging_created",
            SyncPhase::Loaded => "loaded",
            SyncPhase::Locked => "locked",
            SyncPhase::Merged => "merged",
            SyncPhase::Committed => "committed",
            SyncPhase::RolledBack => "rolled_back",
            SyncPhase::SessionReleased => "session_released",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(SyncPhase::StagingCreated.to_string(), "staging_created");
        assert_eq!(SyncPhase::Locked.to_string(), "locked");
    }
}
