//! Public types for the engine coordinator.

use crate::network::ConnectionQuality;
use crate::resilience::circuit_breaker::CircuitState;

/// Engine lifecycle state.
///
/// Use [`super::OfflineEngine::state()`] to check the current state or
/// [`super::OfflineEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Loading the queue and rotating cache versions
    Starting,
    /// Background tasks running
    Running,
    /// Cancelling drains and persisting the queue
    ShuttingDown,
    /// Background tasks joined; reads still work
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time view of the engine for status pages and diagnostics.
///
/// Every field is read from in-memory state; building one does no I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineHealth {
    pub state: EngineState,
    /// Debounced connectivity
    pub online: bool,
    pub quality: ConnectionQuality,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    /// Queued tasks that are not dead
    pub pending_tasks: usize,
    pub dead_letters: usize,
    /// Distinct network fetches currently in flight
    pub inflight_fetches: usize,
    /// Running, online and the sync circuit is not open
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
        assert_eq!(format!("{}", EngineState::Stopped), "Stopped");
    }
}
