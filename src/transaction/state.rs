//! Atomic operation state management.

use std::time::{Duration, Instant};

use super::id::OperationId;

/// The possible states of an atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// The operation is open and may stage changes.
    Active,
    /// The operation's changes were logged and applied.
    Committed,
    /// The operation's changes were discarded.
    RolledBack,
}

impl OperationState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack)
    }

    /// Returns true if the operation is finished (committed or rolled back).
    pub fn is_finished(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committed => write!(f, "Committed"),
            Self::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// Information about an atomic operation.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub id: OperationId,
    pub state: OperationState,
    pub start_time: Instant,
    /// Set once the operation is finished.
    pub end_time: Option<Instant>,
}

impl OperationInfo {
    pub fn new(id: OperationId) -> Self {
        Self {
            id,
            state: OperationState::Active,
            start_time: Instant::now(),
            end_time: None,
        }
    }

    /// Returns the duration for which the operation has been running.
    pub fn duration(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Moves an active operation to `state`. Returns false, leaving the info
    /// untouched, if the operation was already finished.
    pub fn finish(&mut self, state: OperationState) -> bool {
        if !self.state.is_active() {
            return false;
        }
        self.state = state;
        self.end_time = Some(Instant::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_state() {
        let active = OperationState::Active;
        let committed = OperationState::Committed;
        let rolled_back = OperationState::RolledBack;

        assert!(active.is_active());
        assert!(!active.is_finished());

        assert!(committed.is_committed());
        assert!(committed.is_finished());

        assert!(rolled_back.is_rolled_back());
        assert!(rolled_back.is_finished());
        assert!(!rolled_back.is_committed());
    }

    #[test]
    fn test_operation_state_display() {
        assert_eq!(format!("{}", OperationState::Active), "Active");
        assert_eq!(format!("{}", OperationState::Committed), "Committed");
        assert_eq!(format!("{}", OperationState::RolledBack), "RolledBack");
    }

    #[test]
    fn test_finish_only_once() {
        let mut info = OperationInfo::new(OperationId::new(1));
        assert!(info.end_time.is_none());

        assert!(info.finish(OperationState::Committed));
        assert_eq!(info.state, OperationState::Committed);
        assert!(info.end_time.is_some());

        assert!(!info.finish(OperationState::RolledBack));
        assert_eq!(info.state, OperationState::Committed);
    }

    #[test]
    fn test_duration_is_fixed_after_finish() {
        let mut info = OperationInfo::new(OperationId::new(1));

        std::thread::sleep(Duration::from_millis(10));
        assert!(info.duration() >= Duration::from_millis(10));

        info.finish(OperationState::RolledBack);
        let duration = info.duration();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(info.duration(), duration);
    }
}
