//! Pipeline lifecycle state management

/// Pipeline lifecycle state machine
///
/// Setup walks Built → Ready → Paused → Running and may step back and forth
/// inside the Ready/Paused/Running band. Once Stopping is entered the only
/// way forward is Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Stages added and linked, nothing validated yet
    Built,

    /// Topology validated, properties frozen
    Ready,

    /// Stage resources acquired, tasks spawned, data not flowing yet
    Paused,

    /// Sources are producing
    Running,

    /// Teardown in progress
    Stopping,

    /// All stage tasks finished; terminal
    Stopped,
}

impl LifecycleState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, target) {
            // Self-transitions
            (a, b) if a == b => *a != Stopped,

            (Built, Ready) => true,

            // The setup band
            (Ready, Paused) | (Paused, Running) => true,
            (Running, Paused) | (Paused, Ready) => true,

            // Any live state can begin teardown
            (Built | Ready | Paused | Running, Stopping) => true,

            // From Stopping
            (Stopping, Stopped) => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            LifecycleState::Built => "Built",
            LifecycleState::Ready => "Ready",
            LifecycleState::Paused => "Paused",
            LifecycleState::Running => "Running",
            LifecycleState::Stopping => "Stopping",
            LifecycleState::Stopped => "Stopped",
        }
    }

    /// Check if stage tasks exist (paused or running)
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Paused)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleState::Running)
    }

    /// Check if the pipeline is stopped or stopping
    pub fn is_stopped(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Stopping)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_valid_transitions() {
        assert!(Built.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Running));
        assert!(Running.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Ready));
        assert!(Running.can_transition_to(&Stopping));
        assert!(Paused.can_transition_to(&Stopping));
        assert!(Stopping.can_transition_to(&Stopped));

        // Self-transitions
        assert!(Running.can_transition_to(&Running));
        assert!(Stopping.can_transition_to(&Stopping));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Built.can_transition_to(&Running)); // Must go through Ready/Paused
        assert!(!Running.can_transition_to(&Stopped)); // Must go through Stopping
        assert!(!Stopping.can_transition_to(&Running)); // One-way after Stopping
        assert!(!Stopping.can_transition_to(&Paused));
        assert!(!Stopped.can_transition_to(&Running)); // Can't restart after stopped
        assert!(!Stopped.can_transition_to(&Stopped));
        assert!(!Ready.can_transition_to(&Built));
    }

    #[test]
    fn test_state_checks() {
        assert!(Running.is_active());
        assert!(Running.is_running());
        assert!(!Running.is_stopped());

        assert!(Paused.is_active());
        assert!(!Paused.is_running());

        assert!(!Stopped.is_active());
        assert!(Stopping.is_stopped());
        assert!(Stopped.is_stopped());
        assert_eq!(Stopping.to_string(), "Stopping");
    }
}
