//! Pipeline state management

use std::time::Instant;

/// Pipeline state machine
///
/// Represents the lifecycle of the receive pipeline. Transitions are
/// validated so concurrent triggers (a stage failure racing an external
/// stop) collapse into one orderly teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Pipeline has not been started
    Idle,

    /// Transport, decoder and sink are being set up
    Starting,

    /// All stages are running
    Running {
        /// When the pipeline reached Running
        started_at: Instant,
    },

    /// Teardown in progress: workers cancelled, transport closing
    Aborting,

    /// All workers joined and resources released; terminal
    Stopped,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // From Idle
            (Idle, Starting) => true,
            (Idle, Stopped) => true, // aborted before ever starting

            // From Starting
            (Starting, Running { .. }) => true,
            (Starting, Aborting) => true, // setup failure or early abort

            // From Running
            (Running { .. }, Aborting) => true,

            // From Aborting
            (Aborting, Stopped) => true,

            // From Stopped - terminal
            (Stopped, _) => false,

            // Self-transitions
            (a, b) if a == b => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Starting => "Starting",
            PipelineState::Running { .. } => "Running",
            PipelineState::Aborting => "Aborting",
            PipelineState::Stopped => "Stopped",
        }
    }

    /// Check if the pipeline is running
    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    /// Check if the pipeline is stopped or tearing down
    pub fn is_stopped(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Aborting)
    }

    /// Get the duration since the pipeline started (if running)
    pub fn running_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Running { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
