use serde::{Deserialize, Serialize};

/// Lifecycle of the supervised server. Only the supervisor mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ProcessState {
    /// States from which `start()` is accepted.
    pub fn can_start(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed)
    }

    /// States from which `stop()` is accepted.
    pub fn can_stop(self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }

    /// A process exists in the slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }

    /// Where a run ends up once its process has exited.
    pub fn after_exit(self) -> ProcessState {
        match self {
            ProcessState::Stopping => ProcessState::Stopped,
            ProcessState::Starting | ProcessState::Running => ProcessState::Crashed,
            other => other,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Crashed => write!(f, "crashed"),
        }
    }
}
