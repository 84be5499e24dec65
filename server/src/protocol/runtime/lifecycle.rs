use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuntimeState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl RuntimeState {
    /// Whether application work is still accepted.
    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }
    pub fn is_stopped(&self) -> bool {
        matches!(self, RuntimeState::Stopped)
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    /// The last store call failed after all retries.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartupStep {
    RegisterNode,
    StartEndpoints,
    StartControlChannel,
    StartScheduler,
}

impl StartupStep {
    pub const ORDER: [StartupStep; 4] = [
        StartupStep::RegisterNode,
        StartupStep::StartEndpoints,
        StartupStep::StartControlChannel,
        StartupStep::StartScheduler,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutdownStep {
    StopAcceptingWork,
    ReleaseReplyWaiters,
    DrainInFlight,
    DisposeEndpoints,
    DisposeTransports,
    CancelDurability,
    AwaitScheduler,
    ReleaseTimers,
    DeregisterNode,
}

impl ShutdownStep {
    pub const ORDER: [ShutdownStep; 9] = [
        ShutdownStep::StopAcceptingWork,
        ShutdownStep::ReleaseReplyWaiters,
        ShutdownStep::DrainInFlight,
        ShutdownStep::DisposeEndpoints,
        ShutdownStep::DisposeTransports,
        ShutdownStep::CancelDurability,
        ShutdownStep::AwaitScheduler,
        ShutdownStep::ReleaseTimers,
        ShutdownStep::DeregisterNode,
    ];
}
