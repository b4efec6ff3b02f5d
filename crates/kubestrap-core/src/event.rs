use serde::Serialize;

use crate::types::{EngineState, StepResult};

/// Progress events published by the engine during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        phases: usize,
        dry_run: bool,
    },
    PhaseStarted {
        phase: usize,
        steps: Vec<String>,
    },
    StepStarted {
        step: String,
        host: String,
        attempt: u32,
    },
    StepRetrying {
        step: String,
        host: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    StepFinished {
        result: Box<StepResult>,
    },
    HostExcluded {
        host: String,
        step: String,
    },
    FactPublished {
        key: String,
        step: String,
        host: String,
    },
    PhaseCompleted {
        phase: usize,
        failures: usize,
    },
    RunFinished {
        run_id: String,
        state: EngineState,
    },
}

impl RunEvent {
    /// Event name as it appears in run logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PhaseStarted { .. } => "phase_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepFinished { .. } => "step_finished",
            Self::HostExcluded { .. } => "host_excluded",
            Self::FactPublished { .. } => "fact_published",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
