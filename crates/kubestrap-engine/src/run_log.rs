use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kubestrap_core::event::{EventBus, RunEvent};

/// JSONL run logger.
///
/// Writes one JSON object per engine event to `{log_dir}/{run_id}.jsonl`,
/// flushing after every line so a crashed run still leaves a usable log.
pub struct RunLogger {
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run: &'a str,
    #[serde(flatten)]
    event: &'a RunEvent,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Path of the log file for `run_id`.
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Subscribe now and write in the background until `RunFinished`,
    /// bus closure, or cancellation.
    ///
    /// Subscribing before the task starts guarantees no early event is
    /// missed.
    pub fn spawn(
        self,
        event_bus: Arc<EventBus>,
        run_id: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, run_id, cancel))
    }

    async fn run(self, mut rx: Receiver<RunEvent>, run_id: String, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, dir = %self.log_dir.display(), "Failed to create log directory");
            return;
        }

        let log_path = self.path_for(&run_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "Run log started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Run log cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, path = %log_path.display(), "Run log fell behind, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed, run log stopping");
                        break;
                    }
                },
            };

            let entry = LogEntry {
                timestamp: Utc::now().to_rfc3339(),
                run: &run_id,
                event: &event,
            };
            if let Ok(json) = serde_json::to_string(&entry) {
                let line = format!("{}\n", json);
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(error = %e, "Failed to write log entry");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!(error = %e, "Failed to flush log");
                }
            }

            if matches!(event, RunEvent::RunFinished { .. }) {
                break;
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Run log finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestrap_core::types::{EngineState, PlanDefinition, StepDef, Target};
    use kubestrap_test_utils::cluster_inventory;

    use crate::checks::CheckRegistry;
    use crate::plan::{Plan, MIN_EVENT_CAPACITY};

    #[tokio::test]
    async fn test_writes_jsonl_until_run_finished() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let logger = RunLogger::new(dir.path().join("runs"));
        let path = logger.path_for("run-7");
        let handle = logger.spawn(bus.clone(), "run-7".into(), CancellationToken::new());

        bus.publish(RunEvent::RunStarted {
            run_id: "run-7".into(),
            phases: 2,
            dry_run: false,
        });
        bus.publish(RunEvent::PhaseStarted {
            phase: 0,
            steps: vec!["swapoff".into()],
        });
        bus.publish(RunEvent::RunFinished {
            run_id: "run-7".into(),
            state: EngineState::Completed,
        });
        bus.publish(RunEvent::PhaseCompleted {
            phase: 1,
            failures: 0,
        });
        handle.await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "run_started");
        assert_eq!(lines[0]["run"], "run-7");
        assert_eq!(lines[1]["run"], "run-7");
        assert_eq!(lines[1]["steps"][0], "swapoff");
        assert_eq!(lines[2]["state"], "completed");
    }

    #[tokio::test]
    async fn test_bus_sized_for_plan_keeps_every_event() {
        let steps = (0..100)
            .map(|i| StepDef::shell(format!("s{}", i), Target::all(), "true"))
            .collect();
        let plan = Plan::build(
            PlanDefinition::new(steps),
            cluster_inventory(2),
            &CheckRegistry::new(),
        )
        .unwrap();
        let capacity = plan.event_capacity();
        assert!(capacity > MIN_EVENT_CAPACITY);

        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(capacity));
        let logger = RunLogger::new(dir.path().to_path_buf());
        let path = logger.path_for("run-8");
        let handle = logger.spawn(bus.clone(), "run-8".into(), CancellationToken::new());

        // Publish a full run's worth of events before the logger reads any.
        let published = capacity - 1;
        for i in 0..published {
            bus.publish(RunEvent::StepStarted {
                step: format!("s{}", i % 100),
                host: "master".into(),
                attempt: 1,
            });
        }
        bus.publish(RunEvent::RunFinished {
            run_id: "run-8".into(),
            state: EngineState::Completed,
        });
        handle.await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), published + 1);
    }
}
