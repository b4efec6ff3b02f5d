use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kubestrap_core::config::{EngineConfig, FactWait};
use kubestrap_core::error::{Result, StrapError};
use kubestrap_core::event::{EventBus, RunEvent};
use kubestrap_core::inventory::Host;
use kubestrap_core::traits::Transport;
use kubestrap_core::types::{
    CommandOutput, EngineState, FactValue, FailurePolicy, SkipReason, StepResult,
};

use crate::executor::RemoteExecutor;
use crate::facts::FactStore;
use crate::plan::{Plan, Step};
use crate::report::RunReport;
use crate::retry::{calculate_backoff, is_retryable};
use crate::template;

/// Runtime knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_parallel: usize,
    pub default_timeout: Duration,
    pub max_backoff_ms: u64,
    pub fact_wait: FactWait,
    pub dry_run: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_parallel: config.max_parallel.max(1),
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            max_backoff_ms: config.max_backoff_ms,
            fact_wait: config.fact_wait,
            dry_run: false,
        }
    }
}

impl EngineOptions {
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }
}

/// What one attempt of a step produced.
enum Attempt {
    Satisfied,
    Ran(CommandOutput),
}

/// Drives a plan phase by phase across the inventory.
pub struct Engine {
    executor: Arc<RemoteExecutor>,
    options: EngineOptions,
    event_bus: Arc<EventBus>,
    state: watch::Sender<EngineState>,
}

impl Engine {
    pub fn new(transport: Arc<dyn Transport>, options: EngineOptions) -> Self {
        let (state, _) = watch::channel(EngineState::Pending);
        Self {
            executor: Arc::new(RemoteExecutor::new(transport)),
            options,
            event_bus: Arc::new(EventBus::default()),
            state,
        }
    }

    /// Publish events on an existing bus instead of a private one.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn executor(&self) -> &Arc<RemoteExecutor> {
        &self.executor
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Close pooled connections.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }

    /// Run `plan` under a fresh run id.
    pub async fn run(&self, plan: &Plan, cancel: CancellationToken) -> RunReport {
        self.run_with_id(plan, uuid::Uuid::new_v4().to_string(), cancel)
            .await
    }

    /// Run `plan`. Cancelling `cancel` aborts the run like a fatal failure.
    pub async fn run_with_id(
        &self,
        plan: &Plan,
        run_id: String,
        cancel: CancellationToken,
    ) -> RunReport {
        let run_cancel = cancel.child_token();
        let facts = FactStore::new(self.options.fact_wait, run_cancel.clone())
            .with_overwritable(plan.overwritable_facts().iter().cloned());
        let mut report = RunReport::new(run_id.clone(), plan, self.options.dry_run);

        self.state.send_replace(EngineState::Running);
        self.event_bus.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            phases: plan.phases().len(),
            dry_run: self.options.dry_run,
        });
        info!(
            run_id = %run_id,
            plan = %plan.name(),
            phases = plan.phases().len(),
            hosts = plan.inventory().len(),
            dry_run = self.options.dry_run,
            "Run started"
        );

        let mut aborted = false;
        for phase in plan.phases() {
            if run_cancel.is_cancelled() {
                aborted = true;
                break;
            }
            report.phases_run += 1;
            self.event_bus.publish(RunEvent::PhaseStarted {
                phase: phase.index,
                steps: phase.steps.iter().map(|s| s.id.clone()).collect(),
            });

            let excluded = &report.excluded_hosts;
            let inventory = plan.inventory();
            let pairs: Vec<(Arc<Step>, &Host)> = phase
                .steps
                .iter()
                .flat_map(move |step| {
                    step.hosts
                        .iter()
                        .filter(move |h| !excluded.contains(*h))
                        .filter_map(move |h| inventory.get(h))
                        .map(move |host| (step.clone(), host))
                })
                .collect();
            info!(phase = phase.index + 1, pairs = pairs.len(), "Phase started");

            let mut results = stream::iter(pairs)
                .map(|(step, host)| self.run_pair(step, host, &facts, &run_cancel, phase.index))
                .buffer_unordered(self.options.max_parallel);

            let mut failures = 0;
            let mut fatal = false;
            while let Some((result, policy)) = results.next().await {
                if result.is_failure() {
                    failures += 1;
                    match policy {
                        FailurePolicy::Fatal => {
                            error!(
                                step = %result.step_id,
                                host = %result.host,
                                error = result.error.as_deref().unwrap_or_default(),
                                "Fatal step failure, aborting run"
                            );
                            fatal = true;
                            run_cancel.cancel();
                        }
                        FailurePolicy::Continue => {
                            warn!(step = %result.step_id, host = %result.host, "Step failed, continuing");
                        }
                        FailurePolicy::ContinueGroup => {
                            warn!(
                                step = %result.step_id,
                                host = %result.host,
                                "Step failed, excluding host from later phases"
                            );
                            if !report.excluded_hosts.contains(&result.host) {
                                report.excluded_hosts.push(result.host.clone());
                                self.event_bus.publish(RunEvent::HostExcluded {
                                    host: result.host.clone(),
                                    step: result.step_id.clone(),
                                });
                            }
                        }
                    }
                }
                self.event_bus.publish(RunEvent::StepFinished {
                    result: Box::new(result.clone()),
                });
                report.results.push(result);
            }
            drop(results);

            self.event_bus.publish(RunEvent::PhaseCompleted {
                phase: phase.index,
                failures,
            });
            debug!(phase = phase.index + 1, failures, "Phase completed");

            if fatal || run_cancel.is_cancelled() {
                aborted = true;
                break;
            }
        }

        let state = if aborted {
            EngineState::Aborted
        } else {
            EngineState::Completed
        };
        report.state = state;
        report.facts = facts.snapshot().await;
        report.finished_at = Utc::now();
        self.state.send_replace(state);
        self.event_bus.publish(RunEvent::RunFinished {
            run_id: run_id.clone(),
            state,
        });
        info!(
            run_id = %run_id,
            state = %state,
            results = report.results.len(),
            failures = report.failures().len(),
            "Run finished"
        );
        report.normalized()
    }

    /// Run one (step, host) pair to a terminal result.
    async fn run_pair(
        &self,
        step: Arc<Step>,
        host: &Host,
        facts: &FactStore,
        cancel: &CancellationToken,
        phase: usize,
    ) -> (StepResult, FailurePolicy) {
        let started = Instant::now();
        let cancelled = || StepResult::new(&step.id, &host.name, phase).with_error(&StrapError::Cancelled);

        let mut result = if cancel.is_cancelled() {
            cancelled()
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => cancelled(),
                result = self.execute_step(&step, host, facts, phase) => result,
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.finished_at = Utc::now();
        debug!(
            step = %step.id,
            host = %host.name,
            status = %result.status,
            attempts = result.attempts,
            "Pair finished"
        );
        (result, step.on_failure)
    }

    async fn execute_step(
        &self,
        step: &Step,
        host: &Host,
        facts: &FactStore,
        phase: usize,
    ) -> StepResult {
        let mut base = StepResult::new(&step.id, &host.name, phase);

        let mut values = BTreeMap::new();
        for fact in &step.consumes {
            let key = fact.key(&host.name);
            if self.options.dry_run {
                if let Some(value) = facts.try_get(&key).await {
                    values.insert(fact.name.clone(), value);
                }
                continue;
            }
            match facts.get(&key).await {
                Ok(value) => {
                    values.insert(fact.name.clone(), value);
                }
                Err(e) => return base.with_error(&e),
            }
        }
        let command = template::render(&step.command, host, &values);
        base.consumed_facts = values;

        if self.options.dry_run {
            base.stdout = command;
            return base.skipped(SkipReason::DryRun);
        }

        let timeout = step.timeout.unwrap_or(self.options.default_timeout);
        let max_attempts = step.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut result = base.clone();
            result.attempts = attempt;
            self.event_bus.publish(RunEvent::StepStarted {
                step: step.id.clone(),
                host: host.name.clone(),
                attempt,
            });

            let err = match self.attempt(step, host, &command, timeout).await {
                Ok(Attempt::Satisfied) => {
                    info!(step = %step.id, host = %host.name, "Already satisfied, skipping");
                    return result.skipped(SkipReason::AlreadySatisfied);
                }
                Ok(Attempt::Ran(output)) if step.accepts_exit_code(output.exit_code) => {
                    result = result.with_output(&output);
                    return match self.publish_fact(step, host, &output, facts).await {
                        Ok(produced) => {
                            result.produced_fact = produced;
                            result
                        }
                        Err(e) => result.with_error(&e),
                    };
                }
                Ok(Attempt::Ran(output)) => {
                    result = result.with_output(&output);
                    StrapError::CommandFailed {
                        host: host.name.clone(),
                        exit_code: output.exit_code,
                        stderr: output.stderr,
                    }
                }
                Err(e) => e,
            };

            if attempt < max_attempts && is_retryable(&err, &step.retry) {
                let backoff =
                    calculate_backoff(attempt, step.retry.backoff_base_ms, self.options.max_backoff_ms);
                warn!(
                    step = %step.id,
                    host = %host.name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                self.event_bus.publish(RunEvent::StepRetrying {
                    step: step.id.clone(),
                    host: host.name.clone(),
                    attempt,
                    backoff_ms: backoff.as_millis() as u64,
                    error: err.to_string(),
                });
                tokio::time::sleep(backoff).await;
                continue;
            }
            return result.with_error(&err);
        }
    }

    /// Evaluate the check, then run the action if still needed.
    async fn attempt(
        &self,
        step: &Step,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> Result<Attempt> {
        if let Some(check) = &step.check {
            if check
                .already_satisfied(host, self.executor.as_ref(), timeout)
                .await?
            {
                return Ok(Attempt::Satisfied);
            }
        }
        let output = self.executor.execute(host, command, timeout).await?;
        Ok(Attempt::Ran(output))
    }

    async fn publish_fact(
        &self,
        step: &Step,
        host: &Host,
        output: &CommandOutput,
        facts: &FactStore,
    ) -> Result<Option<FactValue>> {
        let (Some(fact), Some(key)) = (&step.produces, step.produced_key(&host.name)) else {
            return Ok(None);
        };
        let value = fact.capture(&output.stdout);
        facts.set(key.clone(), value.clone()).await?;
        self.event_bus.publish(RunEvent::FactPublished {
            key: key.to_string(),
            step: step.id.clone(),
            host: host.name.clone(),
        });
        debug!(fact = %key, step = %step.id, host = %host.name, "Fact published");
        Ok(Some(FactValue {
            key: key.to_string(),
            value,
        }))
    }
}
