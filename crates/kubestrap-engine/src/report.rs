use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use kubestrap_core::error::Result;
use kubestrap_core::types::{EngineState, SkipReason, StepResult, StepStatus};

use crate::plan::Plan;

/// Per-host tally of results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostSummary {
    pub host: String,
    pub ok: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub excluded: bool,
}

/// Everything that happened during one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub plan: String,
    pub state: EngineState,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases_total: usize,
    pub phases_run: usize,
    pub results: Vec<StepResult>,
    pub excluded_hosts: Vec<String>,
    pub facts: BTreeMap<String, String>,
    #[serde(skip)]
    step_order: HashMap<String, usize>,
    #[serde(skip)]
    host_order: Vec<String>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, plan: &Plan, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            plan: plan.name().to_string(),
            state: EngineState::Pending,
            dry_run,
            started_at: now,
            finished_at: now,
            phases_total: plan.phases().len(),
            phases_run: 0,
            results: Vec::new(),
            excluded_hosts: Vec::new(),
            facts: BTreeMap::new(),
            step_order: plan
                .step_order()
                .into_iter()
                .enumerate()
                .map(|(i, id)| (id.to_string(), i))
                .collect(),
            host_order: plan
                .inventory()
                .hosts()
                .iter()
                .map(|h| h.name.clone())
                .collect(),
        }
    }

    fn host_rank(&self, host: &str) -> usize {
        self.host_order
            .iter()
            .position(|h| h == host)
            .unwrap_or(usize::MAX)
    }

    /// Results sorted by phase, then step declaration order, then host
    /// inventory order.
    pub fn normalized(mut self) -> Self {
        let mut results = std::mem::take(&mut self.results);
        results.sort_by_key(|r| {
            (
                r.phase,
                self.step_order.get(&r.step_id).copied().unwrap_or(usize::MAX),
                self.host_rank(&r.host),
            )
        });
        self.results = results;
        self
    }

    pub fn failures(&self) -> Vec<&StepResult> {
        self.results.iter().filter(|r| r.is_failure()).collect()
    }

    pub fn results_for(&self, step_id: &str) -> Vec<&StepResult> {
        self.results.iter().filter(|r| r.step_id == step_id).collect()
    }

    pub fn result(&self, step_id: &str, host: &str) -> Option<&StepResult> {
        self.results
            .iter()
            .find(|r| r.step_id == step_id && r.host == host)
    }

    /// One summary per inventory host, in inventory order.
    pub fn host_summaries(&self) -> Vec<HostSummary> {
        self.host_order
            .iter()
            .map(|host| {
                let mut summary = HostSummary {
                    host: host.clone(),
                    excluded: self.excluded_hosts.contains(host),
                    ..HostSummary::default()
                };
                for r in self.results.iter().filter(|r| &r.host == host) {
                    match r.status {
                        StepStatus::Success => summary.ok += 1,
                        StepStatus::Skipped => summary.skipped += 1,
                        StepStatus::Failed => summary.failed += 1,
                        StepStatus::Cancelled => summary.cancelled += 1,
                    }
                }
                summary
            })
            .collect()
    }

    /// 0 when the run completed, 1 when it was aborted.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            EngineState::Completed => 0,
            _ => 1,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Summary table plus details of every failed pair.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let elapsed = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        let _ = writeln!(
            out,
            "Run {} ({}) {} in {:.1}s{}, {}/{} phases",
            self.run_id,
            self.plan,
            self.state,
            elapsed,
            if self.dry_run { " [dry run]" } else { "" },
            self.phases_run,
            self.phases_total
        );

        let width = self
            .host_order
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(4)
            .max(4);
        let _ = writeln!(
            out,
            "\n{:<width$}  {:>4}  {:>7}  {:>6}  {:>9}",
            "HOST",
            "OK",
            "SKIPPED",
            "FAILED",
            "CANCELLED",
            width = width
        );
        for s in self.host_summaries() {
            let _ = writeln!(
                out,
                "{:<width$}  {:>4}  {:>7}  {:>6}  {:>9}{}",
                s.host,
                s.ok,
                s.skipped,
                s.failed,
                s.cancelled,
                if s.excluded { "  (excluded)" } else { "" },
                width = width
            );
        }

        if self.dry_run {
            let _ = writeln!(out, "\nCommands:");
            for r in &self.results {
                if r.skip_reason == Some(SkipReason::DryRun) {
                    let _ = writeln!(out, "  [{}] {} @ {}: {}", r.phase + 1, r.step_id, r.host, r.stdout);
                }
            }
        }

        let failures = self.failures();
        if !failures.is_empty() {
            let _ = writeln!(out, "\nFailures:");
            for r in failures {
                let _ = writeln!(
                    out,
                    "  [phase {}] {} @ {} after {} attempt(s): {}",
                    r.phase + 1,
                    r.step_id,
                    r.host,
                    r.attempts,
                    r.error.as_deref().unwrap_or("unknown error")
                );
                let stderr = r.stderr.trim();
                if !stderr.is_empty() {
                    for line in stderr.lines().take(10) {
                        let _ = writeln!(out, "      {}", line);
                    }
                }
            }
        }

        if !self.excluded_hosts.is_empty() {
            let _ = writeln!(out, "\nExcluded hosts: {}", self.excluded_hosts.join(", "));
        }
        out
    }
}
