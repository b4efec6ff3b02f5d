use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::load_toml;
use crate::error::{Result, StrapError};
use crate::inventory::HostGroup;

// ── Plan definition ─────────────────────────────────────────────

/// Which hosts a step runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Group(HostGroup),
    Hosts { hosts: Vec<String> },
}

impl Target {
    pub fn all() -> Self {
        Self::Group(HostGroup::All)
    }

    pub fn control_plane() -> Self {
        Self::Group(HostGroup::ControlPlane)
    }

    pub fn workers() -> Self {
        Self::Group(HostGroup::Worker)
    }

    pub fn hosts(names: &[&str]) -> Self {
        Self::Hosts {
            hosts: names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(g) => write!(f, "{}", g),
            Self::Hosts { hosts } => write!(f, "[{}]", hosts.join(", ")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Started,
    Restarted,
    Stopped,
}

/// What a step does on a host.
///
/// In plan files an action is either a bare command string or a table
/// with a `type` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    Shell {
        command: String,
    },
    /// Load a kernel module now and on every boot.
    Modprobe {
        module: String,
    },
    /// Install apt packages, optionally refreshing the index and pinning versions.
    Packages {
        names: Vec<String>,
        #[serde(default)]
        update_cache: bool,
        #[serde(default)]
        hold: bool,
    },
    Service {
        name: String,
        #[serde(default)]
        state: ServiceState,
        #[serde(default)]
        enabled: bool,
        #[serde(default)]
        daemon_reload: bool,
    },
    Directory {
        path: String,
        #[serde(default)]
        mode: Option<String>,
    },
    /// Write a file. `source` is a path relative to the plan file and is
    /// read into `content` when the plan is loaded.
    File {
        path: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        mode: Option<String>,
    },
}

impl Action {
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell {
            command: command.into(),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "shell",
            Self::Modprobe { .. } => "modprobe",
            Self::Packages { .. } => "packages",
            Self::Service { .. } => "service",
            Self::Directory { .. } => "directory",
            Self::File { .. } => "file",
        }
    }
}

/// Idempotency check attached to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CheckSpec {
    /// Satisfied when the command exits 0.
    Command { command: String },
    PathExists { path: String },
    /// A check registered by name in the engine's check registry.
    Named { name: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactScope {
    /// One value for the whole run.
    #[default]
    Global,
    /// One value per host, readable only by steps on the same host.
    Host,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FactCapture {
    /// Whole stdout, trimmed.
    #[default]
    Stdout,
    FirstLine,
}

/// A fact written by a step when it succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactOutput {
    pub name: String,
    #[serde(default)]
    pub scope: FactScope,
    #[serde(default)]
    pub capture: FactCapture,
}

impl FactOutput {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: FactScope::Global,
            capture: FactCapture::Stdout,
        }
    }

    pub fn per_host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: FactScope::Host,
            capture: FactCapture::Stdout,
        }
    }

    /// Extract the fact value from command stdout.
    pub fn capture(&self, stdout: &str) -> String {
        match self.capture {
            FactCapture::Stdout => stdout.trim().to_string(),
            FactCapture::FirstLine => stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Also retry non-zero exits, not just connection failures and timeouts.
    #[serde(default)]
    pub retry_command_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            retry_command_errors: false,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_base_ms,
            retry_command_errors: false,
        }
    }
}

fn default_max_attempts() -> u32 { 1 }
fn default_backoff_base_ms() -> u64 { 1000 }

/// What happens when a step exhausts its retries on a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the whole run.
    #[default]
    Fatal,
    /// Record the failure and keep going.
    Continue,
    /// Drop the host from every later phase.
    ContinueGroup,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Continue => write!(f, "continue"),
            Self::ContinueGroup => write!(f, "continue-group"),
        }
    }
}

/// A step as declared in a plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target: Target,
    #[serde(deserialize_with = "action_or_command")]
    pub action: Action,
    #[serde(default, deserialize_with = "check_or_command")]
    pub check: Option<CheckSpec>,
    #[serde(default, deserialize_with = "fact_or_name")]
    pub produces: Option<FactOutput>,
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_success_exit_codes")]
    pub success_exit_codes: Vec<i32>,
}

fn default_success_exit_codes() -> Vec<i32> {
    vec![0]
}

impl StepDef {
    pub fn new(id: impl Into<String>, target: Target, action: Action) -> Self {
        Self {
            id: id.into(),
            description: None,
            target,
            action,
            check: None,
            produces: None,
            consumes: vec![],
            depends_on: vec![],
            retry: RetryPolicy::default(),
            on_failure: FailurePolicy::default(),
            timeout_ms: None,
            success_exit_codes: default_success_exit_codes(),
        }
    }

    /// Shorthand for a shell step.
    pub fn shell(id: impl Into<String>, target: Target, command: impl Into<String>) -> Self {
        Self::new(id, target, Action::shell(command))
    }

    pub fn with_check(mut self, check: CheckSpec) -> Self {
        self.check = Some(check);
        self
    }

    pub fn producing(mut self, fact: FactOutput) -> Self {
        self.produces = Some(fact);
        self
    }

    pub fn consuming(mut self, facts: &[&str]) -> Self {
        self.consumes = facts.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn after(mut self, steps: &[&str]) -> Self {
        self.depends_on = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

fn action_or_command<'de, D>(deserializer: D) -> std::result::Result<Action, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Command(String),
        Structured(Action),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Command(command) => Action::Shell { command },
        Repr::Structured(action) => action,
    })
}

fn check_or_command<'de, D>(deserializer: D) -> std::result::Result<Option<CheckSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Command(String),
        Spec(CheckSpec),
    }

    Ok(Option::<Repr>::deserialize(deserializer)?.map(|r| match r {
        Repr::Command(command) => CheckSpec::Command { command },
        Repr::Spec(spec) => spec,
    }))
}

fn fact_or_name<'de, D>(deserializer: D) -> std::result::Result<Option<FactOutput>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Name(String),
        Spec(FactOutput),
    }

    Ok(Option::<Repr>::deserialize(deserializer)?.map(|r| match r {
        Repr::Name(name) => FactOutput::global(name),
        Repr::Spec(spec) => spec,
    }))
}

/// Declared fact with its write policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactDecl {
    pub name: String,
    #[serde(default)]
    pub overwritable: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// The parsed contents of a plan file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub facts: Vec<FactDecl>,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

impl PlanDefinition {
    pub fn new(steps: Vec<StepDef>) -> Self {
        Self {
            name: None,
            facts: vec![],
            steps,
        }
    }

    pub fn with_fact(mut self, decl: FactDecl) -> Self {
        self.facts.push(decl);
        self
    }

    /// Load a plan file and inline any `file` action sources, which are
    /// resolved relative to the plan file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let mut plan: PlanDefinition = load_toml(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for step in &mut plan.steps {
            if let Action::File {
                content, source, ..
            } = &mut step.action
            {
                match (content.is_some(), source.as_deref()) {
                    (false, Some(src)) => {
                        let full = base.join(src);
                        let text = std::fs::read_to_string(&full).map_err(|e| {
                            StrapError::Config(format!(
                                "step '{}': cannot read {}: {}",
                                step.id,
                                full.display(),
                                e
                            ))
                        })?;
                        *content = Some(text);
                    }
                    (false, None) => {
                        return Err(StrapError::Config(format!(
                            "step '{}': file action needs `content` or `source`",
                            step.id
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(plan)
    }
}

// ── Execution results ───────────────────────────────────────────

/// Raw result of one command on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    /// Abandoned because the run was aborted while it was pending or in flight.
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "ok"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    AlreadySatisfied,
    DryRun,
}

/// A fact value as recorded in a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactValue {
    pub key: String,
    pub value: String,
}

/// Outcome of one step on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub host: String,
    pub phase: usize,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub produced_fact: Option<FactValue>,
    #[serde(default)]
    pub consumed_facts: BTreeMap<String, String>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn new(step_id: impl Into<String>, host: impl Into<String>, phase: usize) -> Self {
        Self {
            step_id: step_id.into(),
            host: host.into(),
            phase,
            status: StepStatus::Success,
            skip_reason: None,
            attempts: 0,
            duration_ms: 0,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            error_kind: None,
            produced_fact: None,
            consumed_facts: BTreeMap::new(),
            finished_at: Utc::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == StepStatus::Failed
    }

    /// Record command output.
    pub fn with_output(mut self, output: &CommandOutput) -> Self {
        self.exit_code = Some(output.exit_code);
        self.stdout = output.stdout.clone();
        self.stderr = output.stderr.clone();
        self
    }

    /// Record a failure from an error.
    pub fn with_error(mut self, err: &StrapError) -> Self {
        self.status = match err {
            StrapError::Cancelled => StepStatus::Cancelled,
            _ => StepStatus::Failed,
        };
        if let StrapError::CommandFailed {
            exit_code, stderr, ..
        } = err
        {
            self.exit_code = Some(*exit_code);
            if self.stderr.is_empty() {
                self.stderr = stderr.clone();
            }
        }
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind().to_string());
        self
    }

    pub fn skipped(mut self, reason: SkipReason) -> Self {
        self.status = StepStatus::Skipped;
        self.skip_reason = Some(reason);
        self
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_def_from_toml_shorthands() {
        let plan: PlanDefinition = toml::from_str(
            r#"
[[facts]]
name = "join_command"

[[steps]]
id = "swapoff"
target = "all"
action = "swapoff -a"
check = "test -z \"$(swapon --noheadings)\""

[[steps]]
id = "init"
target = "control-plane"
action = { type = "shell", command = "kubeadm init" }
produces = "join_command"
depends_on = ["swapoff"]
on_failure = "fatal"

[[steps]]
id = "join"
target = { hosts = ["w1", "w2"] }
action = "{{ fact.join_command }}"
consumes = ["join_command"]
on_failure = "continue-group"
retry = { max_attempts = 3, backoff_base_ms = 500 }
"#,
        )
        .unwrap();

        assert_eq!(plan.facts.len(), 1);
        assert_eq!(plan.steps.len(), 3);

        let swapoff = &plan.steps[0];
        assert_eq!(swapoff.target, Target::all());
        assert_eq!(swapoff.action, Action::shell("swapoff -a"));
        assert!(matches!(swapoff.check, Some(CheckSpec::Command { .. })));
        assert_eq!(swapoff.success_exit_codes, vec![0]);

        let init = &plan.steps[1];
        assert_eq!(init.target, Target::control_plane());
        assert_eq!(init.produces, Some(FactOutput::global("join_command")));
        assert_eq!(init.depends_on, vec!["swapoff"]);

        let join = &plan.steps[2];
        assert_eq!(join.target, Target::hosts(&["w1", "w2"]));
        assert_eq!(join.on_failure, FailurePolicy::ContinueGroup);
        assert_eq!(join.retry.max_attempts, 3);
        assert_eq!(join.retry.backoff_base_ms, 500);
        assert!(!join.retry.retry_command_errors);
    }

    #[test]
    fn test_structured_actions_parse() {
        let plan: PlanDefinition = toml::from_str(
            r#"
[[steps]]
id = "overlay"
target = "all"
action = { type = "modprobe", module = "overlay" }

[[steps]]
id = "kube"
target = "all"
action = { type = "packages", names = ["kubelet", "kubeadm"], hold = true }
produces = { name = "kubeadm_version", scope = "host", capture = "first-line" }

[[steps]]
id = "containerd"
target = "all"
action = { type = "service", name = "containerd", state = "restarted", daemon_reload = true }
check = { type = "named", name = "containerd-running" }
"#,
        )
        .unwrap();

        assert_eq!(
            plan.steps[0].action,
            Action::Modprobe {
                module: "overlay".into()
            }
        );
        assert!(matches!(
            plan.steps[1].action,
            Action::Packages { hold: true, update_cache: false, .. }
        ));
        let produced = plan.steps[1].produces.as_ref().unwrap();
        assert_eq!(produced.scope, FactScope::Host);
        assert_eq!(produced.capture, FactCapture::FirstLine);
        assert!(matches!(
            plan.steps[2].action,
            Action::Service { state: ServiceState::Restarted, daemon_reload: true, .. }
        ));
        assert_eq!(
            plan.steps[2].check,
            Some(CheckSpec::Named {
                name: "containerd-running".into()
            })
        );
    }

    #[test]
    fn test_fact_capture() {
        let out = "\n  kubeadm join 10.0.0.1:6443 --token abc  \nextra\n";
        assert_eq!(
            FactOutput::global("t").capture(out),
            "kubeadm join 10.0.0.1:6443 --token abc  \nextra"
        );
        let first = FactOutput {
            capture: FactCapture::FirstLine,
            ..FactOutput::global("t")
        };
        assert_eq!(first.capture(out), "kubeadm join 10.0.0.1:6443 --token abc");
    }

    #[test]
    fn test_result_with_error_maps_status() {
        let err = StrapError::CommandFailed {
            host: "m".into(),
            exit_code: 2,
            stderr: "boom".into(),
        };
        let result = StepResult::new("s", "m", 0).with_error(&err);
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.stderr, "boom");
        assert_eq!(result.error_kind.as_deref(), Some("command"));

        let cancelled = StepResult::new("s", "m", 0).with_error(&StrapError::Cancelled);
        assert_eq!(cancelled.status, StepStatus::Cancelled);
        assert!(!cancelled.is_failure());
    }
}
