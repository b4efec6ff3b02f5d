//! Plan building: host resolution, check binding, fact validation and
//! phase layering.
//!
//! A step's phase is one more than the highest phase among its
//! predecessors, where predecessors are the producers of every fact it
//! consumes plus its explicit `depends_on` steps. Steps that share a phase
//! keep their declaration order.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use kubestrap_core::error::{Result, StrapError};
use kubestrap_core::inventory::Inventory;
use kubestrap_core::traits::IdempotencyCheck;
use kubestrap_core::types::{
    Action, CheckSpec, FactOutput, FactScope, FailurePolicy, PlanDefinition, RetryPolicy,
    StepDef, Target,
};

use crate::actions;
use crate::checks::{CheckRegistry, CommandCheck};
use crate::facts::FactKey;
use crate::template;

/// Smallest event bus a run gets, matching `EventBus::default`.
pub const MIN_EVENT_CAPACITY: usize = 256;

/// A fact read by a step, with the scope of its producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedFact {
    pub name: String,
    pub scope: FactScope,
}

impl ConsumedFact {
    pub fn key(&self, host: &str) -> FactKey {
        FactKey::scoped(self.scope, host, &self.name)
    }
}

/// A validated step with its hosts and check resolved.
pub struct Step {
    pub id: String,
    pub description: Option<String>,
    /// Declaration index in the plan file.
    pub index: usize,
    pub phase: usize,
    pub action: Action,
    /// Command template; placeholders are filled at run time.
    pub command: String,
    pub check: Option<Arc<dyn IdempotencyCheck>>,
    pub produces: Option<FactOutput>,
    pub consumes: Vec<ConsumedFact>,
    pub depends_on: Vec<String>,
    pub retry: RetryPolicy,
    pub on_failure: FailurePolicy,
    /// Per-step override of the engine's default timeout.
    pub timeout: Option<Duration>,
    pub success_exit_codes: Vec<i32>,
    pub target: Target,
    /// Resolved host names in inventory order.
    pub hosts: Vec<String>,
}

impl Step {
    pub fn accepts_exit_code(&self, code: i32) -> bool {
        self.success_exit_codes.contains(&code)
    }

    /// Store key for this step's produced fact on `host`.
    pub fn produced_key(&self, host: &str) -> Option<FactKey> {
        self.produces
            .as_ref()
            .map(|f| FactKey::scoped(f.scope, host, &f.name))
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("hosts", &self.hosts)
            .field("check", &self.check.as_ref().map(|c| c.name().to_string()))
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Phase {
    pub index: usize,
    pub steps: Vec<Arc<Step>>,
}

impl Phase {
    /// Number of (step, host) pairs dispatched in this phase.
    pub fn pair_count(&self) -> usize {
        self.steps.iter().map(|s| s.hosts.len()).sum()
    }
}

/// A validated, phase-ordered execution plan.
#[derive(Debug)]
pub struct Plan {
    name: String,
    phases: Vec<Phase>,
    inventory: Inventory,
    overwritable: Vec<String>,
}

impl Plan {
    /// Validate `definition` against `inventory` and lay it out in phases.
    ///
    /// Nothing is executed; every error here is a plan error.
    pub fn build(
        definition: PlanDefinition,
        inventory: Inventory,
        checks: &CheckRegistry,
    ) -> Result<Self> {
        if definition.steps.is_empty() {
            return Err(StrapError::EmptyPlan);
        }

        let mut ids: HashMap<&str, usize> = HashMap::new();
        for (i, step) in definition.steps.iter().enumerate() {
            if ids.insert(step.id.as_str(), i).is_some() {
                return Err(StrapError::DuplicateStep(step.id.clone()));
            }
        }

        let overwritable: HashSet<&str> = definition
            .facts
            .iter()
            .filter(|f| f.overwritable)
            .map(|f| f.name.as_str())
            .collect();

        // Hosts, command templates and checks.
        let mut drafts = Vec::with_capacity(definition.steps.len());
        for def in &definition.steps {
            let hosts = resolve_hosts(def, &inventory)?;
            let command = actions::command(&def.action);
            let template_facts = template::validate(&def.id, &command, true)?;
            let check = resolve_check(def, &template_facts, checks)?;

            let mut consumes = def.consumes.clone();
            for fact in template_facts {
                if !consumes.contains(&fact) {
                    consumes.push(fact);
                }
            }
            drafts.push(Draft {
                hosts,
                command,
                check,
                consumes,
            });
        }

        // Producers of each fact.
        let mut producers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, def) in definition.steps.iter().enumerate() {
            let Some(fact) = &def.produces else { continue };
            let hosts = drafts[i].hosts.len();
            let shared = overwritable.contains(fact.name.as_str());
            if fact.scope == FactScope::Global && hosts > 1 && !shared {
                return Err(StrapError::AmbiguousProducer {
                    step: def.id.clone(),
                    fact: fact.name.clone(),
                    hosts,
                });
            }
            let entry = producers.entry(fact.name.as_str()).or_default();
            if !entry.is_empty() && !shared {
                let hosts = entry.iter().map(|&p| drafts[p].hosts.len()).sum::<usize>() + hosts;
                return Err(StrapError::AmbiguousProducer {
                    step: def.id.clone(),
                    fact: fact.name.clone(),
                    hosts,
                });
            }
            entry.push(i);
        }

        // Predecessor edges and consumed fact scopes.
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); definition.steps.len()];
        let mut consumed: Vec<Vec<ConsumedFact>> = Vec::with_capacity(definition.steps.len());
        for (i, def) in definition.steps.iter().enumerate() {
            let mut facts = Vec::new();
            for name in &drafts[i].consumes {
                let unknown = || StrapError::UnknownFact {
                    step: def.id.clone(),
                    fact: name.clone(),
                };
                let sources = producers.get(name.as_str()).ok_or_else(unknown)?;
                let produced_on: HashSet<&str> = sources
                    .iter()
                    .flat_map(|&p| drafts[p].hosts.iter().map(String::as_str))
                    .collect();
                if produced_on.is_empty() && !drafts[i].hosts.is_empty() {
                    return Err(unknown());
                }

                let scope = definition.steps[sources[0]]
                    .produces
                    .as_ref()
                    .map(|f| f.scope)
                    .unwrap_or_default();
                if scope == FactScope::Host {
                    if let Some(host) = drafts[i]
                        .hosts
                        .iter()
                        .find(|h| !produced_on.contains(h.as_str()))
                    {
                        return Err(StrapError::UnknownFact {
                            step: def.id.clone(),
                            fact: FactKey::for_host(host.clone(), name.clone()).to_string(),
                        });
                    }
                }

                for &p in sources {
                    if !preds[i].contains(&p) {
                        preds[i].push(p);
                    }
                }
                facts.push(ConsumedFact {
                    name: name.clone(),
                    scope,
                });
            }
            consumed.push(facts);

            for dep in &def.depends_on {
                let &p = ids.get(dep.as_str()).ok_or_else(|| StrapError::UnknownStep {
                    step: def.id.clone(),
                    dependency: dep.clone(),
                })?;
                if !preds[i].contains(&p) {
                    preds[i].push(p);
                }
            }
        }

        let layers = layer(&definition.steps, &preds)?;

        let mut phases: Vec<Phase> = Vec::new();
        let total = definition.steps.len();
        let mut steps: Vec<Option<Step>> = definition
            .steps
            .into_iter()
            .zip(drafts)
            .zip(consumed)
            .enumerate()
            .map(|(i, ((def, draft), consumes))| {
                Some(Step {
                    id: def.id,
                    description: def.description,
                    index: i,
                    phase: layers[i],
                    action: def.action,
                    command: draft.command,
                    check: draft.check,
                    produces: def.produces,
                    consumes,
                    depends_on: def.depends_on,
                    retry: def.retry,
                    on_failure: def.on_failure,
                    timeout: def.timeout_ms.map(Duration::from_millis),
                    success_exit_codes: def.success_exit_codes,
                    target: def.target,
                    hosts: draft.hosts,
                })
            })
            .collect();

        let phase_count = layers.iter().copied().max().map_or(0, |m| m + 1);
        for index in 0..phase_count {
            let members = (0..total)
                .filter(|&i| layers[i] == index)
                .filter_map(|i| steps[i].take().map(Arc::new))
                .collect();
            phases.push(Phase {
                index,
                steps: members,
            });
        }

        let mut overwritable: Vec<String> = overwritable.into_iter().map(String::from).collect();
        overwritable.sort();

        let plan = Self {
            name: definition.name.unwrap_or_else(|| "plan".to_string()),
            phases,
            inventory,
            overwritable,
        };
        debug!(
            plan = %plan.name,
            steps = total,
            phases = plan.phases.len(),
            "Plan built"
        );
        Ok(plan)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Facts declared `overwritable`.
    pub fn overwritable_facts(&self) -> &[String] {
        &self.overwritable
    }

    pub fn step(&self, id: &str) -> Option<&Arc<Step>> {
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .find(|s| s.id == id)
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    /// Upper bound on the events one run of this plan publishes, so a bus
    /// of this size never makes a slow subscriber lag.
    pub fn event_capacity(&self) -> usize {
        let per_pairs: usize = self
            .phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .map(|s| {
                // started + retrying per attempt, then finished, fact, exclusion
                s.hosts.len() * (2 * s.retry.max_attempts.max(1) as usize + 3)
            })
            .sum();
        (per_pairs + 2 * self.phases.len() + 2).max(MIN_EVENT_CAPACITY)
    }

    /// Step ids in declaration order.
    pub fn step_order(&self) -> Vec<&str> {
        let mut steps: Vec<&Arc<Step>> = self.phases.iter().flat_map(|p| p.steps.iter()).collect();
        steps.sort_by_key(|s| s.index);
        steps.into_iter().map(|s| s.id.as_str()).collect()
    }

    /// Human-readable phase layout.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Plan '{}': {} steps in {} phases across {} hosts",
            self.name,
            self.step_count(),
            self.phases.len(),
            self.inventory.len()
        );
        for phase in &self.phases {
            let _ = writeln!(out, "\nPhase {}:", phase.index + 1);
            for step in &phase.steps {
                let _ = write!(
                    out,
                    "  {:<24} {:<10} {:<14} on {}",
                    step.id,
                    step.action.kind(),
                    step.on_failure.to_string(),
                    if step.hosts.is_empty() {
                        "(no hosts)".to_string()
                    } else {
                        step.hosts.join(", ")
                    }
                );
                if let Some(check) = &step.check {
                    let _ = write!(out, "  [check: {}]", check.name());
                }
                if let Some(fact) = &step.produces {
                    let _ = write!(out, "  -> {}", fact.name);
                }
                if !step.consumes.is_empty() {
                    let names: Vec<&str> = step.consumes.iter().map(|c| c.name.as_str()).collect();
                    let _ = write!(out, "  <- {}", names.join(", "));
                }
                out.push('\n');
            }
        }
        out
    }
}

struct Draft {
    hosts: Vec<String>,
    command: String,
    check: Option<Arc<dyn IdempotencyCheck>>,
    consumes: Vec<String>,
}

fn resolve_hosts(def: &StepDef, inventory: &Inventory) -> Result<Vec<String>> {
    match &def.target {
        Target::Group(group) => Ok(inventory
            .in_group(*group)
            .into_iter()
            .map(|h| h.name.clone())
            .collect()),
        Target::Hosts { hosts } => {
            let mut positioned = Vec::with_capacity(hosts.len());
            for name in hosts {
                let pos = inventory
                    .position(name)
                    .ok_or_else(|| StrapError::UnknownHost {
                        step: def.id.clone(),
                        host: name.clone(),
                    })?;
                positioned.push((pos, name.clone()));
            }
            positioned.sort();
            positioned.dedup();
            Ok(positioned.into_iter().map(|(_, name)| name).collect())
        }
    }
}

fn resolve_check(
    def: &StepDef,
    template_facts: &[String],
    checks: &CheckRegistry,
) -> Result<Option<Arc<dyn IdempotencyCheck>>> {
    // A producer must run every time: if it were skipped, consumers in later
    // phases would find no fact.
    if let (Some(_), Some(fact)) = (&def.check, &def.produces) {
        return Err(StrapError::Config(format!(
            "step '{}' produces fact '{}' and cannot have a check",
            def.id, fact.name
        )));
    }
    let check: Arc<dyn IdempotencyCheck> = match &def.check {
        Some(CheckSpec::Command { command }) => {
            template::validate(&def.id, command, false)?;
            Arc::new(CommandCheck::new(format!("{}:check", def.id), command.clone()))
        }
        Some(CheckSpec::PathExists { path }) => {
            template::validate(&def.id, path, false)?;
            Arc::new(CommandCheck::path_exists(format!("{}:path", def.id), path))
        }
        Some(CheckSpec::Named { name }) => {
            checks.get(name).ok_or_else(|| StrapError::UnknownCheck {
                step: def.id.clone(),
                check: name.clone(),
            })?
        }
        // Implied checks cannot see rendered fact values.
        None if def.produces.is_some() || !template_facts.is_empty() => return Ok(None),
        None => match actions::implied_check(&def.action) {
            Some(command) => Arc::new(CommandCheck::new(
                format!("{}:{}", def.id, def.action.kind()),
                command,
            )),
            None => return Ok(None),
        },
    };
    Ok(Some(check))
}

/// Longest-path layering with Kahn's algorithm, one round per phase.
fn layer(steps: &[StepDef], preds: &[Vec<usize>]) -> Result<Vec<usize>> {
    let n = steps.len();
    let mut indegree: Vec<usize> = preds.iter().map(Vec::len).collect();
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ps) in preds.iter().enumerate() {
        for &p in ps {
            if p == i {
                return Err(StrapError::CyclicDependency(vec![steps[i].id.clone()]));
            }
            succs[p].push(i);
        }
    }

    let mut layers = vec![usize::MAX; n];
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut round = 0;
    let mut placed = 0;
    while !ready.is_empty() {
        let mut next = Vec::new();
        for &i in &ready {
            layers[i] = round;
            placed += 1;
            for &s in &succs[i] {
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    next.push(s);
                }
            }
        }
        next.sort_unstable();
        ready = next;
        round += 1;
    }

    if placed < n {
        let stuck = (0..n)
            .filter(|&i| layers[i] == usize::MAX)
            .map(|i| steps[i].id.clone())
            .collect();
        return Err(StrapError::CyclicDependency(stuck));
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestrap_core::types::FactDecl;
    use kubestrap_test_utils::cluster_inventory;

    fn build(steps: Vec<StepDef>) -> Result<Plan> {
        Plan::build(
            PlanDefinition::new(steps),
            cluster_inventory(2),
            &CheckRegistry::with_builtins(),
        )
    }

    fn phase_of(plan: &Plan, id: &str) -> usize {
        plan.step(id).unwrap().phase
    }

    fn bootstrap_steps() -> Vec<StepDef> {
        vec![
            StepDef::shell("swapoff", Target::all(), "swapoff -a"),
            StepDef::shell("init", Target::control_plane(), "kubeadm init")
                .after(&["swapoff"]),
            StepDef::shell(
                "token",
                Target::control_plane(),
                "kubeadm token create --print-join-command",
            )
            .producing(FactOutput::global("join_command"))
            .after(&["init"]),
            StepDef::shell("join", Target::workers(), "{{ fact.join_command }}"),
            StepDef::shell("packages", Target::all(), "apt-get install -y kubelet"),
        ]
    }

    #[test]
    fn test_layers_follow_edges() {
        let plan = build(bootstrap_steps()).unwrap();
        assert_eq!(plan.phases().len(), 4);
        assert_eq!(phase_of(&plan, "swapoff"), 0);
        assert_eq!(phase_of(&plan, "packages"), 0);
        assert_eq!(phase_of(&plan, "init"), 1);
        assert_eq!(phase_of(&plan, "token"), 2);
        assert_eq!(phase_of(&plan, "join"), 3);

        let first: Vec<&str> = plan.phases()[0].steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(first, vec!["swapoff", "packages"]);
    }

    #[test]
    fn test_every_edge_points_forward() {
        let plan = build(bootstrap_steps()).unwrap();
        for phase in plan.phases() {
            for step in &phase.steps {
                for dep in &step.depends_on {
                    assert!(phase_of(&plan, dep) < step.phase);
                }
                for fact in &step.consumes {
                    let producer = plan
                        .phases()
                        .iter()
                        .flat_map(|p| p.steps.iter())
                        .find(|s| s.produces.as_ref().map(|f| &f.name) == Some(&fact.name))
                        .unwrap();
                    assert!(producer.phase < step.phase);
                }
            }
        }
    }

    #[test]
    fn test_template_facts_become_consumes() {
        let plan = build(bootstrap_steps()).unwrap();
        let join = plan.step("join").unwrap();
        assert_eq!(
            join.consumes,
            vec![ConsumedFact {
                name: "join_command".into(),
                scope: FactScope::Global
            }]
        );
        assert_eq!(join.hosts, vec!["worker-1", "worker-2"]);
    }

    #[test]
    fn test_unknown_fact() {
        let err = build(vec![
            StepDef::shell("join", Target::workers(), "kubeadm join").consuming(&["join_command"])
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            StrapError::UnknownFact { ref step, ref fact } if step == "join" && fact == "join_command"
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let err = build(vec![
            StepDef::shell("a", Target::all(), "true").after(&["c"]),
            StepDef::shell("b", Target::all(), "true").after(&["a"]),
            StepDef::shell("c", Target::all(), "true").after(&["b"]),
            StepDef::shell("d", Target::all(), "true"),
        ])
        .unwrap_err();
        match err {
            StrapError::CyclicDependency(ids) => assert_eq!(ids, vec!["a", "b", "c"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fact_cycle_detected() {
        let err = build(vec![
            StepDef::shell("a", Target::control_plane(), "echo {{ fact.y }}")
                .producing(FactOutput::global("x")),
            StepDef::shell("b", Target::control_plane(), "echo {{ fact.x }}")
                .producing(FactOutput::global("y")),
        ])
        .unwrap_err();
        assert!(matches!(err, StrapError::CyclicDependency(_)));
    }

    #[test]
    fn test_self_dependency() {
        let err = build(vec![StepDef::shell("a", Target::all(), "true").after(&["a"])]).unwrap_err();
        assert!(matches!(err, StrapError::CyclicDependency(ids) if ids == vec!["a"]));
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(build(vec![]).unwrap_err(), StrapError::EmptyPlan));

        let dup = build(vec![
            StepDef::shell("a", Target::all(), "true"),
            StepDef::shell("a", Target::all(), "true"),
        ])
        .unwrap_err();
        assert!(matches!(dup, StrapError::DuplicateStep(id) if id == "a"));

        let unknown_step =
            build(vec![StepDef::shell("a", Target::all(), "true").after(&["nope"])]).unwrap_err();
        assert!(matches!(unknown_step, StrapError::UnknownStep { .. }));

        let unknown_host =
            build(vec![StepDef::shell("a", Target::hosts(&["ghost"]), "true")]).unwrap_err();
        assert!(matches!(unknown_host, StrapError::UnknownHost { ref host, .. } if host == "ghost"));

        let unknown_check = build(vec![StepDef::shell("a", Target::all(), "true").with_check(
            CheckSpec::Named {
                name: "nope".into(),
            },
        )])
        .unwrap_err();
        assert!(matches!(unknown_check, StrapError::UnknownCheck { .. }));
    }

    #[test]
    fn test_global_fact_from_many_hosts_is_ambiguous() {
        let err = build(vec![StepDef::shell("ver", Target::all(), "uname -r")
            .producing(FactOutput::global("kernel"))])
        .unwrap_err();
        assert!(matches!(
            err,
            StrapError::AmbiguousProducer { ref fact, hosts: 3, .. } if fact == "kernel"
        ));

        let def = PlanDefinition::new(vec![StepDef::shell("ver", Target::all(), "uname -r")
            .producing(FactOutput::global("kernel"))])
        .with_fact(FactDecl {
            name: "kernel".into(),
            overwritable: true,
            description: None,
        });
        let plan = Plan::build(def, cluster_inventory(2), &CheckRegistry::new()).unwrap();
        assert_eq!(plan.overwritable_facts(), ["kernel".to_string()]);
    }

    #[test]
    fn test_host_fact_scope() {
        let plan = build(vec![
            StepDef::shell("ver", Target::all(), "uname -r").producing(FactOutput::per_host("kernel")),
            StepDef::shell("show", Target::workers(), "echo {{ fact.kernel }}"),
        ])
        .unwrap();
        let show = plan.step("show").unwrap();
        assert_eq!(show.consumes[0].scope, FactScope::Host);
        assert_eq!(show.consumes[0].key("worker-1").to_string(), "worker-1/kernel");

        let err = build(vec![
            StepDef::shell("ver", Target::control_plane(), "uname -r")
                .producing(FactOutput::per_host("kernel")),
            StepDef::shell("show", Target::workers(), "echo {{ fact.kernel }}"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            StrapError::UnknownFact { ref fact, .. } if fact == "worker-1/kernel"
        ));
    }

    #[test]
    fn test_checks_resolved() {
        let plan = build(vec![
            StepDef::shell("swapoff", Target::all(), "swapoff -a").with_check(CheckSpec::Named {
                name: "swap-disabled".into(),
            }),
            StepDef::new(
                "overlay",
                Target::all(),
                Action::Modprobe {
                    module: "overlay".into(),
                },
            ),
            StepDef::shell("raw", Target::all(), "echo hi"),
        ])
        .unwrap();
        assert_eq!(
            plan.step("swapoff").unwrap().check.as_ref().unwrap().name(),
            "swap-disabled"
        );
        assert_eq!(
            plan.step("overlay").unwrap().check.as_ref().unwrap().name(),
            "overlay:modprobe"
        );
        assert!(plan.step("raw").unwrap().check.is_none());
    }

    #[test]
    fn test_producer_with_check_rejected() {
        let mut steps = bootstrap_steps();
        steps[2] = steps[2].clone().with_check(CheckSpec::Named {
            name: "kubeadm-initialized".into(),
        });
        let err = build(steps).unwrap_err();
        assert!(matches!(err, StrapError::Config(ref msg) if msg.contains("'token'")));
        assert!(err.is_plan_error());

        // Without an explicit check the producer gets no implied one either.
        let plan = build(vec![StepDef::new(
            "motd",
            Target::control_plane(),
            Action::File {
                path: "/etc/motd".into(),
                content: Some("hi".into()),
                source: None,
                mode: None,
            },
        )
        .producing(FactOutput::global("motd"))])
        .unwrap();
        assert!(plan.step("motd").unwrap().check.is_none());
    }

    #[test]
    fn test_check_templates_cannot_read_facts() {
        let err = build(vec![StepDef::shell("a", Target::all(), "true").with_check(
            CheckSpec::Command {
                command: "test {{ fact.x }}".into(),
            },
        )])
        .unwrap_err();
        assert!(matches!(err, StrapError::Template { .. }));
    }

    #[test]
    fn test_explicit_hosts_in_inventory_order() {
        let plan = build(vec![StepDef::shell(
            "a",
            Target::hosts(&["worker-2", "master", "worker-2"]),
            "true",
        )])
        .unwrap();
        assert_eq!(plan.step("a").unwrap().hosts, vec!["master", "worker-2"]);
    }

    #[test]
    fn test_event_capacity_covers_retries() {
        let plan = build(bootstrap_steps()).unwrap();
        assert_eq!(plan.event_capacity(), MIN_EVENT_CAPACITY);

        let steps: Vec<StepDef> = (0..40)
            .map(|i| {
                StepDef::shell(format!("s{}", i), Target::all(), "true")
                    .with_retry(RetryPolicy::attempts(3, 10))
            })
            .collect();
        let plan = build(steps).unwrap();
        // 40 steps x 3 hosts x (2 x 3 attempts + 3), one phase.
        assert_eq!(plan.event_capacity(), 40 * 3 * 9 + 2 + 2);
    }

    #[test]
    fn test_describe_lists_phases() {
        let plan = build(bootstrap_steps()).unwrap();
        let text = plan.describe();
        assert!(text.starts_with("Plan 'plan': 5 steps in 4 phases across 3 hosts"));
        assert!(text.contains("Phase 4:"));
        assert!(text.contains("-> join_command"));
        assert!(text.contains("<- join_command"));
    }
}
