//! Shared test utilities for kubestrap crates.
//!
//! [`MockTransport`] answers commands from a script instead of a network
//! and records every call, so tests can assert exactly what would have run
//! on each host.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;

use kubestrap_core::error::{Result, StrapError};
use kubestrap_core::inventory::{Host, HostGroup, Inventory};
use kubestrap_core::traits::{Connection, Transport};
use kubestrap_core::types::CommandOutput;

/// A scripted answer to one command.
#[derive(Debug, Clone)]
pub struct Reply {
    outcome: Outcome,
    delay: Option<Duration>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Output(CommandOutput),
    ConnectionError(String),
}

impl Reply {
    /// Exit 0 with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Output(CommandOutput::success(stdout)),
            delay: None,
        }
    }

    /// Non-zero exit with the given stderr.
    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Output(CommandOutput::failure(code, stderr)),
            delay: None,
        }
    }

    /// The transport drops mid-command.
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::ConnectionError(message.into()),
            delay: None,
        }
    }

    /// Answer only after `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Script {
    /// Replies consumed in order; the last one repeats.
    replies: VecDeque<Reply>,
}

impl Script {
    fn next(&mut self) -> Option<Reply> {
        if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        }
    }
}

#[derive(Default)]
struct State {
    exact: HashMap<(Option<String>, String), Script>,
    contains: Vec<(Option<String>, String, Script)>,
    calls: Vec<(String, String)>,
    connects: HashMap<String, usize>,
    unreachable: HashSet<String>,
    flaky_connects: HashMap<String, usize>,
    in_flight: usize,
    peak_in_flight: usize,
}

impl State {
    fn reply_for(&mut self, host: &str, command: &str) -> Reply {
        let host_key = (Some(host.to_string()), command.to_string());
        if let Some(reply) = self.exact.get_mut(&host_key).and_then(Script::next) {
            return reply;
        }
        let any_key = (None, command.to_string());
        if let Some(reply) = self.exact.get_mut(&any_key).and_then(Script::next) {
            return reply;
        }
        for scoped in [true, false] {
            for (h, needle, script) in self.contains.iter_mut() {
                let host_matches = match h.as_deref() {
                    Some(h) => scoped && h == host,
                    None => !scoped,
                };
                if host_matches && command.contains(needle.as_str()) {
                    if let Some(reply) = script.next() {
                        return reply;
                    }
                }
            }
        }
        Reply::ok("")
    }
}

/// In-memory transport driven by scripted replies.
///
/// Unmatched commands succeed with empty output.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("mock transport state poisoned")
    }

    /// Reply to `command` on any host.
    pub fn on(&self, command: &str, reply: Reply) {
        self.on_sequence(command, vec![reply]);
    }

    /// Reply to `command` on any host with `replies` in order.
    pub fn on_sequence(&self, command: &str, replies: Vec<Reply>) {
        self.state().exact.insert(
            (None, command.to_string()),
            Script {
                replies: replies.into(),
            },
        );
    }

    /// Reply to `command` on one host.
    pub fn on_host(&self, host: &str, command: &str, reply: Reply) {
        self.on_host_sequence(host, command, vec![reply]);
    }

    pub fn on_host_sequence(&self, host: &str, command: &str, replies: Vec<Reply>) {
        self.state().exact.insert(
            (Some(host.to_string()), command.to_string()),
            Script {
                replies: replies.into(),
            },
        );
    }

    /// Reply to any command containing `needle`.
    pub fn on_contains(&self, needle: &str, reply: Reply) {
        self.state().contains.push((
            None,
            needle.to_string(),
            Script {
                replies: vec![reply].into(),
            },
        ));
    }

    /// Reply to any command containing `needle` on one host.
    pub fn on_host_contains(&self, host: &str, needle: &str, reply: Reply) {
        self.state().contains.push((
            Some(host.to_string()),
            needle.to_string(),
            Script {
                replies: vec![reply].into(),
            },
        ));
    }

    /// Every connect to `host` fails.
    pub fn unreachable(&self, host: &str) {
        self.state().unreachable.insert(host.to_string());
    }

    /// The next `failures` connects to `host` fail.
    pub fn flaky_connect(&self, host: &str, failures: usize) {
        self.state()
            .flaky_connects
            .insert(host.to_string(), failures);
    }

    /// All `(host, command)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.state().calls.clone()
    }

    /// Commands run on `host`, in order.
    pub fn calls_for(&self, host: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Whether any command on `host` contained `needle`.
    pub fn ran_on(&self, host: &str, needle: &str) -> bool {
        self.calls_for(host).iter().any(|c| c.contains(needle))
    }

    /// Hosts that received any command containing `needle`.
    pub fn hosts_that_ran(&self, needle: &str) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .state()
            .calls
            .iter()
            .filter(|(_, c)| c.contains(needle))
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Most commands that were ever running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.state().peak_in_flight
    }

    pub fn connects_for(&self, host: &str) -> usize {
        self.state().connects.get(host).copied().unwrap_or(0)
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn connect<'a>(&'a self, host: &'a Host) -> BoxFuture<'a, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            let mut state = self.state();
            *state.connects.entry(host.name.clone()).or_default() += 1;

            let flaky = match state.flaky_connects.get_mut(&host.name) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            if flaky || state.unreachable.contains(&host.name) {
                return Err(StrapError::Connection {
                    host: host.name.clone(),
                    message: "connection refused".into(),
                });
            }

            let conn: Arc<dyn Connection> = Arc::new(MockConnection {
                host: host.name.clone(),
                state: self.state.clone(),
            });
            Ok(conn)
        })
    }
}

struct MockConnection {
    host: String,
    state: Arc<Mutex<State>>,
}

impl Connection for MockConnection {
    fn run_command<'a>(
        &'a self,
        command: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            let reply = {
                let mut state = self.state.lock().expect("mock transport state poisoned");
                state.calls.push((self.host.clone(), command.to_string()));
                state.in_flight += 1;
                state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
                state.reply_for(&self.host, command)
            };

            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }
            self.state
                .lock()
                .expect("mock transport state poisoned")
                .in_flight -= 1;

            match reply.outcome {
                Outcome::Output(output) => Ok(output),
                Outcome::ConnectionError(message) => Err(StrapError::Connection {
                    host: self.host.clone(),
                    message,
                }),
            }
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// A host in the given group with a deterministic address.
pub fn host(name: &str, group: HostGroup) -> Host {
    Host::new(name, format!("{}.cluster.test", name)).with_group(group)
}

/// `master` plus `worker-1..=workers`.
pub fn cluster_inventory(workers: usize) -> Inventory {
    let mut hosts = vec![host("master", HostGroup::ControlPlane)];
    for i in 1..=workers {
        hosts.push(host(&format!("worker-{}", i), HostGroup::Worker));
    }
    Inventory::new(hosts).expect("fixture host names are unique")
}
