//! `{{ ... }}` placeholders in step commands.
//!
//! Supported variables:
//! - `{{ host.name }}`, `{{ host.address }}`, `{{ host.user }}`: the target host
//! - `{{ fact.<name> }}`: a fact produced by an earlier phase

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use kubestrap_core::error::{Result, StrapError};
use kubestrap_core::inventory::Host;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

enum Var<'a> {
    HostName,
    HostAddress,
    HostUser,
    Fact(&'a str),
}

fn parse_var(name: &str) -> Option<Var<'_>> {
    match name {
        "host.name" => Some(Var::HostName),
        "host.address" => Some(Var::HostAddress),
        "host.user" => Some(Var::HostUser),
        _ => name
            .strip_prefix("fact.")
            .filter(|f| !f.is_empty())
            .map(Var::Fact),
    }
}

/// Check every placeholder and return the fact names referenced, in order
/// of first appearance.
pub fn validate(step: &str, template: &str, allow_facts: bool) -> Result<Vec<String>> {
    let mut facts: Vec<String> = Vec::new();
    for caps in placeholder().captures_iter(template) {
        let name = &caps[1];
        match parse_var(name) {
            Some(Var::Fact(fact)) if allow_facts => {
                if !facts.iter().any(|f| f == fact) {
                    facts.push(fact.to_string());
                }
            }
            Some(Var::Fact(_)) => {
                return Err(StrapError::Template {
                    step: step.to_string(),
                    message: format!("facts are not available here: {{{{ {} }}}}", name),
                });
            }
            Some(_) => {}
            None => {
                return Err(StrapError::Template {
                    step: step.to_string(),
                    message: format!("unknown variable {{{{ {} }}}}", name),
                });
            }
        }
    }
    Ok(facts)
}

/// Substitute placeholders. Facts missing from `facts` render as
/// `<fact:name>`; validation guarantees they are present in a real run.
pub fn render(template: &str, host: &Host, facts: &BTreeMap<String, String>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match parse_var(&caps[1]) {
            Some(Var::HostName) => host.name.clone(),
            Some(Var::HostAddress) => host.address.clone(),
            Some(Var::HostUser) => host.user.clone(),
            Some(Var::Fact(f)) => facts
                .get(f)
                .cloned()
                .unwrap_or_else(|| format!("<fact:{}>", f)),
            None => caps[0].to_string(),
        })
        .into_owned()
}
