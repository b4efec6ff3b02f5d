//! Rendering structured actions into shell commands.
//!
//! Every structured action has an implied idempotency check, so plans
//! that use them get skip-if-satisfied behavior without writing checks.

use kubestrap_core::shell::{quote_arg, quote_args};
use kubestrap_core::types::{Action, ServiceState};

/// The shell command that performs `action`.
pub fn command(action: &Action) -> String {
    match action {
        Action::Shell { command } => command.clone(),
        Action::Modprobe { module } => {
            let conf = quote_arg(&format!("/etc/modules-load.d/{}.conf", module));
            format!(
                "modprobe {m} && echo {m} > {conf}",
                m = quote_arg(module),
                conf = conf
            )
        }
        Action::Packages {
            names,
            update_cache,
            hold,
        } => {
            let pkgs = quote_args(names);
            let mut parts = vec!["export DEBIAN_FRONTEND=noninteractive".to_string()];
            if *update_cache {
                parts.push("apt-get update -q".to_string());
            }
            parts.push(format!("apt-get install -y -q {}", pkgs));
            if *hold {
                parts.push(format!("apt-mark hold {}", pkgs));
            }
            parts.join(" && ")
        }
        Action::Service {
            name,
            state,
            enabled,
            daemon_reload,
        } => {
            let unit = quote_arg(name);
            let mut parts = Vec::new();
            if *daemon_reload {
                parts.push("systemctl daemon-reload".to_string());
            }
            if *enabled {
                parts.push(format!("systemctl enable {}", unit));
            }
            let verb = match state {
                ServiceState::Started => "start",
                ServiceState::Restarted => "restart",
                ServiceState::Stopped => "stop",
            };
            parts.push(format!("systemctl {} {}", verb, unit));
            parts.join(" && ")
        }
        Action::Directory { path, mode } => {
            let p = quote_arg(path);
            match mode {
                Some(mode) => format!("mkdir -p {p} && chmod {} {p}", quote_arg(mode), p = p),
                None => format!("mkdir -p {}", p),
            }
        }
        Action::File {
            path,
            content,
            mode,
            ..
        } => {
            let p = quote_arg(path);
            let body = quote_arg(content.as_deref().unwrap_or_default());
            let mut cmd = format!(
                "mkdir -p \"$(dirname {p})\" && printf '%s' {body} > {p}",
                p = p,
                body = body
            );
            if let Some(mode) = mode {
                cmd.push_str(&format!(" && chmod {} {}", quote_arg(mode), p));
            }
            cmd
        }
    }
}

/// A command that exits 0 when `action` has nothing left to do.
pub fn implied_check(action: &Action) -> Option<String> {
    match action {
        Action::Shell { .. } => None,
        Action::Modprobe { module } => Some(format!(
            "grep -q '^{m} ' /proc/modules && test -f {conf}",
            m = module.replace('\'', ""),
            conf = quote_arg(&format!("/etc/modules-load.d/{}.conf", module))
        )),
        Action::Packages { names, hold, .. } => {
            let mut checks: Vec<String> = names
                .iter()
                .map(|n| {
                    format!(
                        "dpkg-query -W -f='${{Status}}' {} 2>/dev/null | grep -q 'install ok installed'",
                        quote_arg(n)
                    )
                })
                .collect();
            if *hold {
                checks.extend(
                    names
                        .iter()
                        .map(|n| format!("apt-mark showhold | grep -qx {}", quote_arg(n))),
                );
            }
            Some(checks.join(" && "))
        }
        Action::Service {
            name,
            state,
            enabled,
            ..
        } => {
            let unit = quote_arg(name);
            match state {
                ServiceState::Restarted => None,
                ServiceState::Stopped => Some(format!("! systemctl is-active --quiet {}", unit)),
                ServiceState::Started if *enabled => Some(format!(
                    "systemctl is-active --quiet {u} && systemctl is-enabled --quiet {u}",
                    u = unit
                )),
                ServiceState::Started => Some(format!("systemctl is-active --quiet {}", unit)),
            }
        }
        Action::Directory { path, mode } => {
            let p = quote_arg(path);
            Some(match mode {
                Some(mode) => format!(
                    "test -d {p} && [ \"$(stat -c %a {p})\" = {m} ]",
                    p = p,
                    m = quote_arg(normalize_mode(mode))
                ),
                None => format!("test -d {}", p),
            })
        }
        Action::File {
            path,
            content,
            mode,
            ..
        } => {
            let p = quote_arg(path);
            let mut check = format!(
                "printf '%s' {} | cmp -s - {}",
                quote_arg(content.as_deref().unwrap_or_default()),
                p
            );
            if let Some(mode) = mode {
                check.push_str(&format!(
                    " && [ \"$(stat -c %a {})\" = {} ]",
                    p,
                    quote_arg(normalize_mode(mode))
                ));
            }
            Some(check)
        }
    }
}

/// `stat -c %a` prints modes without leading zeros.
fn normalize_mode(mode: &str) -> &str {
    let trimmed = mode.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_passthrough() {
        let action = Action::shell("swapoff -a");
        assert_eq!(command(&action), "swapoff -a");
        assert!(implied_check(&action).is_none());
    }

    #[test]
    fn test_modprobe() {
        let action = Action::Modprobe {
            module: "br_netfilter".into(),
        };
        assert_eq!(
            command(&action),
            "modprobe br_netfilter && echo br_netfilter > /etc/modules-load.d/br_netfilter.conf"
        );
        assert_eq!(
            implied_check(&action).unwrap(),
            "grep -q '^br_netfilter ' /proc/modules && test -f /etc/modules-load.d/br_netfilter.conf"
        );
    }

    #[test]
    fn test_packages_with_hold() {
        let action = Action::Packages {
            names: vec!["kubelet".into(), "kubeadm".into()],
            update_cache: true,
            hold: true,
        };
        assert_eq!(
            command(&action),
            "export DEBIAN_FRONTEND=noninteractive && apt-get update -q && apt-get install -y -q kubelet kubeadm && apt-mark hold kubelet kubeadm"
        );
        let check = implied_check(&action).unwrap();
        assert!(check.contains("dpkg-query -W -f='${Status}' kubelet"));
        assert!(check.contains("apt-mark showhold | grep -qx kubeadm"));
    }

    #[test]
    fn test_service_restart_has_no_check() {
        let action = Action::Service {
            name: "containerd".into(),
            state: ServiceState::Restarted,
            enabled: false,
            daemon_reload: true,
        };
        assert_eq!(
            command(&action),
            "systemctl daemon-reload && systemctl restart containerd"
        );
        assert!(implied_check(&action).is_none());
    }

    #[test]
    fn test_service_started_enabled() {
        let action = Action::Service {
            name: "containerd".into(),
            state: ServiceState::Started,
            enabled: true,
            daemon_reload: false,
        };
        assert_eq!(
            command(&action),
            "systemctl enable containerd && systemctl start containerd"
        );
        assert_eq!(
            implied_check(&action).unwrap(),
            "systemctl is-active --quiet containerd && systemctl is-enabled --quiet containerd"
        );
    }

    #[test]
    fn test_directory_mode() {
        let action = Action::Directory {
            path: "/etc/apt/keyrings".into(),
            mode: Some("0755".into()),
        };
        assert_eq!(
            command(&action),
            "mkdir -p /etc/apt/keyrings && chmod 0755 /etc/apt/keyrings"
        );
        assert_eq!(
            implied_check(&action).unwrap(),
            "test -d /etc/apt/keyrings && [ \"$(stat -c %a /etc/apt/keyrings)\" = 755 ]"
        );
    }

    #[test]
    fn test_file_quotes_content() {
        let action = Action::File {
            path: "/etc/sysctl.d/k8s.conf".into(),
            content: Some("net.ipv4.ip_forward = 1\n".into()),
            source: None,
            mode: None,
        };
        assert_eq!(
            command(&action),
            "mkdir -p \"$(dirname /etc/sysctl.d/k8s.conf)\" && printf '%s' 'net.ipv4.ip_forward = 1\n' > /etc/sysctl.d/k8s.conf"
        );
        assert_eq!(
            implied_check(&action).unwrap(),
            "printf '%s' 'net.ipv4.ip_forward = 1\n' | cmp -s - /etc/sysctl.d/k8s.conf"
        );
    }

    #[test]
    fn test_file_check_includes_mode() {
        let action = Action::File {
            path: "/etc/kubestrap/token".into(),
            content: Some("secret".into()),
            source: None,
            mode: Some("0600".into()),
        };
        assert!(command(&action).ends_with("&& chmod 0600 /etc/kubestrap/token"));
        assert_eq!(
            implied_check(&action).unwrap(),
            "printf '%s' secret | cmp -s - /etc/kubestrap/token && [ \"$(stat -c %a /etc/kubestrap/token)\" = 600 ]"
        );
    }
}
