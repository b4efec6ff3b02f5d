//! Shell escaping and quoting utilities.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument for shell execution.
/// Arguments made only of safe characters are returned unchanged.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote and join multiple arguments.
pub fn quote_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| quote_arg(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wrap a complete command (with operators) for `sh -c`.
pub fn sh_c(command: &str) -> String {
    format!("sh -c '{}'", escape_single_quote_content(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_arg_plain() {
        assert_eq!(quote_arg("containerd"), "containerd");
        assert_eq!(quote_arg("/etc/containerd/config.toml"), "/etc/containerd/config.toml");
    }

    #[test]
    fn test_quote_arg_meta() {
        assert_eq!(quote_arg(""), "''");
        assert_eq!(quote_arg("a b"), "'a b'");
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_quote_args() {
        assert_eq!(quote_args(&["kubelet", "kube adm"]), "kubelet 'kube adm'");
    }

    #[test]
    fn test_sh_c() {
        assert_eq!(sh_c("echo 'hi' && true"), "sh -c 'echo '\\''hi'\\'' && true'");
    }
}
