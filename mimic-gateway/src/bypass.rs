//! Bypass Evaluator (C3): a pure function over ordered, pre-compiled
//! pass-through rules. Compiled once at session start (see
//! `config::CompiledBypassRule`), so evaluation never pays regex
//! compilation cost per request.

use crate::config::CompiledBypassRule;

/// `isPassThrough(host, path, destPort, rules)`.
///
/// A rule matches if every field it specifies matches: host regex against
/// `host` (when both the rule and the request have one), path regex
/// against `path` likewise, and exact port equality when the rule's port
/// is non-zero. Absent rule fields are wildcards. Rules are evaluated in
/// order; the first full match short-circuits `true`.
///
/// A protocol plugin may call this before headers are parsed, in which
/// case `host`/`path` are `None` and only the port criterion applies.
pub fn is_pass_through(
    host: Option<&str>,
    path: Option<&str>,
    dest_port: u16,
    rules: &[CompiledBypassRule],
) -> bool {
    rules.iter().any(|rule| rule_matches(rule, host, path, dest_port))
}

fn rule_matches(rule: &CompiledBypassRule, host: Option<&str>, path: Option<&str>, dest_port: u16) -> bool {
    if let Some(host_pattern) = &rule.host {
        match host {
            Some(host) if host_pattern.is_match(host) => {}
            _ => return false,
        }
    }

    if let Some(path_pattern) = &rule.path {
        match path {
            Some(path) if path_pattern.is_match(path) => {}
            _ => return false,
        }
    }

    if rule.port != 0 && rule.port != dest_port {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BypassRule;

    fn compile(rules: &[BypassRule]) -> Vec<CompiledBypassRule> {
        rules.iter().map(CompiledBypassRule::compile).collect::<anyhow::Result<_>>().expect("valid rules")
    }

    #[test]
    fn host_rule_short_circuits_regardless_of_port() {
        let rules = compile(&[BypassRule {
            host: Some(r"^internal\.".to_owned()),
            path: None,
            port: 0,
        }]);

        assert!(is_pass_through(Some("internal.svc"), None, 9999, &rules));
        assert!(!is_pass_through(Some("external.svc"), None, 9999, &rules));
    }

    #[test]
    fn port_only_rule_applies_before_headers_are_parsed() {
        let rules = compile(&[BypassRule {
            host: None,
            path: None,
            port: 5432,
        }]);

        assert!(is_pass_through(None, None, 5432, &rules));
        assert!(!is_pass_through(None, None, 80, &rules));
    }

    #[test]
    fn first_full_match_wins_over_later_rules() {
        let rules = compile(&[
            BypassRule {
                host: Some("^a$".to_owned()),
                path: None,
                port: 0,
            },
            BypassRule {
                host: Some("^a$".to_owned()),
                path: Some("^/never$".to_owned()),
                port: 0,
            },
        ]);

        assert!(is_pass_through(Some("a"), Some("/anything"), 1, &rules));
    }

    #[test]
    fn is_pure_function_of_its_inputs() {
        let rules = compile(&[BypassRule {
            host: Some("^a$".to_owned()),
            path: None,
            port: 0,
        }]);

        let first = is_pass_through(Some("a"), None, 1, &rules);
        let second = is_pass_through(Some("a"), None, 1, &rules);
        assert_eq!(first, second);
    }
}
