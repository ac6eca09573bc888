//! Template variable substitution.
//!
//! Service definitions may reference deploy-time values as `{NAME}` inside
//! commands, entrypoints and environment entries: the host address, port
//! assignments, generated secrets and anything plugins contribute via the
//! `provide_vars` hook. References to unknown names are left verbatim so a
//! literal brace in a command does not break a deploy.

use std::collections::BTreeMap;

/// Replaces every `{NAME}` whose name is present in `vars`.
pub fn substitute(input: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_known_names() {
        let vars = vars(&[("HOST", "10.0.0.1"), ("PORT", "8080")]);
        assert_eq!(
            substitute("-bind {HOST}:{PORT}", &vars),
            "-bind 10.0.0.1:8080"
        );
    }

    #[test]
    fn unknown_names_stay_verbatim() {
        let vars = vars(&[("HOST", "10.0.0.1")]);
        assert_eq!(substitute("{HOST} {UNKNOWN}", &vars), "10.0.0.1 {UNKNOWN}");
    }

    #[test]
    fn unterminated_brace_is_literal() {
        assert_eq!(substitute("a {b", &vars(&[])), "a {b");
    }
}
