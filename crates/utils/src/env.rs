use std::collections::HashMap;

/// Variable names that never reach a lifecycle command, in addition to the
/// caller-configured list.
const ALWAYS_SCRUBBED: &[&str] = &["RUST_LOG", "WTENV_DATABASE_URL"];

/// Substrings that mark a variable as a likely credential.
const SECRET_MARKERS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "API_KEY", "PRIVATE_KEY"];

/// Build the environment handed to lifecycle commands: the daemon's own
/// environment minus credentials and the explicitly named variables.
pub fn scrubbed_env(extra_scrubbed: &[String]) -> HashMap<String, String> {
    scrub(std::env::vars(), extra_scrubbed)
}

pub fn scrub<I>(vars: I, extra_scrubbed: &[String]) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| !is_scrubbed(key, extra_scrubbed))
        .collect()
}

fn is_scrubbed(key: &str, extra_scrubbed: &[String]) -> bool {
    if ALWAYS_SCRUBBED.contains(&key) || extra_scrubbed.iter().any(|k| k == key) {
        return true;
    }
    let upper = key.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|marker| upper.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn removes_credentials_and_named_vars() {
        let env = scrub(
            vars(&[
                ("PATH", "/usr/bin"),
                ("GITHUB_TOKEN", "ghp_x"),
                ("db_password", "hunter2"),
                ("RUST_LOG", "debug"),
                ("INTERNAL_ONLY", "1"),
                ("HOME", "/home/dev"),
            ]),
            &["INTERNAL_ONLY".to_string()],
        );

        assert_eq!(env.len(), 2);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert!(env.contains_key("HOME"));
        assert!(!env.contains_key("GITHUB_TOKEN"));
        assert!(!env.contains_key("db_password"));
    }
}
