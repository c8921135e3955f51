//! `server_name` directive extraction.
//!
//! Only the directive shape is recognised, not the nginx grammar: a line
//! whose first non-blank token is `server_name` and which ends the host list
//! with `;`. Commented lines never match because the `#` precedes the
//! directive name.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{trace, warn};

static SERVER_NAME_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*server_name\s+([^;]+);").expect("server_name pattern is valid")
});

/// Returns the raw host tokens of a single line, if it is a `server_name`
/// directive.
pub fn directive_hosts(line: &str) -> Option<Vec<&str>> {
    let captures = SERVER_NAME_LINE.captures(line)?;
    let hosts = captures.get(1)?.as_str();
    Some(hosts.split_whitespace().collect())
}

/// Collect every certificate-eligible host name from configuration text.
///
/// Names are returned in the order they appear; duplicates are kept, the
/// grouper removes them.
pub fn collect_server_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();

    for line in text.lines() {
        let Some(hosts) = directive_hosts(line) else {
            continue;
        };

        for host in hosts {
            match normalize_server_name(host) {
                Some(name) => {
                    trace!(name = %name, "Found server name");
                    names.push(name);
                }
                None => {
                    warn!(server_name = %host, "Skipping server name that cannot be issued over HTTP-01");
                }
            }
        }
    }

    names
}

/// Normalise a host token to the form a CA returns it in.
///
/// Returns `None` for the catch-all `_`, regular expressions and wildcard
/// forms.
pub fn normalize_server_name(token: &str) -> Option<String> {
    let token = token.trim();
    if token.is_empty() || token == "_" {
        return None;
    }
    if token.starts_with('~') || token.starts_with('.') || token.contains('*') {
        return None;
    }

    let name = token.strip_suffix('.').unwrap_or(token);
    if name.is_empty() {
        return None;
    }

    Some(name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_line_matching() {
        let lines = [
            ("  #   server_name 1.example.com;", false),
            ("      server_name 2.example.com;", true),
            ("server_name 3.example.com;", true),
            ("\tserver_name\t4.example.com;", true),
            ("server_names_hash_bucket_size 64;", false),
            ("server_name 5.example.com", false),
        ];

        for (line, expected) in lines {
            assert_eq!(
                directive_hosts(line).is_some(),
                expected,
                "line {line:?}"
            );
        }
    }

    #[test]
    fn test_directive_hosts_discard_empty_tokens() {
        let hosts = directive_hosts("server_name  a.example.com   b.example.com ;").unwrap();
        assert_eq!(hosts, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_collect_server_names() {
        let text = r#"
http {
    server {
        listen 80;
        server_name a.example.com b.example.com;
        location / { proxy_pass http://backend; }
    }
    server {
        # server_name disabled.example.com;
        server_name example.org;
    }
}
"#;

        assert_eq!(
            collect_server_names(text),
            vec!["a.example.com", "b.example.com", "example.org"]
        );
    }

    #[test]
    fn test_collect_skips_uncoverable_names() {
        let text = "server_name _ *.example.com .example.net ~^www\\d+\\.example\\.com$ ok.example.com;";
        assert_eq!(collect_server_names(text), vec!["ok.example.com"]);
    }

    #[test]
    fn test_normalize_server_name() {
        assert_eq!(
            normalize_server_name("WWW.Example.COM"),
            Some("www.example.com".to_string())
        );
        assert_eq!(
            normalize_server_name("example.com."),
            Some("example.com".to_string())
        );
        assert_eq!(normalize_server_name("_"), None);
        assert_eq!(normalize_server_name("*.example.com"), None);
        assert_eq!(normalize_server_name("www.example.*"), None);
        assert_eq!(normalize_server_name("."), None);
    }
}
