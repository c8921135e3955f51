//! Registrable-domain grouping
//!
//! One certificate is requested per registrable domain (the rightmost two
//! labels of a name), covering every configured name below it. Group
//! membership lists are kept in canonical order so that the list stored in
//! an issued certificate compares equal on every later pass, regardless of
//! the order hosts appear in the configuration.
//!
//! # Canonical order
//!
//! Names are compared by their label sequence reversed, i.e. `a.b.example.com`
//! sorts as `com.example.b.a`. Subdomains of a common parent therefore
//! cluster together:
//!
//! ```text
//! example.com
//! a.example.com
//! x.a.example.com
//! b.example.com
//! ```

use std::collections::BTreeMap;

use tracing::{debug, warn};

/// Registrable domain → canonically ordered, deduplicated host names
pub type DomainGroups = BTreeMap<String, Vec<String>>;

/// Join the labels of `fqdn` in reverse order
pub fn reversed_fqdn(fqdn: &str) -> String {
    fqdn.rsplit('.').collect::<Vec<_>>().join(".")
}

/// Rightmost two labels of `fqdn`, or `None` for single-label names
pub fn registrable_domain(fqdn: &str) -> Option<String> {
    let labels: Vec<&str> = fqdn.rsplit('.').take(2).collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return None;
    }

    Some(format!("{}.{}", labels[1], labels[0]))
}

/// Sort host names into canonical (reversed-label) order
pub fn domain_sort(names: &mut [String]) {
    names.sort_by_cached_key(|name| reversed_fqdn(name));
}

/// Group host names by registrable domain
///
/// Names without a registrable domain are logged and left out; they can
/// never be covered by a certificate request anyway.
pub fn group_server_names<I, S>(names: I) -> DomainGroups
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut groups = DomainGroups::new();

    for name in names {
        let name = name.as_ref();
        let Some(key) = registrable_domain(name) else {
            warn!(server_name = %name, "Server name has no registrable domain, skipping");
            continue;
        };

        let members = groups.entry(key).or_default();
        if !members.iter().any(|existing| existing == name) {
            members.push(name.to_string());
        }
    }

    for (key, members) in groups.iter_mut() {
        domain_sort(members);
        debug!(domain = %key, members = ?members, "Grouped server names");
    }

    groups
}
