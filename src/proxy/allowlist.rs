//! Domain allowlist with wildcard suffix matching.
//!
//! Entries are either exact hostnames (`pypi.org`) or wildcards
//! (`*.github.com`). A wildcard matches any strict subdomain of its suffix
//! and never the bare suffix itself:
//!
//! | Entry            | `github.com` | `api.github.com` | `a.b.github.com` | `evilgithub.com` |
//! |------------------|--------------|------------------|------------------|------------------|
//! | `github.com`     | yes          | no               | no               | no               |
//! | `*.github.com`   | no           | yes              | yes              | no               |

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Thread-safe set of allowed domain patterns.
///
/// Shared between the proxy's connection handlers, which read it on every
/// request, and the approval path, which appends runtime-approved hosts.
/// Configured entries come from the policy and are swapped wholesale by
/// [`replace`](Self::replace); approved hosts survive a refresh.
#[derive(Debug, Default)]
pub struct DomainAllowlist {
    entries: RwLock<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    configured: HashSet<String>,
    approved: HashSet<String>,
}

impl Entries {
    fn contains(&self, entry: &str) -> bool {
        self.configured.contains(entry) || self.approved.contains(entry)
    }
}

fn normalize_all<I, S>(entries: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .map(|e| normalize_domain(e.as_ref()))
        .filter(|e| !e.is_empty())
        .collect()
}

impl DomainAllowlist {
    /// Create an allowlist from configured entries.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: RwLock::new(Entries {
                configured: normalize_all(entries),
                approved: HashSet::new(),
            }),
        }
    }

    /// Add an approved entry. Returns `true` if it was not already allowed.
    pub fn add(&self, entry: &str) -> bool {
        let entry = normalize_domain(entry);
        if entry.is_empty() {
            return false;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains(&entry) {
            return false;
        }
        debug!("Added {} to proxy allowlist", entry);
        entries.approved.insert(entry)
    }

    /// Remove an entry, configured or approved. Returns `true` if it was present.
    pub fn remove(&self, entry: &str) -> bool {
        let entry = normalize_domain(entry);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let configured = entries.configured.remove(&entry);
        entries.approved.remove(&entry) || configured
    }

    /// Swap the configured entries for `entries`. Hosts approved at runtime
    /// stay allowed.
    pub fn replace<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fresh = normalize_all(entries);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .configured = fresh;
    }

    /// Check whether `host` is allowed.
    ///
    /// Tries an exact match first, then `*.<suffix>` for every proper dot
    /// suffix of the host, from longest to shortest.
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = normalize_domain(host);
        if host.is_empty() {
            return false;
        }
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if entries.contains(&host) {
            return true;
        }

        let mut rest = host.as_str();
        while let Some((_, suffix)) = rest.split_once('.') {
            if suffix.is_empty() {
                break;
            }
            if entries.contains(&format!("*.{}", suffix)) {
                return true;
            }
            rest = suffix;
        }
        false
    }

    /// Sorted snapshot of the current entries.
    pub fn entries(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<String> = entries.configured.union(&entries.approved).cloned().collect();
        all.sort();
        all
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.configured.union(&entries.approved).count()
    }

    /// Whether the allowlist has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lowercase and strip surrounding whitespace and a trailing root dot.
fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}
