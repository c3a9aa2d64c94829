//! Request router binding.
//!
//! Thin adapter between the external HTTP collaborator and pools: a URI
//! pattern (compiled as an anchored regex) plus an optional client-IP
//! ACL, bound to a pool handle. The collaborator asks the router where a
//! request goes and invokes `Pool::dispatch` on the answer.

use super::pool::PoolHandle;
use crate::error::{PreforkError, Result};
use crate::http::anchored_regex;
use regex::Regex;
use std::sync::Mutex;

struct Binding {
    pool_id: String,
    pattern: Regex,
    acl: Option<Vec<String>>,
    handle: PoolHandle,
}

/// The connecting client address must start with one of the ACL
/// prefixes; an absent ACL admits everyone.
fn acl_allows(acl: Option<&[String]>, ip: &str) -> bool {
    match acl {
        None => true,
        Some(prefixes) => prefixes.iter().any(|prefix| ip.starts_with(prefix.as_str())),
    }
}

impl Binding {
    fn allows(&self, ip: &str) -> bool {
        acl_allows(self.acl.as_deref(), ip)
    }
}

/// Outcome of routing one URI.
pub enum RouteDecision {
    /// No binding matched; the collaborator handles the request itself.
    NoMatch,
    /// A binding matched but the client address failed its ACL (403).
    Forbidden,
    /// Dispatch to this pool.
    Pool(PoolHandle),
}

/// Registry of URI bindings, checked in registration order.
pub struct Router {
    bindings: Mutex<Vec<Binding>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(Vec::new()),
        }
    }

    /// Bind a URI pattern (string patterns are anchored) to a pool.
    pub fn register(
        &self,
        pool_id: &str,
        pattern: &str,
        acl: Option<Vec<String>>,
        handle: PoolHandle,
    ) -> Result<()> {
        let regex = anchored_regex(pattern).map_err(|source| PreforkError::UriPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        tracing::info!(pool = %pool_id, pattern = %regex, "registered route");
        self.bindings
            .lock()
            .expect("router lock poisoned")
            .push(Binding {
                pool_id: pool_id.to_string(),
                pattern: regex,
                acl,
                handle,
            });
        Ok(())
    }

    /// Bind a prebuilt regex (used as-is, no anchoring applied).
    pub fn register_regex(
        &self,
        pool_id: &str,
        pattern: Regex,
        acl: Option<Vec<String>>,
        handle: PoolHandle,
    ) {
        tracing::info!(pool = %pool_id, pattern = %pattern, "registered route");
        self.bindings
            .lock()
            .expect("router lock poisoned")
            .push(Binding {
                pool_id: pool_id.to_string(),
                pattern,
                acl,
                handle,
            });
    }

    /// Drop all bindings for a pool.
    pub fn deregister(&self, pool_id: &str) {
        self.bindings
            .lock()
            .expect("router lock poisoned")
            .retain(|binding| binding.pool_id != pool_id);
    }

    /// First matching binding wins.
    pub fn route(&self, uri: &str, ip: &str) -> RouteDecision {
        let bindings = self.bindings.lock().expect("router lock poisoned");
        for binding in bindings.iter() {
            if binding.pattern.is_match(uri) {
                return if binding.allows(ip) {
                    RouteDecision::Pool(binding.handle.clone())
                } else {
                    RouteDecision::Forbidden
                };
            }
        }
        RouteDecision::NoMatch
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().expect("router lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_prefix_matching() {
        let acl = vec!["10.".to_string(), "192.168.".to_string()];
        assert!(acl_allows(Some(&acl), "10.0.0.7"));
        assert!(acl_allows(Some(&acl), "192.168.1.1"));
        assert!(!acl_allows(Some(&acl), "172.16.0.1"));
        assert!(acl_allows(None, "172.16.0.1"));
    }

    #[test]
    fn string_patterns_are_anchored() {
        let regex = anchored_regex("/img/").unwrap();
        assert!(regex.is_match("/img/42"));
        assert!(!regex.is_match("/static/img/42"));
    }
}
