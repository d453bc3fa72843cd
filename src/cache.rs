//! Content-addressed cache mapping attachment digests to upstream locations.
//!
//! A value is treated as immutable once present: an attachment's bytes never
//! change, so its upstream location is stable for the session lifetime.
//! Concurrent identical writes are idempotent no-ops in effect.

use dashmap::DashMap;
use serde::Serialize;

#[derive(Default)]
pub struct AttachmentCache {
    entries: DashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    /// Redacted key prefixes, never full digests.
    pub keys: Vec<String>,
}

impl AttachmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn store(&self, key: impl Into<String>, location: impl Into<String>) {
        self.entries.insert(key.into(), location.into());
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            keys: self
                .entries
                .iter()
                .map(|e| redact_key(e.key()))
                .collect(),
        }
    }

    /// Empties the cache, returning the prior entry count. In-flight uploads
    /// are unaffected.
    pub fn clear(&self) -> usize {
        let prior = self.entries.len();
        self.entries.clear();
        prior
    }
}

fn redact_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_miss_then_hit() {
        let cache = AttachmentCache::new();
        assert!(cache.lookup("deadbeef").is_none());

        cache.store("deadbeef", "/attachments/1.png");
        assert_eq!(
            cache.lookup("deadbeef"),
            Some("/attachments/1.png".to_string())
        );
    }

    #[test]
    fn test_stats_redacts_keys() {
        let cache = AttachmentCache::new();
        cache.store(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
            "/a",
        );

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.keys, vec!["01234567...".to_string()]);
    }

    #[test]
    fn test_clear_returns_prior_size() {
        let cache = AttachmentCache::new();
        cache.store("a", "1");
        cache.store("b", "2");

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.clear(), 0);
    }
}
