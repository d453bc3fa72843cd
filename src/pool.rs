//! Session credential pool with rotation and unavailability marking.
//!
//! Two independent cursors rotate the pool: one skips credentials marked
//! unavailable (limit-tracked models), one ignores markings entirely
//! (unlimited models). Keeping them separate means a burst of markings cannot
//! starve unlimited-model traffic and vice versa.

use crate::error::{ProxyError, Result};
use dashmap::DashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct CredentialPool {
    all: Vec<String>,
    unavailable: DashSet<String>,
    available_cursor: AtomicUsize,
    unlimited_cursor: AtomicUsize,
}

impl CredentialPool {
    /// Build a pool from a comma-separated credential list. Entries are
    /// trimmed and empties dropped; order is preserved.
    pub fn from_list(raw: &str) -> Self {
        let all = raw
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();

        Self {
            all,
            unavailable: DashSet::new(),
            available_cursor: AtomicUsize::new(0),
            unlimited_cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn unavailable_count(&self) -> usize {
        self.unavailable.len()
    }

    /// Idempotent. Unknown credentials are ignored silently, which keeps the
    /// unavailable set a subset of the pool.
    pub fn mark_unavailable(&self, credential: &str) {
        if self.all.iter().any(|c| c == credential) {
            self.unavailable.insert(credential.to_string());
        }
    }

    /// Next credential not currently marked unavailable, scanning forward
    /// from the available cursor and wrapping at most once. When every
    /// credential is marked, returns the first credential in the original
    /// order rather than failing the caller.
    pub fn next_available(&self) -> Result<String> {
        if self.all.is_empty() {
            return Err(ProxyError::NoCredentialsAvailable);
        }

        if self.unavailable.len() >= self.all.len() {
            return Ok(self.all[0].clone());
        }

        for _ in 0..self.all.len() {
            let pos = self
                .available_cursor
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1)
                % self.all.len();
            let credential = &self.all[pos];

            if !self.unavailable.contains(credential) {
                return Ok(credential.clone());
            }
        }

        Ok(self.all[0].clone())
    }

    /// Next credential regardless of unavailability markings. Used for
    /// models exempt from limit tracking.
    pub fn any_credential(&self) -> Result<String> {
        if self.all.is_empty() {
            return Err(ProxyError::NoCredentialsAvailable);
        }

        let pos = self
            .unlimited_cursor
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
            % self.all.len();
        Ok(self.all[pos].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_trims_and_drops_empties() {
        let pool = CredentialPool::from_list(" a , , b,c ,");
        assert_eq!(pool.len(), 3);
        assert!(!pool.is_empty());
    }

    #[test]
    fn test_empty_pool_errors() {
        let pool = CredentialPool::from_list("");
        assert!(matches!(
            pool.next_available(),
            Err(ProxyError::NoCredentialsAvailable)
        ));
        assert!(matches!(
            pool.any_credential(),
            Err(ProxyError::NoCredentialsAvailable)
        ));
    }

    #[test]
    fn test_round_robin_visits_everyone() {
        let pool = CredentialPool::from_list("a,b,c");
        let mut seen = HashSet::new();
        for _ in 0..4 {
            seen.insert(pool.next_available().unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_skips_unavailable() {
        let pool = CredentialPool::from_list("a,b,c");
        pool.mark_unavailable("b");

        for _ in 0..6 {
            let cred = pool.next_available().unwrap();
            assert_ne!(cred, "b");
        }
    }

    #[test]
    fn test_all_unavailable_falls_back_to_first() {
        let pool = CredentialPool::from_list("a,b,c");
        pool.mark_unavailable("a");
        pool.mark_unavailable("b");
        pool.mark_unavailable("c");

        assert_eq!(pool.next_available().unwrap(), "a");
        assert_eq!(pool.unavailable_count(), 3);
    }

    #[test]
    fn test_marking_is_idempotent_and_tolerates_unknowns() {
        let pool = CredentialPool::from_list("a,b");
        pool.mark_unavailable("a");
        pool.mark_unavailable("a");
        pool.mark_unavailable("stranger");
        assert_eq!(pool.next_available().unwrap(), "b");
    }

    #[test]
    fn test_any_credential_ignores_markings() {
        let pool = CredentialPool::from_list("a,b");
        pool.mark_unavailable("a");
        pool.mark_unavailable("b");

        let mut seen = HashSet::new();
        for _ in 0..4 {
            seen.insert(pool.any_credential().unwrap());
        }
        assert_eq!(seen.len(), 2);
    }
}
