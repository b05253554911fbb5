//! In-memory secret cache held by the agent
//!
//! Decrypted safes are kept in guarded memory, indexed by safe path in an
//! ordered map. Storing a path that is already cached replaces the old
//! entry, whose buffers are zeroed as soon as it is dropped.
//!
//! There is no capacity bound: entries live until replaced, removed, or
//! the agent exits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kickpass_crypto::GuardedBuf;
use tracing::debug;

use crate::error::AgentError;
use crate::path::{SafePath, METADATA_MAX_LEN, PASSWORD_MAX_LEN};

/// A decrypted safe cached by the agent
///
/// Only `SecretCache::allocate` builds one; its buffers are filled once at
/// allocation and read-only afterwards.
pub struct AgentSafe {
    path: SafePath,
    password: GuardedBuf,
    metadata: GuardedBuf,
}

impl AgentSafe {
    pub fn path(&self) -> &SafePath {
        &self.path
    }

    pub fn password(&self) -> &[u8] {
        self.password.as_bytes()
    }

    pub fn metadata(&self) -> &[u8] {
        self.metadata.as_bytes()
    }
}

impl fmt::Debug for AgentSafe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSafe")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Ordered, internally synchronized index of cached safes
#[derive(Default)]
pub struct SecretCache {
    entries: Mutex<BTreeMap<SafePath, AgentSafe>>,
}

impl SecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve guarded memory for a safe and copy its secrets in
    pub fn allocate(
        &self,
        path: SafePath,
        password: &[u8],
        metadata: &[u8],
    ) -> Result<AgentSafe, AgentError> {
        let password = GuardedBuf::new(PASSWORD_MAX_LEN, password)?;
        let metadata = GuardedBuf::new(METADATA_MAX_LEN, metadata)?;

        Ok(AgentSafe {
            path,
            password,
            metadata,
        })
    }

    /// Insert a safe, replacing any entry with the same path
    ///
    /// Returns true when an older entry was replaced.
    pub fn store(&self, safe: AgentSafe) -> bool {
        let mut entries = self.lock();
        let path = safe.path.clone();
        let replaced = entries.insert(path.clone(), safe);
        debug!(safe = %path, replaced = replaced.is_some(), "cached safe");
        replaced.is_some()
    }

    /// Run `f` against the cached safe at `path`, if any
    ///
    /// The closure runs under the cache lock, so it should only copy out
    /// what it needs.
    pub fn lookup<R>(&self, path: &str, f: impl FnOnce(&AgentSafe) -> R) -> Option<R> {
        let entries = self.lock();
        entries.get(path).map(f)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    /// Drop the entry at `path`, zeroing its buffers
    pub fn remove(&self, path: &str) -> bool {
        let removed = self.lock().remove(path);
        let found = removed.is_some();
        drop(removed);
        if found {
            debug!(safe = path, "evicted safe");
        }
        found
    }

    /// Drop every entry, returning how many there were
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let count = drained.len();
        drop(drained);
        count
    }

    /// Cached paths in lexicographic order
    pub fn paths(&self) -> Vec<SafePath> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SafePath, AgentSafe>> {
        // Entries stay consistent even if a holder panicked: every mutation
        // is a single map operation.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SecretCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCache")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn path(p: &str) -> SafePath {
        SafePath::new(p).unwrap()
    }

    fn cache_with(entries: &[(&str, &str, &str)]) -> SecretCache {
        let cache = SecretCache::new();
        for (p, pw, md) in entries {
            let safe = cache
                .allocate(path(p), pw.as_bytes(), md.as_bytes())
                .unwrap();
            cache.store(safe);
        }
        cache
    }

    #[test]
    fn test_store_and_lookup() {
        let cache = cache_with(&[("email/gmail", "p@ss", "url: gmail.com")]);

        let password = cache.lookup("email/gmail", |s| s.password().to_vec());
        assert_eq!(password.as_deref(), Some(&b"p@ss"[..]));

        let metadata = cache.lookup("email/gmail", |s| s.metadata().to_vec());
        assert_eq!(metadata.as_deref(), Some(&b"url: gmail.com"[..]));
    }

    #[test]
    fn test_lookup_missing() {
        let cache = cache_with(&[("a", "1", "")]);
        assert!(cache.lookup("b", |_| ()).is_none());
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_distinct_paths_all_found_in_order() {
        let cache = cache_with(&[
            ("web/zeta", "z", ""),
            ("bank", "b", ""),
            ("email/gmail", "g", ""),
            ("email/aol", "a", ""),
            ("web/alpha", "w", ""),
        ]);

        for (p, pw) in [
            ("web/zeta", "z"),
            ("bank", "b"),
            ("email/gmail", "g"),
            ("email/aol", "a"),
            ("web/alpha", "w"),
        ] {
            let found = cache.lookup(p, |s| s.password().to_vec()).unwrap();
            assert_eq!(found, pw.as_bytes());
        }

        let order: Vec<String> = cache.paths().iter().map(|p| p.to_string()).collect();
        assert_eq!(
            order,
            vec!["bank", "email/aol", "email/gmail", "web/alpha", "web/zeta"]
        );
    }

    #[test]
    fn test_store_same_path_overwrites() {
        let cache = cache_with(&[("email/gmail", "old", "v1")]);

        let newer = cache.allocate(path("email/gmail"), b"new", b"v2").unwrap();
        assert!(cache.store(newer));

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.lookup("email/gmail", |s| s.password().to_vec()),
            Some(b"new".to_vec())
        );
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = cache_with(&[("a", "1", ""), ("b", "2", ""), ("c", "3", "")]);

        assert!(cache.remove("b"));
        assert!(!cache.remove("b"));
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oversized_secret_is_invalid_not_exhausted() {
        let cache = SecretCache::new();
        let big = vec![b'x'; PASSWORD_MAX_LEN + 1];
        let err = cache.allocate(path("a"), &big, b"").unwrap_err();
        assert!(matches!(err, AgentError::InvalidSafe(_)));
    }

    #[test]
    fn test_concurrent_stores() {
        let cache = Arc::new(SecretCache::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let safe = cache
                        .allocate(path(&format!("safe/{:02}", i)), b"pw", b"")
                        .unwrap();
                    cache.store(safe);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cache.len(), 16);
        let paths = cache.paths();
        assert!(paths.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let cache = cache_with(&[("a", "hunter2", "secret notes")]);
        let dbg = cache.lookup("a", |s| format!("{:?}", s)).unwrap();
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("secret notes"));
    }
}
