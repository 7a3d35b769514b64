// src/paths.rs

//! Deterministic on-disk layout and the bounded path cache.
//!
//! Layout:
//!
//! ```text
//! <root>/.cinchdb/metadata.db
//! <root>/.cinchdb/databases/<db>/branches/<branch>/
//! <root>/.cinchdb/databases/<db>/branches/<branch>/tenants/<shard>/<tenant>.db
//! ```
//!
//! `<shard>` is the first two hex digits of SHA-256 of the tenant
//! name, which keeps any single directory to a few hundred files even
//! with tens of thousands of tenants. All name arguments are assumed
//! to have passed [`crate::naming::validate_name`].

use crate::config::{METADATA_DB, STATE_DIR};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Bound on cached path-assembly results
const PATH_CACHE_CAPACITY: usize = 1000;

/// Hidden state directory for a project
pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

/// Path of the metadata index file
pub fn metadata_db_path(root: &Path) -> PathBuf {
    state_dir(root).join(METADATA_DB)
}

/// Root directory of a database
pub fn database_path(root: &Path, database: &str) -> PathBuf {
    state_dir(root).join("databases").join(database)
}

/// Root directory of a branch
pub fn branch_path(root: &Path, database: &str, branch: &str) -> PathBuf {
    database_path(root, database).join("branches").join(branch)
}

/// Tenants directory of a branch (shard directories live below it)
pub fn tenants_path(root: &Path, database: &str, branch: &str) -> PathBuf {
    branch_path(root, database, branch).join("tenants")
}

/// Shard bucket for a tenant: first two hex digits of SHA-256(name)
pub fn shard_for(tenant: &str) -> String {
    let digest = Sha256::digest(tenant.as_bytes());
    hex::encode(&digest[..1])
}

/// Full path of a tenant's SQLite file
pub fn tenant_db_path(root: &Path, database: &str, branch: &str, tenant: &str) -> PathBuf {
    tenants_path(root, database, branch)
        .join(shard_for(tenant))
        .join(format!("{tenant}.db"))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Shard(String),
    TenantDb(String, String, String),
}

#[derive(Debug, Clone)]
enum CacheEntry {
    Shard(String),
    Path(PathBuf),
}

/// LRU cache over assembled tenant paths and shard computations.
///
/// Invalidation is write-through: every mutation that removes or
/// renames a database, branch, or tenant calls [`PathCache::invalidate`].
pub struct PathCache {
    inner: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl std::fmt::Debug for PathCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathCache")
            .field("entries", &self.lock().len())
            .finish()
    }
}

impl PathCache {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(PATH_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached shard computation
    pub fn shard(&self, tenant: &str) -> String {
        let key = CacheKey::Shard(tenant.to_string());
        if let Some(CacheEntry::Shard(s)) = self.lock().get(&key) {
            return s.clone();
        }
        let shard = shard_for(tenant);
        self.lock().put(key, CacheEntry::Shard(shard.clone()));
        shard
    }

    /// Cached tenant database path
    pub fn tenant_db(&self, root: &Path, database: &str, branch: &str, tenant: &str) -> PathBuf {
        let key = CacheKey::TenantDb(
            database.to_string(),
            branch.to_string(),
            tenant.to_string(),
        );
        if let Some(CacheEntry::Path(p)) = self.lock().get(&key) {
            return p.clone();
        }
        let path = tenant_db_path(root, database, branch, tenant);
        self.lock().put(key, CacheEntry::Path(path.clone()));
        path
    }

    /// Drop cached entries matching the given scope.
    ///
    /// `invalidate(Some(db), None, None)` drops everything under a
    /// database; narrower scopes drop only matching branch/tenant
    /// entries. Shard entries are only dropped when a specific tenant
    /// is named.
    pub fn invalidate(&self, database: Option<&str>, branch: Option<&str>, tenant: Option<&str>) {
        let mut cache = self.lock();
        let doomed: Vec<CacheKey> = cache
            .iter()
            .filter(|(key, _)| match key {
                CacheKey::Shard(name) => tenant == Some(name.as_str()),
                CacheKey::TenantDb(db, br, tn) => {
                    database.is_none_or(|d| d == db)
                        && branch.is_none_or(|b| b == br)
                        && tenant.is_none_or(|t| t == tn)
                }
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            cache.pop(&key);
        }
    }
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let root = Path::new("/proj");
        assert_eq!(
            metadata_db_path(root),
            PathBuf::from("/proj/.cinchdb/metadata.db")
        );
        assert_eq!(
            branch_path(root, "app", "main"),
            PathBuf::from("/proj/.cinchdb/databases/app/branches/main")
        );
    }

    #[test]
    fn test_shard_is_deterministic_sha256_prefix() {
        let digest = Sha256::digest(b"customer1");
        let expected = hex::encode(&digest[..1]);
        assert_eq!(shard_for("customer1"), expected);
        assert_eq!(shard_for("customer1").len(), 2);
        // Stable across calls
        assert_eq!(shard_for("customer1"), shard_for("customer1"));
    }

    #[test]
    fn test_tenant_db_path_is_sharded() {
        let root = Path::new("/proj");
        let path = tenant_db_path(root, "app", "main", "acme");
        let shard = shard_for("acme");
        assert_eq!(
            path,
            PathBuf::from(format!(
                "/proj/.cinchdb/databases/app/branches/main/tenants/{shard}/acme.db"
            ))
        );
    }

    #[test]
    fn test_cache_returns_same_paths() {
        let cache = PathCache::new();
        let root = Path::new("/proj");
        let direct = tenant_db_path(root, "app", "main", "acme");
        assert_eq!(cache.tenant_db(root, "app", "main", "acme"), direct);
        // Second hit comes from the cache
        assert_eq!(cache.tenant_db(root, "app", "main", "acme"), direct);
        assert_eq!(cache.shard("acme"), shard_for("acme"));
    }

    #[test]
    fn test_invalidate_scopes() {
        let cache = PathCache::new();
        let root = Path::new("/proj");
        cache.tenant_db(root, "app", "main", "t1");
        cache.tenant_db(root, "app", "feat", "t2");
        cache.tenant_db(root, "other", "main", "t3");

        cache.invalidate(Some("app"), Some("feat"), None);
        assert_eq!(cache.lock().len(), 2);

        cache.invalidate(Some("app"), None, None);
        assert_eq!(cache.lock().len(), 1);

        cache.invalidate(None, None, None);
        assert_eq!(cache.lock().len(), 0);
    }
}
