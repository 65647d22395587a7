//! Filesystem profile store
//!
//! Profiles live as opaque JSON files under one root directory, one
//! subdirectory per bucket: `primary/`, `backup/`, `emergency/`. The store
//! reads them; it never writes — creating, refreshing, and removing profile
//! files is an external operator action.
//!
//! An `active/` subdirectory is reserved for the pool manager and must not
//! be hand-populated; the store refuses to list or load from it.

use std::path::{Path, PathBuf};

use common::Secret;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::profile::PoolBucket;

/// Reserved directory name that operators must not hand-populate.
const ACTIVE_DIR: &str = "active";

/// Read-only view of the on-disk credential pools.
pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    /// Open a store rooted at `root`. The root must exist; bucket
    /// subdirectories may be absent (treated as empty).
    pub fn open(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::Store(format!(
                "profile store root is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// List profile ids in one bucket, sorted by filename for a stable scan
    /// order. Ids are `<bucket>/<file stem>`.
    pub async fn list_profiles(&self, bucket: PoolBucket) -> Result<Vec<String>> {
        let dir = self.root.join(bucket.dir_name());
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Store(format!("reading {}: {e}", dir.display())))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Store(format!("reading {}: {e}", dir.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(format!("{}/{}", bucket.dir_name(), stem));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load one profile's opaque payload by id.
    pub async fn load_profile(&self, id: &str) -> Result<Secret<String>> {
        let Some((bucket_dir, stem)) = id.split_once('/') else {
            return Err(Error::NotFound(id.to_string()));
        };
        if bucket_dir == ACTIVE_DIR {
            return Err(Error::Store(format!(
                "the '{ACTIVE_DIR}' slot is managed internally and cannot be loaded as a pool"
            )));
        }
        if !PoolBucket::SCAN_ORDER
            .iter()
            .any(|b| b.dir_name() == bucket_dir)
            || stem.contains(['/', '\\'])
            || stem.contains("..")
        {
            return Err(Error::NotFound(id.to_string()));
        }

        let path = self.root.join(bucket_dir).join(format!("{stem}.json"));
        let payload = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Store(format!("loading {}: {e}", path.display())))?;
        Ok(Secret::new(payload))
    }

    /// Scan every bucket in priority order, returning
    /// `(bucket, id, payload)` triples ready for the manager.
    pub async fn scan(&self) -> Result<Vec<(PoolBucket, String, Secret<String>)>> {
        self.warn_if_active_populated();

        let mut out = Vec::new();
        for bucket in PoolBucket::SCAN_ORDER {
            for id in self.list_profiles(bucket).await? {
                let payload = self.load_profile(&id).await?;
                out.push((bucket, id, payload));
            }
        }
        info!(profiles = out.len(), root = %self.root.display(), "profile store scanned");
        Ok(out)
    }

    /// Operators sometimes copy a profile into `active/` by hand expecting
    /// it to take priority; it never does, so call that out loudly.
    fn warn_if_active_populated(&self) {
        let active = self.root.join(ACTIVE_DIR);
        if let Ok(mut entries) = std::fs::read_dir(&active)
            && entries.next().is_some()
        {
            warn!(
                dir = %active.display(),
                "the 'active' slot is managed internally; files placed there are ignored"
            );
        }
    }

    /// Store root path (for health output).
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(dir: &Path, bucket: &str, name: &str, body: &str) {
        let d = dir.join(bucket);
        std::fs::create_dir_all(&d).unwrap();
        std::fs::write(d.join(format!("{name}.json")), body).unwrap();
    }

    #[tokio::test]
    async fn list_profiles_sorted_per_bucket() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "primary", "bob", "{}");
        seed(dir.path(), "primary", "alice", "{}");
        seed(dir.path(), "backup", "zoe", "{}");

        let store = ProfileStore::open(dir.path().to_path_buf()).unwrap();
        let primary = store.list_profiles(PoolBucket::Primary).await.unwrap();
        assert_eq!(primary, vec!["primary/alice", "primary/bob"]);

        let backup = store.list_profiles(PoolBucket::Backup).await.unwrap();
        assert_eq!(backup, vec!["backup/zoe"]);
    }

    #[tokio::test]
    async fn missing_bucket_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path().to_path_buf()).unwrap();
        let ids = store.list_profiles(PoolBucket::Emergency).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn non_json_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "primary", "alice", "{}");
        std::fs::write(dir.path().join("primary/README.txt"), "notes").unwrap();

        let store = ProfileStore::open(dir.path().to_path_buf()).unwrap();
        let ids = store.list_profiles(PoolBucket::Primary).await.unwrap();
        assert_eq!(ids, vec!["primary/alice"]);
    }

    #[tokio::test]
    async fn load_profile_returns_payload() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "primary", "alice", r#"{"cookies":[]}"#);

        let store = ProfileStore::open(dir.path().to_path_buf()).unwrap();
        let payload = store.load_profile("primary/alice").await.unwrap();
        assert_eq!(payload.expose(), r#"{"cookies":[]}"#);
    }

    #[tokio::test]
    async fn load_from_active_slot_refused() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "active", "sneaky", "{}");

        let store = ProfileStore::open(dir.path().to_path_buf()).unwrap();
        let err = store.load_profile("active/sneaky").await.unwrap_err();
        assert!(err.to_string().contains("managed internally"));
    }

    #[tokio::test]
    async fn load_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path().to_path_buf()).unwrap();
        assert!(store.load_profile("primary/../secret").await.is_err());
        assert!(store.load_profile("no-bucket").await.is_err());
    }

    #[tokio::test]
    async fn scan_orders_buckets_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "emergency", "last", "{}");
        seed(dir.path(), "primary", "first", "{}");
        seed(dir.path(), "backup", "middle", "{}");
        seed(dir.path(), "active", "ignored", "{}");

        let store = ProfileStore::open(dir.path().to_path_buf()).unwrap();
        let scanned = store.scan().await.unwrap();
        let ids: Vec<&str> = scanned.iter().map(|(_, id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["primary/first", "backup/middle", "emergency/last"]);
    }

    #[test]
    fn open_rejects_missing_root() {
        let result = ProfileStore::open(PathBuf::from("/nonexistent/pools"));
        assert!(result.is_err());
    }
}
