// src/imagery/cache.rs
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::provider::TileRequest;

/// Content address of a tile: SHA-256 over the coordinate rounded to six
/// decimals (about 0.1 m) and the request parameters.
pub fn cache_key(request: &TileRequest) -> String {
    let canonical = format!(
        "{:.6},{:.6},{},{},{}x{}",
        request.lat,
        request.lon,
        request.spec.zoom,
        request.spec.style,
        request.spec.width,
        request.spec.height
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

type LockMap = HashMap<PathBuf, Arc<AsyncMutex<()>>>;

/// On-disk tile store with one lock per path. A path's lock lives only while
/// someone holds or waits for it.
pub struct TileCache {
    dir: PathBuf,
    locks: Mutex<LockMap>,
}

/// Exclusive hold on one tile path; releasing the last hold drops the entry.
pub struct TileLock<'a> {
    cache: &'a TileCache,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TileLock<'_> {
    fn drop(&mut self) {
        // The guard owns a reference to the entry; release it before counting.
        self.guard.take();
        let mut locks = self.cache.lock_map();
        if locks
            .get(&self.path)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&self.path);
        }
    }
}

impl TileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, request: &TileRequest) -> PathBuf {
        self.dir.join(format!("{}.png", cache_key(request)))
    }

    fn lock_map(&self) -> MutexGuard<'_, LockMap> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialises every check-then-write on `path`.
    pub async fn lock(&self, path: &Path) -> TileLock<'_> {
        let entry = self
            .lock_map()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = entry.lock_owned().await;
        TileLock {
            cache: self,
            path: path.to_path_buf(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.lock_map().len()
    }

    pub async fn contains(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Writes to a sibling temp file and renames it into place, so readers never
    /// observe a partial tile.
    pub async fn store(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imagery::provider::TileSpec;

    fn request(lat: f64, lon: f64) -> TileRequest {
        TileRequest {
            lat,
            lon,
            spec: TileSpec::default(),
        }
    }

    #[test]
    fn test_same_coordinate_same_path() {
        let cache = TileCache::new("/tmp/tiles");
        assert_eq!(
            cache.path_for(&request(47.5112, -122.257)),
            cache.path_for(&request(47.5112, -122.257))
        );
        // Sub-micro-degree noise rounds away.
        assert_eq!(
            cache.path_for(&request(47.5112, -122.257)),
            cache.path_for(&request(47.51120000001, -122.257))
        );
        assert_ne!(
            cache.path_for(&request(47.5112, -122.257)),
            cache.path_for(&request(47.5113, -122.257))
        );
    }

    #[test]
    fn test_request_parameters_change_the_address() {
        let base = request(47.5112, -122.257);
        let mut zoomed = base.clone();
        zoomed.spec.zoom = 17;
        assert_ne!(cache_key(&base), cache_key(&zoomed));
    }

    #[tokio::test]
    async fn test_store_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::new(dir.path().join("tiles"));
        let path = cache.path_for(&request(1.0, 2.0));
        assert!(!cache.contains(&path).await);

        let _guard = cache.lock(&path).await;
        cache.store(&path, b"first").await.unwrap();
        cache.store(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(cache.dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_released_locks_are_forgotten() {
        let cache = TileCache::new("/tmp/tiles");
        let first = cache.path_for(&request(1.0, 2.0));
        let second = cache.path_for(&request(3.0, 4.0));
        {
            let _a = cache.lock(&first).await;
            let _b = cache.lock(&second).await;
            assert_eq!(cache.tracked_locks(), 2);
        }
        assert_eq!(cache.tracked_locks(), 0);

        for i in 0..100 {
            let path = cache.path_for(&request(i as f64, 0.0));
            drop(cache.lock(&path).await);
        }
        assert_eq!(cache.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_waiter_keeps_the_lock_alive() {
        let cache = Arc::new(TileCache::new("/tmp/tiles"));
        let path = cache.path_for(&request(5.0, 6.0));
        let held = cache.lock(&path).await;

        let waiter = {
            let cache = Arc::clone(&cache);
            let path = path.clone();
            tokio::spawn(async move {
                let _guard = cache.lock(&path).await;
                cache.tracked_locks()
            })
        };
        tokio::task::yield_now().await;
        drop(held);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(cache.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::new(dir.path().join("tiles"));
        let path = cache.path_for(&request(7.0, 8.0));
        // A non-empty directory at the target makes the rename fail.
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        assert!(cache.store(&path, b"tile").await.is_err());
        let names: Vec<_> = std::fs::read_dir(cache.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1, "{:?}", names);
    }
}
