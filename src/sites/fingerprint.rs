//! Content fingerprint cache backing ETag validation.
//!
//! Each served file gets a SHA-256 digest of its contents together with the size
//! and modification time seen when it was hashed. An entry is reused until the
//! file's modification time moves past the recorded one or the entry reaches its
//! maximum age, whichever comes first. Entries are never evicted.
//!
//! Lookups of fresh entries go straight to the entry map. Recomputation happens
//! under a recompute lock: one lock for the whole cache by default, or a set of
//! striped locks selected by path hash.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use moka::future::Cache;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Fingerprint of a file's contents at the time it was hashed.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    /// Hex digest prefixed with the algorithm, e.g. `sha256-9f86…`
    pub digest: String,
    /// Quoted ETag value sent to clients
    pub validator: String,
    pub size: u64,
    /// Modification time of the file when it was hashed
    pub modified: SystemTime,
    /// When this entry was computed
    pub created: Instant,
}

impl Fingerprint {
    fn new(contents: &[u8], modified: SystemTime) -> Self {
        let digest = format!("sha256-{:x}", Sha256::digest(contents));
        let validator = format!("\"{}\"", digest);
        Self {
            digest,
            validator,
            size: contents.len() as u64,
            modified,
            created: Instant::now(),
        }
    }

    /// Whether this entry can be used for a file currently modified at `modified`.
    pub fn is_valid(&self, modified: SystemTime, max_age: Duration) -> bool {
        modified <= self.modified && self.created.elapsed() < max_age
    }
}

pub struct FingerprintCache {
    entries: Cache<PathBuf, Arc<Fingerprint>>,
    recompute_locks: Box<[Mutex<()>]>,
    max_age: Duration,
    recomputations: AtomicU64,
}

impl FingerprintCache {
    /// Create a cache whose entries go stale after `max_age`.
    ///
    /// `stripes` is the number of recompute locks; 1 serializes every recompute.
    pub fn new(max_age: Duration, stripes: usize) -> Self {
        let recompute_locks = (0..stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            entries: Cache::builder().build(),
            recompute_locks,
            max_age,
            recomputations: AtomicU64::new(0),
        }
    }

    /// Return a valid fingerprint for `path`, hashing the file if needed.
    pub async fn get_or_refresh(&self, path: &Path) -> io::Result<Arc<Fingerprint>> {
        if let Some(entry) = self.entries.get(path).await {
            let modified = tokio::fs::metadata(path).await?.modified()?;
            if entry.is_valid(modified, self.max_age) {
                return Ok(entry);
            }
            tracing::debug!(path = %path.display(), "Fingerprint stale, recomputing");
        }

        self.recompute(path).await
    }

    async fn recompute(&self, path: &Path) -> io::Result<Arc<Fingerprint>> {
        let _guard = self.lock_for(path).lock().await;

        let mut file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        let modified = metadata.modified()?;

        // Another task may have refreshed this path while we waited for the lock
        if let Some(entry) = self.entries.get(path).await {
            if entry.is_valid(modified, self.max_age) {
                return Ok(entry);
            }
        }

        let mut contents = Vec::with_capacity(metadata.len() as usize);
        file.read_to_end(&mut contents).await?;

        let entry = Arc::new(Fingerprint::new(&contents, modified));
        self.entries.insert(path.to_path_buf(), entry.clone()).await;
        self.recomputations.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            path = %path.display(),
            size = entry.size,
            digest = %entry.digest,
            "Computed file fingerprint"
        );
        Ok(entry)
    }

    fn lock_for(&self, path: &Path) -> &Mutex<()> {
        if self.recompute_locks.len() == 1 {
            return &self.recompute_locks[0];
        }
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        let index = (hasher.finish() % self.recompute_locks.len() as u64) as usize;
        &self.recompute_locks[index]
    }

    /// Number of times a file has been hashed since the cache was created.
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }
}
