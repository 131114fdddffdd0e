//! The optional job cache (component J). Keyed by `(rule cmd fingerprint,
//! resolved static deps fingerprint, target set fingerprint)`; a hit returns
//! a pre-computed job digest plus the set of artifact blobs it references,
//! all addressed through the same [`LocalStore`] used for everything else.
//! A miss is not an error: the job-exec supervisor falls through to actual
//! execution and, on a clean success, calls [`Cache::put`] to populate it.
//!
//! The cached digest shape itself is left generic (`D`) rather than fixed
//! to one struct here: the real `JobDigest` (every target/dep's path and
//! `Crc`) lives in `process_exec`, a crate this one doesn't depend on —
//! `store` stays the leaf it is everywhere else (DESIGN.md), and the
//! engine layer that actually owns `process_exec::digest::JobDigest`
//! supplies it as `D` at the call site.

use hashing::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};

use crate::LocalStore;

/// The three fingerprints that together identify a cacheable unit of work.
/// Kept as separate fields (rather than pre-combined) so callers can log
/// which component of the key changed when a cache miss surprises them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub cmd_fingerprint: Fingerprint,
    pub deps_fingerprint: Fingerprint,
    pub targets_fingerprint: Fingerprint,
}

impl CacheKey {
    /// Folds the three components into the single digest used to address
    /// the cache entry blob in the store.
    fn combined(&self) -> Digest {
        let mut buf = Vec::with_capacity(3 * hashing::FINGERPRINT_SIZE);
        buf.extend_from_slice(self.cmd_fingerprint.as_bytes());
        buf.extend_from_slice(self.deps_fingerprint.as_bytes());
        buf.extend_from_slice(self.targets_fingerprint.as_bytes());
        Digest::of_bytes(&buf)
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntry<D> {
    digest: D,
    artifacts: Vec<Digest>,
}

pub struct Cache {
    store: LocalStore,
}

impl Cache {
    pub fn new(store: LocalStore) -> Cache {
        Cache { store }
    }

    /// Looks up `key`; returns the job digest and artifact set on a hit.
    /// Artifacts themselves are not fetched here — callers pull each one
    /// from the store lazily, the way a job's actual outputs would be
    /// materialized into its sandbox lazily too.
    pub async fn get<D: for<'de> Deserialize<'de>>(&self, key: CacheKey) -> Result<Option<(D, Vec<Digest>)>, String> {
        let entry_digest = key.combined();
        let bytes = match self.store.load_bytes(entry_digest).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let entry: CacheEntry<D> =
            serde_json::from_slice(&bytes).map_err(|e| format!("corrupt cache entry: {e}"))?;
        Ok(Some((entry.digest, entry.artifacts)))
    }

    /// Records a clean success under `key`. `artifacts` must already be
    /// present in the backing store (the supervisor stores job outputs as
    /// it collects them, before ever calling `put`).
    pub async fn put<D: Serialize>(&self, key: CacheKey, digest: &D, artifacts: Vec<Digest>) -> Result<(), String> {
        let entry = CacheEntry { digest, artifacts };
        let bytes = serde_json::to_vec(&entry).map_err(|e| format!("cache entry serialize: {e}"))?;
        self.store.store_bytes(bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashing::Fingerprint;
    use task_executor::Executor;

    /// Stand-in for a real caller's digest type (e.g.
    /// `process_exec::digest::JobDigest`); `Cache` doesn't care what shape
    /// `D` is as long as it round-trips through serde.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct FakeDigest {
        exit_code: i32,
        stdout: Digest,
    }

    fn key(seed: u8) -> CacheKey {
        let fp = |tag: u8| Fingerprint::from_digest_bytes({
            use sha2::{Digest as _, Sha256};
            let mut hasher = Sha256::default();
            hasher.update([seed, tag]);
            hasher.finalize()
        });
        CacheKey {
            cmd_fingerprint: fp(0),
            deps_fingerprint: fp(1),
            targets_fingerprint: fp(2),
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), 16 * 1024 * 1024, Executor::new()).unwrap();
        let cache = Cache::new(store.clone());
        let k = key(1);

        assert!(cache.get::<FakeDigest>(k).await.unwrap().is_none());

        let stdout = store.store_bytes(b"built ok\n".to_vec()).await.unwrap();
        let digest = FakeDigest { exit_code: 0, stdout };
        cache.put(k, &digest, vec![stdout]).await.unwrap();

        let (hit_digest, artifacts): (FakeDigest, Vec<Digest>) = cache.get(k).await.unwrap().unwrap();
        assert_eq!(hit_digest.exit_code, 0);
        assert_eq!(artifacts, vec![stdout]);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), 16 * 1024 * 1024, Executor::new()).unwrap();
        let cache = Cache::new(store);
        let a = key(1);
        let b = key(2);
        let digest = FakeDigest {
            exit_code: 0,
            stdout: hashing::EMPTY_DIGEST,
        };
        cache.put(a, &digest, vec![]).await.unwrap();
        assert!(cache.get::<FakeDigest>(b).await.unwrap().is_none());
        assert!(cache.get::<FakeDigest>(a).await.unwrap().is_some());
    }
}
