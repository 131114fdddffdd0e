//! The content-addressed artifact store (component J's backing store, and
//! the CRC machinery component E relies on to decide whether a dep's content
//! actually changed). Blobs are addressed by their [`hashing::Fingerprint`]
//! and held in a single LMDB environment with two databases: `content` and
//! `leases` (a lease extends a blob's lifetime past the next garbage
//! collection pass, mirroring why the persistent store's Node table keeps a
//! producer pointer rather than re-deriving it each run).
//!
//! This is a simplified, single-shard take on the teacher's `ShardedLmdb`
//! (see DESIGN.md): our write volume doesn't need 16-way parallelism, but we
//! keep the same versioned-key scheme and `NO_SYNC | NO_TLS` environment
//! flags, since those are what make LMDB usable from a thread pool at all.

pub mod cache;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashing::{Digest, Fingerprint, FINGERPRINT_SIZE};
use lmdb::{Cursor, Environment, EnvironmentFlags, Transaction, WriteFlags};
use log::trace;
use task_executor::Executor;

pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(2 * 60 * 60);
const SCHEMA_VERSION: u8 = 1;
const VERSIONED_KEY_SIZE: usize = FINGERPRINT_SIZE + 1;

fn versioned_key(fingerprint: Fingerprint) -> [u8; VERSIONED_KEY_SIZE] {
    let mut buf = [0u8; VERSIONED_KEY_SIZE];
    buf[0..FINGERPRINT_SIZE].copy_from_slice(fingerprint.as_bytes());
    buf[FINGERPRINT_SIZE] = SCHEMA_VERSION;
    buf
}

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    env: Environment,
    content_db: lmdb::Database,
    leases_db: lmdb::Database,
    executor: Executor,
    lease_time: Duration,
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: &Path, max_size_bytes: usize, executor: Executor) -> Result<LocalStore, String> {
        std::fs::create_dir_all(root).map_err(|e| format!("could not create store dir: {e}"))?;
        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_SYNC | EnvironmentFlags::NO_TLS)
            .set_max_dbs(2)
            .set_map_size(max_size_bytes)
            .open(root)
            .map_err(|e| format!("error opening store environment at {root:?}: {e}"))?;
        let content_db = env
            .create_db(Some("content"), lmdb::DatabaseFlags::empty())
            .map_err(|e| format!("error opening content db: {e}"))?;
        let leases_db = env
            .create_db(Some("leases"), lmdb::DatabaseFlags::empty())
            .map_err(|e| format!("error opening leases db: {e}"))?;
        Ok(LocalStore {
            inner: Arc::new(Inner {
                env,
                content_db,
                leases_db,
                executor,
                lease_time: DEFAULT_LEASE_TIME,
                root: root.to_path_buf(),
            }),
        })
    }

    pub async fn store_bytes(&self, bytes: Vec<u8>) -> Result<Digest, String> {
        let digest = Digest::of_bytes(&bytes);
        let inner = self.inner.clone();
        self
            .inner
            .executor
            .spawn_blocking(
                move || {
                    let key = versioned_key(digest.hash);
                    let mut txn = inner
                        .env
                        .begin_rw_txn()
                        .map_err(|e| format!("begin_rw_txn: {e}"))?;
                    txn.put(inner.content_db, &key, &bytes, WriteFlags::empty())
                        .map_err(|e| format!("put content: {e}"))?;
                    write_lease(&mut txn, inner.leases_db, &key, inner.lease_time)?;
                    txn.commit().map_err(|e| format!("commit: {e}"))?;
                    Ok(digest)
                },
                |e| Err(format!("store_bytes task failed: {e}")),
            )
            .await
    }

    pub async fn load_bytes(&self, digest: Digest) -> Result<Option<Vec<u8>>, String> {
        let inner = self.inner.clone();
        self
            .inner
            .executor
            .spawn_blocking(
                move || {
                    let key = versioned_key(digest.hash);
                    let txn = inner.env.begin_ro_txn().map_err(|e| format!("begin_ro_txn: {e}"))?;
                    match txn.get(inner.content_db, &key) {
                        Ok(bytes) => Ok(Some(bytes.to_vec())),
                        Err(lmdb::Error::NotFound) => Ok(None),
                        Err(e) => Err(format!("get content: {e}")),
                    }
                },
                |e| Err(format!("load_bytes task failed: {e}")),
            )
            .await
    }

    pub async fn exists(&self, digest: Digest) -> Result<bool, String> {
        Ok(self.load_bytes(digest).await?.is_some())
    }

    pub async fn lease(&self, digest: Digest) -> Result<(), String> {
        let inner = self.inner.clone();
        self
            .inner
            .executor
            .spawn_blocking(
                move || {
                    let key = versioned_key(digest.hash);
                    let mut txn = inner
                        .env
                        .begin_rw_txn()
                        .map_err(|e| format!("begin_rw_txn: {e}"))?;
                    write_lease(&mut txn, inner.leases_db, &key, inner.lease_time)?;
                    txn.commit().map_err(|e| format!("commit: {e}"))
                },
                |e| Err(format!("lease task failed: {e}")),
            )
            .await
    }

    /// Removes every blob whose lease has expired. A garbage-collect pass,
    /// distinct from the persistent store's node/job graph-collect pass.
    pub async fn collect_expired(&self) -> Result<usize, String> {
        let inner = self.inner.clone();
        self
            .inner
            .executor
            .spawn_blocking(
                move || {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap()
                        .as_secs();
                    let mut expired_keys = Vec::new();
                    {
                        let txn = inner.env.begin_ro_txn().map_err(|e| format!("begin_ro_txn: {e}"))?;
                        let mut cursor = txn
                            .open_ro_cursor(inner.leases_db)
                            .map_err(|e| format!("open_ro_cursor: {e}"))?;
                        for key_res in cursor.iter() {
                            let (key, value) =
                                key_res.map_err(|e| format!("advance lease cursor: {e}"))?;
                            let expires_at = u64::from_be_bytes(value.try_into().unwrap_or([0; 8]));
                            if expires_at < now {
                                expired_keys.push(key.to_vec());
                            }
                        }
                    }
                    let mut txn = inner.env.begin_rw_txn().map_err(|e| format!("begin_rw_txn: {e}"))?;
                    for key in &expired_keys {
                        let _ = txn.del(inner.content_db, key, None);
                        let _ = txn.del(inner.leases_db, key, None);
                    }
                    txn.commit().map_err(|e| format!("commit: {e}"))?;
                    trace!("collected {} expired store entries", expired_keys.len());
                    Ok(expired_keys.len())
                },
                |e| Err(format!("collect_expired task failed: {e}")),
            )
            .await
    }

    pub fn root(&self) -> PathBuf {
        self.inner.root.clone()
    }
}

fn write_lease(
    txn: &mut lmdb::RwTransaction,
    leases_db: lmdb::Database,
    key: &[u8],
    lease_time: Duration,
) -> Result<(), String> {
    let expires_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .checked_add(lease_time)
        .unwrap()
        .as_secs();
    txn.put(leases_db, &key, &expires_at.to_be_bytes(), WriteFlags::empty())
        .map_err(|e| format!("put lease: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> Executor {
        Executor::new()
    }

    #[tokio::test]
    async fn store_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), 16 * 1024 * 1024, executor()).unwrap();
        let digest = store.store_bytes(b"hello world".to_vec()).await.unwrap();
        let loaded = store.load_bytes(digest).await.unwrap().unwrap();
        assert_eq!(loaded, b"hello world");
    }

    #[tokio::test]
    async fn missing_digest_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), 16 * 1024 * 1024, executor()).unwrap();
        let missing = Digest::of_bytes(b"never stored");
        assert_eq!(store.load_bytes(missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn exists_reflects_store_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), 16 * 1024 * 1024, executor()).unwrap();
        let digest = Digest::of_bytes(b"abc");
        assert!(!store.exists(digest).await.unwrap());
        store.store_bytes(b"abc".to_vec()).await.unwrap();
        assert!(store.exists(digest).await.unwrap());
    }
}
