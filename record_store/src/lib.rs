//! The persistent node/job graph (component A): mmapped, append-mostly
//! typed tables for `Node`, `Job`, `Rule`, plus the name index that maps a
//! target file name to its matching rules via [`rule_match::RuleMatchIndex`].
//!
//! As in `store` (see that crate's module doc and DESIGN.md), we get the
//! "mmapped, append-mostly" property from a single LMDB environment rather
//! than a bespoke log format: LMDB's B-tree pages are themselves mmapped,
//! writes are copy-on-write (never in-place mutation of a committed page),
//! and a crash leaves the last-committed transaction intact by construction
//! — so the `chk` consistency pass (§4.A) only has to worry about OS-level
//! torn writes, not a hand-rolled log's partial appends.

pub mod job;
pub mod node;
pub mod rule;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lmdb::{Cursor, Environment, EnvironmentFlags, Transaction, WriteFlags};
use log::{info, warn};
use rule_match::{CompiledTarget, RuleMatchIndex};
use task_executor::Executor;

pub use job::{Dep, DepWitness, Job, LastRunStatus, RunStatus, TargetRef};
pub use node::{Buildability, ContentFingerprint, Node, NodeFlags};
pub use rule::{Dflags, Resources, Rule, Tflags};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u32);

use serde::{Deserialize, Serialize};

fn id_key(id: u32) -> [u8; 4] {
    id.to_be_bytes()
}

/// The persistent store. Cheap to clone: everything that matters is behind
/// an `Arc`, matching `store::LocalStore`'s shape.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<Inner>,
}

struct Inner {
    env: Environment,
    name_db: lmdb::Database,
    node_db: lmdb::Database,
    job_db: lmdb::Database,
    rule_db: lmdb::Database,
    meta_db: lmdb::Database,
    executor: Executor,
    /// In-memory mirror of the persisted `match_gen` counter (§3 invariant).
    /// Bumping this is O(1); nodes lazily notice they're stale next time
    /// they're looked up (§4.B/§4.F), rather than this store eagerly
    /// walking every node.
    match_gen: AtomicU64,
    next_node_id: AtomicU64,
    next_job_id: AtomicU64,
    next_rule_id: AtomicU64,
    root: PathBuf,
}

const META_MATCH_GEN: &[u8] = b"match_gen";
const META_CRASH_MARKER: &[u8] = b"crash_marker";
const META_NEXT_NODE: &[u8] = b"next_node_id";
const META_NEXT_JOB: &[u8] = b"next_job_id";
const META_NEXT_RULE: &[u8] = b"next_rule_id";

impl RecordStore {
    pub fn open(root: &Path, max_size_bytes: usize, executor: Executor) -> Result<RecordStore, String> {
        std::fs::create_dir_all(root).map_err(|e| format!("could not create store dir: {e}"))?;
        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_SYNC | EnvironmentFlags::NO_TLS)
            .set_max_dbs(8)
            .set_map_size(max_size_bytes)
            .open(root)
            .map_err(|e| format!("error opening record store environment at {root:?}: {e}"))?;
        let name_db = open_db(&env, "name")?;
        let node_db = open_db(&env, "node")?;
        let job_db = open_db(&env, "job")?;
        let rule_db = open_db(&env, "rule")?;
        let meta_db = open_db(&env, "meta")?;

        let crashed = read_meta_u64(&env, meta_db, META_CRASH_MARKER)?.unwrap_or(0) != 0;
        let mut match_gen = read_meta_u64(&env, meta_db, META_MATCH_GEN)?.unwrap_or(0);
        if crashed {
            warn!("record store was not closed cleanly; running consistency check");
            let dropped = chk(&env, node_db, job_db, rule_db)?;
            if dropped > 0 {
                warn!("chk dropped {dropped} truncated record(s)");
            }
            // Per §4.A: "bump match_gen to the max so that all cached match
            // info is invalidated before anything is trusted".
            match_gen += 1;
            write_meta_u64(&env, meta_db, META_MATCH_GEN, match_gen)?;
        }
        write_meta_u64(&env, meta_db, META_CRASH_MARKER, 1)?;

        let next_node_id = read_meta_u64(&env, meta_db, META_NEXT_NODE)?.unwrap_or(0);
        let next_job_id = read_meta_u64(&env, meta_db, META_NEXT_JOB)?.unwrap_or(0);
        let next_rule_id = read_meta_u64(&env, meta_db, META_NEXT_RULE)?.unwrap_or(0);

        Ok(RecordStore {
            inner: Arc::new(Inner {
                env,
                name_db,
                node_db,
                job_db,
                rule_db,
                meta_db,
                executor,
                match_gen: AtomicU64::new(match_gen),
                next_node_id: AtomicU64::new(next_node_id),
                next_job_id: AtomicU64::new(next_job_id),
                next_rule_id: AtomicU64::new(next_rule_id),
                root: root.to_path_buf(),
            }),
        })
    }

    /// Marks the store as cleanly closed, so the next `open` doesn't run
    /// `chk` or bump `match_gen` unnecessarily. Callers (the engine loop's
    /// shutdown path) must call this before the process exits normally.
    pub fn close_cleanly(&self) -> Result<(), String> {
        write_meta_u64(&self.inner.env, self.inner.meta_db, META_CRASH_MARKER, 0)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn match_gen(&self) -> u64 {
        self.inner.match_gen.load(Ordering::SeqCst)
    }

    /// Cheaply invalidates every node's cached rule-match info in O(1) work
    /// (§3 invariant, §4.A "Source set" rule). Called whenever the rule set
    /// or the source-ness of some node changes.
    pub fn bump_match_gen(&self) -> u64 {
        let new_gen = self.inner.match_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = write_meta_u64(&self.inner.env, self.inner.meta_db, META_MATCH_GEN, new_gen);
        new_gen
    }

    fn alloc_node_id(&self) -> NodeId {
        let id = self.inner.next_node_id.fetch_add(1, Ordering::SeqCst);
        let _ = write_meta_u64(&self.inner.env, self.inner.meta_db, META_NEXT_NODE, id + 1);
        NodeId(id as u32)
    }

    fn alloc_job_id(&self) -> JobId {
        let id = self.inner.next_job_id.fetch_add(1, Ordering::SeqCst);
        let _ = write_meta_u64(&self.inner.env, self.inner.meta_db, META_NEXT_JOB, id + 1);
        JobId(id as u32)
    }

    fn alloc_rule_id(&self) -> RuleId {
        let id = self.inner.next_rule_id.fetch_add(1, Ordering::SeqCst);
        let _ = write_meta_u64(&self.inner.env, self.inner.meta_db, META_NEXT_RULE, id + 1);
        RuleId(id as u32)
    }

    /// Looks up a node by name, creating it lazily (§3 "Nodes are created
    /// lazily on first mention").
    pub fn get_or_create_node(&self, name: &fs::RelativePath) -> Result<NodeId, String> {
        let key = name.to_str().ok_or("non-utf8 path")?.as_bytes();
        {
            let txn = self.inner.env.begin_ro_txn().map_err(|e| format!("{e}"))?;
            if let Ok(bytes) = txn.get(self.inner.name_db, &key) {
                return Ok(NodeId(u32::from_be_bytes(bytes.try_into().unwrap())));
            }
        }
        let id = self.alloc_node_id();
        let node = Node::new_plain(name.clone());
        let mut txn = self.inner.env.begin_rw_txn().map_err(|e| format!("{e}"))?;
        txn.put(self.inner.name_db, &key, &id.0.to_be_bytes(), WriteFlags::empty())
            .map_err(|e| format!("{e}"))?;
        put_json(&mut txn, self.inner.node_db, &id_key(id.0), &node)?;
        txn.commit().map_err(|e| format!("{e}"))?;
        Ok(id)
    }

    pub fn get_node(&self, id: NodeId) -> Result<Option<Node>, String> {
        let txn = self.inner.env.begin_ro_txn().map_err(|e| format!("{e}"))?;
        get_json(&txn, self.inner.node_db, &id_key(id.0))
    }

    pub fn put_node(&self, id: NodeId, node: &Node) -> Result<(), String> {
        let mut txn = self.inner.env.begin_rw_txn().map_err(|e| format!("{e}"))?;
        put_json(&mut txn, self.inner.node_db, &id_key(id.0), node)?;
        txn.commit().map_err(|e| format!("{e}"))
    }

    pub fn create_job(&self, job: &Job) -> Result<JobId, String> {
        let id = self.alloc_job_id();
        let mut txn = self.inner.env.begin_rw_txn().map_err(|e| format!("{e}"))?;
        put_json(&mut txn, self.inner.job_db, &id_key(id.0), job)?;
        txn.commit().map_err(|e| format!("{e}"))?;
        Ok(id)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>, String> {
        let txn = self.inner.env.begin_ro_txn().map_err(|e| format!("{e}"))?;
        get_json(&txn, self.inner.job_db, &id_key(id.0))
    }

    pub fn put_job(&self, id: JobId, job: &Job) -> Result<(), String> {
        let mut txn = self.inner.env.begin_rw_txn().map_err(|e| format!("{e}"))?;
        put_json(&mut txn, self.inner.job_db, &id_key(id.0), job)?;
        txn.commit().map_err(|e| format!("{e}"))
    }

    /// Stores (or replaces, by content fingerprint) a rule. Per §4.A "Rule
    /// storage": lookup by match fingerprint decides whether an incoming
    /// rule replaces an existing slot or creates a new one.
    pub fn put_rule(&self, existing: Option<RuleId>, rule: &Rule) -> Result<RuleId, String> {
        let id = existing.unwrap_or_else(|| self.alloc_rule_id());
        let mut txn = self.inner.env.begin_rw_txn().map_err(|e| format!("{e}"))?;
        put_json(&mut txn, self.inner.rule_db, &id_key(id.0), rule)?;
        txn.commit().map_err(|e| format!("{e}"))?;
        Ok(id)
    }

    pub fn get_rule(&self, id: RuleId) -> Result<Option<Rule>, String> {
        let txn = self.inner.env.begin_ro_txn().map_err(|e| format!("{e}"))?;
        get_json(&txn, self.inner.rule_db, &id_key(id.0))
    }

    pub fn all_rules(&self) -> Result<Vec<(RuleId, Rule)>, String> {
        let txn = self.inner.env.begin_ro_txn().map_err(|e| format!("{e}"))?;
        let mut cursor = txn.open_ro_cursor(self.inner.rule_db).map_err(|e| format!("{e}"))?;
        let mut out = Vec::new();
        for entry in cursor.iter() {
            let (key, value) = entry.map_err(|e| format!("{e}"))?;
            let id = RuleId(u32::from_be_bytes(key.try_into().unwrap()));
            let rule: Rule = serde_json::from_slice(value).map_err(|e| format!("corrupt rule record: {e}"))?;
            out.push((id, rule));
        }
        Ok(out)
    }

    /// Rebuilds the suffix/prefix match index from every persisted rule's
    /// target patterns (component B, §4.B: "built once per rule-set
    /// change"). Callers bump `match_gen` alongside this whenever the rule
    /// set changes, per the §3 invariant.
    pub fn rebuild_rule_index(&self) -> Result<RuleMatchIndex, String> {
        let rules = self.all_rules()?;
        let mut entries = Vec::new();
        for (rule_id, rule) in &rules {
            for (target_index, pattern) in rule.target_patterns.iter().enumerate() {
                entries.push(CompiledTarget::from_pattern(
                    rule_id.0,
                    rule.name.clone(),
                    target_index as u32,
                    pattern,
                    rule.is_special,
                    rule.special_rank,
                    rule.is_anti,
                    rule.priority,
                ));
            }
        }
        info!("compiled rule match index from {} rule(s)", rules.len());
        Ok(RuleMatchIndex::build(entries))
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }
}

fn open_db(env: &Environment, name: &str) -> Result<lmdb::Database, String> {
    env.create_db(Some(name), lmdb::DatabaseFlags::empty())
        .map_err(|e| format!("error opening {name} db: {e}"))
}

fn read_meta_u64(env: &Environment, db: lmdb::Database, key: &[u8]) -> Result<Option<u64>, String> {
    let txn = env.begin_ro_txn().map_err(|e| format!("{e}"))?;
    match txn.get(db, &key) {
        Ok(bytes) => Ok(Some(u64::from_be_bytes(bytes.try_into().map_err(|_| "corrupt meta value")?))),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(format!("{e}")),
    }
}

fn write_meta_u64(env: &Environment, db: lmdb::Database, key: &[u8], value: u64) -> Result<(), String> {
    let mut txn = env.begin_rw_txn().map_err(|e| format!("{e}"))?;
    txn.put(db, &key, &value.to_be_bytes(), WriteFlags::empty())
        .map_err(|e| format!("{e}"))?;
    txn.commit().map_err(|e| format!("{e}"))
}

fn put_json<T: Serialize>(
    txn: &mut lmdb::RwTransaction,
    db: lmdb::Database,
    key: &[u8],
    value: &T,
) -> Result<(), String> {
    let bytes = serde_json::to_vec(value).map_err(|e| format!("serialize: {e}"))?;
    txn.put(db, &key, &bytes, WriteFlags::empty()).map_err(|e| format!("put: {e}"))
}

fn get_json<T: for<'de> Deserialize<'de>>(
    txn: &lmdb::RoTransaction,
    db: lmdb::Database,
    key: &[u8],
) -> Result<Option<T>, String> {
    match txn.get(db, &key) {
        Ok(bytes) => {
            let value = serde_json::from_slice(bytes).map_err(|e| format!("corrupt record: {e}"))?;
            Ok(Some(value))
        }
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(format!("{e}")),
    }
}

/// Walks every typed table and drops any record whose value fails to
/// deserialize (a torn write truncated mid-record by a crash mid-commit is
/// the only way this can happen under LMDB, since partial transactions are
/// never visible, but a page written during a hard power loss on a
/// non-journaled filesystem is not outside what "crash-safe enough for
/// rescue-on-startup" promises). Returns the number of records dropped.
fn chk(
    env: &Environment,
    node_db: lmdb::Database,
    job_db: lmdb::Database,
    rule_db: lmdb::Database,
) -> Result<usize, String> {
    let mut dropped = 0;
    for db in [node_db, job_db, rule_db] {
        let bad_keys = {
            let txn = env.begin_ro_txn().map_err(|e| format!("{e}"))?;
            let mut cursor = txn.open_ro_cursor(db).map_err(|e| format!("{e}"))?;
            let mut bad = Vec::new();
            for entry in cursor.iter() {
                let (key, value) = entry.map_err(|e| format!("{e}"))?;
                if serde_json::from_slice::<serde_json::Value>(value).is_err() {
                    bad.push(key.to_vec());
                }
            }
            bad
        };
        if !bad_keys.is_empty() {
            let mut txn = env.begin_rw_txn().map_err(|e| format!("{e}"))?;
            for key in &bad_keys {
                let _ = txn.del(db, key, None);
            }
            txn.commit().map_err(|e| format!("{e}"))?;
            dropped += bad_keys.len();
        }
    }
    Ok(dropped)
}
