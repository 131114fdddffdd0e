//! Local sub-backend of component G (SPEC_FULL §4.G): turns a job the make
//! state machine (component F) decided must run into an actual
//! `process_exec::run_job` invocation on this machine, gated by the named
//! resource pools (`ResourcePools`, §4.G) and a small-id pool that doubles
//! as the pure concurrency throttle `Config::local_jobs_cap` names.
//!
//! A real deployment runs job-exec (§4.E) in a supervisor process the
//! engine talks RPC to; this backend instead calls `process_exec::run_job`
//! in-process. There is no other machine to cross an IPC boundary to for a
//! single-host engine, only the sandbox and tracer seams `process_exec`
//! already defines — recorded in DESIGN.md as this backend's resolution of
//! the local-vs-RPC Open Question.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_semaphore::AsyncSemaphore;
use async_trait::async_trait;
use autodep::report::Recorder;
use autodep::tracer::{tracer_for, Tracer, TracerConfig};
use autodep::AutodepEnv;
use fs::RelativePath;
use hashing::{Digest, Fingerprint};
use parking_lot::Mutex;
use process_exec::{Crc, DepSpec, JobDigest, StartReply, TargetSpec};
use record_store::{ContentFingerprint, Job, JobId, LastRunStatus, NodeId, RunStatus};
use sandbox::{MountPlan, Sandbox, View};
use store::cache::{Cache, CacheKey};
use task_executor::Executor;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use workunit_store::{JobCost, Metric, WorkunitStore};

use crate::config::Config;
use crate::graph::Graph;
use crate::make::{JobRunResult, JobRunner};

/// Free-list of small-ids `0..cap` gated by a semaphore of the same size, so
/// "a small-id is available" and "a concurrency slot is available" are the
/// same fact (§4.G+ "pure concurrency throttle independent of resource
/// pools", glossary "Small-id").
struct SmallIdPool {
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<u32>>>,
}

impl SmallIdPool {
    fn new(cap: usize) -> SmallIdPool {
        SmallIdPool {
            semaphore: Arc::new(Semaphore::new(cap)),
            free: Arc::new(Mutex::new((0..cap as u32).rev().collect())),
        }
    }

    async fn acquire(&self) -> SmallIdGuard {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        let id = self
            .free
            .lock()
            .pop()
            .expect("a free id exists for every held permit");
        SmallIdGuard {
            id,
            free: Arc::clone(&self.free),
            _permit: permit,
        }
    }
}

/// RAII small-id. The id is pushed back onto the free-list before `_permit`
/// is dropped (field drop order follows declaration order in `Drop::drop`,
/// then field declaration order for the rest), so a task woken by the
/// semaphore never finds the free-list still empty — a `Notify`-based
/// handoff would have to get that ordering right by hand instead of getting
/// it for free from drop order.
struct SmallIdGuard {
    id: u32,
    free: Arc<Mutex<Vec<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SmallIdGuard {
    fn drop(&mut self) {
        self.free.lock().push(self.id);
    }
}

pub struct LocalBackend {
    repo_root: PathBuf,
    admin_dir: PathBuf,
    config: Config,
    executor: Executor,
    pools: super::ResourcePools,
    small_ids: SmallIdPool,
    crc_pool: AsyncSemaphore,
    store: Option<store::LocalStore>,
    cache: Option<Cache>,
    workunits: Arc<WorkunitStore>,
    tracer: Box<dyn Tracer + Send + Sync>,
}

impl LocalBackend {
    pub fn new(repo_root: PathBuf, config: Config, executor: Executor, workunits: Arc<WorkunitStore>) -> Result<LocalBackend, String> {
        let admin_dir = repo_root.join(&config.admin_dir);
        let (store, cache) = if config.cache_enabled {
            let store = store::LocalStore::open(&admin_dir.join("store"), config.store_map_size_bytes, executor.to_borrowed())?;
            let cache = Cache::new(store.clone());
            (Some(store), Some(cache))
        } else {
            (None, None)
        };
        let pools = super::ResourcePools::new(&config.default_resources);
        let small_ids = SmallIdPool::new(config.local_jobs_cap.max(1));
        let crc_pool = AsyncSemaphore::new(config.local_jobs_cap.max(1));
        let tracer = tracer_for(config.autodep_method);
        Ok(LocalBackend {
            repo_root,
            admin_dir,
            config,
            executor,
            pools,
            small_ids,
            crc_pool,
            store,
            cache,
            workunits,
            tracer,
        })
    }

    /// The mount plan for one job's sandbox. `build_scratch_root` only makes
    /// declared views visible to the job when a chroot source is set (the
    /// chroot source itself is always bind-mounted read-only); without one,
    /// views land in a scratch subtree nothing ever `chroot`s into. So this
    /// backend only chroots when `Config::sandbox.chroot_dir` is configured,
    /// layering a writable view over the job's private tmp there, and runs
    /// unsandboxed (against the real root) otherwise — a deliberate
    /// simplification recorded in DESIGN.md, not a bug in `sandbox`.
    fn mount_plan(&self, scratch_tmp: &Path) -> MountPlan {
        match &self.config.sandbox.chroot_dir {
            Some(chroot_dir) => MountPlan {
                chroot_source: Some(chroot_dir.clone()),
                views: vec![View::bind("/tmp", scratch_tmp, false)],
                cwd: PathBuf::from("/"),
            },
            None => MountPlan {
                chroot_source: None,
                views: Vec::new(),
                cwd: self.repo_root.clone(),
            },
        }
    }

    /// Restores a cache hit's targets from the artifact store and reports a
    /// clean, instantaneous run (§4.J "the engine still runs the pre-action
    /// wash and replays the digest as if a job had run"). A `Crc::Computed`
    /// fingerprint doubles as the artifact's store key — `hashing::Digest`'s
    /// key derivation only consumes the hash half, so no separate path ->
    /// blob index needs to survive the round trip through `Cache`.
    async fn finish_from_digest(&self, graph: &Graph, job: &Job, digest: JobDigest) -> Result<JobRunResult, String> {
        let replayed = process_exec::replay(&digest);
        if let Some(store) = &self.store {
            for target in &replayed.targets {
                let real = self.repo_root.join(target.path.as_path());
                match &target.crc {
                    Crc::Computed(fingerprint) => {
                        if let Some(bytes) = store.load_bytes(Digest::new(*fingerprint, 0)).await? {
                            if let Some(parent) = real.parent() {
                                tokio::fs::create_dir_all(parent)
                                    .await
                                    .map_err(|e| format!("mkdir {parent:?}: {e}"))?;
                            }
                            tokio::fs::write(&real, bytes).await.map_err(|e| format!("write {real:?}: {e}"))?;
                        }
                    }
                    Crc::None => {
                        let _ = tokio::fs::remove_file(&real).await;
                    }
                    Crc::Tag(_) | Crc::Unknown => {}
                }
            }
        }
        let written = written_from_digest(graph, &replayed)?;
        self.workunits.increment_counter(Metric::JobsHit, 1);
        Ok(JobRunResult {
            status: LastRunStatus::Ok,
            run_status: RunStatus::Ok,
            written,
            from_cache: true,
        })
    }
}

#[async_trait]
impl JobRunner for LocalBackend {
    async fn run(&self, graph: &Graph, job_id: JobId, job: &Job) -> Result<JobRunResult, String> {
        self.workunits.increment_counter(Metric::LocalExecutionRequests, 1);
        let rule = graph.rule(job.rule)?.ok_or("job's rule was collected")?;

        let cache_key = CacheKey {
            cmd_fingerprint: rule.cmd_fingerprint(),
            deps_fingerprint: deps_fingerprint(graph, job)?,
            targets_fingerprint: targets_fingerprint(graph, job)?,
        };

        if rule.cacheable {
            if let Some(cache) = &self.cache {
                if let Some((digest, _artifacts)) = cache.get::<JobDigest>(cache_key).await? {
                    self.workunits.increment_counter(Metric::CacheHits, 1);
                    return self.finish_from_digest(graph, job, digest).await;
                }
                self.workunits.increment_counter(Metric::CacheMisses, 1);
            }
        }

        let _resource_permits = self.pools.acquire(&rule.resources).await;
        let small_id_guard = self.small_ids.acquire().await;

        let scratch_root = self.admin_dir.join("tmp").join(format!("job-{}-{}", job_id.0, small_id_guard.id));
        let plan = self.mount_plan(&scratch_root);
        let sandbox = Sandbox::new(scratch_root.clone(), plan, small_id_guard.id);

        let mut targets = Vec::with_capacity(job.declared_targets.len());
        for &node_id in &job.declared_targets {
            let node = graph.node(node_id)?.ok_or("target node vanished")?;
            targets.push(TargetSpec {
                path: node.name.clone(),
                static_target: true,
                incremental: rule.default_tflags.incremental,
                previous_fingerprint: fingerprint_tag(&node.fingerprint),
            });
        }

        let dep_node_ids = dep_nodes_of(job);
        let mut deps = Vec::with_capacity(dep_node_ids.len());
        let mut source_paths = HashSet::new();
        for node_id in &dep_node_ids {
            let node = graph.node(*node_id)?.ok_or("dep node vanished")?;
            if node.flags.is_source {
                source_paths.insert(self.repo_root.join(node.name.as_path()));
            }
            deps.push(DepSpec {
                path: node.name.clone(),
                critical: false,
                previous_fingerprint: fingerprint_tag(&node.fingerprint),
            });
        }

        let report_socket = scratch_root.join("autodep.sock");
        let autodep_env = AutodepEnv {
            repo_root: self.repo_root.clone(),
            src_dirs: Vec::new(),
            admin_dir: self.admin_dir.clone(),
            tmp_physical: Some(scratch_root.join("tmp")),
            tmp_view: Some(PathBuf::from("tmp")),
            report_socket: report_socket.clone(),
            simple_dirs: Vec::new(),
        };

        let reply = StartReply {
            argv: argv_for(&rule),
            env: BTreeMap::new(),
            autodep_env,
            sandbox_plan: sandbox.plan.clone(),
            targets,
            deps,
            stdin_path: None,
            stdout_path: None,
            timeout: rule.timeout,
            small_id: small_id_guard.id,
            cache_key: rule.cacheable.then(|| cache_key.to_display_string()),
        };

        let tracer_config = TracerConfig {
            method: self.config.autodep_method,
            shim_path: self.config.autodep_shim_path.clone(),
            report_socket,
        };

        // No access-report-socket receiver is wired up here: the LD_PRELOAD
        // shim's wire format has nothing listening on `report_socket`, and
        // `autodep::tracer`'s own doc marks the ptrace syscall decode as a
        // stub seam. `compute_job_digest` still produces a correct digest
        // from what's on disk after the run; deps just stay `Unknown`
        // rather than getting promoted from a date witness to a content
        // one. Documented as a scope limitation in DESIGN.md.
        let recorder = Recorder::new();
        let crc_targets = rule.default_tflags.crc;
        let should_crc_target = move |_: &RelativePath| crc_targets;
        let is_source = move |path: &Path| source_paths.contains(path);

        let outcome = process_exec::run_job(
            &self.executor,
            &self.crc_pool,
            &self.repo_root,
            &reply,
            &sandbox,
            self.tracer.as_ref(),
            &tracer_config,
            &recorder,
            is_source,
            should_crc_target,
            |_bytes| {},
        )
        .await?;

        let job_ok = outcome.exit_code == 0 && outcome.digest.errors.is_empty();
        let status = if job_ok { LastRunStatus::Ok } else { LastRunStatus::Err };
        let run_status = if job_ok { RunStatus::Ok } else { RunStatus::Err };

        if job_ok && rule.cacheable {
            if let Some((store, cache)) = self.store.as_ref().zip(self.cache.as_ref()) {
                let mut artifacts = Vec::new();
                for target in &outcome.digest.targets {
                    if let Crc::Computed(_) = target.crc {
                        let real = self.repo_root.join(target.path.as_path());
                        if let Ok(bytes) = tokio::fs::read(&real).await {
                            artifacts.push(store.store_bytes(bytes).await?);
                        }
                    }
                }
                cache.put(cache_key, &outcome.digest, artifacts).await?;
            }
        }

        self.workunits.record_job_cost(
            &rule.name,
            JobCost {
                user_cpu: Duration::from_secs_f64(outcome.stats.user_cpu_secs),
                wall_clock: Duration::from_secs_f64(outcome.stats.wall_secs),
                max_rss_bytes: outcome.stats.max_rss_kb * 1024,
            },
        );
        self
            .workunits
            .increment_counter(if job_ok { Metric::JobsDone } else { Metric::JobsFailed }, 1);

        let written = written_from_digest(graph, &outcome.digest)?;
        Ok(JobRunResult {
            status,
            run_status,
            written,
            from_cache: false,
        })
    }
}

trait CacheKeyDisplay {
    fn to_display_string(&self) -> String;
}

impl CacheKeyDisplay for CacheKey {
    /// Informational wire value only (`StartReply::cache_key`); the engine
    /// itself re-derives the real key from `rule`/`graph` rather than
    /// parsing this back.
    fn to_display_string(&self) -> String {
        format!(
            "{}-{}-{}",
            self.cmd_fingerprint.to_hex(),
            self.deps_fingerprint.to_hex(),
            self.targets_fingerprint.to_hex()
        )
    }
}

fn dep_nodes_of(job: &Job) -> Vec<NodeId> {
    if job.deps.is_empty() {
        job.static_dep_nodes.clone()
    } else {
        job.deps.iter().map(|dep| dep.node).collect()
    }
}

fn fingerprint_tag(fp: &ContentFingerprint) -> Option<Fingerprint> {
    match fp {
        ContentFingerprint::Regular(f) | ContentFingerprint::Link(f) => Some(*f),
        ContentFingerprint::None | ContentFingerprint::Unknown => None,
    }
}

/// `/bin/sh -c <cmd>`: rules are shell command lines (spec §1), not argv
/// vectors, the same way the original's job commands are shell text.
fn argv_for(rule: &record_store::Rule) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), rule.cmd.clone()]
}

fn push_tagged_fingerprint(buf: &mut Vec<u8>, fp: &ContentFingerprint) {
    match fp {
        ContentFingerprint::None => buf.push(0),
        ContentFingerprint::Regular(f) => {
            buf.push(1);
            buf.extend_from_slice(f.as_bytes());
        }
        ContentFingerprint::Link(f) => {
            buf.push(2);
            buf.extend_from_slice(f.as_bytes());
        }
        ContentFingerprint::Unknown => buf.push(3),
    }
}

/// Hashes the declared target set's node names into the cache key's
/// `targets_fingerprint` component.
fn targets_fingerprint(graph: &Graph, job: &Job) -> Result<Fingerprint, String> {
    let mut buf = Vec::new();
    for &node_id in &job.declared_targets {
        let node = graph.node(node_id)?.ok_or("target node vanished")?;
        if let Some(name) = node.name.to_str() {
            buf.extend_from_slice(name.as_bytes());
        }
        buf.push(0);
    }
    Ok(Digest::of_bytes(&buf).hash)
}

/// Hashes the resolved dep set's names and cached content fingerprints into
/// the cache key's `deps_fingerprint` component — two jobs whose deps
/// resolved to the same names but different content must miss each other.
fn deps_fingerprint(graph: &Graph, job: &Job) -> Result<Fingerprint, String> {
    let mut buf = Vec::new();
    for node_id in dep_nodes_of(job) {
        let node = graph.node(node_id)?.ok_or("dep node vanished")?;
        if let Some(name) = node.name.to_str() {
            buf.extend_from_slice(name.as_bytes());
        }
        buf.push(0);
        push_tagged_fingerprint(&mut buf, &node.fingerprint);
    }
    Ok(Digest::of_bytes(&buf).hash)
}

fn written_from_digest(graph: &Graph, digest: &JobDigest) -> Result<Vec<(NodeId, ContentFingerprint)>, String> {
    let mut out = Vec::with_capacity(digest.targets.len());
    for target in &digest.targets {
        let node_id = graph.get_or_create_node(&target.path)?;
        let fingerprint = match &target.crc {
            Crc::None => ContentFingerprint::None,
            Crc::Tag(fp) | Crc::Computed(fp) => ContentFingerprint::Regular(*fp),
            Crc::Unknown => ContentFingerprint::Unknown,
        };
        out.push((node_id, fingerprint));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_id_pool_reuses_ids_after_release() {
        let pool = SmallIdPool::new(2);
        let first = pool.acquire().await;
        let id = first.id;
        drop(first);
        let second = pool.acquire().await;
        assert_eq!(second.id, id);
    }

    #[tokio::test]
    async fn small_id_pool_hands_out_distinct_ids_concurrently() {
        let pool = SmallIdPool::new(2);
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn argv_wraps_cmd_in_a_shell() {
        let mut rule = sample_rule();
        rule.cmd = "cc -c foo.c".to_string();
        assert_eq!(argv_for(&rule), vec!["/bin/sh", "-c", "cc -c foo.c"]);
    }

    #[test]
    fn fingerprint_tag_is_none_for_absent_or_unknown() {
        assert_eq!(fingerprint_tag(&ContentFingerprint::None), None);
        assert_eq!(fingerprint_tag(&ContentFingerprint::Unknown), None);
        assert_eq!(
            fingerprint_tag(&ContentFingerprint::Regular(hashing::EMPTY_FINGERPRINT)),
            Some(hashing::EMPTY_FINGERPRINT)
        );
    }

    fn sample_rule() -> record_store::Rule {
        record_store::Rule {
            name: "compile".to_string(),
            target_patterns: vec!["build/*.o".to_string()],
            static_dep_patterns: vec!["src/*.c".to_string()],
            cmd: "cc -c".to_string(),
            resources: record_store::Resources::new(),
            default_tflags: record_store::Tflags::default(),
            default_dflags: record_store::Dflags::default(),
            priority: 0,
            is_special: false,
            special_rank: 0,
            is_anti: false,
            timeout: None,
            n_retries: 0,
            cacheable: true,
            frozen: false,
            cmd_gen: 0,
            rsrcs_gen: 0,
        }
    }
}
