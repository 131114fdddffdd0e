//! `JobDigest` computation (§4.E point 6): for every file the job touched,
//! decide whether it's a target or a dep, then a `Crc` for it. Target CRCs
//! are computed in parallel across a bounded thread pool (§5 "a
//! bounded-size CRC thread pool inside the job-exec supervisor").

use std::fs as stdfs;
use std::io;
use std::path::{Path, PathBuf};

use async_semaphore::AsyncSemaphore;
use fs::RelativePath;
use hashing::Fingerprint;
use serde::{Deserialize, Serialize};
use task_executor::Executor;

use autodep::node_state::ContentState;
use autodep::report::Recorder;

use crate::rpc::{DepSpec, TargetSpec};

/// Each CRC computation acquires one slot of the pool, so the pool's total
/// weight equals its configured concurrency.
const CRC_SLOT_WEIGHT: usize = 1;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Crc {
    /// The file doesn't exist (was unlinked and never recreated).
    None,
    /// Reused from the node's previous fingerprint, uncomputed this run —
    /// used when the job failed or the target isn't marked for CRC.
    Tag(Fingerprint),
    /// Freshly hashed this run.
    Computed(Fingerprint),
    /// A dep that wasn't steady across the job's lifetime: its content at
    /// report time can't be trusted to match its content at job-end.
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetDigest {
    pub path: RelativePath,
    pub crc: Crc,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepDigest {
    pub path: RelativePath,
    pub crc: Crc,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDigest {
    pub targets: Vec<TargetDigest>,
    pub deps: Vec<DepDigest>,
    pub errors: Vec<String>,
}

fn lstat_content_state(path: &Path) -> ContentState {
    match stdfs::symlink_metadata(path) {
        Ok(metadata) => ContentState::from_lstat(true, metadata.file_type().is_symlink()),
        Err(_) => ContentState::from_lstat(false, false),
    }
}

fn hash_file(path: &Path) -> io::Result<Fingerprint> {
    let mut file = stdfs::File::open(path)?;
    let digest = hashing::sync_copy_and_hash(&mut file, &mut io::sink())?;
    Ok(digest.hash)
}

/// Computes one target's digest. `should_crc` gates the expensive content
/// hash; targets that fail it (job failed, or the rule says don't CRC this
/// target) fall back to the node's previously recorded tag.
async fn target_digest(executor: &Executor, crc_pool: &AsyncSemaphore, repo_root: &Path, spec: &TargetSpec, recorder: &Recorder, job_failed: bool, should_crc: bool) -> TargetDigest {
    let real = repo_root.join(spec.path.as_path());
    let report = recorder.get(&real);
    let was_unlinked = report.map(|r| r.unlink).unwrap_or(false);
    let was_written = report.map(|r| r.write).unwrap_or(false);

    let crc = if was_unlinked && !real.exists() {
        Crc::None
    } else if job_failed || !should_crc {
        match spec.previous_fingerprint {
            Some(fp) => Crc::Tag(fp),
            None => Crc::Unknown,
        }
    } else if was_written || real.exists() {
        let hash_target = real.clone();
        let permit = crc_pool.acquire(CRC_SLOT_WEIGHT).await;
        let computed = executor
            .spawn_blocking(
                move || hash_file(&hash_target).map_err(|e| e.to_string()),
                |e| Err(format!("CRC thread panicked: {e}")),
            )
            .await;
        drop(permit);
        match computed {
            Ok(fp) => Crc::Computed(fp),
            Err(_) => Crc::Unknown,
        }
    } else {
        Crc::None
    };

    TargetDigest {
        path: spec.path.clone(),
        crc,
    }
}

/// A dep's content is promoted from a date-based observation to a
/// content-based one only if its on-disk state at job-end still matches
/// the state `Recorder` captured at first access (§4.E point 6).
fn dep_digest(repo_root: &Path, spec: &DepSpec, recorder: &Recorder) -> DepDigest {
    let real = repo_root.join(spec.path.as_path());
    let report = recorder.get(&real);
    let pre_state = report.and_then(|r| r.pre_state);
    let post_state = lstat_content_state(&real);
    let steady = pre_state.map(|pre| pre == post_state).unwrap_or(false);

    let crc = if !steady {
        Crc::Unknown
    } else {
        match post_state {
            ContentState::Absent => Crc::None,
            ContentState::Regular | ContentState::Link => match hash_file(&real) {
                Ok(fp) => Crc::Computed(fp),
                Err(_) => spec.previous_fingerprint.map(Crc::Tag).unwrap_or(Crc::Unknown),
            },
            ContentState::Unknown => Crc::Unknown,
        }
    };

    DepDigest {
        path: spec.path.clone(),
        crc,
    }
}

pub struct DigestInputs<'a> {
    pub repo_root: &'a Path,
    pub targets: &'a [TargetSpec],
    pub deps: &'a [DepSpec],
    pub job_failed: bool,
}

pub async fn compute_job_digest(
    executor: &Executor,
    crc_pool: &AsyncSemaphore,
    inputs: DigestInputs<'_>,
    recorder: &Recorder,
    should_crc_target: impl Fn(&RelativePath) -> bool,
) -> JobDigest {
    let mut targets = Vec::with_capacity(inputs.targets.len());
    for spec in inputs.targets {
        let should_crc = should_crc_target(&spec.path);
        targets.push(target_digest(executor, crc_pool, inputs.repo_root, spec, recorder, inputs.job_failed, should_crc).await);
    }

    let deps = inputs.deps.iter().map(|spec| dep_digest(inputs.repo_root, spec, recorder)).collect();

    JobDigest {
        targets,
        deps,
        errors: Vec::new(),
    }
}

/// Recovers a digest-equivalent view without running the job, by replaying
/// a cached `JobDigest` verbatim — used by the cache-hit path (§4.J "the
/// engine still runs the pre-action wash and replays the digest as if a job
/// had run").
pub fn replay(cached: &JobDigest) -> JobDigest {
    cached.clone()
}

pub fn targets_as_paths(digest: &JobDigest) -> Vec<PathBuf> {
    digest.targets.iter().map(|t| t.path.as_path().to_path_buf()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodep::ops::{Operation, Outcome};
    use std::time::Instant;

    fn repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        (dir, root)
    }

    #[tokio::test]
    async fn unlinked_target_with_no_recreation_has_no_crc() {
        let (_dir, root) = repo();
        let target_path = RelativePath::new("out.o").unwrap();
        let real = root.join("out.o");
        std::fs::write(&real, b"x").unwrap();

        let mut recorder = Recorder::new();
        recorder.apply(&real, Operation::Unlink, ContentState::Regular, Instant::now(), Outcome::Confirmed);
        std::fs::remove_file(&real).unwrap();

        let spec = TargetSpec {
            path: target_path,
            static_target: true,
            incremental: false,
            previous_fingerprint: None,
        };
        let executor = Executor::new();
        let pool = AsyncSemaphore::new(2);
        let digest = target_digest(&executor, &pool, &root, &spec, &recorder, false, true).await;
        assert_eq!(digest.crc, Crc::None);
    }

    #[tokio::test]
    async fn failed_job_reuses_previous_tag_instead_of_hashing() {
        let (_dir, root) = repo();
        let real = root.join("out.o");
        std::fs::write(&real, b"stale content").unwrap();
        let prev = hashing::Digest::of_bytes(b"previous content").hash;

        let spec = TargetSpec {
            path: RelativePath::new("out.o").unwrap(),
            static_target: true,
            incremental: false,
            previous_fingerprint: Some(prev),
        };
        let executor = Executor::new();
        let pool = AsyncSemaphore::new(2);
        let digest = target_digest(&executor, &pool, &root, &spec, &Recorder::new(), true, true).await;
        assert_eq!(digest.crc, Crc::Tag(prev));
    }

    #[tokio::test]
    async fn written_target_gets_a_freshly_computed_crc() {
        let (_dir, root) = repo();
        let real = root.join("out.o");
        std::fs::write(&real, b"fresh content").unwrap();

        let spec = TargetSpec {
            path: RelativePath::new("out.o").unwrap(),
            static_target: true,
            incremental: false,
            previous_fingerprint: None,
        };
        let executor = Executor::new();
        let pool = AsyncSemaphore::new(2);
        let digest = target_digest(&executor, &pool, &root, &spec, &Recorder::new(), false, true).await;
        assert_eq!(digest.crc, Crc::Computed(hashing::Digest::of_bytes(b"fresh content").hash));
    }

    #[test]
    fn unsteady_dep_is_marked_unknown() {
        let (_dir, root) = repo();
        let real = root.join("in.c");
        std::fs::write(&real, b"v1").unwrap();

        let mut recorder = Recorder::new();
        recorder.apply(&real, Operation::Read, ContentState::Regular, Instant::now(), Outcome::Confirmed);
        std::fs::remove_file(&real).unwrap();

        let spec = DepSpec {
            path: RelativePath::new("in.c").unwrap(),
            critical: false,
            previous_fingerprint: None,
        };
        let digest = dep_digest(&root, &spec, &recorder);
        assert_eq!(digest.crc, Crc::Unknown);
    }

    #[test]
    fn steady_dep_is_promoted_to_a_content_fingerprint() {
        let (_dir, root) = repo();
        let real = root.join("in.c");
        std::fs::write(&real, b"v1").unwrap();

        let mut recorder = Recorder::new();
        recorder.apply(&real, Operation::Read, ContentState::Regular, Instant::now(), Outcome::Confirmed);

        let spec = DepSpec {
            path: RelativePath::new("in.c").unwrap(),
            critical: false,
            previous_fingerprint: None,
        };
        let digest = dep_digest(&root, &spec, &recorder);
        assert_eq!(digest.crc, Crc::Computed(hashing::Digest::of_bytes(b"v1").hash));
    }
}
