//! Pre-action target wash (§4.D): the ordered list of `FileAction`s applied
//! to a job's targets before its command runs, and the shared directory
//! counter that keeps concurrent jobs from `rmdir`-ing each other's target
//! directories out from under them.

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One step of the wash. Applied in order; see `apply_wash`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileAction {
    /// Remove the target. `warn_if_foreign` requests a warning (not an
    /// error) when the file wasn't produced by the job about to run;
    /// `quarantine_if_foreign` instead moves it aside rather than deleting
    /// it outright (§7 "Manual modification").
    Unlink {
        warn_if_foreign: bool,
        quarantine_if_foreign: bool,
    },
    /// Break hard links on the target so an in-place incremental write
    /// only ever mutates this job's private copy.
    Uniquify,
    Mkdir,
    /// Remove a directory left empty by earlier washes, unless it's
    /// currently protected (see `DirGuard`).
    Rmdir,
}

/// What the caller needs to know to decide whether a file was "produced by
/// someone else" for the `warn_if_foreign`/`quarantine_if_foreign` variants.
pub trait ProducerOracle {
    fn produced_by_this_job(&self, path: &Path) -> bool;
}

/// One wash step's outcome, reported back to the caller for logging /
/// error accumulation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WashOutcome {
    Unlinked,
    Quarantined(PathBuf),
    Uniquified,
    DirCreated,
    DirRemoved,
    DirProtectedSkipped,
    NoOp,
}

/// Guards directories that are currently "in use" by a running job's
/// targets, so a sibling job's `Rmdir` wash step never removes a directory
/// another job still needs (§4.D "Directories currently protected by
/// concurrent jobs are never removed; a shared dir counter guards them").
#[derive(Default)]
pub struct DirGuard {
    refcounts: Mutex<HashMap<PathBuf, u32>>,
}

impl DirGuard {
    pub fn new() -> DirGuard {
        DirGuard::default()
    }

    pub fn protect(&self, dir: &Path) {
        *self.refcounts.lock().unwrap().entry(dir.to_path_buf()).or_insert(0) += 1;
    }

    pub fn release(&self, dir: &Path) {
        let mut guard = self.refcounts.lock().unwrap();
        if let Some(count) = guard.get_mut(dir) {
            *count -= 1;
            if *count == 0 {
                guard.remove(dir);
            }
        }
    }

    pub fn is_protected(&self, dir: &Path) -> bool {
        self.refcounts.lock().unwrap().get(dir).copied().unwrap_or(0) > 0
    }
}

fn file_hard_link_count(metadata: &Metadata) -> u64 {
    metadata.nlink()
}

/// Applies one `FileAction` to `target`. Returns the outcome, or an error
/// string for anything that isn't the well-understood "foreign file, and
/// the policy says refuse" case (which is reported via `WashOutcome`, not
/// an `Err`, since it's expected user-facing behavior, not an engine bug).
pub fn apply_action(
    action: &FileAction,
    target: &Path,
    producer: &dyn ProducerOracle,
    dir_guard: &DirGuard,
) -> Result<WashOutcome, String> {
    match action {
        FileAction::Unlink {
            warn_if_foreign,
            quarantine_if_foreign,
        } => {
            if !target.exists() {
                return Ok(WashOutcome::NoOp);
            }
            let foreign = !producer.produced_by_this_job(target);
            if foreign && *quarantine_if_foreign {
                let quarantine_dir = target
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(".lmake_quarantine");
                std::fs::create_dir_all(&quarantine_dir).map_err(|e| format!("mkdir quarantine dir: {e}"))?;
                let dest = quarantine_dir.join(target.file_name().unwrap_or_default());
                std::fs::rename(target, &dest).map_err(|e| format!("quarantine {target:?}: {e}"))?;
                return Ok(WashOutcome::Quarantined(dest));
            }
            if foreign && *warn_if_foreign {
                log::warn!("unlinking {target:?}, which was not produced by the job about to run");
            }
            std::fs::remove_file(target).map_err(|e| format!("unlink {target:?}: {e}"))?;
            Ok(WashOutcome::Unlinked)
        }
        FileAction::Uniquify => {
            if !target.exists() {
                return Ok(WashOutcome::NoOp);
            }
            let metadata = std::fs::metadata(target).map_err(|e| format!("stat {target:?}: {e}"))?;
            if file_hard_link_count(&metadata) <= 1 {
                return Ok(WashOutcome::NoOp);
            }
            let tmp = target.with_extension("lmake_uniquify_tmp");
            std::fs::copy(target, &tmp).map_err(|e| format!("copy for uniquify {target:?}: {e}"))?;
            std::fs::rename(&tmp, target).map_err(|e| format!("rename uniquify {target:?}: {e}"))?;
            Ok(WashOutcome::Uniquified)
        }
        FileAction::Mkdir => {
            let dir = target.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir).map_err(|e| format!("mkdir {dir:?}: {e}"))?;
            dir_guard.protect(dir);
            Ok(WashOutcome::DirCreated)
        }
        FileAction::Rmdir => {
            let dir = target.parent().unwrap_or_else(|| Path::new("."));
            if dir_guard.is_protected(dir) {
                return Ok(WashOutcome::DirProtectedSkipped);
            }
            match std::fs::remove_dir(dir) {
                Ok(()) => Ok(WashOutcome::DirRemoved),
                Err(e) if e.kind() == std::io::ErrorKind::Other || e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                    Ok(WashOutcome::NoOp)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(WashOutcome::NoOp),
                Err(e) => Err(format!("rmdir {dir:?}: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysForeign;
    impl ProducerOracle for AlwaysForeign {
        fn produced_by_this_job(&self, _path: &Path) -> bool {
            false
        }
    }

    struct AlwaysOwn;
    impl ProducerOracle for AlwaysOwn {
        fn produced_by_this_job(&self, _path: &Path) -> bool {
            true
        }
    }

    #[test]
    fn unlink_missing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing");
        let guard = DirGuard::new();
        let outcome = apply_action(
            &FileAction::Unlink {
                warn_if_foreign: false,
                quarantine_if_foreign: false,
            },
            &target,
            &AlwaysOwn,
            &guard,
        )
        .unwrap();
        assert_eq!(outcome, WashOutcome::NoOp);
    }

    #[test]
    fn unlink_removes_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.out");
        std::fs::write(&target, b"x").unwrap();
        let guard = DirGuard::new();
        let outcome = apply_action(
            &FileAction::Unlink {
                warn_if_foreign: false,
                quarantine_if_foreign: false,
            },
            &target,
            &AlwaysOwn,
            &guard,
        )
        .unwrap();
        assert_eq!(outcome, WashOutcome::Unlinked);
        assert!(!target.exists());
    }

    #[test]
    fn foreign_file_is_quarantined_instead_of_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("manual.txt");
        std::fs::write(&target, b"hand-edited").unwrap();
        let guard = DirGuard::new();
        let outcome = apply_action(
            &FileAction::Unlink {
                warn_if_foreign: true,
                quarantine_if_foreign: true,
            },
            &target,
            &AlwaysForeign,
            &guard,
        )
        .unwrap();
        match outcome {
            WashOutcome::Quarantined(dest) => assert!(dest.exists()),
            other => panic!("expected Quarantined, got {other:?}"),
        }
        assert!(!target.exists());
    }

    #[test]
    fn protected_dir_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("out");
        std::fs::create_dir(&sub).unwrap();
        let guard = DirGuard::new();
        guard.protect(&sub);
        let outcome = apply_action(&FileAction::Rmdir, &sub.join("f"), &AlwaysOwn, &guard).unwrap();
        assert_eq!(outcome, WashOutcome::DirProtectedSkipped);
        assert!(sub.exists());
    }

    #[test]
    fn unprotected_empty_dir_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("out");
        std::fs::create_dir(&sub).unwrap();
        let guard = DirGuard::new();
        let outcome = apply_action(&FileAction::Rmdir, &sub.join("f"), &AlwaysOwn, &guard).unwrap();
        assert_eq!(outcome, WashOutcome::DirRemoved);
        assert!(!sub.exists());
    }

    #[test]
    fn dir_guard_refcounts_multiple_protectors() {
        let guard = DirGuard::new();
        let dir = PathBuf::from("/repo/build");
        guard.protect(&dir);
        guard.protect(&dir);
        guard.release(&dir);
        assert!(guard.is_protected(&dir));
        guard.release(&dir);
        assert!(!guard.is_protected(&dir));
    }
}
