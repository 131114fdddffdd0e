//! Job sandbox (component D, spec §4.D): assembles the namespace + mount
//! tree a job's command runs inside, washes its targets beforehand, and
//! tears the scratch tree back down once the job ends.
//!
//! Assembly order matches §4.D's five points: enter namespaces, build the
//! scratch root from a declared chroot source, mount the declared views,
//! `chroot`+`chdir`, then (inside the child, after `fork`+`exec` is handed
//! off to `process_exec`) the job's own pid-offset is derived from its
//! small-id for private-tmp naming.

pub mod namespaces;
pub mod small_id;
pub mod views;
pub mod wash;

use std::path::{Path, PathBuf};

pub use namespaces::{build_scratch_root, chroot_and_chdir, enter_namespaces, teardown_scratch_root};
pub use small_id::pid_offset;
pub use views::{MountPlan, View, ViewKind};
pub use wash::{apply_action, DirGuard, FileAction, ProducerOracle, WashOutcome};

/// One job's sandbox: where its scratch root lives on the host, and the
/// mount plan describing what's visible inside.
pub struct Sandbox {
    pub scratch_root: PathBuf,
    pub plan: MountPlan,
    pub small_id: u32,
    dir_guard: DirGuard,
}

impl Sandbox {
    pub fn new(scratch_root: impl Into<PathBuf>, plan: MountPlan, small_id: u32) -> Sandbox {
        Sandbox {
            scratch_root: scratch_root.into(),
            plan,
            small_id,
            dir_guard: DirGuard::new(),
        }
    }

    /// The offset this sandbox's job should add to its private tmp
    /// filenames, so concurrent jobs with nearby small-ids don't collide
    /// (§4.D point 5).
    pub fn tmp_pid_offset(&self) -> u32 {
        pid_offset(self.small_id)
    }

    /// Runs the ordered target wash (§4.D) before the job's command starts.
    /// `targets` pairs each target path with the actions to apply to it, in
    /// order; a `Mkdir` action protects its directory in `self.dir_guard`
    /// for the lifetime of the sandbox so a sibling job's `Rmdir` can't race
    /// it out from under this job.
    pub fn wash_targets(
        &self,
        targets: &[(PathBuf, Vec<FileAction>)],
        producer: &dyn ProducerOracle,
    ) -> Result<Vec<WashOutcome>, String> {
        let mut outcomes = Vec::new();
        for (target, actions) in targets {
            for action in actions {
                outcomes.push(apply_action(action, target, producer, &self.dir_guard)?);
            }
        }
        Ok(outcomes)
    }

    /// Assembles the namespace and mount tree for this sandbox (§4.D points
    /// 1-4). Must run inside the process that will become the job's
    /// command, before `exec`.
    pub fn assemble(&self) -> Result<(), String> {
        enter_namespaces()?;
        build_scratch_root(&self.scratch_root, &self.plan)?;
        if self.plan.is_chrooted() {
            chroot_and_chdir(&self.scratch_root, &self.plan.cwd)?;
        }
        Ok(())
    }

    /// Releases directories this sandbox protected and removes the scratch
    /// tree. Directories still protected by a sibling sandbox's concurrent
    /// job are left in place by `teardown_scratch_root`'s caller, which
    /// should call `release_dir` for each directory this sandbox's own
    /// `wash_targets` protected once the job is fully done with it.
    pub fn release_dir(&self, dir: &Path) {
        self.dir_guard.release(dir);
    }

    pub fn teardown(&self) -> Result<(), String> {
        teardown_scratch_root(&self.scratch_root)
    }
}
