//! View declarations (§4.D point 3, glossary "View"): the logical paths a
//! job sees inside the sandbox, each backed by one physical mount strategy.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A logical path the job's command sees, mapped onto one or more physical
/// directories.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct View {
    /// Where the job sees this view, relative to the sandbox root.
    pub mount_point: PathBuf,
    pub kind: ViewKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ViewKind {
    /// A single physical directory, bind-mounted read-write or read-only.
    Bind { physical: PathBuf, read_only: bool },
    /// Several physical directories layered with a writable upper and a
    /// work directory (standard overlayfs shape).
    Overlay {
        lower: Vec<PathBuf>,
        upper: PathBuf,
        work: PathBuf,
    },
    /// An in-memory filesystem of bounded size — used for a job's private
    /// tmp when the rule doesn't need it to survive the job (§4.D point 3).
    Tmpfs { size_bytes: u64 },
    /// A FUSE mount that additionally reports every write back to the
    /// engine, e.g. for a view the engine wants live visibility into
    /// without waiting for the job to end.
    Fuse { reporting_socket: PathBuf },
}

impl View {
    pub fn bind(mount_point: impl Into<PathBuf>, physical: impl Into<PathBuf>, read_only: bool) -> View {
        View {
            mount_point: mount_point.into(),
            kind: ViewKind::Bind {
                physical: physical.into(),
                read_only,
            },
        }
    }

    pub fn overlay(mount_point: impl Into<PathBuf>, lower: Vec<PathBuf>, upper: impl Into<PathBuf>, work: impl Into<PathBuf>) -> View {
        View {
            mount_point: mount_point.into(),
            kind: ViewKind::Overlay {
                lower,
                upper: upper.into(),
                work: work.into(),
            },
        }
    }

    pub fn tmpfs(mount_point: impl Into<PathBuf>, size_bytes: u64) -> View {
        View {
            mount_point: mount_point.into(),
            kind: ViewKind::Tmpfs { size_bytes },
        }
    }
}

/// The full mount plan for one job's sandbox: an optional chroot source
/// (every top-level entry of which is bind-mounted into a scratch dir, per
/// §4.D point 2), the declared views, and the working directory the
/// command is `chdir`'d into after `chroot`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountPlan {
    pub chroot_source: Option<PathBuf>,
    pub views: Vec<View>,
    pub cwd: PathBuf,
}

impl MountPlan {
    pub fn is_chrooted(&self) -> bool {
        self.chroot_source.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_view_round_trips_through_kind() {
        let view = View::bind("/repo", "/data/repo-42", false);
        match view.kind {
            ViewKind::Bind { read_only, .. } => assert!(!read_only),
            _ => panic!("expected Bind"),
        }
    }

    #[test]
    fn mount_plan_without_chroot_source_is_not_chrooted() {
        let plan = MountPlan {
            chroot_source: None,
            views: vec![],
            cwd: PathBuf::from("/"),
        };
        assert!(!plan.is_chrooted());
    }
}
