//! Path resolution under the repo/tmp/source-dir policy (§4.C "Solve").
//!
//! The traced process never passes the engine an already-resolved path: it
//! reports a `Path` (dirfd + name) and lets the autodep layer itself redo
//! the resolution the kernel is about to do, so every symlink hop along the
//! way can be reported as an `Access::Lnk` dep. The real `open`-time
//! resolution happens in the kernel; this module exists to mirror it
//! user-side without actually opening the file (stat/lstat only).

use std::path::{Component, Path, PathBuf};

use fs::{Access, AccessMask, PathKind};

/// Where a job's private tmp actually lives (`Tmp`, §4.D) and the view it
/// is visible under inside the sandbox (`tmp_view`, §4.C "tmp-view
/// mapping"). `None` when the rule declares no `tmp_view`.
#[derive(Clone, Debug, Default)]
pub struct TmpViewMapping {
    pub physical: Option<PathBuf>,
    pub view: Option<PathBuf>,
}

impl TmpViewMapping {
    /// Rewrites `real` from the physical tmp dir to its view-visible path,
    /// when it falls under the physical dir and a view is configured.
    pub fn to_view(&self, real: &Path) -> Option<PathBuf> {
        let (physical, view) = match (&self.physical, &self.view) {
            (Some(p), Some(v)) => (p, v),
            _ => return None,
        };
        real.strip_prefix(physical).ok().map(|suffix| view.join(suffix))
    }
}

/// The policy a `Solve` resolves paths against: repo root, declared source
/// directories, and the tmp-view mapping.
#[derive(Clone, Debug)]
pub struct RealPathEnv {
    pub repo_root: PathBuf,
    pub src_dirs: Vec<PathBuf>,
    pub admin_dir: PathBuf,
    pub tmp_view: TmpViewMapping,
}

impl RealPathEnv {
    pub fn classify(&self, real: &Path) -> PathKind {
        if real == self.repo_root {
            return PathKind::Root;
        }
        if real.starts_with(&self.repo_root) {
            return PathKind::Repo;
        }
        if real.starts_with(&self.admin_dir) {
            return PathKind::Admin;
        }
        if let Some(view) = &self.tmp_view.view {
            if real.starts_with(view) {
                return PathKind::Tmp;
            }
        }
        if let Some(physical) = &self.tmp_view.physical {
            if real.starts_with(physical) {
                return PathKind::Tmp;
            }
        }
        if real.starts_with("/proc") {
            return PathKind::Proc;
        }
        if self.src_dirs.iter().any(|d| real.starts_with(d)) {
            return PathKind::SrcDirs;
        }
        PathKind::Ext
    }
}

/// Resolves a filesystem path a component at a time, following symlinks and
/// recording each traversal as a `Lnk` access. `resolve_link` is the seam
/// that lets production code call `std::fs::read_link` and tests supply a
/// fake filesystem without touching disk.
pub fn solve(
    path: &Path,
    env: &RealPathEnv,
    resolve_link: &mut dyn FnMut(&Path) -> Option<PathBuf>,
) -> Solve {
    let mut real = PathBuf::new();
    let mut accesses = AccessMask::EMPTY;
    let mut lnks = Vec::new();
    let mut remaining: Vec<Component> = path.components().collect();
    remaining.reverse();
    let mut hops = 0usize;
    const MAX_HOPS: usize = 40; // mirrors ELOOP's conventional 40-symlink kernel cap

    while let Some(component) = remaining.pop() {
        match component {
            Component::RootDir => real = PathBuf::from("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                real.pop();
            }
            Component::Normal(part) => {
                real.push(part);
                if hops >= MAX_HOPS {
                    break;
                }
                if let Some(target) = resolve_link(&real) {
                    hops += 1;
                    accesses = accesses.with(Access::Lnk);
                    lnks.push(real.clone());
                    let mut target_components: Vec<Component> = target.components().collect();
                    target_components.reverse();
                    if target.is_absolute() {
                        real = PathBuf::new();
                    } else {
                        real.pop();
                    }
                    for c in target_components {
                        remaining.push(c);
                    }
                }
            }
            Component::Prefix(_) => {}
        }
    }

    let kind = env.classify(&real);
    Solve {
        real,
        kind,
        accesses,
        lnks,
    }
}

/// Result of resolving a `Path`: the canonical path, which "world" it lands
/// in, and the accesses the resolution itself performed.
#[derive(Clone, Debug)]
pub struct Solve {
    pub real: PathBuf,
    pub kind: PathKind,
    pub accesses: AccessMask,
    pub lnks: Vec<PathBuf>,
}
