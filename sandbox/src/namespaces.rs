//! Namespace assembly (§4.D points 1-4): new user+mount namespaces with a
//! 1-to-1 uid/gid mapping, scratch-dir bind mounts for a declared chroot,
//! per-view mounts, then `chroot`+`chdir` into the assembled root.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getgid, getuid};

use crate::views::{MountPlan, View, ViewKind};

/// Enters new user and mount namespaces, mapping the invoking uid/gid
/// 1-to-1 so the job sees itself as the same user it would outside the
/// sandbox (§4.D point 1). Must be called before any mount/chroot calls —
/// a mount namespace's mounts are only ever visible to itself and its
/// children.
pub fn enter_namespaces() -> Result<(), String> {
    let uid = getuid();
    let gid = getgid();
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS).map_err(|e| format!("unshare: {e}"))?;
    write_id_map("/proc/self/setgroups", "deny")?;
    write_id_map("/proc/self/uid_map", &format!("{uid} {uid} 1"))?;
    write_id_map("/proc/self/gid_map", &format!("{gid} {gid} 1"))?;
    Ok(())
}

fn write_id_map(path: &str, contents: &str) -> Result<(), String> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| format!("open {path}: {e}"))?;
    file.write_all(contents.as_bytes()).map_err(|e| format!("write {path}: {e}"))
}

/// Builds the scratch root: for a declared `chroot_source`, bind-mounts
/// every top-level entry of the source plus empty mount points for each
/// view; returns the scratch root path.
pub fn build_scratch_root(scratch_root: &Path, plan: &MountPlan) -> Result<(), String> {
    std::fs::create_dir_all(scratch_root).map_err(|e| format!("mkdir scratch root: {e}"))?;

    if let Some(source) = &plan.chroot_source {
        for entry in std::fs::read_dir(source).map_err(|e| format!("read_dir {source:?}: {e}"))? {
            let entry = entry.map_err(|e| format!("read_dir entry: {e}"))?;
            let name = entry.file_name();
            let dest = scratch_root.join(&name);
            let metadata = entry.metadata().map_err(|e| format!("metadata: {e}"))?;
            if metadata.is_dir() {
                std::fs::create_dir_all(&dest).map_err(|e| format!("mkdir {dest:?}: {e}"))?;
            } else {
                std::fs::File::create(&dest).map_err(|e| format!("touch {dest:?}: {e}"))?;
            }
            bind_mount(&entry.path(), &dest, true)?;
        }
    }

    for view in &plan.views {
        let dest = scratch_root.join(view.mount_point.strip_prefix("/").unwrap_or(&view.mount_point));
        std::fs::create_dir_all(&dest).map_err(|e| format!("mkdir view mount point {dest:?}: {e}"))?;
        mount_view(view, &dest)?;
    }

    Ok(())
}

fn bind_mount(source: &Path, dest: &Path, read_only: bool) -> Result<(), String> {
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REC;
    mount(Some(source), dest, None::<&str>, flags, None::<&str>).map_err(|e| format!("bind mount {source:?} -> {dest:?}: {e}"))?;
    if read_only {
        flags |= MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        mount(None::<&str>, dest, None::<&str>, flags, None::<&str>)
            .map_err(|e| format!("remount ro {dest:?}: {e}"))?;
    }
    Ok(())
}

fn mount_view(view: &View, dest: &Path) -> Result<(), String> {
    match &view.kind {
        ViewKind::Bind { physical, read_only } => bind_mount(physical, dest, *read_only),
        ViewKind::Overlay { lower, upper, work } => {
            std::fs::create_dir_all(upper).map_err(|e| format!("mkdir upper: {e}"))?;
            std::fs::create_dir_all(work).map_err(|e| format!("mkdir work: {e}"))?;
            let lower_joined = lower
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(":");
            let options = format!(
                "lowerdir={},upperdir={},workdir={}",
                lower_joined,
                upper.display(),
                work.display()
            );
            mount(Some("overlay"), dest, Some("overlay"), MsFlags::empty(), Some(options.as_str()))
                .map_err(|e| format!("overlay mount {dest:?}: {e}"))
        }
        ViewKind::Tmpfs { size_bytes } => {
            let options = format!("size={size_bytes}");
            mount(None::<&str>, dest, Some("tmpfs"), MsFlags::empty(), Some(options.as_str()))
                .map_err(|e| format!("tmpfs mount {dest:?}: {e}"))
        }
        ViewKind::Fuse { .. } => {
            // FUSE mounts are driven by a long-lived mount object owned by
            // the job-exec supervisor (§4.D "post-job cleanup: FUSE
            // unmounts are driven by dropping the FUSE mount objects"),
            // not by a one-shot `mount(2)` call here.
            Ok(())
        }
    }
}

/// `chroot`s into `scratch_root` then `chdir`s into `cwd` (§4.D point 4).
pub fn chroot_and_chdir(scratch_root: &Path, cwd: &Path) -> Result<(), String> {
    nix::unistd::chroot(scratch_root).map_err(|e| format!("chroot {scratch_root:?}: {e}"))?;
    nix::unistd::chdir(cwd).map_err(|e| format!("chdir {cwd:?}: {e}"))
}

/// Post-job cleanup (§4.D): removes the scratch directory tree. FUSE
/// mounts are unmounted by their own drop glue, not here.
pub fn teardown_scratch_root(scratch_root: &Path) -> Result<(), String> {
    if scratch_root.exists() {
        std::fs::remove_dir_all(scratch_root).map_err(|e| format!("remove scratch root {scratch_root:?}: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_scratch_root_with_no_chroot_source_only_makes_view_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let plan = MountPlan {
            chroot_source: None,
            views: vec![],
            cwd: PathBuf::from("/"),
        };
        build_scratch_root(&scratch, &plan).unwrap();
        assert!(scratch.is_dir());
    }
}
