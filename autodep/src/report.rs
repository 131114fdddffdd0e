//! Per-job access reporting: the de-duplicated `(file, accesses)` table
//! that the autodep layer sends to the job-exec supervisor (§4.C "Access
//! de-duplication", wire message `Access(files+digest)` in §6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use fs::{Access, AccessMask};

use crate::node_state::ContentState;
use crate::ops::{Operation, Outcome, PendingOp};

/// The observable report for one file, accumulated across every operation
/// the job performed against it.
#[derive(Clone, Debug)]
pub struct FileReport {
    pub accesses: AccessMask,
    pub write: bool,
    pub unlink: bool,
    pub first_read_at: Option<Instant>,
    pub first_write_at: Option<Instant>,
    pub pre_state: Option<ContentState>,
}

impl FileReport {
    fn empty() -> FileReport {
        FileReport {
            accesses: AccessMask::EMPTY,
            write: false,
            unlink: false,
            first_read_at: None,
            first_write_at: None,
            pre_state: None,
        }
    }
}

/// Per-job cache mapping file -> `(accesses-ever, accesses-after-seen)`,
/// exactly as spec §4.C describes: a redundant access report that reveals
/// no new bit is dropped, while a write always resets the cache for that
/// file (since a write invalidates any earlier "nothing new to see" claim).
pub struct Recorder {
    files: HashMap<PathBuf, FileReport>,
    /// `(accesses-ever, accesses-after-last-reset)` — the second element is
    /// what de-duplication actually compares against; it's reset to empty
    /// whenever a write happens, so a read immediately after a write is
    /// never suppressed even if the same bits were seen before the write.
    dedup: HashMap<PathBuf, (AccessMask, AccessMask)>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder {
            files: HashMap::new(),
            dedup: HashMap::new(),
        }
    }

    /// Applies a confirmed (or vanished) operation. Returns `true` if this
    /// call produced a change worth forwarding to the engine (i.e. was not
    /// suppressed by de-duplication) — this is the boundary that keeps
    /// "reporting the same `(file, access-mask)` twice within a run
    /// produces at most one network message" (§8) true.
    pub fn apply(&mut self, path: &Path, operation: Operation, pre_state: ContentState, started_at: Instant, outcome: Outcome) -> bool {
        if outcome == Outcome::Vanished {
            return false;
        }
        let access = operation_access(operation);
        let is_write = operation.is_write();
        let is_unlink = operation.is_unlink();

        if is_write {
            self.dedup.insert(path.to_path_buf(), (AccessMask::EMPTY, AccessMask::EMPTY));
        }

        let (_, after_reset) = self.dedup.entry(path.to_path_buf()).or_insert((AccessMask::EMPTY, AccessMask::EMPTY));
        let reveals_new_bit = access.map(|a| !after_reset.subsumes(a)).unwrap_or(false);
        if !reveals_new_bit && !is_write && !is_unlink {
            return false;
        }
        if let Some(a) = access {
            *after_reset = after_reset.union(a);
        }

        let report = self.files.entry(path.to_path_buf()).or_insert_with(FileReport::empty);
        if let Some(a) = access {
            report.accesses = report.accesses.union(a);
        }
        if is_write {
            report.write = true;
            report.first_write_at.get_or_insert(started_at);
        }
        if is_unlink {
            report.unlink = true;
        }
        if matches!(operation, Operation::Read | Operation::Open { write: false, .. } | Operation::Stat) {
            report.first_read_at.get_or_insert(started_at);
        }
        if report.pre_state.is_none() {
            report.pre_state = Some(pre_state);
        }
        true
    }

    pub fn apply_pending(&mut self, pending: PendingOp, success: bool) -> bool {
        let (operation, path, pre_state, started_at, outcome) = pending.confirm(success);
        self.apply(&path, operation, pre_state, started_at, outcome)
    }

    pub fn reports(&self) -> impl Iterator<Item = (&Path, &FileReport)> {
        self.files.iter().map(|(p, r)| (p.as_path(), r))
    }

    pub fn get(&self, path: &Path) -> Option<&FileReport> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn operation_access(operation: Operation) -> Option<AccessMask> {
    match operation {
        Operation::Lnk | Operation::Symlnk | Operation::ReadLnk => Some(AccessMask::EMPTY.with(Access::Lnk)),
        Operation::Read | Operation::Exec | Operation::Open { .. } => Some(AccessMask::EMPTY.with(Access::Reg)),
        Operation::Stat | Operation::ChDir => Some(AccessMask::EMPTY.with(Access::Stat)),
        Operation::Chmod | Operation::Mkdir | Operation::Rename | Operation::Unlink => {
            Some(AccessMask::EMPTY.with(Access::Stat))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn first_access_is_reported() {
        let mut rec = Recorder::new();
        let reported = rec.apply(
            &PathBuf::from("/repo/a.c"),
            Operation::Read,
            ContentState::Regular,
            now(),
            Outcome::Confirmed,
        );
        assert!(reported);
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn repeated_identical_access_is_suppressed() {
        let mut rec = Recorder::new();
        let path = PathBuf::from("/repo/a.c");
        assert!(rec.apply(&path, Operation::Stat, ContentState::Regular, now(), Outcome::Confirmed));
        assert!(!rec.apply(&path, Operation::Stat, ContentState::Regular, now(), Outcome::Confirmed));
    }

    #[test]
    fn new_access_bit_is_not_suppressed() {
        let mut rec = Recorder::new();
        let path = PathBuf::from("/repo/a.c");
        assert!(rec.apply(&path, Operation::Stat, ContentState::Regular, now(), Outcome::Confirmed));
        assert!(rec.apply(&path, Operation::Read, ContentState::Regular, now(), Outcome::Confirmed));
    }

    #[test]
    fn write_resets_dedup_cache() {
        let mut rec = Recorder::new();
        let path = PathBuf::from("/repo/out.o");
        assert!(rec.apply(
            &path,
            Operation::Open { write: true, create: true, truncate: true },
            ContentState::Absent,
            now(),
            Outcome::Confirmed
        ));
        // A read with bits already seen before the write is reported again,
        // since the write invalidated the prior "nothing new" claim.
        assert!(rec.apply(&path, Operation::Open { write: true, create: false, truncate: false }, ContentState::Regular, now(), Outcome::Confirmed));
    }

    #[test]
    fn vanished_operation_is_never_reported() {
        let mut rec = Recorder::new();
        let pending = PendingOp::begin(Operation::Open { write: false, create: false, truncate: false }, PathBuf::from("/repo/missing"), ContentState::Absent, now());
        assert!(!rec.apply_pending(pending, false));
        assert!(rec.is_empty());
    }

    #[test]
    fn unlink_is_reported_even_without_new_access_bits() {
        let mut rec = Recorder::new();
        let path = PathBuf::from("/repo/stale");
        assert!(rec.apply(&path, Operation::Stat, ContentState::Regular, now(), Outcome::Confirmed));
        assert!(rec.apply(&path, Operation::Unlink, ContentState::Regular, now(), Outcome::Confirmed));
        assert!(rec.get(&path).unwrap().unlink);
    }
}
