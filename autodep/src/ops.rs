//! The "two-phase object" model from §4.C: each observed operation reports
//! a tentative access when it is about to happen (so the engine can answer
//! `ChkDeps` mid-flight even if the process never returns), then a second
//! call after the real syscall flips the report from "maybe" to either
//! "confirmed" or "vanished".

use std::path::PathBuf;
use std::time::Instant;

use crate::node_state::ContentState;

/// The syscall-level operation being traced. `Open` carries the flags that
/// distinguish a read-open from a write-open, since that changes whether
/// the access should be reported as a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    ChDir,
    Chmod,
    Exec,
    Lnk,
    Mkdir,
    Open { write: bool, create: bool, truncate: bool },
    Read,
    ReadLnk,
    Rename,
    Stat,
    Symlnk,
    Unlink,
}

impl Operation {
    /// Whether this operation, on its own, counts as a write for dep
    /// analysis purposes (§4.C reporting model "write flag").
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Chmod
                | Operation::Lnk
                | Operation::Mkdir
                | Operation::Rename
                | Operation::Symlnk
                | Operation::Unlink
                | Operation::Open { write: true, .. }
        )
    }

    pub fn is_unlink(&self) -> bool {
        matches!(self, Operation::Unlink)
    }
}

/// A begun-but-not-yet-confirmed operation: the pre-state captured at
/// construction time, to be compared against whatever the syscall's actual
/// outcome turns out to be.
#[derive(Debug)]
pub struct PendingOp {
    pub operation: Operation,
    pub path: PathBuf,
    pub pre_state: ContentState,
    pub started_at: Instant,
}

/// What a confirmed operation resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The syscall succeeded as expected.
    Confirmed,
    /// The syscall failed; the tentative access didn't actually happen
    /// (e.g. an `open()` that returned `ENOENT`).
    Vanished,
}

impl PendingOp {
    pub fn begin(operation: Operation, path: PathBuf, pre_state: ContentState, now: Instant) -> PendingOp {
        PendingOp {
            operation,
            path,
            pre_state,
            started_at: now,
        }
    }

    /// The second call in the two-phase protocol: reports whether the
    /// syscall the tentative access predicted actually happened.
    pub fn confirm(self, success: bool) -> (Operation, PathBuf, ContentState, Instant, Outcome) {
        let outcome = if success { Outcome::Confirmed } else { Outcome::Vanished };
        (self.operation, self.path, self.pre_state, self.started_at, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_open_counts_as_write() {
        let op = Operation::Open {
            write: true,
            create: false,
            truncate: false,
        };
        assert!(op.is_write());
    }

    #[test]
    fn read_open_is_not_a_write() {
        let op = Operation::Open {
            write: false,
            create: false,
            truncate: false,
        };
        assert!(!op.is_write());
    }

    #[test]
    fn unlink_is_flagged_distinctly_from_write() {
        assert!(Operation::Unlink.is_write());
        assert!(Operation::Unlink.is_unlink());
    }

    #[test]
    fn confirm_failure_reports_vanished() {
        let pending = PendingOp::begin(Operation::Stat, PathBuf::from("/repo/a"), ContentState::Absent, Instant::now());
        let (_, _, _, _, outcome) = pending.confirm(false);
        assert_eq!(outcome, Outcome::Vanished);
    }
}
