//! The `Job` and `Dep` entities (spec §3): one concrete invocation of a
//! rule, and its recorded dependencies in exactly the order they were
//! observed at the last run.

use std::time::Duration;

use fs::AccessMask;
use serde::{Deserialize, Serialize};

use crate::rule::Dflags;
use crate::{NodeId, RuleId};

/// `last_run_status`: what happened the last time this job's process was
/// launched (or wasn't). Chronological per spec §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastRunStatus {
    /// Never run.
    New,
    /// Failed before the command even started (bad sandbox setup, missing
    /// static dep discovered too late, etc).
    EarlyErr,
    /// Backend lost track of the job before a start was ever seen.
    EarlyLost,
    /// Backend lost track of the job after a start was seen.
    LateLost,
    Killed,
    /// Ended via a `ChkDeps` negative answer rather than actually running.
    ChkDeps,
    /// Rule was removed; job kept only for graph bookkeeping.
    Garbage,
    Ok,
    Err,
    Timeout,
}

/// `run_status`: the reason a `(Job, Req)` analysis landed where it did,
/// independent of whether the process itself was ever launched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Ok,
    DepErr,
    MissingStatic,
    Err,
}

/// Either a content fingerprint or a bare date, depending on whether the
/// dep's content was actually confirmed (§3 "Dep" attributes).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum DepWitness {
    Fingerprint(crate::node::ContentFingerprint),
    Date(u64),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Dep {
    pub node: NodeId,
    pub access_mask: AccessMask,
    pub flags: Dflags,
    /// True when this dep was observed in the same "parallel chunk" as its
    /// predecessor (§3 "Dep ordering").
    pub parallel: bool,
    pub witness: DepWitness,
}

impl Dep {
    pub fn is_static(&self) -> bool {
        self.flags.static_dep
    }

    pub fn is_critical(&self) -> bool {
        self.flags.critical
    }
}

/// An output the job wrote (or unlinked), in the order it happened.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TargetRef {
    pub node: NodeId,
    pub written: bool,
    pub unlinked: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub rule: RuleId,
    /// Static deps, ordered, each flagged `Dflags::STATIC`; always a prefix
    /// of what ends up in `deps` once the job has actually run once.
    pub static_dep_nodes: Vec<NodeId>,
    /// The rule's target patterns, resolved against the stem this job was
    /// instantiated for, as nodes — fixed at instantiation time so the job
    /// can be launched (component G needs the full declared target set)
    /// before it has ever actually run and reported `targets` below.
    pub declared_targets: Vec<NodeId>,
    /// Full recorded dep list from the last successful run, in the exact
    /// order + parallel-grouping it was observed (§3 invariant).
    pub deps: Vec<Dep>,
    pub targets: Vec<TargetRef>,
    pub last_run_status: LastRunStatus,
    pub run_status: RunStatus,
    /// `exec_gen >= rule.cmd_gen` means the command hasn't changed since
    /// this job last ran (§3 invariant).
    pub exec_gen: u64,
    pub best_exec_time: Duration,
    /// Cost-per-resource-token, used by ETA (§4.H).
    pub cost_per_token: f64,
}

impl Job {
    pub fn new(rule: RuleId, static_dep_nodes: Vec<NodeId>, declared_targets: Vec<NodeId>) -> Job {
        Job {
            rule,
            static_dep_nodes,
            declared_targets,
            deps: Vec::new(),
            targets: Vec::new(),
            last_run_status: LastRunStatus::New,
            run_status: RunStatus::Ok,
            exec_gen: 0,
            best_exec_time: Duration::ZERO,
            cost_per_token: 0.0,
        }
    }

    /// True if the command has not changed since this job last ran, per the
    /// generation invariant in spec §3.
    pub fn cmd_unchanged(&self, rule_cmd_gen: u64) -> bool {
        self.exec_gen >= rule_cmd_gen
    }

    pub fn rsrcs_unchanged(&self, rule_rsrcs_gen: u64) -> bool {
        self.exec_gen >= rule_rsrcs_gen
    }

    /// Splits `deps` into maximal contiguous parallel chunks (glossary:
    /// "Parallel dep chunk"), preserving the `(start, end)` index ranges
    /// so callers can walk a chunk at a time without copying.
    pub fn parallel_chunks(&self) -> Vec<(usize, usize)> {
        let mut chunks = Vec::new();
        let mut start = 0usize;
        for (i, dep) in self.deps.iter().enumerate() {
            if i > 0 && !dep.parallel {
                chunks.push((start, i));
                start = i;
            }
        }
        if start < self.deps.len() {
            chunks.push((start, self.deps.len()));
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ContentFingerprint;

    fn dep(parallel: bool) -> Dep {
        Dep {
            node: NodeId(0),
            access_mask: AccessMask::EMPTY,
            flags: Dflags::default(),
            parallel,
            witness: DepWitness::Fingerprint(ContentFingerprint::None),
        }
    }

    #[test]
    fn parallel_chunks_groups_contiguous_runs() {
        let mut job = Job::new(RuleId(0), vec![], vec![]);
        job.deps = vec![dep(false), dep(true), dep(true), dep(false), dep(true)];
        assert_eq!(job.parallel_chunks(), vec![(0, 3), (3, 5)]);
    }

    #[test]
    fn cmd_unchanged_respects_generation_invariant() {
        let mut job = Job::new(RuleId(0), vec![], vec![]);
        job.exec_gen = 5;
        assert!(job.cmd_unchanged(5));
        assert!(job.cmd_unchanged(3));
        assert!(!job.cmd_unchanged(6));
    }

    #[test]
    fn single_chunk_when_all_sequential() {
        let mut job = Job::new(RuleId(0), vec![], vec![]);
        job.deps = vec![dep(false), dep(false)];
        assert_eq!(job.parallel_chunks(), vec![(0, 1), (1, 2)]);
    }
}
