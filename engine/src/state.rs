//! Shared vocabulary for the make state machine (§4.F / §3 `ReqInfo`):
//! `Action`, `Level`, `EntityId`, `ReqId`, and the per-`(entity, Req)`
//! analysis record itself.

use std::collections::HashSet;

use record_store::{JobId, NodeId};

use crate::reason::Reason;

/// `ReqInfo.desired run action` (spec §3), ordered so a later variant always
/// asks for at least as much work as an earlier one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    None,
    /// Just decide buildability, don't even check the disk.
    Makable,
    /// Check `run_status`/error state, without necessarily touching disk.
    Status,
    /// Confirm on-disk content actually matches the recorded fingerprint.
    Disk,
    /// Actually run the job if anything is out of date.
    Run,
}

/// `ReqInfo.level`: where this `(entity, Req)` pair's analysis currently
/// stands (spec §4.F).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    None,
    Dep,
    Queued,
    Exec,
    Done,
    /// Done via a cache hit rather than an actual run (§4.J).
    Hit,
}

/// One node/job identity a `ReqInfo` can be keyed on (spec §3: "per `(Node|Job,
/// Req)` pair").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityId {
    Node(NodeId),
    Job(JobId),
}

impl From<NodeId> for EntityId {
    fn from(id: NodeId) -> EntityId {
        EntityId::Node(id)
    }
}

impl From<JobId> for EntityId {
    fn from(id: JobId) -> EntityId {
        EntityId::Job(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(pub u64);

/// The outcome of analyzing one dep during the dep walk (§4.F step 2),
/// before it's folded into the chunk-level `state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DepState {
    Ok,
    /// Modified, but not yet "stamped" because the parallel chunk containing
    /// it hasn't closed (§4.F: "tracks modifications inside the current
    /// parallel chunk separately").
    ProtoModif,
    Modif,
    Err,
    MissingStatic,
}

/// Per-`(Node|Job, Req)` analysis state (spec §3 `ReqInfo`).
#[derive(Clone, Debug)]
pub struct ReqInfo {
    pub action: Action,
    pub level: Level,
    /// Iterator position into the deps vector (§4.F).
    pub dep_lvl: usize,
    pub reason: Reason,
    /// Command/resources changed, or rule is frozen/errored-and-forgettable
    /// (§4.F step 1).
    pub force: bool,
    /// Propagated from deps currently being (re)analyzed; true if this
    /// analysis might still be invalidated by a dep that could vanish.
    pub speculative: bool,
    /// Number of outstanding watched deps.
    pub wait_count: u32,
    pub watchers: HashSet<EntityId>,
    /// Coarse delay propagated transitively from deps under analysis,
    /// used to prioritize which watcher wakes first.
    pub critical_pressure: u32,
    /// High-water mark of the strongest action this pair has ever been
    /// confirmed `Done` for (spec §8 idempotence-of-make property).
    pub done_upto: Action,
}

impl Default for ReqInfo {
    fn default() -> ReqInfo {
        ReqInfo {
            action: Action::None,
            level: Level::None,
            dep_lvl: 0,
            reason: Reason::none(),
            force: false,
            speculative: false,
            wait_count: 0,
            watchers: HashSet::new(),
            critical_pressure: 0,
            done_upto: Action::None,
        }
    }
}

impl ReqInfo {
    pub fn is_waiting(&self) -> bool {
        self.wait_count > 0
    }

    /// Spec §8: "once `req_info(n,r).done` is true for action A, subsequent
    /// `make(n,r,A')` with `A' <= A` returns immediately".
    pub fn done_for(&self, action: Action) -> bool {
        matches!(self.level, Level::Done | Level::Hit) && action <= self.done_upto
    }

    pub fn mark_done(&mut self, action: Action) {
        self.level = Level::Done;
        if action > self.done_upto {
            self.done_upto = action;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ordering_matches_spec_progression() {
        assert!(Action::None < Action::Makable);
        assert!(Action::Makable < Action::Status);
        assert!(Action::Status < Action::Disk);
        assert!(Action::Disk < Action::Run);
    }

    #[test]
    fn fresh_req_info_is_not_waiting() {
        let ri = ReqInfo::default();
        assert!(!ri.is_waiting());
        assert!(!ri.done_for(Action::Status));
    }

    #[test]
    fn mark_done_raises_high_water_mark_only() {
        let mut ri = ReqInfo::default();
        ri.mark_done(Action::Disk);
        assert_eq!(ri.done_upto, Action::Disk);
        ri.mark_done(Action::Status);
        assert_eq!(ri.done_upto, Action::Disk);
    }
}
