//! The `Node` entity (spec §3): a filesystem path inside the repository (or
//! a declared source), with its cached content fingerprint, match-cache
//! generation, and ordered list of candidate producers.

use fs::RelativePath;
use hashing::Fingerprint;
use serde::{Deserialize, Serialize};

use crate::JobId;

/// A tagged content fingerprint. `None` and `Regular`/`Link` are distinct
/// from each other (a node going from absent to present is itself a
/// modification, even before comparing hashes) and `Unknown` marks a dep
/// that was observed by date only, never confirmed against content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentFingerprint {
    /// The file does not exist on disk.
    None,
    Regular(Fingerprint),
    /// The file is a symlink; fingerprint is of the link target string.
    Link(Fingerprint),
    /// Observed by date, not content; treated as "maybe different" by `matches`.
    Unknown,
}

impl ContentFingerprint {
    /// Decides whether `self` (the cached fingerprint) and `other` (a freshly
    /// observed one) should be considered a difference, given which accesses
    /// were actually performed. An `Unknown` fingerprint on either side can
    /// never be proven equal, so it always counts as a difference — this is
    /// what forces a date-only dep to be promoted to a real comparison before
    /// the make state machine can call it "Ok" (§4.E point 6: "promote a
    /// date-based observation to a content-based one ... or mark it
    /// `Crc::Unknown`").
    pub fn matches(&self, other: &ContentFingerprint) -> bool {
        match (self, other) {
            (ContentFingerprint::Unknown, _) | (_, ContentFingerprint::Unknown) => false,
            (a, b) => a == b,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ContentFingerprint::None)
    }
}

/// A data-independent approximation of "can this node ever be produced".
/// `No` nodes (e.g. outside any declared source dir and matched by no rule)
/// are rejected as deps before any expensive analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Buildability {
    No,
    Maybe,
    Yes,
}

/// Status flags carried on every node (spec §3 "status flags").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub is_source: bool,
    pub is_anti: bool,
    pub unlinked: bool,
    pub pollution: bool,
    pub clash: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub name: RelativePath,
    pub fingerprint: ContentFingerprint,
    /// ctime-like instant correlating the cached fingerprint with disk
    /// state; not itself a correctness signal, only a staleness hint.
    pub content_date: u64,
    pub buildability: Buildability,
    /// Node's cached rule-match info is trusted only when this is `>=` the
    /// store's global `match_gen` (§3 invariant).
    pub match_gen: u64,
    /// Candidate job-targets, ordered by priority (highest first).
    pub candidate_jobs: Vec<JobId>,
    /// Index into `candidate_jobs` of the "conform" producer: the job that
    /// most recently actually wrote this file, among the candidates.
    pub conform_idx: Option<usize>,
    /// Who wrote the file on disk last, which may differ from the conform
    /// producer right after a rule-set change.
    pub actual_job: Option<JobId>,
    pub flags: NodeFlags,
}

impl Node {
    pub fn new_source(name: RelativePath) -> Node {
        Node {
            name,
            fingerprint: ContentFingerprint::None,
            content_date: 0,
            buildability: Buildability::Yes,
            match_gen: 0,
            candidate_jobs: Vec::new(),
            conform_idx: None,
            actual_job: None,
            flags: NodeFlags {
                is_source: true,
                ..Default::default()
            },
        }
    }

    pub fn new_plain(name: RelativePath) -> Node {
        Node {
            name,
            fingerprint: ContentFingerprint::None,
            content_date: 0,
            buildability: Buildability::Maybe,
            match_gen: 0,
            candidate_jobs: Vec::new(),
            conform_idx: None,
            actual_job: None,
            flags: NodeFlags::default(),
        }
    }

    pub fn conform_job(&self) -> Option<JobId> {
        self.conform_idx.and_then(|idx| self.candidate_jobs.get(idx).copied())
    }

    /// True if the file is absent per the last observation — the dual of
    /// the testable-property "a node's crc == None iff the last observation
    /// saw the file absent" (§8).
    pub fn is_absent(&self) -> bool {
        self.fingerprint.is_absent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fingerprint_never_matches() {
        let fp = ContentFingerprint::Regular(hashing::EMPTY_FINGERPRINT);
        assert!(!ContentFingerprint::Unknown.matches(&fp));
        assert!(!fp.matches(&ContentFingerprint::Unknown));
    }

    #[test]
    fn identical_regular_fingerprints_match() {
        let fp = ContentFingerprint::Regular(hashing::EMPTY_FINGERPRINT);
        assert!(fp.matches(&fp));
    }

    #[test]
    fn absence_differs_from_presence() {
        let present = ContentFingerprint::Regular(hashing::EMPTY_FINGERPRINT);
        assert!(!ContentFingerprint::None.matches(&present));
    }

    #[test]
    fn conform_job_reads_through_index() {
        let mut node = Node::new_plain(RelativePath::new("a.out").unwrap());
        node.candidate_jobs = vec![JobId(3), JobId(7)];
        node.conform_idx = Some(1);
        assert_eq!(node.conform_job(), Some(JobId(7)));
    }
}
