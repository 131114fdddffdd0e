//! `JobReasonTag` and the `reason |= x` accumulation rule (spec §4.F: "Reasons
//! ... are ordered so that error-producing reasons win over informational
//! ones; `reason |= x` keeps the strongest").

use serde::{Deserialize, Serialize};

/// Ordered worst-to-best is backwards from how humans read it, so this is
/// ordered *best-to-worst is last*: a higher discriminant always wins when
/// two reasons are accumulated via [`Reason::accumulate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobReasonTag {
    #[default]
    None,
    /// Never run before.
    New,
    /// Rule was removed/garbage-collected; kept only for bookkeeping.
    Garbage,
    /// Resources fingerprint changed since the job last ran (§9 open
    /// question: treated as a force-rerun reason, same as `Cmd`).
    Rsrcs,
    /// Command fingerprint changed since the job last ran.
    Cmd,
    /// The Req asked to forget old errors and this job errored last time.
    Forgotten,
    /// Rule (or node) is marked `frozen`/force.
    Force,
    /// A non-critical dep's content changed.
    DepModified,
    /// A dep is not yet ready; this job is waiting on it.
    DepNotReady,
    /// A dep was manually modified on disk outside the engine.
    DepOverwritten,
    /// A required dep is in error.
    DepError,
    /// A required static dep doesn't exist and can't be produced.
    MissingStatic,
    /// Two jobs wrote the same target concurrently.
    Clash,
}

/// A single accumulator that always holds the strongest reason seen so far,
/// per the `reason |= x` rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reason(JobReasonTag);

impl Reason {
    pub fn none() -> Reason {
        Reason(JobReasonTag::None)
    }

    pub fn tag(&self) -> JobReasonTag {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == JobReasonTag::None
    }

    /// `reason |= x`: keeps whichever of the current and incoming reason is
    /// stronger (§4.F).
    pub fn accumulate(&mut self, tag: JobReasonTag) {
        if tag > self.0 {
            self.0 = tag;
        }
    }

    pub fn merge(&mut self, other: Reason) {
        self.accumulate(other.0);
    }

    /// Error-class reasons (§7 "error-class reasons are sticky") force a
    /// `Run` action regardless of what the caller originally asked for.
    pub fn forces_run(&self) -> bool {
        self.0 != JobReasonTag::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_keeps_the_stronger_reason() {
        let mut reason = Reason::none();
        reason.accumulate(JobReasonTag::DepModified);
        reason.accumulate(JobReasonTag::New);
        assert_eq!(reason.tag(), JobReasonTag::DepModified);
        reason.accumulate(JobReasonTag::MissingStatic);
        assert_eq!(reason.tag(), JobReasonTag::MissingStatic);
    }

    #[test]
    fn error_class_reason_is_sticky_against_weaker_updates() {
        let mut reason = Reason::none();
        reason.accumulate(JobReasonTag::DepError);
        reason.accumulate(JobReasonTag::DepNotReady);
        assert_eq!(reason.tag(), JobReasonTag::DepError);
    }
}
