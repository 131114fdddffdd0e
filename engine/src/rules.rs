//! Rule registration: the cmd_gen/rsrcs_gen bump policy (spec §3: "a rule
//! has `cmd_gen` and `rsrcs_gen` counters", without saying who bumps them —
//! resolved here, see DESIGN.md's Open Question entry).
//!
//! A replace compares the incoming rule's `cmd_fingerprint`/`rsrcs_fingerprint`
//! against the rule it's replacing (read back through `Graph::rule` before
//! the replace lands): each counter is copied forward unchanged if its
//! fingerprint didn't move, or bumped by one if it did. A rule with no
//! previous version starts both counters at `0`. This keeps a job's
//! `exec_gen` (§3 "`exec_gen >= cmd_gen` ⇒ command unchanged since job last
//! ran") meaningfully comparable without rebuilding every job's `exec_gen`
//! on an unrelated rule edit.

use record_store::{Rule, RuleId};

use crate::graph::Graph;

pub fn register_rule(graph: &Graph, existing: Option<RuleId>, mut rule: Rule) -> Result<RuleId, String> {
    let previous = match existing {
        Some(id) => graph.rule(id)?,
        None => None,
    };
    match previous {
        Some(prev) => {
            rule.cmd_gen = bump_if_changed(prev.cmd_gen, prev.cmd_fingerprint(), rule.cmd_fingerprint());
            rule.rsrcs_gen = bump_if_changed(prev.rsrcs_gen, prev.rsrcs_fingerprint(), rule.rsrcs_fingerprint());
        }
        None => {
            rule.cmd_gen = 0;
            rule.rsrcs_gen = 0;
        }
    }
    graph.put_rule(existing, rule)
}

fn bump_if_changed(previous_gen: u64, previous: hashing::Fingerprint, current: hashing::Fingerprint) -> u64 {
    if previous == current {
        previous_gen
    } else {
        previous_gen + 1
    }
}
