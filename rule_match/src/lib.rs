//! Compiles rule target patterns into an index that, given a file name,
//! returns the candidate `(rule, target-index)` pairs that could produce it,
//! ordered by the priority rule §4.B defines.
//!
//! The spec describes this as a suffix tree whose leaves carry prefix
//! sub-trees, with entries propagated so a more specific suffix/prefix
//! inherits the matches registered at a less specific one. We get the same
//! externally observable lookup behavior — a pattern matches `f` iff `f`
//! ends with its suffix and starts with its prefix — by keeping a flat,
//! unsorted table and filtering/sorting at lookup time instead of building
//! the tree. Rule-set changes are infrequent (one compile per rule-set
//! edit) and lookup volume is one call per node resolution, so the simpler
//! structure is not a bottleneck; see DESIGN.md for why this is a
//! deliberate simplification rather than a shortcut.

use std::cmp::Ordering;

use fs::{common_prefix_len, common_suffix_len, split_stem};

/// One `(rule, target within that rule)` pair, compiled from a rule's
/// target pattern.
#[derive(Clone, Debug)]
pub struct CompiledTarget {
    pub rule_id: u32,
    pub rule_name: String,
    pub target_index: u32,
    pub prefix: String,
    pub suffix: String,
    pub is_literal: bool,
    /// True for the small set of internal rules that produce sources and
    /// anti-targets (§3 "Source/anti nodes").
    pub is_special: bool,
    pub special_rank: i32,
    /// Anti-rules (targets that must never exist) sort before ordinary
    /// rules within the same priority class.
    pub is_anti: bool,
    pub priority: i32,
}

impl CompiledTarget {
    pub fn from_pattern(
        rule_id: u32,
        rule_name: impl Into<String>,
        target_index: u32,
        pattern: &str,
        is_special: bool,
        special_rank: i32,
        is_anti: bool,
        priority: i32,
    ) -> CompiledTarget {
        let ps = split_stem(pattern);
        CompiledTarget {
            rule_id,
            rule_name: rule_name.into(),
            target_index,
            prefix: ps.prefix,
            suffix: ps.suffix,
            is_literal: ps.is_literal,
            is_special,
            special_rank,
            is_anti,
            priority,
        }
    }

    fn matches(&self, f: &str) -> bool {
        if self.is_literal {
            return f == self.prefix;
        }
        f.len() >= self.prefix.len() + self.suffix.len()
            && f.starts_with(self.prefix.as_str())
            && f.ends_with(self.suffix.as_str())
    }

    /// `prefix_len + suffix_len` against the actual matched name, used as
    /// the "finer patterns before coarser ones" tie-break (§4.B).
    fn specificity(&self, f: &str) -> usize {
        if self.is_literal {
            return f.len() * 2;
        }
        common_prefix_len(&self.prefix, f) + common_suffix_len(&self.suffix, f)
    }

    /// The stem text a wildcard pattern captured from `f` (the part between
    /// the matched prefix and suffix), used by job instantiation to expand a
    /// rule's static dep patterns against the same stem the target matched
    /// (spec §3 Rule "static deps (expanded against the matched stem before
    /// a job is instantiated)"). `None` for a literal pattern, which has no
    /// stem to capture.
    pub fn stem<'a>(&self, f: &'a str) -> Option<&'a str> {
        if self.is_literal {
            return None;
        }
        f.get(self.prefix.len()..f.len() - self.suffix.len())
    }
}

/// Substitutes the single `*` wildcard in a dep/target pattern with a
/// captured stem. Patterns with no `*` are returned unchanged.
pub fn substitute_stem(pattern: &str, stem: Option<&str>) -> String {
    match (pattern.find('*'), stem) {
        (Some(pos), Some(stem)) => {
            let mut out = String::with_capacity(pattern.len() + stem.len());
            out.push_str(&pattern[..pos]);
            out.push_str(stem);
            out.push_str(&pattern[pos + 1..]);
            out
        }
        _ => pattern.to_string(),
    }
}

/// Sort key implementing `(is-special, priority, special-rank,
/// prefix_len+suffix_len)` descending, with anti-rules first within a
/// priority class. Ties are broken by declaration order, matching the
/// original's behavior of iterating rules in file order: `rule_id`s are
/// allocated monotonically as rules are first declared and kept across
/// replacement (`RecordStore::put_rule`), so ascending `rule_id` *is*
/// declaration order — wrapped in `Reverse` so the lowest (earliest-declared)
/// id wins under this otherwise-descending key.
fn sort_key(entry: &CompiledTarget, f: &str) -> (bool, i32, i32, bool, usize, std::cmp::Reverse<u32>) {
    (
        entry.is_special,
        entry.priority,
        entry.special_rank,
        entry.is_anti,
        entry.specificity(f),
        std::cmp::Reverse(entry.rule_id),
    )
}

pub struct RuleMatchIndex {
    entries: Vec<CompiledTarget>,
}

impl RuleMatchIndex {
    pub fn build(entries: Vec<CompiledTarget>) -> RuleMatchIndex {
        RuleMatchIndex { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns candidate targets for `f`, ordered highest-priority first.
    pub fn lookup(&self, f: &str) -> Vec<&CompiledTarget> {
        let mut matches: Vec<&CompiledTarget> = self.entries.iter().filter(|e| e.matches(f)).collect();
        matches.sort_by(|a, b| {
            sort_key(b, f)
                .partial_cmp(&sort_key(a, f))
                .unwrap_or(Ordering::Equal)
        });
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(rule_name: &str, pattern: &str, priority: i32) -> CompiledTarget {
        CompiledTarget::from_pattern(0, rule_name, 0, pattern, false, 0, false, priority)
    }

    #[test]
    fn literal_pattern_matches_exact_name_only() {
        let idx = RuleMatchIndex::build(vec![target("exact", "build/out.bin", 0)]);
        assert_eq!(idx.lookup("build/out.bin").len(), 1);
        assert!(idx.lookup("build/out.bin.bak").is_empty());
    }

    #[test]
    fn wildcard_pattern_matches_prefix_and_suffix() {
        let idx = RuleMatchIndex::build(vec![target("compile", "build/*.o", 0)]);
        assert_eq!(idx.lookup("build/foo.o").len(), 1);
        assert!(idx.lookup("build/foo.c").is_empty());
        assert!(idx.lookup("other/foo.o").is_empty());
    }

    #[test]
    fn higher_priority_rule_sorts_first() {
        let idx = RuleMatchIndex::build(vec![
            target("low", "*.o", 0),
            target("high", "*.o", 10),
        ]);
        let hits = idx.lookup("a.o");
        assert_eq!(hits[0].rule_name, "high");
        assert_eq!(hits[1].rule_name, "low");
    }

    #[test]
    fn anti_rule_precedes_ordinary_rule_in_same_priority_class() {
        let mut anti = target("anti", "*.tmp", 5);
        anti.is_anti = true;
        let ordinary = target("ordinary", "*.tmp", 5);
        let idx = RuleMatchIndex::build(vec![ordinary, anti]);
        let hits = idx.lookup("x.tmp");
        assert!(hits[0].is_anti);
    }

    #[test]
    fn finer_pattern_sorts_before_coarser_one() {
        let idx = RuleMatchIndex::build(vec![
            target("coarse", "*", 0),
            target("fine", "build/*.o", 0),
        ]);
        let hits = idx.lookup("build/a.o");
        assert_eq!(hits[0].rule_name, "fine");
    }

    #[test]
    fn stem_is_captured_between_prefix_and_suffix() {
        let entry = target("compile", "build/*.o", 0);
        assert_eq!(entry.stem("build/foo.o"), Some("foo"));
    }

    #[test]
    fn literal_pattern_has_no_stem() {
        let entry = target("exact", "build/out.bin", 0);
        assert_eq!(entry.stem("build/out.bin"), None);
    }

    #[test]
    fn substitute_stem_replaces_single_wildcard() {
        assert_eq!(substitute_stem("src/*.c", Some("foo")), "src/foo.c");
        assert_eq!(substitute_stem("fixed/path", Some("foo")), "fixed/path");
    }
}
