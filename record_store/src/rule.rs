//! The `Rule` entity (spec §3): the full specification for a family of jobs.
//! Two orthogonal fingerprints — one over the command, one over resources —
//! so a resources-only edit resets only the "resources ok" bit on every job
//! of that rule, not the "command ok" bit (§3 invariant, §4.F step 1).

use std::collections::BTreeMap;

use hashing::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};

/// Per-target attribute bits (spec glossary: "Tflags").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tflags {
    /// Disk content is trusted even if it was modified outside the engine.
    pub manual_ok: bool,
    /// Compute and compare a CRC for this target (off for targets whose
    /// content is known to be nondeterministic, e.g. timestamped archives).
    pub crc: bool,
    /// Don't complain if this target wasn't actually written.
    pub incremental: bool,
}

/// Per-dep attribute bits (spec §3 "Dep flags").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dflags {
    pub static_dep: bool,
    pub required: bool,
    pub critical: bool,
    pub essential: bool,
    pub ignore_error: bool,
    pub top: bool,
}

/// A named resource request, e.g. `("cpu", 1)`, `("mem_mb", 512)`. Units are
/// opaque to the engine; only the backend layer's resource pools interpret
/// them (§4.G).
pub type Resources = BTreeMap<String, u64>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// Target name patterns, in declaration order; `rule_match` compiles
    /// these into the suffix/prefix index (component B).
    pub target_patterns: Vec<String>,
    /// Statically-known dep patterns (expanded against the matched stem
    /// before a job is instantiated).
    pub static_dep_patterns: Vec<String>,
    pub cmd: String,
    pub resources: Resources,
    pub default_tflags: Tflags,
    pub default_dflags: Dflags,
    pub priority: i32,
    pub is_special: bool,
    pub special_rank: i32,
    pub is_anti: bool,
    pub timeout: Option<std::time::Duration>,
    pub n_retries: u32,
    pub cacheable: bool,
    /// "Frozen": trust the current state and never rebuild (glossary).
    pub frozen: bool,
    pub cmd_gen: u64,
    pub rsrcs_gen: u64,
}

impl Rule {
    /// The fingerprint that changing `cmd` invalidates. Excludes
    /// `resources` deliberately — see the module doc.
    pub fn cmd_fingerprint(&self) -> Fingerprint {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.cmd.as_bytes());
        buf.push(0);
        for pattern in &self.target_patterns {
            buf.extend_from_slice(pattern.as_bytes());
            buf.push(0);
        }
        for pattern in &self.static_dep_patterns {
            buf.extend_from_slice(pattern.as_bytes());
            buf.push(0);
        }
        Digest::of_bytes(&buf).hash
    }

    /// The fingerprint that changing `resources` invalidates.
    pub fn rsrcs_fingerprint(&self) -> Fingerprint {
        let mut buf = Vec::new();
        for (key, value) in &self.resources {
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&value.to_le_bytes());
        }
        Digest::of_bytes(&buf).hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> Rule {
        Rule {
            name: "compile".to_string(),
            target_patterns: vec!["build/*.o".to_string()],
            static_dep_patterns: vec!["src/*.c".to_string()],
            cmd: "cc -c".to_string(),
            resources: Resources::new(),
            default_tflags: Tflags::default(),
            default_dflags: Dflags::default(),
            priority: 0,
            is_special: false,
            special_rank: 0,
            is_anti: false,
            timeout: None,
            n_retries: 0,
            cacheable: true,
            frozen: false,
            cmd_gen: 0,
            rsrcs_gen: 0,
        }
    }

    #[test]
    fn cmd_fingerprint_changes_with_cmd_text() {
        let base = rule();
        let mut edited = base.clone();
        edited.cmd = "cc -c -O2".to_string();
        assert_ne!(base.cmd_fingerprint(), edited.cmd_fingerprint());
    }

    #[test]
    fn rsrcs_fingerprint_independent_of_cmd() {
        let base = rule();
        let mut edited = base.clone();
        edited.cmd = "cc -c -O2".to_string();
        assert_eq!(base.rsrcs_fingerprint(), edited.rsrcs_fingerprint());
    }

    #[test]
    fn rsrcs_fingerprint_changes_with_resources() {
        let mut base = rule();
        base.resources.insert("cpu".to_string(), 1);
        let mut edited = base.clone();
        edited.resources.insert("cpu".to_string(), 2);
        assert_ne!(base.rsrcs_fingerprint(), edited.rsrcs_fingerprint());
        assert_eq!(base.cmd_fingerprint(), edited.cmd_fingerprint());
    }
}
