//! Path and filesystem-access vocabulary shared across the autodep record
//! layer, the sandbox, and the persistent store: what a repo-relative path
//! looks like, which "world" a path resolves into, and which accesses were
//! observed against it.

use std::cmp::min;
use std::fmt;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};

pub mod simple_paths;

/// A path relative to the repository root. Absolute paths, Windows path
/// prefixes, and `..` components that would escape the root are rejected at
/// construction so every consumer downstream can treat a `RelativePath` as
/// already-sandboxed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    pub fn empty() -> RelativePath {
        RelativePath(PathBuf::new())
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<RelativePath, String> {
        let mut relative = PathBuf::new();
        let candidate = path.as_ref();
        for component in candidate.components() {
            match component {
                Component::Prefix(_) => {
                    return Err(format!("windows paths are not allowed: {candidate:?}"))
                }
                Component::RootDir => {
                    return Err(format!("absolute paths are not allowed: {candidate:?}"))
                }
                Component::CurDir => continue,
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(format!(
                            "relative paths that escape the root are not allowed: {candidate:?}"
                        ));
                    }
                }
                Component::Normal(part) => relative.push(part),
            }
        }
        Ok(RelativePath(relative))
    }

    pub fn to_str(&self) -> Option<&str> {
        self.0.to_str()
    }

    pub fn join(&self, other: &RelativePath) -> RelativePath {
        RelativePath(self.0.join(&other.0))
    }
}

impl Deref for RelativePath {
    type Target = PathBuf;

    fn deref(&self) -> &PathBuf {
        &self.0
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Which "world" a resolved path lands in. The autodep record layer (§4.C)
/// tags every access with one of these so the job-exec supervisor can decide
/// what, if anything, to report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// Inside the repository proper.
    Repo,
    /// Inside a declared dependency directory outside the repo.
    Dep,
    /// Inside a declared source directory.
    SrcDirs,
    /// The repo root itself.
    Root,
    /// Inside the job's private tmp.
    Tmp,
    /// Under `/proc`.
    Proc,
    /// Inside the admin dir.
    Admin,
    /// Anywhere else.
    Ext,
}

/// The kind of filesystem access a job performed against a path, as reported
/// by the autodep record layer. Three bits, combined into a mask on `Dep`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Access {
    /// A symlink was traversed or read.
    Lnk,
    /// The regular content of the file was read (open+read, exec, etc).
    Reg,
    /// Only metadata was observed (stat, access, etc).
    Stat,
}

/// A set of `Access` bits, small enough to copy by value; stored inline on
/// every `Dep` record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AccessMask(u8);

impl AccessMask {
    pub const EMPTY: AccessMask = AccessMask(0);

    fn bit(access: Access) -> u8 {
        match access {
            Access::Lnk => 0b001,
            Access::Reg => 0b010,
            Access::Stat => 0b100,
        }
    }

    pub fn with(mut self, access: Access) -> AccessMask {
        self.0 |= Self::bit(access);
        self
    }

    pub fn contains(&self, access: Access) -> bool {
        self.0 & Self::bit(access) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if `other` has no bits that `self` lacks, i.e. `other` reveals
    /// nothing new — used by the autodep de-duplication cache (§4.C).
    pub fn subsumes(&self, other: AccessMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: AccessMask) -> AccessMask {
        AccessMask(self.0 | other.0)
    }
}

/// Splits a literal target pattern at the first/last stem marker (`%` or
/// `{}` depending on rule syntax — here modeled simply as `*`) into a prefix
/// and suffix, as used by the rule-matching index (§4.B). An all-literal
/// pattern (no stem) gets the sentinel suffix `""` with `is_literal = true`
/// so it is never conflated with a pattern whose suffix happens to be empty.
pub struct PrefixSuffix {
    pub prefix: String,
    pub suffix: String,
    pub is_literal: bool,
}

pub fn split_stem(pattern: &str) -> PrefixSuffix {
    match (pattern.find('*'), pattern.rfind('*')) {
        (Some(first), Some(last)) => PrefixSuffix {
            prefix: pattern[..first].to_string(),
            suffix: pattern[last + 1..].to_string(),
            is_literal: false,
        },
        _ => PrefixSuffix {
            prefix: pattern.to_string(),
            suffix: String::new(),
            is_literal: true,
        },
    }
}

/// Longest common prefix length between two strings, used to rank candidate
/// matches by `prefix_len + suffix_len` (§4.B ordering rule).
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    let max = min(a.len(), b.len());
    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .take(max)
        .take_while(|(x, y)| x == y)
        .count()
}

/// Longest common suffix length, computed by comparing reversed bytes.
pub fn common_suffix_len(a: &str, b: &str) -> usize {
    let max = min(a.len(), b.len());
    a.as_bytes()
        .iter()
        .rev()
        .zip(b.as_bytes().iter().rev())
        .take(max)
        .take_while(|(x, y)| x == y)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_rejects_absolute() {
        assert!(RelativePath::new("/etc/passwd").is_err());
    }

    #[test]
    fn relative_path_rejects_escaping_parent() {
        assert!(RelativePath::new("../outside").is_err());
    }

    #[test]
    fn relative_path_normalizes_parent_within_root() {
        let p = RelativePath::new("a/b/../c").unwrap();
        assert_eq!(p.to_str(), Some("a/c"));
    }

    #[test]
    fn access_mask_tracks_subsumption() {
        let reg_only = AccessMask::EMPTY.with(Access::Reg);
        let reg_and_stat = reg_only.with(Access::Stat);
        assert!(reg_and_stat.subsumes(reg_only));
        assert!(!reg_only.subsumes(reg_and_stat));
    }

    #[test]
    fn split_stem_literal_pattern() {
        let ps = split_stem("foo/bar.txt");
        assert!(ps.is_literal);
        assert_eq!(ps.prefix, "foo/bar.txt");
    }

    #[test]
    fn split_stem_with_wildcard() {
        let ps = split_stem("build/*.o");
        assert!(!ps.is_literal);
        assert_eq!(ps.prefix, "build/");
        assert_eq!(ps.suffix, ".o");
    }
}
