//! The "simple path" suppression policy from §4.C: access reports are
//! dropped for well-known system directories when the path does not escape
//! them, so every job doesn't generate noise deps on `/usr/lib/libc.so` and
//! friends. The exact list is left as a configuration point (open question,
//! spec §9); these are the defaults.

const DEFAULT_SIMPLE_DIRS: &[&str] = &["/bin", "/dev", "/etc", "/lib", "/lib64", "/sys", "/usr", "/var"];

#[derive(Clone, Debug)]
pub struct SimplePathPolicy {
    dirs: Vec<String>,
}

impl Default for SimplePathPolicy {
    fn default() -> Self {
        SimplePathPolicy {
            dirs: DEFAULT_SIMPLE_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SimplePathPolicy {
    pub fn new(dirs: Vec<String>) -> Self {
        SimplePathPolicy { dirs }
    }

    /// True if `real` lives under one of the configured simple directories
    /// and does not later escape it (e.g. via `..` — callers pass an already
    /// lexically-normalized path, so this is a straightforward prefix test).
    pub fn is_simple(&self, real: &str) -> bool {
        self
            .dirs
            .iter()
            .any(|dir| real == dir.as_str() || real.starts_with(&format!("{dir}/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_default_dirs() {
        let policy = SimplePathPolicy::default();
        assert!(policy.is_simple("/usr/lib/libc.so"));
        assert!(policy.is_simple("/etc"));
        assert!(!policy.is_simple("/home/user/repo/src/main.rs"));
    }

    #[test]
    fn custom_dirs_override_defaults() {
        let policy = SimplePathPolicy::new(vec!["/opt/toolchain".to_string()]);
        assert!(policy.is_simple("/opt/toolchain/bin/cc"));
        assert!(!policy.is_simple("/usr/bin/cc"));
    }
}
