//! A lightweight pre-op content marker, distinct from `record_store`'s
//! `ContentFingerprint`: the autodep layer runs inside the traced process
//! and must stay cheap (no hashing, no store access), so it only records
//! *which kind* of thing was there before the syscall, leaving the actual
//! content hash to the job-exec supervisor's post-run digest pass (§4.E).

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentState {
    Absent,
    Regular,
    Link,
    /// Existed but couldn't cheaply be classified (e.g. a stat that raced
    /// with another process); treated like "maybe different" downstream.
    Unknown,
}

impl ContentState {
    pub fn from_lstat(exists: bool, is_symlink: bool) -> ContentState {
        match (exists, is_symlink) {
            (false, _) => ContentState::Absent,
            (true, true) => ContentState::Link,
            (true, false) => ContentState::Regular,
        }
    }
}
