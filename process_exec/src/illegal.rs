//! Illegal-pattern detection (§4.E point 6): a job's accesses are checked
//! against what it was told its deps/targets were. Three patterns are
//! flagged as human-readable error lines appended to the `JobDigest`:
//! writing to a declared dep, writing to a source node, and a declared
//! static target that doesn't exist when the job otherwise succeeded.

use std::path::Path;

use autodep::report::Recorder;

use crate::rpc::{DepSpec, TargetSpec};

pub fn detect_illegal_patterns(repo_root: &Path, targets: &[TargetSpec], deps: &[DepSpec], recorder: &Recorder, is_source: impl Fn(&Path) -> bool, job_succeeded: bool) -> Vec<String> {
    let mut errors = Vec::new();

    for dep in deps {
        let real = repo_root.join(dep.path.as_path());
        if recorder.get(&real).map(|r| r.write).unwrap_or(false) {
            errors.push(format!("job wrote to a declared dep: {}", dep.path));
        }
    }

    for (real, report) in recorder.reports() {
        if report.write && is_source(real) {
            errors.push(format!("job wrote to a source file: {}", real.display()));
        }
    }

    if job_succeeded {
        for target in targets {
            if !target.static_target {
                continue;
            }
            let real = repo_root.join(target.path.as_path());
            if !real.exists() {
                errors.push(format!("missing static target: {}", target.path));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodep::node_state::ContentState;
    use autodep::ops::{Operation, Outcome};
    use fs::RelativePath;
    use std::time::Instant;

    #[test]
    fn write_to_declared_dep_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let real = root.join("in.c");
        let mut recorder = Recorder::new();
        recorder.apply(
            &real,
            Operation::Open {
                write: true,
                create: false,
                truncate: false,
            },
            ContentState::Regular,
            Instant::now(),
            Outcome::Confirmed,
        );
        let deps = vec![DepSpec {
            path: RelativePath::new("in.c").unwrap(),
            critical: false,
            previous_fingerprint: None,
        }];
        let errors = detect_illegal_patterns(&root, &[], &deps, &recorder, |_| false, true);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("wrote to a declared dep"));
    }

    #[test]
    fn write_to_source_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let real = root.join("src/main.c");
        let mut recorder = Recorder::new();
        recorder.apply(
            &real,
            Operation::Open {
                write: true,
                create: false,
                truncate: false,
            },
            ContentState::Regular,
            Instant::now(),
            Outcome::Confirmed,
        );
        let errors = detect_illegal_patterns(&root, &[], &[], &recorder, |p| p == real, true);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("wrote to a source file"));
    }

    #[test]
    fn missing_static_target_after_success_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let targets = vec![TargetSpec {
            path: RelativePath::new("out.o").unwrap(),
            static_target: true,
            incremental: false,
            previous_fingerprint: None,
        }];
        let errors = detect_illegal_patterns(&root, &targets, &[], &Recorder::new(), |_| false, true);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("missing static target"));
    }

    #[test]
    fn missing_target_after_failure_is_not_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let targets = vec![TargetSpec {
            path: RelativePath::new("out.o").unwrap(),
            static_target: true,
            incremental: false,
            previous_fingerprint: None,
        }];
        let errors = detect_illegal_patterns(&root, &targets, &[], &Recorder::new(), |_| false, false);
        assert!(errors.is_empty());
    }

    #[test]
    fn clean_job_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let errors = detect_illegal_patterns(&root, &[], &[], &Recorder::new(), |_| false, true);
        assert!(errors.is_empty());
    }
}
