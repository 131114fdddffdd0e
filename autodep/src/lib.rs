//! The autodep record layer (component C): in-process interception of
//! filesystem syscalls, path resolution under the repo/tmp/source-dir
//! policy, and access reporting to the job-exec supervisor.

pub mod elf;
pub mod node_state;
pub mod ops;
pub mod path;
pub mod report;
pub mod tracer;

use std::path::PathBuf;

use fs::simple_paths::SimplePathPolicy;
use serde::{Deserialize, Serialize};

pub use ops::{Operation, Outcome, PendingOp};
pub use path::{solve, RealPathEnv, Solve, TmpViewMapping};
pub use report::{FileReport, Recorder};
pub use tracer::{AutodepMethod, Tracer, TracerConfig};

/// The serialized form of `LMAKE_AUTODEP_ENV` (§6): everything the autodep
/// child needs to reconstruct its `RealPathEnv` and reporting socket
/// without consulting the engine again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutodepEnv {
    pub repo_root: PathBuf,
    pub src_dirs: Vec<PathBuf>,
    pub admin_dir: PathBuf,
    pub tmp_physical: Option<PathBuf>,
    pub tmp_view: Option<PathBuf>,
    pub report_socket: PathBuf,
    pub simple_dirs: Vec<String>,
}

impl AutodepEnv {
    pub fn to_env_value(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("failed to serialize LMAKE_AUTODEP_ENV: {e}"))
    }

    pub fn from_env_value(value: &str) -> Result<AutodepEnv, String> {
        serde_json::from_str(value).map_err(|e| format!("failed to parse LMAKE_AUTODEP_ENV: {e}"))
    }

    pub fn real_path_env(&self) -> RealPathEnv {
        RealPathEnv {
            repo_root: self.repo_root.clone(),
            src_dirs: self.src_dirs.clone(),
            admin_dir: self.admin_dir.clone(),
            tmp_view: TmpViewMapping {
                physical: self.tmp_physical.clone(),
                view: self.tmp_view.clone(),
            },
        }
    }

    pub fn simple_path_policy(&self) -> SimplePathPolicy {
        if self.simple_dirs.is_empty() {
            SimplePathPolicy::default()
        } else {
            SimplePathPolicy::new(self.simple_dirs.clone())
        }
    }
}

/// Decides, before any expensive resolution work, whether an access against
/// `real` should be suppressed entirely (§4.C "Simple paths").
pub fn should_suppress(policy: &SimplePathPolicy, real: &std::path::Path) -> bool {
    real.to_str().map(|s| policy.is_simple(s)).unwrap_or(false)
}

pub const AUTODEP_ENV_VAR: &str = "LMAKE_AUTODEP_ENV";
