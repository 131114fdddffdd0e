//! Supervisor ↔ engine control messages (spec §4.E, wire shapes §6):
//! `Start`/`StartReply` at job launch, `ChkDeps`/`DepInfos`/`LiveOut` during
//! the run, `End` at exit. These are plain serde structs rather than a
//! generated protobuf schema — this repo's RPC boundaries consistently use
//! `serde_json` over a length-prefixed stream (see `record_store`/`store`'s
//! own choice of serde over bincode).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use fs::RelativePath;
use hashing::Fingerprint;
use serde::{Deserialize, Serialize};

use autodep::AutodepEnv;
use sandbox::MountPlan;

use crate::digest::JobDigest;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SeqId(pub u64);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartRequest {
    pub seq_id: SeqId,
    pub job_id: JobId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetSpec {
    pub path: RelativePath,
    /// Declared static (required to exist after a successful run).
    pub static_target: bool,
    /// Incremental targets are not washed (unlinked) before the job runs —
    /// the job is expected to read its own prior content.
    pub incremental: bool,
    /// The node's last-recorded content fingerprint, reused verbatim as a
    /// target's "tag" when the job fails or the target isn't to be CRC'd.
    pub previous_fingerprint: Option<Fingerprint>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepSpec {
    pub path: RelativePath,
    pub critical: bool,
    pub previous_fingerprint: Option<Fingerprint>,
}

/// Everything the supervisor needs to run one job (§4.E point 1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartReply {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub autodep_env: AutodepEnv,
    pub sandbox_plan: MountPlan,
    pub targets: Vec<TargetSpec>,
    pub deps: Vec<DepSpec>,
    pub stdin_path: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub small_id: u32,
    pub cache_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveOut {
    pub text: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChkDepsRequest {
    pub deps: Vec<RelativePath>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChkDepsReply {
    Yes,
    No,
    Maybe,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepInfosRequest {
    pub deps: Vec<RelativePath>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepInfo {
    pub ok: bool,
    pub fingerprint: Option<Fingerprint>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepInfosReply {
    pub infos: Vec<DepInfo>,
}

/// Per-job resource usage reported alongside the digest (§4.E point 7).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct JobStats {
    pub user_cpu_secs: f64,
    pub wall_secs: f64,
    pub max_rss_kb: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndRequest {
    pub digest: JobDigest,
    pub stats: JobStats,
    pub tmp_dir: Option<PathBuf>,
    pub dynamic_env: BTreeMap<String, String>,
}
