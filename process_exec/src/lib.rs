//! Job-exec supervisor (component E, spec §4.E): the process that actually
//! runs one job's command. Wraps the sandbox (component D) and autodep
//! tracer (component C) around a child process, collects its output, and
//! computes the post-run digest the make state machine (component F) and
//! job cache (component J) key off.
//!
//! Split into the wire types a real implementation would exchange with a
//! supervising engine (`rpc`), the digest computation that turns recorded
//! accesses into a `JobDigest` (`digest`), the post-run sanity checks
//! (`illegal`), and the actual run loop that ties sandbox assembly, tracer
//! instrumentation, and digesting together (`supervisor`).

pub mod digest;
pub mod illegal;
pub mod rpc;
pub mod supervisor;

pub use digest::{compute_job_digest, replay, Crc, DepDigest, DigestInputs, JobDigest, TargetDigest};
pub use illegal::detect_illegal_patterns;
pub use rpc::{
    ChkDepsReply, ChkDepsRequest, DepInfo, DepInfosReply, DepInfosRequest, DepSpec, EndRequest,
    JobId, JobStats, LiveOut, SeqId, StartReply, StartRequest, TargetSpec,
};
pub use supervisor::{dynamic_env_overlay, run_job, wash_targets, ChildOutput, JobRunOutcome};
