//! The per-job supervisor (§4.E): washes targets, enters the sandbox,
//! spawns the user command, collects its output and the autodep layer's
//! access reports, then computes the final `JobDigest` and stats.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use autodep::report::Recorder;
use autodep::tracer::{Tracer, TracerConfig};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use sandbox::{FileAction, ProducerOracle, Sandbox};
use task_executor::Executor;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::digest::{compute_job_digest, DigestInputs, JobDigest};
use crate::illegal::detect_illegal_patterns;
use crate::rpc::{JobStats, StartReply};

/// One chunk of a running job's output, mirroring the shape the local
/// backend's own child-collection loop uses (§4.E point 5).
#[derive(Debug)]
pub enum ChildOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub struct JobRunOutcome {
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub digest: JobDigest,
    pub stats: JobStats,
}

/// Every access this job's command is already known to have produced was
/// produced by this job — the supervisor is the sole writer into its own
/// sandbox while the job runs.
struct JobIsProducer;
impl ProducerOracle for JobIsProducer {
    fn produced_by_this_job(&self, _path: &Path) -> bool {
        true
    }
}

fn mkdir_and_unlink_actions(incremental: bool) -> Vec<FileAction> {
    let mut actions = vec![FileAction::Mkdir];
    if !incremental {
        actions.push(FileAction::Unlink {
            warn_if_foreign: true,
            quarantine_if_foreign: false,
        });
    }
    actions
}

/// Runs the pre-action wash for every declared target (§4.E point 2).
pub fn wash_targets(repo_root: &Path, reply: &StartReply, sbox: &Sandbox) -> Result<(), String> {
    let entries: Vec<_> = reply
        .targets
        .iter()
        .map(|target| (repo_root.join(target.path.as_path()), mkdir_and_unlink_actions(target.incremental)))
        .collect();
    sbox.wash_targets(&entries, &JobIsProducer).map(|_| ())
}

async fn collect_child_output(mut child: tokio::process::Child, live_out: &mut dyn FnMut(&[u8])) -> Result<(i32, Bytes, Bytes), String> {
    let stdout = child.stdout.take().ok_or("child stdout was not piped")?;
    let stderr = child.stderr.take().ok_or("child stderr was not piped")?;

    let stdout_stream: BoxStream<Result<ChildOutput, String>> = FramedRead::new(stdout, BytesCodec::new())
        .map(|res| res.map(|b| ChildOutput::Stdout(b.freeze())).map_err(|e| format!("reading stdout: {e}")))
        .boxed();
    let stderr_stream: BoxStream<Result<ChildOutput, String>> = FramedRead::new(stderr, BytesCodec::new())
        .map(|res| res.map(|b| ChildOutput::Stderr(b.freeze())).map_err(|e| format!("reading stderr: {e}")))
        .boxed();

    let mut combined = futures::stream::select(stdout_stream, stderr_stream);
    let mut stdout_buf = BytesMut::new();
    let mut stderr_buf = BytesMut::new();
    while let Some(chunk) = combined.next().await {
        match chunk? {
            ChildOutput::Stdout(b) => {
                live_out(&b);
                stdout_buf.extend_from_slice(&b);
            }
            ChildOutput::Stderr(b) => {
                live_out(&b);
                stderr_buf.extend_from_slice(&b);
            }
        }
    }

    let status = child.wait().await.map_err(|e| format!("waiting for child: {e}"))?;
    let exit_code = status.code().unwrap_or(-1);
    Ok((exit_code, stdout_buf.freeze(), stderr_buf.freeze()))
}

fn rusage_children() -> (f64, u64) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc != 0 {
        return (0.0, 0);
    }
    let user_cpu_secs = usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1_000_000.0;
    (user_cpu_secs, usage.ru_maxrss as u64)
}

/// Runs one job end to end: wash, sandbox, spawn, collect, digest.
#[allow(clippy::too_many_arguments)]
pub async fn run_job(
    executor: &Executor,
    crc_pool: &async_semaphore::AsyncSemaphore,
    repo_root: &Path,
    reply: &StartReply,
    sbox: &Sandbox,
    tracer: &dyn Tracer,
    tracer_config: &TracerConfig,
    recorder: &Recorder,
    is_source: impl Fn(&Path) -> bool,
    should_crc_target: impl Fn(&fs::RelativePath) -> bool,
    mut live_out: impl FnMut(&[u8]),
) -> Result<JobRunOutcome, String> {
    wash_targets(repo_root, reply, sbox)?;
    sbox.assemble()?;

    let start = Instant::now();

    let mut std_cmd = std::process::Command::new(reply.argv.first().ok_or("empty argv")?);
    std_cmd.args(&reply.argv[1..]);
    std_cmd.envs(reply.env.iter());
    std_cmd.env(autodep::AUTODEP_ENV_VAR, reply.autodep_env.to_env_value()?);
    std_cmd.stdin(Stdio::null());
    std_cmd.stdout(Stdio::piped());
    std_cmd.stderr(Stdio::piped());
    tracer.instrument(&mut std_cmd, tracer_config)?;

    let mut tokio_cmd = tokio::process::Command::from(std_cmd);
    let child = tokio_cmd.spawn().map_err(|e| format!("spawning job command: {e}"))?;

    let (exit_code, stdout, stderr) = collect_child_output(child, &mut live_out).await?;
    let wall_secs = start.elapsed().as_secs_f64();
    let (user_cpu_secs, max_rss_kb) = rusage_children();

    let job_succeeded = exit_code == 0;
    let inputs = DigestInputs {
        repo_root,
        targets: &reply.targets,
        deps: &reply.deps,
        job_failed: !job_succeeded,
    };
    let mut digest = compute_job_digest(executor, crc_pool, inputs, recorder, should_crc_target).await;
    digest.errors.extend(detect_illegal_patterns(repo_root, &reply.targets, &reply.deps, recorder, is_source, job_succeeded));

    sbox.teardown()?;

    Ok(JobRunOutcome {
        exit_code,
        stdout,
        stderr,
        digest,
        stats: JobStats {
            user_cpu_secs,
            wall_secs,
            max_rss_kb,
        },
    })
}

pub fn dynamic_env_overlay(reply: &StartReply) -> BTreeMap<String, String> {
    reply.env.clone()
}
