//! Thin CLI front-end (spec §6): `make`/`show`/`forget`/`mark`/`debug`/
//! `dump_job`, the same operations §6 describes as RPCs to a running
//! engine. The generic RPC transport those are framed as is out of scope
//! per spec §1 (no network/socket server in this repo, DESIGN.md), so this
//! binary constructs `Config`/`RecordStore`/`Graph`/`MakeEngine`/
//! `LocalBackend`/`ReqController` directly and drives them in-process,
//! mirroring `engine::backend::local`'s own resolution of the local-vs-RPC
//! Open Question.

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use engine::backend::local::LocalBackend;
use engine::error::ExitCode;
use engine::{Action, Config, EngineError, Graph, MakeEngine, ReqController};
use fs::RelativePath;
use record_store::RecordStore;
use task_executor::Executor;
use workunit_store::WorkunitStore;

#[derive(Parser)]
#[command(name = "lmake", about = "Content-addressed build engine driver")]
struct Opt {
    /// Repository root; defaults to the current working directory.
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Suppress all but warnings.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build (or check) one or more targets.
    Make {
        targets: Vec<String>,
        /// Only check whether targets are up to date; don't run anything.
        #[arg(long)]
        dry_run: bool,
        /// Caps concurrent local job execution, overriding `engine.toml`.
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Bypass the job cache for this Req.
        #[arg(long)]
        no_cache: bool,
    },
    /// Print the persisted node/job/rule state for one target.
    Show { target: String },
    /// Clear a target's producer job back to "never run", forcing a full
    /// rebuild on the next `make` regardless of recorded error state.
    Forget { targets: Vec<String> },
    /// Freeze or unfreeze the rule that currently produces `target`
    /// (glossary "Frozen": trust the current state and never rebuild).
    Mark {
        target: String,
        #[arg(long, conflicts_with = "unfrozen")]
        frozen: bool,
        #[arg(long)]
        unfrozen: bool,
    },
    /// Dump a node's full persisted record plus its producer job and rule,
    /// for troubleshooting why a target built the way it did.
    Debug { target: String },
    /// Dump one job record as JSON by its numeric id.
    DumpJob { job_id: u32 },
}

fn main() -> ProcessExitCode {
    let opt = Opt::parse();
    logging::init(logging::level_from_verbosity(opt.quiet, opt.verbose));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");

    match runtime.block_on(run(opt)) {
        Ok(code) => to_process_exit_code(code),
        Err(e) => {
            log::error!("{e}");
            to_process_exit_code(e.exit_code())
        }
    }
}

fn to_process_exit_code(code: ExitCode) -> ProcessExitCode {
    ProcessExitCode::from(code as u8)
}

async fn run(opt: Opt) -> Result<ExitCode, EngineError> {
    let repo_root = match opt.repo {
        Some(path) => path,
        None => std::env::current_dir().map_err(|e| EngineError::System(format!("getcwd: {e}")))?,
    };

    let mut config = Config::load(&repo_root).map_err(EngineError::Format)?;

    let executor = Executor::new();
    let store = RecordStore::open(
        &repo_root.join(&config.admin_dir).join("graph"),
        config.store_map_size_bytes,
        executor.to_borrowed(),
    )
    .map_err(EngineError::Store)?;
    let graph = Graph::new(store).map_err(EngineError::Store)?;

    match opt.cmd {
        Command::Make { targets, dry_run, jobs, no_cache } => {
            if let Some(jobs) = jobs {
                config.local_jobs_cap = jobs.max(1);
            }
            if no_cache {
                config.cache_enabled = false;
            }
            let workunits = Arc::new(WorkunitStore::new());
            let backend = LocalBackend::new(repo_root.clone(), config, executor.clone(), Arc::clone(&workunits))
                .map_err(EngineError::System)?;
            let make = Arc::new(MakeEngine::new(graph.clone(), Arc::new(backend)));
            let controller = ReqController::new(graph, make, workunits);

            let targets = parse_targets(&targets)?;
            let action = if dry_run { Action::Status } else { Action::Run };
            let summary = controller.run(&targets, action).await.map_err(EngineError::BuildFailed)?;

            for outcome in &summary.targets {
                println!("{}: {}", outcome.target, outcome.status);
            }
            if summary.all_ok() {
                Ok(ExitCode::Success)
            } else {
                let failed: Vec<String> = summary
                    .targets
                    .iter()
                    .filter(|t| t.status.is_failure())
                    .map(|t| format!("{} ({})", t.target, t.status))
                    .collect();
                Err(EngineError::BuildFailed(failed.join(", ")))
            }
        }

        Command::Show { target } => {
            let path = RelativePath::new(&target).map_err(EngineError::Usage)?;
            let node_id = graph.get_or_create_node(&path).map_err(EngineError::Store)?;
            let node = graph
                .node(node_id)
                .map_err(EngineError::Store)?
                .ok_or_else(|| EngineError::System("node vanished".to_string()))?;
            println!("node {target}:");
            println!("  fingerprint: {:?}", node.fingerprint);
            println!("  buildability: {:?}", node.buildability);
            println!("  flags: {:?}", node.flags);
            println!("  conform_job: {:?}", node.conform_job());
            Ok(ExitCode::Success)
        }

        Command::Forget { targets } => {
            for target in parse_targets(&targets)? {
                let node_id = graph.get_or_create_node(&target).map_err(EngineError::Store)?;
                let node = graph
                    .node(node_id)
                    .map_err(EngineError::Store)?
                    .ok_or_else(|| EngineError::System("node vanished".to_string()))?;
                let Some(job_id) = node.conform_job() else {
                    continue;
                };
                let mut job = graph
                    .job(job_id)
                    .map_err(EngineError::Store)?
                    .ok_or_else(|| EngineError::System("job vanished".to_string()))?;
                job.last_run_status = record_store::LastRunStatus::New;
                graph.put_job(job_id, &job).map_err(EngineError::Store)?;
            }
            Ok(ExitCode::Success)
        }

        Command::Mark { target, frozen, unfrozen } => {
            let path = RelativePath::new(&target).map_err(EngineError::Usage)?;
            let node_id = graph.get_or_create_node(&path).map_err(EngineError::Store)?;
            let node = graph
                .node(node_id)
                .map_err(EngineError::Store)?
                .ok_or_else(|| EngineError::System("node vanished".to_string()))?;
            let job_id = node
                .conform_job()
                .ok_or_else(|| EngineError::Usage(format!("{target} has no producer job to mark")))?;
            let job = graph
                .job(job_id)
                .map_err(EngineError::Store)?
                .ok_or_else(|| EngineError::System("job vanished".to_string()))?;
            let mut rule = graph
                .rule(job.rule)
                .map_err(EngineError::Store)?
                .ok_or_else(|| EngineError::System("rule vanished".to_string()))?;
            rule.frozen = frozen || !unfrozen && rule.frozen;
            graph.put_rule(Some(job.rule), rule).map_err(EngineError::Store)?;
            Ok(ExitCode::Success)
        }

        Command::Debug { target } => {
            let path = RelativePath::new(&target).map_err(EngineError::Usage)?;
            let node_id = graph.get_or_create_node(&path).map_err(EngineError::Store)?;
            let node = graph
                .node(node_id)
                .map_err(EngineError::Store)?
                .ok_or_else(|| EngineError::System("node vanished".to_string()))?;
            println!(
                "node: {}",
                serde_json::to_string_pretty(&node).map_err(|e| EngineError::Format(e.to_string()))?
            );
            if let Some(job_id) = node.conform_job() {
                if let Some(job) = graph.job(job_id).map_err(EngineError::Store)? {
                    println!("job {}: {:#?}", job_id.0, job);
                    if let Some(rule) = graph.rule(job.rule).map_err(EngineError::Store)? {
                        println!("rule: {:#?}", rule);
                    }
                }
            }
            Ok(ExitCode::Success)
        }

        Command::DumpJob { job_id } => {
            let id = record_store::JobId(job_id);
            let job = graph
                .job(id)
                .map_err(EngineError::Store)?
                .ok_or_else(|| EngineError::Usage(format!("no such job: {job_id}")))?;
            println!("{}", serde_json::to_string_pretty(&job).map_err(|e| EngineError::Format(e.to_string()))?);
            Ok(ExitCode::Success)
        }
    }
}

fn parse_targets(targets: &[String]) -> Result<Vec<RelativePath>, EngineError> {
    if targets.is_empty() {
        return Err(EngineError::Usage("no targets given".to_string()));
    }
    targets.iter().map(|t| RelativePath::new(t).map_err(EngineError::Usage)).collect()
}
