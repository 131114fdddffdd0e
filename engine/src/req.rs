//! The Req controller (component H, spec §4.H): the entry point a CLI
//! invocation actually drives. Resolves a requested target-pattern list to
//! nodes, hands each to the make state machine (component F), and folds the
//! per-target outcomes into the done/rerun/steady/hit/failed/frozen/clash/
//! unreachable summary spec §4.H point 5 describes — plus the dependency
//! cycle check §4.F point 5 calls for before a Req is allowed to drive any
//! work at all.
//!
//! §4.H's generic RPC transport (colored/prefixed audit lines streamed to a
//! remote client) is out of scope per spec §1; this repo emits the same
//! audit lines through `log` instead (DESIGN.md).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fs::RelativePath;
use record_store::{NodeId, RunStatus};
use workunit_store::{JobCost, Metric, WorkunitStore};

use crate::graph::Graph;
use crate::make::MakeEngine;
use crate::reason::JobReasonTag;
use crate::state::{Action, Level, ReqId, ReqInfo};

/// How one requested target settled, per spec §4.H point 5's summary
/// categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetStatus {
    /// Built for the first time.
    Done,
    /// Rebuilt because something it depends on (or its own command/resources)
    /// changed.
    Rerun,
    /// Already up to date; nothing needed to run.
    Steady,
    /// Served from the job cache (§4.J) rather than actually run.
    Hit,
    /// The job (or one of its required deps) ended in error.
    Failed,
    /// The rule (or job) is frozen: the engine trusted its current state
    /// without considering it for a rebuild.
    Frozen,
    /// Two jobs wrote this target concurrently.
    Clash,
    /// No rule can produce this target and it doesn't exist as a source.
    Unreachable,
}

impl TargetStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, TargetStatus::Failed | TargetStatus::Clash | TargetStatus::Unreachable)
    }
}

/// One requested target's final disposition.
#[derive(Clone, Debug)]
pub struct TargetOutcome {
    pub target: RelativePath,
    pub node: NodeId,
    pub status: TargetStatus,
}

/// What a single `ReqController::run` call produced: the per-target
/// breakdown plus a snapshot of the engine-wide counters it updated along
/// the way.
#[derive(Debug)]
pub struct ReqSummary {
    pub targets: Vec<TargetOutcome>,
    pub counters: HashMap<Metric, u64>,
}

impl ReqSummary {
    /// Spec §6 exit-code surface: a Req that produced any failing target
    /// maps to `ExitCode::BuildFailed` at the CLI layer.
    pub fn all_ok(&self) -> bool {
        !self.targets.iter().any(|t| t.status.is_failure())
    }
}

/// Drives Req lifecycles (spec §3 "A Req owns per-node and per-job analysis
/// state", §4.H): one controller can open many Reqs (each gets its own
/// `ReqId`/`ReqTable` inside `MakeEngine`), but the common case — and the
/// only one the CLI needs — is one target list in, one summary out.
pub struct ReqController {
    graph: Graph,
    make: Arc<MakeEngine>,
    workunits: Arc<WorkunitStore>,
    next_req_id: AtomicU64,
}

impl ReqController {
    pub fn new(graph: Graph, make: Arc<MakeEngine>, workunits: Arc<WorkunitStore>) -> ReqController {
        ReqController {
            graph,
            make,
            workunits,
            next_req_id: AtomicU64::new(1),
        }
    }

    /// Opens a Req over `targets`, drives each to `action` via `MakeEngine`,
    /// and closes the Req before returning (spec §4.H: a Req's analysis
    /// state is scoped to its own lifetime, not kept around afterwards).
    pub async fn run(&self, targets: &[RelativePath], action: Action) -> Result<ReqSummary, String> {
        let req_id = ReqId(self.next_req_id.fetch_add(1, Ordering::SeqCst));

        let mut node_ids = Vec::with_capacity(targets.len());
        for target in targets {
            let node_id = self.graph.get_or_create_node(target)?;
            if let Some(cycle) = self.detect_cycle(node_id)? {
                self.make.close_req(req_id);
                let names = cycle
                    .iter()
                    .filter_map(|id| self.graph.node(*id).ok().flatten())
                    .map(|n| n.name.to_str().unwrap_or("<non-utf8>").to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(format!("dependency cycle detected: {names}"));
            }
            node_ids.push(node_id);
        }

        let mut outcomes = Vec::with_capacity(node_ids.len());
        for (target, node_id) in targets.iter().zip(node_ids.iter()) {
            let info = self.make.make_node(req_id, *node_id, action).await?;
            let status = self.classify(*node_id, &info)?;
            self.record(status);
            log::info!("{}: {:?}", target, status);
            outcomes.push(TargetOutcome {
                target: target.clone(),
                node: *node_id,
                status,
            });
        }

        self.make.close_req(req_id);
        Ok(ReqSummary {
            targets: outcomes,
            counters: self.workunits.get_counters(),
        })
    }

    /// Best-known ETA for a not-yet-run job of `rule_name` (§4.H ETA),
    /// sourced from the rolling execution history `engine::backend` feeds on
    /// every completed run.
    pub fn estimate(&self, rule_name: &str) -> Option<JobCost> {
        self.workunits.estimate_job_cost(rule_name)
    }

    fn record(&self, status: TargetStatus) {
        match status {
            TargetStatus::Rerun => self.workunits.increment_counter(Metric::JobsRerun, 1),
            TargetStatus::Steady => self.workunits.increment_counter(Metric::JobsSteady, 1),
            TargetStatus::Frozen => self.workunits.increment_counter(Metric::JobsFrozen, 1),
            // Done/Hit/Failed are already counted per-job by `engine::backend`
            // as the job itself runs; Clash/Unreachable have no job to blame.
            TargetStatus::Done | TargetStatus::Hit | TargetStatus::Failed | TargetStatus::Clash | TargetStatus::Unreachable => {}
        }
    }

    fn classify(&self, node_id: NodeId, info: &ReqInfo) -> Result<TargetStatus, String> {
        if info.reason.tag() == JobReasonTag::Clash {
            return Ok(TargetStatus::Clash);
        }
        if info.reason.tag() == JobReasonTag::MissingStatic {
            return Ok(TargetStatus::Unreachable);
        }

        let node = self.graph.node(node_id)?.ok_or("node vanished during classification")?;
        let Some(job_id) = node.conform_job() else {
            return Ok(TargetStatus::Done);
        };
        let job = self.graph.job(job_id)?.ok_or("job vanished during classification")?;

        if let Some(rule) = self.graph.rule(job.rule)? {
            if rule.frozen {
                return Ok(TargetStatus::Frozen);
            }
        }
        if matches!(job.run_status, RunStatus::Err | RunStatus::DepErr | RunStatus::MissingStatic) {
            return Ok(TargetStatus::Failed);
        }
        if info.level == Level::Hit {
            return Ok(TargetStatus::Hit);
        }
        match info.reason.tag() {
            JobReasonTag::None => Ok(TargetStatus::Steady),
            JobReasonTag::New => Ok(TargetStatus::Done),
            _ => Ok(TargetStatus::Rerun),
        }
    }

    /// Walks `conform_job -> static_dep_nodes`/`deps` edges depth-first from
    /// `start`, the way `make_job_inner`'s own dep walk would, reporting the
    /// first repeated node as a cycle (§4.F point 5, §4.H's cycle report).
    /// This has no dedicated data structure: it just replays the same graph
    /// reads `make_job_inner` makes, with a path set instead of a `ReqTable`.
    fn detect_cycle(&self, start: NodeId) -> Result<Option<Vec<NodeId>>, String> {
        let mut path = Vec::new();
        let mut on_path = HashSet::new();
        self.visit(start, &mut path, &mut on_path)
    }

    fn visit(&self, node_id: NodeId, path: &mut Vec<NodeId>, on_path: &mut HashSet<NodeId>) -> Result<Option<Vec<NodeId>>, String> {
        if on_path.contains(&node_id) {
            path.push(node_id);
            return Ok(Some(path.clone()));
        }
        let Some(node) = self.graph.node(node_id)? else {
            return Ok(None);
        };
        let Some(job_id) = node.conform_job() else {
            return Ok(None);
        };
        path.push(node_id);
        on_path.insert(node_id);

        let job = self.graph.job(job_id)?.ok_or("job vanished during cycle check")?;
        let dep_nodes: Vec<NodeId> = if job.deps.is_empty() {
            job.static_dep_nodes.clone()
        } else {
            job.deps.iter().map(|dep| dep.node).collect()
        };
        for dep in dep_nodes {
            if let Some(cycle) = self.visit(dep, path, on_path)? {
                return Ok(Some(cycle));
            }
        }

        path.pop();
        on_path.remove(&node_id);
        Ok(None)
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TargetStatus::Done => "done",
            TargetStatus::Rerun => "rerun",
            TargetStatus::Steady => "steady",
            TargetStatus::Hit => "hit",
            TargetStatus::Failed => "failed",
            TargetStatus::Frozen => "frozen",
            TargetStatus::Clash => "clash",
            TargetStatus::Unreachable => "unreachable",
        };
        write!(f, "{text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use record_store::{ContentFingerprint, Dflags, Job, JobId, LastRunStatus, RecordStore, Resources, Rule, Tflags};
    use task_executor::Executor;

    use crate::make::{JobRunResult, JobRunner};

    struct AlwaysOk;
    #[async_trait]
    impl JobRunner for AlwaysOk {
        async fn run(&self, _graph: &Graph, _job_id: JobId, job: &Job) -> Result<JobRunResult, String> {
            Ok(JobRunResult {
                status: LastRunStatus::Ok,
                run_status: RunStatus::Ok,
                written: job
                    .targets
                    .iter()
                    .map(|t| (t.node, ContentFingerprint::Regular(hashing::EMPTY_FINGERPRINT)))
                    .collect(),
                from_cache: false,
            })
        }
    }

    /// Same as `AlwaysOk`, but counts invocations so a test can pin "the job
    /// was not resubmitted" rather than just the `TargetStatus` label a
    /// steady-but-still-resubmitted job would also report (spec §8
    /// scenario 2's idempotence property).
    #[derive(Default)]
    struct CountingOk {
        runs: std::sync::atomic::AtomicU64,
    }
    #[async_trait]
    impl JobRunner for CountingOk {
        async fn run(&self, _graph: &Graph, _job_id: JobId, job: &Job) -> Result<JobRunResult, String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(JobRunResult {
                status: LastRunStatus::Ok,
                run_status: RunStatus::Ok,
                written: job
                    .targets
                    .iter()
                    .map(|t| (t.node, ContentFingerprint::Regular(hashing::EMPTY_FINGERPRINT)))
                    .collect(),
                from_cache: false,
            })
        }
    }

    fn rule(target: &str, dep: &str) -> Rule {
        Rule {
            name: "compile".to_string(),
            target_patterns: vec![target.to_string()],
            static_dep_patterns: if dep.is_empty() { vec![] } else { vec![dep.to_string()] },
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

    fn controller() -> (tempfile::TempDir, ReqController) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 16 * 1024 * 1024, Executor::new()).unwrap();
        let graph = Graph::new(store).unwrap();
        let workunits = Arc::new(WorkunitStore::new());
        let make = Arc::new(MakeEngine::new(graph.clone(), Arc::new(AlwaysOk)));
        (dir, ReqController::new(graph, make, workunits))
    }

    #[tokio::test]
    async fn new_target_reports_done() {
        let (_dir, controller) = controller();
        controller.graph.put_rule(None, rule("out.bin", "")).unwrap();
        let target = RelativePath::new("out.bin").unwrap();
        let summary = controller.run(&[target], Action::Run).await.unwrap();
        assert_eq!(summary.targets.len(), 1);
        assert_eq!(summary.targets[0].status, TargetStatus::Done);
        assert!(summary.all_ok());
    }

    #[tokio::test]
    async fn repeated_run_of_unchanged_rule_reports_steady() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 16 * 1024 * 1024, Executor::new()).unwrap();
        let graph = Graph::new(store).unwrap();
        let workunits = Arc::new(WorkunitStore::new());
        let runner = Arc::new(CountingOk::default());
        let make = Arc::new(MakeEngine::new(graph.clone(), runner.clone()));
        let controller = ReqController::new(graph, make, workunits);

        controller.graph.put_rule(None, rule("out.bin", "")).unwrap();
        let target = RelativePath::new("out.bin").unwrap();
        controller.run(&[target.clone()], Action::Run).await.unwrap();
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        // A fresh Req over the same already-settled job: nothing changed
        // since it last ran, so the job's own force check finds no reason
        // and the target reports Steady rather than Done again — and,
        // unlike the label alone, the runner must not have been invoked a
        // second time (spec §8 scenario 2: "job is not resubmitted").
        let summary = controller.run(&[target], Action::Run).await.unwrap();
        assert_eq!(summary.targets[0].status, TargetStatus::Steady);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unbuildable_target_reports_unreachable_and_fails_the_req() {
        let (_dir, controller) = controller();
        let target = RelativePath::new("no_such_rule.out").unwrap();
        let summary = controller.run(&[target], Action::Run).await.unwrap();
        assert_eq!(summary.targets[0].status, TargetStatus::Unreachable);
        assert!(!summary.all_ok());
    }

    #[tokio::test]
    async fn self_dependent_rule_is_rejected_as_a_cycle() {
        let (_dir, controller) = controller();
        // A rule whose own target also satisfies its static dep: `ensure_producer`
        // instantiates a job whose `static_dep_nodes` includes the node it
        // is the conform job for, the simplest possible cycle shape.
        controller.graph.put_rule(None, rule("self.out", "self.out")).unwrap();
        let target = RelativePath::new("self.out").unwrap();
        let node_id = controller.graph.get_or_create_node(&target).unwrap();
        controller.graph.ensure_producer(node_id).unwrap();

        let err = controller.run(&[target], Action::Run).await.unwrap_err();
        assert!(err.contains("cycle"), "unexpected error: {err}");
    }
}
