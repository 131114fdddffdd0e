//! Ties the persistent store (component A) to the rule-match index
//! (component B): resolving a node name to its candidate producer jobs,
//! instantiating a `Job` the first time a rule is matched against a
//! particular stem, and keeping the rule-match index in sync with
//! `match_gen` (spec §3 invariant, §4.B).

use std::collections::HashMap;
use std::sync::Arc;

use fs::RelativePath;
use parking_lot::RwLock;
use record_store::{Job, JobId, Node, NodeId, RecordStore, Rule, RuleId};
use rule_match::{substitute_stem, RuleMatchIndex};

/// The in-memory half of components A+B: the persisted graph plus a cached
/// compiled match index, rebuilt whenever `match_gen` has moved past what
/// this cache was built against (§3 "Match generation" invariant).
#[derive(Clone)]
pub struct Graph {
    store: RecordStore,
    cached: Arc<RwLock<CachedIndex>>,
}

struct CachedIndex {
    built_at_gen: u64,
    index: RuleMatchIndex,
    rules: HashMap<RuleId, Rule>,
}

impl Graph {
    pub fn new(store: RecordStore) -> Result<Graph, String> {
        let (index, rules) = Graph::build_index(&store)?;
        Ok(Graph {
            store,
            cached: Arc::new(RwLock::new(CachedIndex {
                built_at_gen: 0,
                index,
                rules,
            })),
        })
    }

    fn build_index(store: &RecordStore) -> Result<(RuleMatchIndex, HashMap<RuleId, Rule>), String> {
        let index = store.rebuild_rule_index()?;
        let rules = store.all_rules()?.into_iter().collect();
        Ok((index, rules))
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Adds or replaces a rule, bumping `match_gen` per §3 "Source set:
    /// modification of the source list triggers a full `match_gen` bump" —
    /// generalized here to any rule-set edit, matching §4.B "built once per
    /// rule-set change".
    pub fn put_rule(&self, existing: Option<RuleId>, rule: Rule) -> Result<RuleId, String> {
        let id = self.store.put_rule(existing, &rule)?;
        self.store.bump_match_gen();
        Ok(id)
    }

    /// Rebuilds the cached match index if `match_gen` has moved since it was
    /// last built (§3 invariant: "a node's cached rule-match is trusted only
    /// when its `match_gen >= global`", generalized here to one shared
    /// cache instead of a per-node cached answer, since rebuilding the whole
    /// index is itself O(rules) and infrequent).
    fn refresh_if_stale(&self) -> Result<(), String> {
        let current_gen = self.store.match_gen();
        if self.cached.read().built_at_gen >= current_gen {
            return Ok(());
        }
        let (index, rules) = Graph::build_index(&self.store)?;
        let mut cached = self.cached.write();
        if cached.built_at_gen < current_gen {
            cached.index = index;
            cached.rules = rules;
            cached.built_at_gen = current_gen;
        }
        Ok(())
    }

    pub fn rule(&self, id: RuleId) -> Result<Option<Rule>, String> {
        self.refresh_if_stale()?;
        Ok(self.cached.read().rules.get(&id).cloned())
    }

    pub fn get_or_create_node(&self, name: &RelativePath) -> Result<NodeId, String> {
        self.store.get_or_create_node(name)
    }

    pub fn node(&self, id: NodeId) -> Result<Option<Node>, String> {
        self.store.get_node(id)
    }

    pub fn put_node(&self, id: NodeId, node: &Node) -> Result<(), String> {
        self.store.put_node(id, node)
    }

    pub fn job(&self, id: JobId) -> Result<Option<Job>, String> {
        self.store.get_job(id)
    }

    pub fn put_job(&self, id: JobId, job: &Job) -> Result<(), String> {
        self.store.put_job(id, job)
    }

    /// Returns every `(rule, static deps expanded against the matched stem)`
    /// candidate for `name`, ordered by priority per §4.B's sort key —
    /// these are the candidates `Node::candidate_jobs` is built from.
    pub fn candidate_rules(&self, name: &RelativePath) -> Result<Vec<CandidateRule>, String> {
        self.refresh_if_stale()?;
        let cached = self.cached.read();
        let f = name.to_str().ok_or("non-utf8 path")?;
        let mut out = Vec::new();
        for entry in cached.index.lookup(f) {
            let Some(rule) = cached.rules.get(&RuleId(entry.rule_id)) else {
                continue;
            };
            let stem = entry.stem(f).map(|s| s.to_string());
            let static_dep_names = rule
                .static_dep_patterns
                .iter()
                .map(|pattern| substitute_stem(pattern, stem.as_deref()))
                .collect();
            let target_names = rule
                .target_patterns
                .iter()
                .map(|pattern| substitute_stem(pattern, stem.as_deref()))
                .collect();
            out.push(CandidateRule {
                rule_id: RuleId(entry.rule_id),
                is_anti: entry.is_anti,
                target_index: entry.target_index,
                static_dep_names,
                target_names,
            });
        }
        Ok(out)
    }

    /// Finds (creating lazily if necessary) the highest-priority non-anti
    /// job that could produce `node_id`, registering it as a candidate on
    /// the node if it wasn't already (spec §3 "Jobs are created lazily when
    /// a node needs a producer").
    pub fn ensure_producer(&self, node_id: NodeId) -> Result<Option<JobId>, String> {
        let node = self.node(node_id)?.ok_or("node vanished")?;
        if node.flags.is_source || node.flags.is_anti {
            return Ok(None);
        }
        if let Some(existing) = node.conform_job() {
            return Ok(Some(existing));
        }

        let candidates = self.candidate_rules(&node.name)?;
        let Some(winner) = candidates.into_iter().find(|c| !c.is_anti) else {
            return Ok(None);
        };

        let mut static_deps = Vec::with_capacity(winner.static_dep_names.len());
        for dep_name in &winner.static_dep_names {
            let dep_path = RelativePath::new(dep_name)?;
            static_deps.push(self.get_or_create_node(&dep_path)?);
        }

        let mut declared_targets = Vec::with_capacity(winner.target_names.len());
        for target_name in &winner.target_names {
            let target_path = RelativePath::new(target_name)?;
            declared_targets.push(self.get_or_create_node(&target_path)?);
        }

        let job = Job::new(winner.rule_id, static_deps, declared_targets);
        let job_id = self.store.create_job(&job)?;

        let mut node = node;
        node.candidate_jobs.push(job_id);
        node.conform_idx = Some(node.candidate_jobs.len() - 1);
        self.put_node(node_id, &node)?;
        Ok(Some(job_id))
    }
}

pub struct CandidateRule {
    pub rule_id: RuleId,
    pub is_anti: bool,
    pub target_index: u32,
    pub static_dep_names: Vec<String>,
    pub target_names: Vec<String>,
}
