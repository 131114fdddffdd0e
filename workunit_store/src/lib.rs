//! Stats and timing used by the Req controller (§4.H): per-step counters,
//! per-report-kind counters, accumulated time, and the rolling per-rule
//! execution history that feeds ETA estimation.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// The kinds of counters the Req controller's final summary breaks jobs down
/// by (§4.H point 5: "failed/done/rerun/steady/hit").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Metric {
    JobsDone,
    JobsRerun,
    JobsSteady,
    JobsHit,
    JobsFailed,
    JobsFrozen,
    LocalExecutionRequests,
    CacheHits,
    CacheMisses,
}

#[derive(Default)]
struct Counters {
    values: HashMap<Metric, u64>,
}

/// A single job's observed cost: wall clock, user cpu time, and peak RSS.
/// This is the `JobStats` triple from SPEC_FULL §3.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JobCost {
    pub user_cpu: Duration,
    pub wall_clock: Duration,
    pub max_rss_bytes: u64,
}

/// A rolling window of the last N execution costs observed for a rule,
/// used to estimate the cost of jobs that haven't run yet (§4.H ETA).
const HISTORY_WINDOW: usize = 8;

#[derive(Default)]
struct RuleHistory {
    samples: Vec<JobCost>,
}

impl RuleHistory {
    fn push(&mut self, cost: JobCost) {
        self.samples.push(cost);
        if self.samples.len() > HISTORY_WINDOW {
            self.samples.remove(0);
        }
    }

    fn estimate(&self) -> Option<JobCost> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len() as u32;
        let mut wall = Duration::ZERO;
        let mut cpu = Duration::ZERO;
        let mut rss = 0u64;
        for sample in &self.samples {
            wall += sample.wall_clock;
            cpu += sample.user_cpu;
            rss += sample.max_rss_bytes;
        }
        Some(JobCost {
            user_cpu: cpu / n,
            wall_clock: wall / n,
            max_rss_bytes: rss / n as u64,
        })
    }
}

/// The store of record for a single Req's (and, for per-rule history, the
/// whole engine's) observed stats.
pub struct WorkunitStore {
    counters: Mutex<Counters>,
    history: Mutex<HashMap<String, RuleHistory>>,
}

impl Default for WorkunitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkunitStore {
    pub fn new() -> WorkunitStore {
        WorkunitStore {
            counters: Mutex::new(Counters::default()),
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn increment_counter(&self, metric: Metric, change: u64) {
        *self.counters.lock().values.entry(metric).or_insert(0) += change;
    }

    pub fn get_counter(&self, metric: Metric) -> u64 {
        *self.counters.lock().values.get(&metric).unwrap_or(&0)
    }

    pub fn get_counters(&self) -> HashMap<Metric, u64> {
        self.counters.lock().values.clone()
    }

    /// Records an observed execution cost for a rule, feeding future ETA
    /// estimates for other jobs of that rule.
    pub fn record_job_cost(&self, rule_name: &str, cost: JobCost) {
        self
            .history
            .lock()
            .entry(rule_name.to_string())
            .or_default()
            .push(cost);
    }

    /// Best-known estimate of how long a not-yet-run job of `rule_name` will
    /// take, averaged over its last runs (or its siblings', if it has none).
    pub fn estimate_job_cost(&self, rule_name: &str) -> Option<JobCost> {
        self.history.lock().get(rule_name).and_then(RuleHistory::estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let store = WorkunitStore::new();
        store.increment_counter(Metric::JobsDone, 1);
        store.increment_counter(Metric::JobsDone, 2);
        assert_eq!(store.get_counter(Metric::JobsDone), 3);
        assert_eq!(store.get_counter(Metric::JobsFailed), 0);
    }

    #[test]
    fn rule_history_windows_and_averages() {
        let store = WorkunitStore::new();
        for i in 1..=10u64 {
            store.record_job_cost(
                "//:build",
                JobCost {
                    user_cpu: Duration::from_secs(i),
                    wall_clock: Duration::from_secs(i),
                    max_rss_bytes: i * 1024,
                },
            );
        }
        // Only the last HISTORY_WINDOW=8 samples (3..=10) should count.
        let estimate = store.estimate_job_cost("//:build").unwrap();
        let expected_avg = (3..=10u64).sum::<u64>() / 8;
        assert_eq!(estimate.wall_clock, Duration::from_secs(expected_avg));
    }

    #[test]
    fn unknown_rule_has_no_estimate() {
        let store = WorkunitStore::new();
        assert!(store.estimate_job_cost("//:unknown").is_none());
    }
}
