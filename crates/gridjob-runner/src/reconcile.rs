//! Reconciliation of job-accounting history into a restart plan.
//!
//! The flow is query, parse, resolve array tasks, classify, resubmit. The
//! whole record set is classified before anything is resubmitted, so the node
//! ban list is complete for every resubmission.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cluster::{parse_sbatch_job_id, sbatch_args, ClusterClient, HistoryQuery};
use crate::sacct::{parse_history, HistoryRecord, JobState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub start_id: u64,
    pub end_id: Option<u64>,
    /// Restrict restarts to this state (matched after normalization).
    pub state: Option<String>,
    pub include_failed: bool,
    pub restart_cancelled: bool,
    pub exclude_nodes: bool,
}

impl ReconcileOptions {
    pub fn action_states(&self) -> BTreeSet<JobState> {
        let mut states = BTreeSet::from([JobState::Timeout, JobState::Preempted]);
        if self.include_failed {
            states.insert(JobState::Failed);
        }
        if self.restart_cancelled {
            states.insert(JobState::Cancelled);
        }
        states
    }

    fn in_id_range(&self, record: &HistoryRecord) -> bool {
        record.job_id >= self.start_id && self.end_id.map_or(true, |end| record.job_id <= end)
    }

    fn matches_state_filter(&self, state: &JobState) -> bool {
        self.state
            .as_deref()
            .map_or(true, |wanted| JobState::parse(&wanted.to_ascii_uppercase()) == *state)
    }
}

/// Reads array-dispatch files (one script path per line), caching each file.
#[derive(Debug, Default)]
pub struct DispatchFiles {
    cache: BTreeMap<PathBuf, Option<Vec<String>>>,
}

impl DispatchFiles {
    pub fn resolve(&mut self, dispatch: &Path, index: usize) -> Option<String> {
        let lines = self
            .cache
            .entry(dispatch.to_path_buf())
            .or_insert_with(|| match fs::read_to_string(dispatch) {
                Ok(raw) => Some(raw.lines().map(|l| l.trim().to_string()).collect()),
                Err(err) => {
                    debug!(file = %dispatch.display(), "array dispatch file unreadable: {}", err);
                    None
                }
            });
        lines
            .as_ref()?
            .get(index)
            .filter(|line| !line.is_empty())
            .cloned()
    }
}

/// Replaces the dispatch file of array-task records with the task's script.
/// Records that cannot be resolved are dropped.
pub fn resolve_array_tasks(
    records: Vec<HistoryRecord>,
    dispatch: &mut DispatchFiles,
) -> Vec<HistoryRecord> {
    records
        .into_iter()
        .filter_map(|mut record| {
            let Some(index) = record.task_index else {
                return Some(record);
            };
            match dispatch.resolve(Path::new(&record.script), index) {
                Some(script) => {
                    record.script = script;
                    Some(record)
                }
                None => {
                    debug!(
                        job = %record.display_id(),
                        dispatch = %record.script,
                        "dropping array task without a resolvable script"
                    );
                    None
                }
            }
        })
        .collect()
}

/// An actionable record that was not restarted because its script was seen
/// running, pending or completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledJob {
    pub record: HistoryRecord,
    pub settled_by: JobState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartPlan {
    /// Latest actionable record per resolved script.
    pub restarts: BTreeMap<String, HistoryRecord>,
    pub banned: BTreeSet<String>,
    pub handled: Vec<HandledJob>,
}

impl RestartPlan {
    pub fn banned_nodes(&self) -> Vec<String> {
        self.banned.iter().cloned().collect()
    }
}

/// Classifies resolved records, in query order, into a restart plan.
pub fn plan_restarts(records: &[HistoryRecord], options: &ReconcileOptions) -> RestartPlan {
    let action_states = options.action_states();
    let mut plan = RestartPlan::default();
    let mut settled: BTreeMap<String, JobState> = BTreeMap::new();

    for record in records {
        if record.state == JobState::Failed && options.exclude_nodes {
            if let Some(nodes) = record.assigned_nodes() {
                plan.banned.insert(nodes.to_string());
            }
        }
        if !options.in_id_range(record) {
            debug!(job = %record.display_id(), "outside id range");
            continue;
        }
        if record.state.is_settled() {
            settled.insert(record.script.clone(), record.state.clone());
            if let Some(previous) = plan.restarts.remove(&record.script) {
                debug!(
                    script = %record.script,
                    "job {} is {}, no restart needed",
                    record.display_id(),
                    record.state
                );
                plan.handled.push(HandledJob {
                    record: previous,
                    settled_by: record.state.clone(),
                });
            }
            continue;
        }
        if !action_states.contains(&record.state) || !options.matches_state_filter(&record.state) {
            continue;
        }
        if let Some(state) = settled.get(&record.script) {
            debug!(script = %record.script, "already {}, ignoring {}", state, record.state);
            plan.handled.push(HandledJob {
                record: record.clone(),
                settled_by: state.clone(),
            });
            continue;
        }
        plan.restarts.insert(record.script.clone(), record.clone());
    }
    plan
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    pub script: String,
    pub original: HistoryRecord,
    /// `sbatch` arguments issued (or, in a dry run, that would be issued).
    pub args: Vec<String>,
    pub job_id: Option<u64>,
    pub error: Option<String>,
}

impl RestartOutcome {
    pub fn command_line(&self) -> String {
        format!("sbatch {}", crate::shell_join(&self.args))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartReport {
    pub dry: bool,
    pub records: usize,
    pub plan: RestartPlan,
    pub outcomes: Vec<RestartOutcome>,
}

impl RestartReport {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Queries history, classifies it and resubmits the restart set.
///
/// A query error aborts before classification; submission errors are
/// recorded per job.
pub fn run_restart<C: ClusterClient + ?Sized>(
    client: &C,
    query: &HistoryQuery,
    options: &ReconcileOptions,
    dry: bool,
) -> Result<RestartReport> {
    let output = client.query_history(query)?;
    if let Some(err) = output.error() {
        return Err(anyhow!("accounting query failed: {}", err));
    }
    let records = parse_history(&output.stdout);
    let record_count = records.len();
    let records = resolve_array_tasks(records, &mut DispatchFiles::default());
    let plan = plan_restarts(&records, options);
    info!(
        records = record_count,
        restarts = plan.restarts.len(),
        banned = plan.banned.len(),
        "classified job history"
    );

    let banned = plan.banned_nodes();
    let mut outcomes = Vec::with_capacity(plan.restarts.len());
    for (script, original) in &plan.restarts {
        let script_path = Path::new(script);
        let mut outcome = RestartOutcome {
            script: script.clone(),
            original: original.clone(),
            args: sbatch_args(script_path, &banned),
            job_id: None,
            error: None,
        };
        if !dry {
            match client.submit(script_path, &banned) {
                Ok(out) => match out.error() {
                    Some(err) => outcome.error = Some(err.to_string()),
                    None => outcome.job_id = parse_sbatch_job_id(&out.stdout),
                },
                Err(err) => outcome.error = Some(err.to_string()),
            }
            match &outcome.error {
                Some(err) => warn!(script = %script, "resubmission failed: {}", err),
                None => info!(script = %script, job_id = ?outcome.job_id, "resubmitted"),
            }
        }
        outcomes.push(outcome);
    }

    Ok(RestartReport {
        dry,
        records: record_count,
        plan,
        outcomes,
    })
}
